use crate::{types::*, utils, ApiError, LLMProvider};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic-specific message structure
#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

/// Response structure for Anthropic API responses
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

/// Usage information from Anthropic API
#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    pub fn default_base_url() -> String {
        "https://api.anthropic.com/v1".to_string()
    }

    pub fn default_model() -> String {
        "claude-3-5-sonnet-20241022".to_string()
    }

    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    fn get_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn convert_message(message: &Message) -> AnthropicMessage {
        AnthropicMessage {
            role: match message.role {
                MessageRole::Assistant => "assistant".to_string(),
                // System messages are filtered out before conversion
                MessageRole::User | MessageRole::System => "user".to_string(),
            },
            content: message.blocks(),
        }
    }

    fn convert_tool(tool: ToolDefinition) -> serde_json::Value {
        let input_schema = tool.parameters.unwrap_or_else(|| {
            serde_json::json!({
                "type": "object",
                "properties": {}
            })
        });
        serde_json::json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": input_schema,
        })
    }

    fn build_request(&self, request: LLMRequest) -> AnthropicRequest {
        let (system, messages) = split_system_messages(&request);
        let messages = messages.into_iter().map(Self::convert_message).collect();

        let tools = request
            .tools
            .filter(|tools| !tools.is_empty())
            .map(|tools| tools.into_iter().map(Self::convert_tool).collect::<Vec<_>>());
        let tool_choice = tools
            .as_ref()
            .map(|_| serde_json::json!({ "type": "auto" }));

        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            tools,
            tool_choice,
        }
    }
}

#[async_trait]
impl LLMProvider for AnthropicClient {
    async fn send_message(&mut self, request: LLMRequest) -> Result<LLMResponse> {
        let anthropic_request = self.build_request(request);

        trace!(
            "Sending Anthropic request to {}:\n{}",
            self.model,
            serde_json::to_string_pretty(&anthropic_request)?
        );

        let response = self
            .client
            .post(self.get_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        let response = utils::check_response_error(response).await?;
        let anthropic_response: AnthropicResponse =
            utils::parse_response_body(response, "Anthropic").await?;

        debug!(
            "Anthropic stop reason: {:?}",
            anthropic_response.stop_reason
        );

        Ok(LLMResponse {
            content: anthropic_response.content,
            usage: Usage {
                input_tokens: anthropic_response.usage.input_tokens,
                output_tokens: anthropic_response.usage.output_tokens,
            },
        })
    }

    fn provider_name(&self) -> &'static str {
        "anthropic"
    }

    fn available_models(&self) -> Vec<String> {
        [
            "claude-3-5-sonnet-20241022",
            "claude-3-opus-20240229",
            "claude-3-sonnet-20240229",
            "claude-3-haiku-20240307",
        ]
        .iter()
        .map(|m| m.to_string())
        .collect()
    }
}
