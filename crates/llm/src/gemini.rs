use crate::{types::*, utils, ApiError, LLMProvider};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{trace, warn};

const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

#[derive(Debug, Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<GeminiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Parts,
}

#[derive(Debug, Serialize)]
struct Parts {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    request_counter: u64,
}

impl GeminiClient {
    pub fn default_base_url() -> String {
        "https://generativelanguage.googleapis.com/v1beta".to_string()
    }

    pub fn default_model() -> String {
        "gemini-1.5-pro".to_string()
    }

    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
            model,
            request_counter: 0,
        }
    }

    fn get_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    /// Gemini has no call ids, function responses are matched by name.
    /// Collects the names of all tool uses so results can be labelled.
    fn tool_names_by_id(messages: &[&Message]) -> HashMap<String, String> {
        messages
            .iter()
            .flat_map(|message| message.blocks())
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, .. } => Some((id, name)),
                _ => None,
            })
            .collect()
    }

    fn convert_message(message: &Message, tool_names: &HashMap<String, String>) -> GeminiMessage {
        let role = Some(match message.role {
            MessageRole::Assistant => "model".to_string(),
            MessageRole::User | MessageRole::System => "user".to_string(),
        });

        let parts = message
            .blocks()
            .into_iter()
            .map(|block| match block {
                ContentBlock::Text { text } => GeminiPart {
                    text: Some(text),
                    ..Default::default()
                },
                ContentBlock::ToolUse { name, input, .. } => GeminiPart {
                    function_call: Some(GeminiFunctionCall { name, args: input }),
                    ..Default::default()
                },
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    let name = tool_names.get(&tool_use_id).cloned().unwrap_or_else(|| {
                        warn!("No tool use found for result {}", tool_use_id);
                        tool_use_id.clone()
                    });
                    GeminiPart {
                        function_response: Some(GeminiFunctionResponse {
                            name,
                            response: json!({ "result": content }),
                        }),
                        ..Default::default()
                    }
                }
            })
            .collect();

        GeminiMessage { role, parts }
    }

    fn build_request(&self, request: LLMRequest) -> GeminiRequest {
        let (system, conversation) = split_system_messages(&request);
        let tool_names = Self::tool_names_by_id(&conversation);

        let contents = conversation
            .iter()
            .map(|message| Self::convert_message(message, &tool_names))
            .collect();

        let tools = request
            .tools
            .filter(|tools| !tools.is_empty())
            .map(|tools| {
                vec![json!({
                    "function_declarations": tools.into_iter().map(|tool| {
                        let mut declaration = json!({
                            "name": tool.name,
                            "description": tool.description,
                        });
                        if let Some(parameters) = tool.parameters {
                            declaration["parameters"] = parameters;
                        }
                        declaration
                    }).collect::<Vec<_>>()
                })]
            });

        GeminiRequest {
            system_instruction: if system.is_empty() {
                None
            } else {
                Some(SystemInstruction {
                    parts: Parts { text: system },
                })
            },
            contents,
            generation_config: Some(GenerationConfig {
                max_output_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            }),
            tools,
        }
    }

    fn convert_response(response: GeminiResponse, request_id: u64) -> LLMResponse {
        let mut tool_counter = 0;
        let content = response
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .filter_map(|part| {
                if let Some(function_call) = part.function_call {
                    tool_counter += 1;
                    let input = if function_call.args.is_null() {
                        json!({})
                    } else {
                        function_call.args
                    };
                    Some(ContentBlock::ToolUse {
                        id: format!("tool-{request_id}-{tool_counter}"),
                        name: function_call.name,
                        input,
                    })
                } else {
                    part.text.map(|text| ContentBlock::Text { text })
                }
            })
            .collect();

        let usage = response
            .usage_metadata
            .map(|usage| Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            })
            .unwrap_or_default();

        LLMResponse { content, usage }
    }
}

#[async_trait]
impl LLMProvider for GeminiClient {
    async fn send_message(&mut self, request: LLMRequest) -> Result<LLMResponse> {
        self.request_counter += 1;
        let request_id = self.request_counter;
        let gemini_request = self.build_request(request);

        trace!(
            "Sending Gemini request to {}:\n{}",
            self.model,
            serde_json::to_string_pretty(&gemini_request)?
        );

        let response = self
            .client
            .post(self.get_url())
            .query(&[("key", &self.api_key)])
            .header("Content-Type", "application/json")
            .json(&gemini_request)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        let response = utils::check_response_error(response).await?;
        let gemini_response: GeminiResponse =
            utils::parse_response_body(response, "Gemini").await?;

        Ok(Self::convert_response(gemini_response, request_id))
    }

    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    fn available_models(&self) -> Vec<String> {
        [
            "gemini-1.5-pro",
            "gemini-1.5-flash",
            "gemini-1.0-pro",
            "gemini-1.0-ultra",
        ]
        .iter()
        .map(|m| m.to_string())
        .collect()
    }

    fn schema_dialect(&self) -> SchemaDialect {
        SchemaDialect::Gemini
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GeminiClient {
        GeminiClient::new(
            "key".to_string(),
            "gemini-1.5-pro".to_string(),
            "http://localhost".to_string(),
        )
    }

    #[test]
    fn test_function_response_uses_tool_name() {
        let request = LLMRequest {
            messages: vec![
                Message::new_user("How many dags?"),
                Message::new_assistant_content(vec![ContentBlock::new_tool_use(
                    "tool-1-1",
                    "list_dags",
                    json!({}),
                )]),
                Message::new_user_content(vec![ContentBlock::new_tool_result(
                    "tool-1-1",
                    "3",
                    false,
                )]),
            ],
            system_prompt: "sys".to_string(),
            tools: None,
            max_tokens: None,
        };
        let built = serde_json::to_value(client().build_request(request)).unwrap();
        assert_eq!(built["system_instruction"]["parts"]["text"], "sys");
        assert_eq!(built["contents"][1]["role"], "model");
        assert_eq!(
            built["contents"][1]["parts"][0]["functionCall"]["name"],
            "list_dags"
        );
        assert_eq!(
            built["contents"][2]["parts"][0]["functionResponse"],
            json!({"name": "list_dags", "response": {"result": "3"}})
        );
        assert_eq!(built["generation_config"]["maxOutputTokens"], 8192);
    }

    #[test]
    fn test_function_calls_get_sequential_ids() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Checking"},
                        {"functionCall": {"name": "list_dags", "args": {"active": true}}},
                        {"functionCall": {"name": "get_health"}}
                    ]
                }
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}
        }))
        .unwrap();
        let converted = GeminiClient::convert_response(response, 7);
        assert_eq!(converted.content.len(), 3);
        assert_eq!(
            converted.content[1],
            ContentBlock::new_tool_use("tool-7-1", "list_dags", json!({"active": true}))
        );
        assert_eq!(
            converted.content[2],
            ContentBlock::new_tool_use("tool-7-2", "get_health", json!({}))
        );
        assert_eq!(converted.usage.input_tokens, 10);
    }

    #[test]
    fn test_parameterless_tool_omits_parameters() {
        let request = LLMRequest {
            messages: vec![Message::new_user("hi")],
            system_prompt: String::new(),
            tools: Some(vec![ToolDefinition {
                name: "get_health".to_string(),
                description: "Health".to_string(),
                parameters: None,
            }]),
            max_tokens: Some(256),
        };
        let built = serde_json::to_value(client().build_request(request)).unwrap();
        let declaration = &built["tools"][0]["function_declarations"][0];
        assert_eq!(declaration["name"], "get_health");
        assert!(declaration.get("parameters").is_none());
        assert!(built.get("system_instruction").is_none());
    }
}
