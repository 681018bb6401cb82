use crate::{types::*, utils, ApiError, LLMProvider};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

#[derive(Debug, Serialize, Clone)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAIFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

pub struct OpenAIClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIClient {
    pub fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    pub fn default_model() -> String {
        "gpt-4o".to_string()
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
        format!("{}/chat/completions", self.base_url)
    }

    pub(crate) fn convert_message(message: &Message) -> Vec<OpenAIChatMessage> {
        match &message.content {
            MessageContent::Text(text) => {
                vec![OpenAIChatMessage {
                    role: match message.role {
                        MessageRole::System => "system".to_string(),
                        MessageRole::User => "user".to_string(),
                        MessageRole::Assistant => "assistant".to_string(),
                    },
                    content: Some(serde_json::json!(text)),
                    tool_calls: None,
                    tool_call_id: None,
                }]
            }
            MessageContent::Structured(blocks) => match message.role {
                // Tool uses become tool_calls, the rest is content
                MessageRole::Assistant => Self::convert_assistant_message(blocks),
                // Tool results become separate "tool" messages
                MessageRole::User | MessageRole::System => Self::convert_user_message(blocks),
            },
        }
    }

    fn convert_assistant_message(blocks: &[ContentBlock]) -> Vec<OpenAIChatMessage> {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in blocks {
            match block {
                ContentBlock::Text { text } => text_parts.push(text.clone()),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(OpenAIToolCall {
                        id: id.clone(),
                        call_type: "function".to_string(),
                        function: OpenAIFunction {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    });
                }
                ContentBlock::ToolResult { .. } => {
                    warn!(
                        "Unexpected content block type in assistant message: {:?}",
                        block
                    );
                }
            }
        }

        vec![OpenAIChatMessage {
            role: "assistant".to_string(),
            content: Some(serde_json::json!(text_parts.join("\n\n"))),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }]
    }

    fn convert_user_message(blocks: &[ContentBlock]) -> Vec<OpenAIChatMessage> {
        let mut messages = Vec::new();
        let mut current_content: Vec<String> = Vec::new();

        for block in blocks {
            match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    if !current_content.is_empty() {
                        messages.push(Self::create_user_text_message(&current_content));
                        current_content.clear();
                    }

                    let safe_content = if content.is_empty() {
                        "No output".to_string()
                    } else {
                        content.clone()
                    };

                    messages.push(OpenAIChatMessage {
                        role: "tool".to_string(),
                        content: Some(serde_json::json!(safe_content)),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id.clone()),
                    });
                }
                ContentBlock::Text { text } => current_content.push(text.clone()),
                ContentBlock::ToolUse { .. } => {
                    warn!("Unexpected content block type in user message: {:?}", block);
                }
            }
        }

        if !current_content.is_empty() {
            messages.push(Self::create_user_text_message(&current_content));
        }

        messages
    }

    fn create_user_text_message(text_parts: &[String]) -> OpenAIChatMessage {
        OpenAIChatMessage {
            role: "user".to_string(),
            content: Some(serde_json::json!(text_parts.join("\n\n"))),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn convert_tool(tool: ToolDefinition) -> serde_json::Value {
        let parameters = tool.parameters.unwrap_or_else(|| {
            serde_json::json!({
                "type": "object",
                "properties": {}
            })
        });
        serde_json::json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": parameters,
            }
        })
    }

    fn build_request(&self, request: LLMRequest) -> OpenAIRequest {
        let (system, conversation) = split_system_messages(&request);

        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(OpenAIChatMessage {
                role: "system".to_string(),
                content: Some(serde_json::json!(system)),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        messages.extend(
            conversation
                .into_iter()
                .flat_map(|message| Self::convert_message(message)),
        );

        let tools = request
            .tools
            .filter(|tools| !tools.is_empty())
            .map(|tools| tools.into_iter().map(Self::convert_tool).collect::<Vec<_>>());
        let tool_choice = tools.as_ref().map(|_| serde_json::json!("auto"));

        OpenAIRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            tools,
            tool_choice,
        }
    }

    fn convert_response(response: OpenAIResponse) -> Result<LLMResponse> {
        let usage = response
            .usage
            .map(|usage| Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_else(Usage::zero);

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| ApiError::Unknown("Response contained no choices".to_string()))?;

        let mut blocks = Vec::new();

        if let Some(text) = message.content.as_ref().and_then(|c| c.as_str()) {
            if !text.is_empty() {
                blocks.push(ContentBlock::new_text(text));
            }
        }

        for call in message.tool_calls.unwrap_or_default() {
            let input = if call.function.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.function.arguments).map_err(|e| {
                    ApiError::Unknown(format!("Failed to parse tool arguments: {e}"))
                })?
            };
            blocks.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        Ok(LLMResponse {
            content: blocks,
            usage,
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAIClient {
    async fn send_message(&mut self, request: LLMRequest) -> Result<LLMResponse> {
        let openai_request = self.build_request(request);

        trace!(
            "Sending OpenAI request to {}:\n{}",
            self.model,
            serde_json::to_string_pretty(&openai_request)?
        );

        let response = self
            .client
            .post(self.get_url())
            .bearer_auth(&self.api_key)
            .json(&openai_request)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        let response = utils::check_response_error(response).await?;
        let openai_response: OpenAIResponse =
            utils::parse_response_body(response, "OpenAI").await?;

        Self::convert_response(openai_response)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn available_models(&self) -> Vec<String> {
        ["gpt-4o", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"]
            .iter()
            .map(|m| m.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_results_become_tool_messages() {
        let message = Message::new_user_content(vec![
            ContentBlock::new_tool_result("call_1", "", false),
            ContentBlock::new_tool_result("call_2", "3 dags", false),
        ]);
        let converted = OpenAIClient::convert_message(&message);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "tool");
        assert_eq!(converted[0].content, Some(json!("No output")));
        assert_eq!(converted[1].tool_call_id.as_deref(), Some("call_2"));
    }

    #[test]
    fn test_assistant_tool_use_becomes_tool_call() {
        let message = Message::new_assistant_content(vec![
            ContentBlock::new_text("Let me check."),
            ContentBlock::new_tool_use("call_1", "list_dags", json!({"active": true})),
        ]);
        let converted = OpenAIClient::convert_message(&message);
        assert_eq!(converted.len(), 1);
        let calls = converted[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "list_dags");
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args, json!({"active": true}));
    }

    #[test]
    fn test_system_prompt_is_first_message() {
        let client = OpenAIClient::new(
            "key".to_string(),
            "gpt-4o".to_string(),
            "http://localhost".to_string(),
        );
        let built = client.build_request(LLMRequest {
            messages: vec![Message::new_user("hi")],
            system_prompt: "You query Airflow.".to_string(),
            tools: None,
            max_tokens: None,
        });
        assert_eq!(built.messages[0].role, "system");
        assert_eq!(built.messages[1].role, "user");
        assert!(built.tool_choice.is_none());
    }

    #[test]
    fn test_empty_arguments_parse_as_empty_object() {
        let response: OpenAIResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_health", "arguments": ""}
                    }]
                }
            }]
        }))
        .unwrap();
        let converted = OpenAIClient::convert_response(response).unwrap();
        assert_eq!(
            converted.content,
            vec![ContentBlock::new_tool_use("call_1", "get_health", json!({}))]
        );
        assert_eq!(converted.usage, Usage::zero());
    }
}
