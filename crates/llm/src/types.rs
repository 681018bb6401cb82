use serde::{Deserialize, Serialize};

/// Tracks token usage for a request/response pair
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Usage {
    /// Number of tokens in the input (prompt)
    pub input_tokens: u32,
    /// Number of tokens in the output (completion)
    pub output_tokens: u32,
}

impl Usage {
    pub fn zero() -> Self {
        Usage {
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// How a provider expects the type names inside tool parameter schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    /// Lower-case JSON-schema names (`string`, `boolean`, ...)
    JsonSchema,
    /// Upper-case OpenAPI subset used by Gemini (`STRING`, `BOOLEAN`, ...)
    Gemini,
}

/// A tool declaration in the shape sent alongside a chat request.
///
/// `parameters` is `None` for tools that take no arguments; providers that
/// require a schema substitute an empty object schema.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Generic request structure that can be mapped to different providers
#[derive(Debug, Clone, Default)]
pub struct LLMRequest {
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub tools: Option<Vec<ToolDefinition>>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Structured(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    pub fn new_text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn new_tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn new_tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: if is_error { Some(true) } else { None },
        }
    }
}

impl Message {
    pub fn new_system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn new_user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn new_assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn new_user_content(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Structured(blocks),
        }
    }

    pub fn new_assistant_content(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Structured(blocks),
        }
    }

    /// Ordered block view of the message, regardless of how it was stored.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            MessageContent::Text(text) => vec![ContentBlock::new_text(text.clone())],
            MessageContent::Structured(blocks) => blocks.clone(),
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Structured(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Generic response structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct LLMResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

/// Common error types for all LLM providers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Splits system messages out of a conversation.
///
/// Returns the combined system text (the request's `system_prompt` first,
/// then every system message in order) and the remaining messages.
pub(crate) fn split_system_messages(request: &LLMRequest) -> (String, Vec<&Message>) {
    let mut system_parts = Vec::new();
    if !request.system_prompt.is_empty() {
        system_parts.push(request.system_prompt.clone());
    }
    let mut rest = Vec::new();
    for message in &request.messages {
        if message.role == MessageRole::System {
            system_parts.push(message.text());
        } else {
            rest.push(message);
        }
    }
    (system_parts.join("\n\n"), rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_block_wire_tags() {
        let blocks = vec![
            ContentBlock::new_text("a"),
            ContentBlock::new_tool_use("1", "list_dags", json!({"active": true})),
            ContentBlock::new_tool_result("1", "3", false),
        ];
        let value = serde_json::to_value(&blocks).unwrap();
        assert_eq!(value[0]["type"], "text");
        assert_eq!(value[1]["type"], "tool_use");
        assert_eq!(value[1]["input"]["active"], true);
        assert_eq!(value[2]["type"], "tool_result");
        assert!(value[2].get("is_error").is_none());
    }

    #[test]
    fn test_model_reply_parses_into_blocks() {
        let raw = r#"[
            {"type": "text", "text": "checking"},
            {"type": "tool_use", "id": "t1", "name": "list_dags", "input": {}}
        ]"#;
        let blocks: Vec<ContentBlock> = serde_json::from_str(raw).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[1], ContentBlock::ToolUse { id, .. } if id == "t1"));
    }

    #[test]
    fn test_split_system_messages() {
        let request = LLMRequest {
            messages: vec![
                Message::new_system("be brief"),
                Message::new_user("hi"),
            ],
            system_prompt: "You query Airflow.".to_string(),
            tools: None,
            max_tokens: None,
        };
        let (system, rest) = split_system_messages(&request);
        assert_eq!(system, "You query Airflow.\n\nbe brief");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].role, MessageRole::User);
    }

    #[test]
    fn test_message_text_joins_text_blocks_only() {
        let message = Message::new_assistant_content(vec![
            ContentBlock::new_text("a"),
            ContentBlock::new_tool_use("1", "x", json!({})),
            ContentBlock::new_text("b"),
        ]);
        assert_eq!(message.text(), "a\nb");
        assert_eq!(message.blocks().len(), 3);
    }
}
