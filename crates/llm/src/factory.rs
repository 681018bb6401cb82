use crate::{AnthropicClient, GeminiClient, LLMProvider, OpenAIClient, SchemaDialect};
use anyhow::{Context, Result};
use clap::ValueEnum;

/// Generic fallback for the API key when no provider-specific variable is set.
pub const GENERIC_API_KEY_VAR: &str = "LLM_API_KEY";

#[derive(
    ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LLMProviderType {
    #[default]
    Anthropic,
    #[value(name = "openai")]
    OpenAI,
    Gemini,
}

impl LLMProviderType {
    /// Environment variable holding this provider's API key
    pub fn api_key_var(self) -> &'static str {
        match self {
            LLMProviderType::Anthropic => "ANTHROPIC_API_KEY",
            LLMProviderType::OpenAI => "OPENAI_API_KEY",
            LLMProviderType::Gemini => "GOOGLE_API_KEY",
        }
    }

    /// Schema dialect the provider's tool declarations are written in
    pub fn schema_dialect(self) -> SchemaDialect {
        match self {
            LLMProviderType::Gemini => SchemaDialect::Gemini,
            LLMProviderType::Anthropic | LLMProviderType::OpenAI => SchemaDialect::JsonSchema,
        }
    }

    fn default_model(self) -> String {
        match self {
            LLMProviderType::Anthropic => AnthropicClient::default_model(),
            LLMProviderType::OpenAI => OpenAIClient::default_model(),
            LLMProviderType::Gemini => GeminiClient::default_model(),
        }
    }

    fn default_base_url(self) -> String {
        match self {
            LLMProviderType::Anthropic => AnthropicClient::default_base_url(),
            LLMProviderType::OpenAI => OpenAIClient::default_base_url(),
            LLMProviderType::Gemini => GeminiClient::default_base_url(),
        }
    }
}

/// Configuration for creating an LLM client
#[derive(Debug, Clone, Default)]
pub struct LLMClientConfig {
    pub provider: LLMProviderType,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

fn resolve_api_key(config: &LLMClientConfig) -> Result<String> {
    if let Some(key) = config.api_key.as_ref().filter(|key| !key.is_empty()) {
        return Ok(key.clone());
    }
    let provider_var = config.provider.api_key_var();
    std::env::var(provider_var)
        .ok()
        .filter(|key| !key.is_empty())
        .or_else(|| {
            std::env::var(GENERIC_API_KEY_VAR)
                .ok()
                .filter(|key| !key.is_empty())
        })
        .with_context(|| {
            format!("No API key configured: set {provider_var} or {GENERIC_API_KEY_VAR}")
        })
}

pub fn create_llm_client(config: LLMClientConfig) -> Result<Box<dyn LLMProvider>> {
    let api_key = resolve_api_key(&config)?;
    let model = config
        .model
        .unwrap_or_else(|| config.provider.default_model());
    let base_url = config
        .base_url
        .unwrap_or_else(|| config.provider.default_base_url());

    match config.provider {
        LLMProviderType::Anthropic => Ok(Box::new(AnthropicClient::new(api_key, model, base_url))),
        LLMProviderType::OpenAI => Ok(Box::new(OpenAIClient::new(api_key, model, base_url))),
        LLMProviderType::Gemini => Ok(Box::new(GeminiClient::new(api_key, model, base_url))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_key_selects_provider() {
        let client = create_llm_client(LLMClientConfig {
            provider: LLMProviderType::Gemini,
            model: None,
            base_url: None,
            api_key: Some("secret".to_string()),
        })
        .unwrap();
        assert_eq!(client.provider_name(), "gemini");
        assert_eq!(client.schema_dialect(), SchemaDialect::Gemini);
        assert_eq!(
            LLMProviderType::Gemini.schema_dialect(),
            client.schema_dialect()
        );
        assert!(client
            .available_models()
            .contains(&"gemini-1.5-flash".to_string()));
    }

    #[test]
    fn test_provider_type_serde_is_lowercase() {
        let parsed: LLMProviderType = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(parsed, LLMProviderType::OpenAI);
        assert_eq!(
            serde_json::to_string(&LLMProviderType::Anthropic).unwrap(),
            "\"anthropic\""
        );
        assert_eq!(
            LLMProviderType::from_str("openai", true).unwrap(),
            LLMProviderType::OpenAI
        );
    }
}
