//! LLM integration module providing abstraction over different LLM providers
//!
//! This module implements:
//! - Common interface for LLM interactions via the LLMProvider trait
//! - Support for multiple providers (Anthropic, OpenAI, Gemini)
//! - Shared types for conversations, content blocks and tool declarations
//! - A factory that selects a provider from a configuration value


mod utils;

pub mod anthropic;
pub mod display;
pub mod factory;
pub mod gemini;
pub mod openai;
pub mod types;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAIClient;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for different LLM provider implementations
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Sends a request to the LLM service
    async fn send_message(&mut self, request: LLMRequest) -> Result<LLMResponse>;

    /// Short identifier of the provider, e.g. "anthropic"
    fn provider_name(&self) -> &'static str;

    /// Models this provider can be configured with
    fn available_models(&self) -> Vec<String>;

    /// Schema dialect expected for tool parameter declarations
    fn schema_dialect(&self) -> SchemaDialect {
        SchemaDialect::JsonSchema
    }
}
