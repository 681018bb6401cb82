mod assembler;
mod orchestrator;

pub use assembler::{ResponseAssembler, NO_TEXT_SENTINEL};
pub use orchestrator::{
    OrchestrationContext, Orchestrator, RunError, RunOutcome, RunSettings, DEFAULT_MAX_DEPTH,
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL_TIMEOUT,
};

/// Instructions for the Airflow metrics agent.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../../resources/system_prompt.md");
