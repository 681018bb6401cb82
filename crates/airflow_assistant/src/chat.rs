use crate::agent::{Orchestrator, RunError, RunOutcome, RunSettings};
use crate::config::AppConfig;
use crate::mcp::{
    EphemeralSessions, ProtocolError, SessionPolicy, SessionPool, ToolBackend, ToolDescriptor,
    ToolServerConfig,
};
use llm::{LLMProvider, Message, MessageRole};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Answers chat questions with the help of the tool server.
///
/// Holds the session pool when the pooled policy is configured, so it is
/// shared by every question asked through this service.
pub struct ChatService {
    settings: RunSettings,
    tool_server: ToolServerConfig,
    tool_timeout: Duration,
    history_limit: usize,
    pool: Option<SessionPool>,
}

impl ChatService {
    pub fn new(config: &AppConfig) -> Self {
        let pool = match config.session_policy {
            SessionPolicy::Pooled => Some(SessionPool::new(
                config.tool_server.clone(),
                config.pool_size,
                config.tool_timeout(),
            )),
            SessionPolicy::Ephemeral => None,
        };
        Self {
            settings: config.run_settings(),
            tool_server: config.tool_server.clone(),
            tool_timeout: config.tool_timeout(),
            history_limit: config.history_limit,
            pool,
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        if self.pool.is_some() {
            SessionPolicy::Pooled
        } else {
            SessionPolicy::Ephemeral
        }
    }

    /// Runs one question against the model and the tool server.
    ///
    /// `history` holds earlier messages of the chat, oldest first.
    pub async fn answer(
        &self,
        llm: &mut dyn LLMProvider,
        history: &[Message],
        question: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let mut backend = self.acquire_backend().await?;
        self.answer_with(llm, backend.as_mut(), history, question, cancel)
            .await
    }

    /// Same as [`ChatService::answer`] with an already acquired backend.
    /// The backend is closed before returning, whatever the outcome.
    pub async fn answer_with(
        &self,
        llm: &mut dyn LLMProvider,
        backend: &mut dyn ToolBackend,
        history: &[Message],
        question: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let conversation = build_conversation(history, question, self.history_limit);
        debug!(
            "Answering with {} messages of history",
            conversation.len() - 1
        );

        let orchestrator =
            Orchestrator::new(self.settings.clone()).with_cancellation(cancel);
        let result = orchestrator.run(llm, backend, conversation).await;
        backend.close().await;

        if let Ok(outcome) = &result {
            info!(
                "Answered at depth {} (truncated: {}, tokens in/out: {}/{})",
                outcome.depth,
                outcome.truncated,
                outcome.usage.input_tokens,
                outcome.usage.output_tokens
            );
        }
        result
    }

    /// Lists the tool server's tools through the configured policy.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        let mut backend = self.acquire_backend().await?;
        let tools = backend.list_tools().await;
        backend.close().await;
        tools
    }

    /// Closes idle pooled sessions.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }

    async fn acquire_backend(&self) -> Result<Box<dyn ToolBackend>, ProtocolError> {
        Ok(match &self.pool {
            Some(pool) => Box::new(pool.acquire().await?),
            None => Box::new(EphemeralSessions::new(
                self.tool_server.clone(),
                self.tool_timeout,
            )),
        })
    }
}

/// The last `limit` text messages of `history` followed by the question.
///
/// Tool traffic of earlier runs is not replayed.
pub fn build_conversation(history: &[Message], question: &str, limit: usize) -> Vec<Message> {
    let texts: Vec<Message> = history
        .iter()
        .filter(|message| message.role != MessageRole::System)
        .filter_map(|message| {
            let text = message.text();
            if text.trim().is_empty() {
                return None;
            }
            Some(match message.role {
                MessageRole::Assistant => Message::new_assistant(text),
                _ => Message::new_user(text),
            })
        })
        .collect();

    let skip = texts.len().saturating_sub(limit);
    let mut conversation: Vec<Message> = texts.into_iter().skip(skip).collect();
    conversation.push(Message::new_user(question));
    conversation
}
