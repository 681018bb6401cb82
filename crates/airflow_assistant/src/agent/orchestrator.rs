use super::assembler::ResponseAssembler;
use crate::mcp::{ProtocolError, ToolBackend, ToolInvocationError};
use crate::tools::build_declarations;
use llm::{ContentBlock, LLMProvider, LLMRequest, LLMResponse, Message, ToolDefinition, Usage};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Upper bound on model dispatches per run. Values below 1 count as 1.
    pub max_depth: usize,
    pub max_tokens: Option<u32>,
    pub system_prompt: String,
    pub model_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            system_prompt: super::DEFAULT_SYSTEM_PROMPT.to_string(),
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Model call failed: {0:#}")]
    ModelCall(anyhow::Error),

    #[error("Model call timed out after {0:?}")]
    ModelTimeout(Duration),

    #[error("Could not load tools: {0}")]
    ToolSetup(#[from] ProtocolError),

    #[error("Run was cancelled")]
    Cancelled,
}

/// State of one in-flight run.
#[derive(Debug)]
pub struct OrchestrationContext {
    pub conversation: Vec<Message>,
    pub depth: usize,
    pub max_depth: usize,
    pub accumulated_text: ResponseAssembler,
    pub usage: Usage,
}

impl OrchestrationContext {
    fn new(conversation: Vec<Message>, max_depth: usize) -> Self {
        Self {
            conversation,
            depth: 0,
            max_depth,
            accumulated_text: ResponseAssembler::new(),
            usage: Usage::zero(),
        }
    }

    fn finish(self, truncated: bool) -> RunOutcome {
        RunOutcome {
            answer: self.accumulated_text.join(),
            produced_text: self.accumulated_text.has_text(),
            truncated,
            depth: self.depth,
            conversation: self.conversation,
            usage: self.usage,
        }
    }
}

/// Result of a completed (possibly truncated) run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub answer: String,
    /// False when `answer` is the no-text sentinel.
    pub produced_text: bool,
    /// The depth bound stopped the run while the model still wanted tools.
    pub truncated: bool,
    /// Depth of the last dispatch, starting at 0.
    pub depth: usize,
    pub conversation: Vec<Message>,
    pub usage: Usage,
}

enum Turn {
    /// The model answered without requesting tools
    Done,
    /// Tools were executed and their results appended
    ToolsExecuted,
}

/// Drives the depth-bounded tool-use loop.
///
/// Each turn sends the conversation to the model, executes all requested
/// tools in order and appends one assistant message with the tool uses and
/// one user message with their results before the next dispatch.
pub struct Orchestrator {
    settings: RunSettings,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(mut settings: RunSettings) -> Self {
        settings.max_depth = settings.max_depth.max(1);
        Self {
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        llm: &mut dyn LLMProvider,
        tools: &mut dyn ToolBackend,
        conversation: Vec<Message>,
    ) -> Result<RunOutcome, RunError> {
        self.check_cancelled()?;

        let descriptors = tools.list_tools().await?;
        let declarations = build_declarations(&descriptors, llm.schema_dialect());
        debug!(
            "Declaring {} of {} tools to {}",
            declarations.len(),
            descriptors.len(),
            llm.provider_name()
        );

        let mut context = OrchestrationContext::new(conversation, self.settings.max_depth);
        let mut depth = 0;
        loop {
            let turn = self
                .turn(llm, tools, &mut context, &declarations, depth)
                .await?;
            match turn {
                Turn::Done => {
                    info!("Run finished at depth {}", depth);
                    return Ok(context.finish(false));
                }
                Turn::ToolsExecuted if depth + 1 >= context.max_depth => {
                    info!(
                        "Run truncated at depth {} (max depth {})",
                        depth, context.max_depth
                    );
                    return Ok(context.finish(true));
                }
                Turn::ToolsExecuted => depth += 1,
            }
        }
    }

    async fn turn(
        &self,
        llm: &mut dyn LLMProvider,
        tools: &mut dyn ToolBackend,
        context: &mut OrchestrationContext,
        declarations: &[ToolDefinition],
        depth: usize,
    ) -> Result<Turn, RunError> {
        context.depth = depth;
        self.check_cancelled()?;

        let response = self
            .dispatch(llm, &context.conversation, declarations, depth)
            .await?;
        context.usage.input_tokens += response.usage.input_tokens;
        context.usage.output_tokens += response.usage.output_tokens;

        let content = assign_unique_ids(&context.conversation, response.content, depth);

        let mut tool_uses = Vec::new();
        for block in &content {
            match block {
                ContentBlock::Text { text } => context.accumulated_text.push(text.clone()),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_uses.push((id.clone(), name.clone(), input.clone()))
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    warn!("Ignoring tool result {} sent by the model", tool_use_id);
                }
            }
        }

        let assistant_blocks: Vec<ContentBlock> = content
            .into_iter()
            .filter(|block| !matches!(block, ContentBlock::ToolResult { .. }))
            .collect();

        if tool_uses.is_empty() {
            if !assistant_blocks.is_empty() {
                context
                    .conversation
                    .push(Message::new_assistant_content(assistant_blocks));
            }
            return Ok(Turn::Done);
        }

        let declared: HashSet<&str> = declarations.iter().map(|d| d.name.as_str()).collect();
        let mut results = Vec::with_capacity(tool_uses.len());
        for (id, name, input) in tool_uses {
            self.check_cancelled()?;

            let result = if declared.contains(name.as_str()) {
                debug!("Invoking tool {} ({})", name, id);
                tools.invoke(&name, input).await
            } else {
                Err(ToolInvocationError::UnknownTool(name.clone()))
            };

            results.push(match result {
                Ok(output) => ContentBlock::new_tool_result(id, output, false),
                Err(e) => {
                    warn!("Tool {} failed: {}", name, e);
                    ContentBlock::new_tool_result(id, format!("Error: {e}"), true)
                }
            });
        }

        context
            .conversation
            .push(Message::new_assistant_content(assistant_blocks));
        context
            .conversation
            .push(Message::new_user_content(results));

        Ok(Turn::ToolsExecuted)
    }

    async fn dispatch(
        &self,
        llm: &mut dyn LLMProvider,
        conversation: &[Message],
        declarations: &[ToolDefinition],
        depth: usize,
    ) -> Result<LLMResponse, RunError> {
        let request = LLMRequest {
            messages: conversation.to_vec(),
            system_prompt: self.settings.system_prompt.clone(),
            tools: if declarations.is_empty() {
                None
            } else {
                Some(declarations.to_vec())
            },
            max_tokens: self.settings.max_tokens,
        };

        debug!(
            "Dispatching {} messages to {} at depth {}",
            request.messages.len(),
            llm.provider_name(),
            depth
        );

        let timeout = self.settings.model_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RunError::Cancelled),
            result = tokio::time::timeout(timeout, llm.send_message(request)) => match result {
                Err(_) => Err(RunError::ModelTimeout(timeout)),
                Ok(Err(e)) => Err(RunError::ModelCall(e)),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }

    fn check_cancelled(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Rewrites empty or already used tool use ids to `tool-{depth}-{index}`.
fn assign_unique_ids(
    conversation: &[Message],
    content: Vec<ContentBlock>,
    depth: usize,
) -> Vec<ContentBlock> {
    let mut seen: HashSet<String> = conversation
        .iter()
        .flat_map(|message| message.blocks())
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, .. } => Some(id),
            _ => None,
        })
        .collect();

    let mut index = 0;
    content
        .into_iter()
        .map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                let id = if id.is_empty() || seen.contains(&id) {
                    let mut candidate = format!("tool-{depth}-{index}");
                    let mut suffix = 1;
                    while seen.contains(&candidate) {
                        candidate = format!("tool-{depth}-{index}-{suffix}");
                        suffix += 1;
                    }
                    debug!("Rewriting tool use id {:?} to {}", id, candidate);
                    candidate
                } else {
                    id
                };
                seen.insert(id.clone());
                index += 1;
                ContentBlock::ToolUse { id, name, input }
            }
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_and_empty_ids_are_rewritten() {
        let conversation = vec![Message::new_assistant_content(vec![
            ContentBlock::new_tool_use("1", "list_dags", json!({})),
        ])];
        let content = vec![
            ContentBlock::new_text("again"),
            ContentBlock::new_tool_use("1", "list_dags", json!({})),
            ContentBlock::new_tool_use("", "get_dag", json!({})),
            ContentBlock::new_tool_use("fresh", "get_dag", json!({})),
            ContentBlock::new_tool_use("fresh", "get_dag", json!({})),
        ];

        let ids: Vec<String> = assign_unique_ids(&conversation, content, 2)
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["tool-2-0", "tool-2-1", "fresh", "tool-2-3"]);
    }

    #[test]
    fn test_max_depth_below_one_is_raised() {
        let orchestrator = Orchestrator::new(RunSettings {
            max_depth: 0,
            ..Default::default()
        });
        assert_eq!(orchestrator.settings().max_depth, 1);
    }
}
