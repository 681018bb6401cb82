use super::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace, warn};

/// How long `close()` waits for the server to exit after stdin is closed.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Launch parameters of the tool server process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values may reference the current environment as `${NAME}`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ToolServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Environment with `${NAME}` references expanded. Unset variables expand
    /// to the empty string.
    pub fn resolved_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(key, value)| (key.clone(), expand_env_refs(value)))
            .collect()
    }
}

fn expand_env_refs(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                result.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference stays literal
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to launch tool server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool server handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Malformed message from tool server: {0}")]
    Malformed(String),

    #[error("Tool server exited unexpectedly")]
    ProcessExited,

    #[error("Tool session is not ready (state: {0:?})")]
    NotReady(SessionState),

    #[error("Tool server rejected `{method}` ({code}): {message}")]
    Rejected {
        method: String,
        code: i32,
        message: String,
    },

    #[error("Timed out after {timeout:?} waiting for `{method}`")]
    Timeout { method: String, timeout: Duration },

    #[error("I/O error on tool server connection: {0}")]
    Io(#[from] std::io::Error),
}

/// A failed tool call. Reported back to the model, not fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool {tool} failed: {message}")]
    Execution { tool: String, message: String },

    #[error("Tool {tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("Tool server connection failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// One running tool server process and its JSON-RPC connection.
///
/// Messages are newline-delimited JSON on the child's stdin/stdout. The
/// child's stderr is forwarded to the log.
pub struct ToolSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    state: SessionState,
    next_id: i64,
    request_timeout: Duration,
    server_info: Option<Implementation>,
}

impl ToolSession {
    /// Spawns the server and performs the `initialize` exchange.
    pub async fn start(
        config: &ToolServerConfig,
        request_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        debug!("Starting tool server: {} {:?}", config.command, config.args);

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(config.resolved_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProtocolError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ProtocolError::HandshakeFailed(
                "tool server stdio is not available".to_string(),
            ));
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("tool server: {}", line);
                }
            });
        }

        let mut session = Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            state: SessionState::Uninitialized,
            next_id: 0,
            request_timeout,
            server_info: None,
        };

        if let Err(e) = session.handshake().await {
            session.state = SessionState::Failed;
            session.close().await;
            return Err(match e {
                ProtocolError::HandshakeFailed(_) | ProtocolError::Spawn { .. } => e,
                other => ProtocolError::HandshakeFailed(other.to_string()),
            });
        }

        Ok(session)
    }

    async fn handshake(&mut self) -> Result<(), ProtocolError> {
        self.state = SessionState::Handshaking;

        let params = InitializeParams {
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: PROTOCOL_VERSION.to_string(),
        };

        let result = self
            .round_trip("initialize", serde_json::to_value(params)?)
            .await?
            .map_err(|error| {
                ProtocolError::HandshakeFailed(format!(
                    "initialize rejected ({}): {}",
                    error.code, error.message
                ))
            })?;

        let initialized: InitializeResult = serde_json::from_value(result).map_err(|e| {
            ProtocolError::HandshakeFailed(format!("invalid initialize result: {e}"))
        })?;

        debug!(
            "Connected to tool server {} {} (protocol {})",
            initialized.server_info.name,
            initialized.server_info.version,
            initialized.protocol_version
        );
        self.server_info = Some(initialized.server_info);

        self.notify("notifications/initialized").await?;
        self.state = SessionState::Ready;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// False once the server process has exited, whatever the state says.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ready and backed by a running process.
    pub fn is_reusable(&mut self) -> bool {
        self.is_ready() && self.is_alive()
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    /// Process id of the server, while it runs.
    pub fn process_id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Lists all tools, following pagination cursors until exhausted.
    pub async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        self.ensure_ready()?;

        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let params = serde_json::to_value(ListToolsParams { cursor })?;
            let page = match self.round_trip("tools/list", params).await {
                Ok(Ok(result)) => serde_json::from_value::<ListToolsResult>(result)
                    .map_err(|e| ProtocolError::Malformed(format!("tools/list result: {e}"))),
                Ok(Err(error)) => Err(ProtocolError::Rejected {
                    method: "tools/list".to_string(),
                    code: error.code,
                    message: error.message,
                }),
                Err(e) => Err(e),
            };
            let page = page.inspect_err(|_| self.state = SessionState::Failed)?;

            tools.extend(page.tools.into_iter().map(ToolDescriptor::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!("Tool server offers {} tools", tools.len());
        Ok(tools)
    }

    /// Calls one tool and returns its rendered content.
    pub async fn invoke(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ToolInvocationError> {
        self.ensure_ready()?;

        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments: Some(arguments),
        })
        .map_err(ProtocolError::from)?;

        let reply = match self.round_trip("tools/call", params).await {
            Ok(reply) => reply,
            Err(ProtocolError::Timeout { timeout, .. }) => {
                self.state = SessionState::Failed;
                return Err(ToolInvocationError::Timeout {
                    tool: name.to_string(),
                    timeout,
                });
            }
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(e.into());
            }
        };

        match reply {
            Ok(result) => {
                let result: ToolCallResult = serde_json::from_value(result).map_err(|e| {
                    self.state = SessionState::Failed;
                    ProtocolError::Malformed(format!("tools/call result: {e}"))
                })?;
                if result.is_error {
                    Err(ToolInvocationError::Execution {
                        tool: name.to_string(),
                        message: result.render(),
                    })
                } else {
                    Ok(result.render())
                }
            }
            Err(error) => Err(classify_call_error(name, error)),
        }
    }

    /// Terminates the server. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        // EOF on stdin asks the server to shut down
        self.stdin.take();

        match tokio::time::timeout(CLOSE_GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Tool server exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for tool server: {}", e),
            Err(_) => {
                debug!("Tool server did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill tool server: {}", e);
                }
            }
        }

        self.state = SessionState::Closed;
    }

    fn ensure_ready(&self) -> Result<(), ProtocolError> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(ProtocolError::NotReady(self.state))
        }
    }

    /// Sends a request and waits for the correlated reply.
    ///
    /// The outer error is a connection failure, the inner one an error
    /// object returned by the server.
    async fn round_trip(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Result<serde_json::Value, ErrorObject>, ProtocolError> {
        self.next_id += 1;
        let id = RequestId::Number(self.next_id);

        let request = JSONRPCRequest {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        self.write_message(&serde_json::to_string(&request)?).await?;

        let timeout = self.request_timeout;
        match tokio::time::timeout(timeout, self.read_reply(&id)).await {
            Ok(reply) => reply,
            Err(_) => Err(ProtocolError::Timeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }

    async fn read_reply(
        &mut self,
        expected: &RequestId,
    ) -> Result<Result<serde_json::Value, ErrorObject>, ProtocolError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or(ProtocolError::ProcessExited)?;
            if line.trim().is_empty() {
                continue;
            }
            trace!("Received message: {}", line);

            let message: JSONRPCMessage = serde_json::from_str(&line)
                .map_err(|e| ProtocolError::Malformed(format!("{e}: {line}")))?;

            match message {
                JSONRPCMessage::Response { id, result, .. } if &id == expected => {
                    return Ok(Ok(result));
                }
                JSONRPCMessage::Error {
                    id: Some(id),
                    error,
                    ..
                } if &id == expected => {
                    return Ok(Err(error));
                }
                JSONRPCMessage::Response { id, .. } => {
                    debug!("Skipping response for foreign request {}", id);
                }
                JSONRPCMessage::Error { id, error, .. } => {
                    debug!(
                        "Skipping error for request {:?}: {} {}",
                        id, error.code, error.message
                    );
                }
                JSONRPCMessage::Request { id, method, .. } => {
                    debug!("Rejecting server request {} ({})", method, id);
                    let reply = JSONRPCError {
                        jsonrpc: "2.0".to_string(),
                        id,
                        error: ErrorObject {
                            code: METHOD_NOT_FOUND,
                            message: format!("Method not supported by client: {method}"),
                            data: None,
                        },
                    };
                    self.write_message(&serde_json::to_string(&reply)?).await?;
                }
                JSONRPCMessage::Notification { method, .. } => {
                    debug!("Ignoring server notification {}", method);
                }
            }
        }
    }

    async fn notify(&mut self, method: &str) -> Result<(), ProtocolError> {
        let notification = JSONRPCNotification::<serde_json::Value> {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: None,
        };
        self.write_message(&serde_json::to_string(&notification)?)
            .await
    }

    async fn write_message(&mut self, message: &str) -> Result<(), ProtocolError> {
        trace!("Sending message: {}", message);
        let stdin = self.stdin.as_mut().ok_or(ProtocolError::ProcessExited)?;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

fn classify_call_error(tool: &str, error: ErrorObject) -> ToolInvocationError {
    let unknown_tool = error.message.to_lowercase().contains("unknown tool");
    match error.code {
        METHOD_NOT_FOUND => ToolInvocationError::UnknownTool(tool.to_string()),
        _ if unknown_tool => ToolInvocationError::UnknownTool(tool.to_string()),
        INVALID_PARAMS => ToolInvocationError::InvalidArguments {
            tool: tool.to_string(),
            message: error.message,
        },
        _ => ToolInvocationError::Execution {
            tool: tool.to_string(),
            message: error.message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_references_are_expanded() {
        std::env::set_var("AIRFLOW_ASSISTANT_TEST_HOST", "http://localhost:8080");
        assert_eq!(
            expand_env_refs("${AIRFLOW_ASSISTANT_TEST_HOST}/api/v1"),
            "http://localhost:8080/api/v1"
        );
        assert_eq!(expand_env_refs("plain"), "plain");
        assert_eq!(expand_env_refs("${AIRFLOW_ASSISTANT_TEST_UNSET_VAR}"), "");
        assert_eq!(expand_env_refs("broken ${NAME"), "broken ${NAME");
    }

    #[test]
    fn test_resolved_env_keeps_keys() {
        let config = ToolServerConfig::new("server")
            .with_args(["--unsafe"])
            .with_env("AIRFLOW_USERNAME", "admin");
        assert_eq!(config.args, vec!["--unsafe".to_string()]);
        assert_eq!(
            config.resolved_env(),
            vec![("AIRFLOW_USERNAME".to_string(), "admin".to_string())]
        );
    }

    #[test]
    fn test_call_errors_are_classified() {
        let error = |code: i32, message: &str| ErrorObject {
            code,
            message: message.to_string(),
            data: None,
        };
        assert!(matches!(
            classify_call_error("x", error(METHOD_NOT_FOUND, "nope")),
            ToolInvocationError::UnknownTool(name) if name == "x"
        ));
        assert!(matches!(
            classify_call_error("x", error(INTERNAL_ERROR, "Unknown tool: x")),
            ToolInvocationError::UnknownTool(_)
        ));
        assert!(matches!(
            classify_call_error("x", error(INVALID_PARAMS, "active must be boolean")),
            ToolInvocationError::InvalidArguments { .. }
        ));
        assert!(matches!(
            classify_call_error("x", error(INTERNAL_ERROR, "boom")),
            ToolInvocationError::Execution { message, .. } if message == "boom"
        ));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_spawn() {
        let config = ToolServerConfig::new("/nonexistent/airflow-tool-server");
        let result = ToolSession::start(&config, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::Spawn { .. })));
    }
}
