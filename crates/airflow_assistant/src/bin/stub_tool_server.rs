//! A small tool server speaking the stdio protocol, for development and tests.
//!
//! It pretends to front an Airflow deployment with three DAGs and offers a
//! few extra tools that make failure modes reproducible.

use airflow_assistant::logging::setup_logging;
use airflow_assistant::mcp::types::*;
use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tracing::{debug, error, trace};

#[derive(Parser, Debug)]
#[command(about = "Stub Airflow tool server for development and testing only")]
struct Args {
    /// Exit as soon as the first message arrives
    #[arg(long)]
    exit_before_handshake: bool,

    /// Answer `initialize` with something that is not JSON-RPC
    #[arg(long)]
    garbage_handshake: bool,

    /// Number of tools per `tools/list` page
    #[arg(long, default_value_t = 3)]
    page_size: usize,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn tool_catalogue() -> Vec<WireTool> {
    let tool = |name: &str, description: &str, schema: Value| WireTool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: Some(schema),
    };
    vec![
        tool(
            "list_dags",
            "List the DAGs of the Airflow deployment",
            json!({
                "type": "object",
                "properties": {"active": {"type": "boolean", "title": "Only active DAGs"}},
                "required": []
            }),
        ),
        tool(
            "get_dag",
            "Get the details of one DAG",
            json!({
                "type": "object",
                "properties": {"dag_id": {"type": "string", "title": "Dag Id"}},
                "required": ["dag_id"]
            }),
        ),
        tool(
            "server_pid",
            "Process id of this server",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "echo_env",
            "Value of an environment variable of this server",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        ),
        tool(
            "fail",
            "Always fails",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "slow",
            "Sleeps before answering",
            json!({
                "type": "object",
                "properties": {"millis": {"type": "integer"}},
                "required": ["millis"]
            }),
        ),
        tool(
            "chatty",
            "Sends unrelated messages before answering",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}

const DAGS: [(&str, bool); 4] = [
    ("etl_daily", true),
    ("reporting", true),
    ("cleanup", true),
    ("legacy_import", false),
];

enum CallOutcome {
    Result(ToolCallResult),
    Error(i32, String),
}

struct StubServer {
    args: Args,
    lines: Lines<BufReader<Stdin>>,
    stdout: Stdout,
}

impl StubServer {
    fn new(args: Args) -> Self {
        Self {
            args,
            lines: BufReader::new(tokio::io::stdin()).lines(),
            stdout: tokio::io::stdout(),
        }
    }

    async fn run(&mut self) -> Result<()> {
        while let Some(line) = self.lines.next_line().await? {
            if self.args.exit_before_handshake {
                debug!("Exiting before the handshake");
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }
            self.handle_message(&line).await?;
        }
        debug!("Client closed stdin");
        Ok(())
    }

    async fn send_message(&mut self, message: &Value) -> Result<()> {
        let message_str = serde_json::to_string(message)?;
        trace!("Sending message: {}", message_str);
        self.write_line(&message_str).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdout.write_all(line.as_bytes()).await?;
        self.stdout.write_all(b"\n").await?;
        self.stdout.flush().await?;
        Ok(())
    }

    async fn send_response<T: serde::Serialize>(&mut self, id: RequestId, result: T) -> Result<()> {
        let response = JSONRPCResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result,
        };
        self.send_message(&serde_json::to_value(response)?).await
    }

    async fn send_error(&mut self, id: RequestId, code: i32, message: String) -> Result<()> {
        let error = JSONRPCError {
            jsonrpc: "2.0".to_string(),
            id,
            error: ErrorObject {
                code,
                message,
                data: None,
            },
        };
        self.send_message(&serde_json::to_value(error)?).await
    }

    async fn handle_initialize(&mut self, id: RequestId, params: InitializeParams) -> Result<()> {
        debug!("Initialize from {}", params.client_info.name);
        if self.args.garbage_handshake {
            return self.write_line("this is not json-rpc").await;
        }
        self.send_response(
            id,
            InitializeResult {
                capabilities: ServerCapabilities {
                    tools: Some(ToolsCapability {
                        list_changed: Some(false),
                    }),
                },
                protocol_version: params.protocol_version,
                server_info: Implementation {
                    name: "stub-tool-server".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                instructions: None,
            },
        )
        .await
    }

    async fn handle_tools_list(&mut self, id: RequestId, params: ListToolsParams) -> Result<()> {
        let tools = tool_catalogue();
        let start = params
            .cursor
            .as_deref()
            .and_then(|cursor| cursor.parse::<usize>().ok())
            .unwrap_or(0)
            .min(tools.len());
        let end = (start + self.args.page_size.max(1)).min(tools.len());
        debug!("Listing tools {}..{}", start, end);

        self.send_response(
            id,
            ListToolsResult {
                tools: tools[start..end].to_vec(),
                next_cursor: (end < tools.len()).then(|| end.to_string()),
            },
        )
        .await
    }

    async fn handle_tool_call(&mut self, id: RequestId, params: ToolCallParams) -> Result<()> {
        debug!("Handling tool call for {}", params.name);
        let arguments = params.arguments.unwrap_or_else(|| json!({}));

        let outcome = match params.name.as_str() {
            "list_dags" => {
                let only_active = match arguments.get("active") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(active)) => *active,
                    Some(other) => {
                        return self
                            .send_error(
                                id,
                                INVALID_PARAMS,
                                format!("active must be a boolean, got {other}"),
                            )
                            .await
                    }
                };
                let total = DAGS
                    .iter()
                    .filter(|(_, active)| *active || !only_active)
                    .count();
                CallOutcome::Result(ToolCallResult {
                    content: vec![json!({ "total_entries": total })],
                    is_error: false,
                })
            }
            "get_dag" => match arguments.get("dag_id").and_then(Value::as_str) {
                None => CallOutcome::Error(INVALID_PARAMS, "dag_id is required".to_string()),
                Some(dag_id) => match DAGS.iter().find(|(name, _)| *name == dag_id) {
                    Some((name, active)) => CallOutcome::Result(ToolCallResult::text(
                        format!("DAG {name} is_paused: {}", !active),
                        false,
                    )),
                    None => CallOutcome::Result(ToolCallResult::text(
                        format!("DAG {dag_id} not found"),
                        true,
                    )),
                },
            },
            "server_pid" => {
                CallOutcome::Result(ToolCallResult::text(std::process::id().to_string(), false))
            }
            "echo_env" => {
                let name = arguments
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let value = std::env::var(name).unwrap_or_default();
                CallOutcome::Result(ToolCallResult::text(value, false))
            }
            "fail" => CallOutcome::Result(ToolCallResult::text(
                "Airflow API returned 500 Internal Server Error",
                true,
            )),
            "slow" => {
                let millis = arguments.get("millis").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                CallOutcome::Result(ToolCallResult::text(format!("slept {millis}ms"), false))
            }
            "chatty" => self.chatty().await?,
            name => CallOutcome::Error(METHOD_NOT_FOUND, format!("Unknown tool: {name}")),
        };

        match outcome {
            CallOutcome::Result(result) => self.send_response(id, result).await,
            CallOutcome::Error(code, message) => self.send_error(id, code, message).await,
        }
    }

    /// Sends a notification, a stray response and a server request, then
    /// reports the code of the client's reply to that request.
    async fn chatty(&mut self) -> Result<CallOutcome> {
        self.send_message(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {"level": "info", "data": "working"}
        }))
        .await?;
        self.send_message(&json!({"jsonrpc": "2.0", "id": 9999, "result": {}}))
            .await?;
        self.send_message(&json!({"jsonrpc": "2.0", "id": "srv-1", "method": "roots/list"}))
            .await?;

        let reply = self.lines.next_line().await?.unwrap_or_default();
        let code = serde_json::from_str::<Value>(&reply)
            .ok()
            .and_then(|reply| reply["error"]["code"].as_i64());
        Ok(match code {
            Some(code) => CallOutcome::Result(ToolCallResult::text(
                format!("client answered {code}"),
                false,
            )),
            None => CallOutcome::Error(INTERNAL_ERROR, format!("unexpected reply: {reply}")),
        })
    }

    async fn handle_message(&mut self, message: &str) -> Result<()> {
        let message: JSONRPCMessage = match serde_json::from_str(message) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Invalid JSON-RPC message: {}", e);
                return Ok(());
            }
        };

        match message {
            JSONRPCMessage::Request {
                method, id, params, ..
            } => {
                trace!("Processing request: method={}, id={}", method, id);
                let params = params.unwrap_or_else(|| json!({}));
                match method.as_str() {
                    "initialize" => match serde_json::from_value(params) {
                        Ok(params) => self.handle_initialize(id, params).await?,
                        Err(e) => {
                            self.send_error(id, INVALID_PARAMS, e.to_string()).await?
                        }
                    },
                    "tools/list" => {
                        let params = serde_json::from_value(params).unwrap_or_default();
                        self.handle_tools_list(id, params).await?
                    }
                    "tools/call" => match serde_json::from_value(params) {
                        Ok(params) => self.handle_tool_call(id, params).await?,
                        Err(e) => {
                            self.send_error(id, INVALID_PARAMS, format!("Invalid tool parameters: {e}"))
                                .await?
                        }
                    },
                    method => {
                        self.send_error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
                            .await?
                    }
                }
            }
            JSONRPCMessage::Notification { method, .. } => match method.as_str() {
                "notifications/initialized" => debug!("Client initialized"),
                _ => debug!("Unknown notification: {}", method),
            },
            JSONRPCMessage::Response { id, .. } | JSONRPCMessage::Error { id: Some(id), .. } => {
                debug!("Ignoring unexpected reply {}", id)
            }
            JSONRPCMessage::Error { id: None, error, .. } => {
                debug!("Ignoring error without id: {}", error.message)
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);
    StubServer::new(args).run().await
}
