use airflow_assistant::mcp::{
    EphemeralSessions, ProtocolError, SessionPool, SessionState, ToolBackend,
    ToolInvocationError, ToolServerConfig, ToolSession,
};
use serde_json::json;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn stub_server() -> ToolServerConfig {
    ToolServerConfig::new(env!("CARGO_BIN_EXE_stub-tool-server"))
}

async fn start() -> ToolSession {
    ToolSession::start(&stub_server(), TIMEOUT)
        .await
        .expect("stub server should start")
}

#[tokio::test]
async fn test_handshake_reaches_ready() {
    let mut session = start().await;
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(
        session.server_info().map(|info| info.name.as_str()),
        Some("stub-tool-server")
    );
    assert!(session.process_id().is_some());
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_list_tools_follows_pagination() {
    let mut session = ToolSession::start(
        &stub_server().with_args(["--page-size", "2"]),
        TIMEOUT,
    )
    .await
    .unwrap();

    let tools = session.list_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["list_dags", "get_dag", "server_pid", "echo_env", "fail", "slow", "chatty"]
    );

    // The wire `inputSchema` arrives as `input_schema`
    let list_dags = &tools[0];
    assert_eq!(list_dags.description, "List the DAGs of the Airflow deployment");
    assert_eq!(
        list_dags.input_schema.as_ref().unwrap()["properties"]["active"]["type"],
        "boolean"
    );
    session.close().await;
}

#[tokio::test]
async fn test_invoke_renders_content() {
    let mut session = start().await;

    let all = session.invoke("list_dags", json!({})).await.unwrap();
    assert_eq!(all, r#"{"total_entries":4}"#);
    let active = session
        .invoke("list_dags", json!({"active": true}))
        .await
        .unwrap();
    assert_eq!(active, r#"{"total_entries":3}"#);

    let dag = session
        .invoke("get_dag", json!({"dag_id": "reporting"}))
        .await
        .unwrap();
    assert_eq!(dag, "DAG reporting is_paused: false");
    session.close().await;
}

#[tokio::test]
async fn test_invocation_errors_keep_session_ready() {
    let mut session = start().await;

    let unknown = session.invoke("drop_database", json!({})).await;
    assert!(
        matches!(unknown, Err(ToolInvocationError::UnknownTool(ref name)) if name == "drop_database"),
        "{unknown:?}"
    );

    let invalid = session.invoke("get_dag", json!({})).await;
    assert!(
        matches!(invalid, Err(ToolInvocationError::InvalidArguments { .. })),
        "{invalid:?}"
    );

    match session.invoke("fail", json!({})).await {
        Err(ToolInvocationError::Execution { tool, message }) => {
            assert_eq!(tool, "fail");
            assert!(message.contains("500"), "{message}");
        }
        other => panic!("Expected execution error, got {other:?}"),
    }

    assert!(session.is_ready());
    assert!(session.invoke("server_pid", json!({})).await.is_ok());
    session.close().await;
}

#[tokio::test]
async fn test_server_messages_are_handled_while_waiting() {
    let mut session = start().await;
    let reply = session.invoke("chatty", json!({})).await.unwrap();
    assert_eq!(reply, "client answered -32601");
    assert!(session.is_ready());
    session.close().await;
}

#[tokio::test]
async fn test_timeout_fails_session() {
    let mut session = ToolSession::start(&stub_server(), Duration::from_millis(200))
        .await
        .unwrap();

    let result = session.invoke("slow", json!({"millis": 5000})).await;
    assert!(
        matches!(result, Err(ToolInvocationError::Timeout { .. })),
        "{result:?}"
    );
    assert_eq!(session.state(), SessionState::Failed);

    let after = session.invoke("server_pid", json!({})).await;
    assert!(matches!(
        after,
        Err(ToolInvocationError::Protocol(ProtocolError::NotReady(
            SessionState::Failed
        )))
    ));
    session.close().await;
}

#[tokio::test]
async fn test_early_exit_fails_handshake() {
    let result = ToolSession::start(
        &stub_server().with_args(["--exit-before-handshake"]),
        TIMEOUT,
    )
    .await;
    assert!(
        matches!(result, Err(ProtocolError::HandshakeFailed(_))),
        "{:?}",
        result.err()
    );
}

#[tokio::test]
async fn test_garbage_fails_handshake() {
    let result =
        ToolSession::start(&stub_server().with_args(["--garbage-handshake"]), TIMEOUT).await;
    assert!(
        matches!(result, Err(ProtocolError::HandshakeFailed(_))),
        "{:?}",
        result.err()
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut session = start().await;
    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    let result = session.list_tools().await;
    assert!(matches!(
        result,
        Err(ProtocolError::NotReady(SessionState::Closed))
    ));
}

#[tokio::test]
async fn test_env_references_are_resolved() {
    std::env::set_var("STUB_SERVER_SECRET", "s3cret");
    let config = stub_server()
        .with_env("AIRFLOW_AUTH_TOKEN", "${STUB_SERVER_SECRET}")
        .with_env("AIRFLOW_BASE_URL", "http://localhost:8080");

    let mut session = ToolSession::start(&config, TIMEOUT).await.unwrap();
    let token = session
        .invoke("echo_env", json!({"name": "AIRFLOW_AUTH_TOKEN"}))
        .await
        .unwrap();
    let url = session
        .invoke("echo_env", json!({"name": "AIRFLOW_BASE_URL"}))
        .await
        .unwrap();
    assert_eq!(token, "s3cret");
    assert_eq!(url, "http://localhost:8080");
    session.close().await;
}

#[tokio::test]
async fn test_ephemeral_sessions_spawn_per_call() {
    let mut backend = EphemeralSessions::new(stub_server(), TIMEOUT);

    let tools = backend.list_tools().await.unwrap();
    assert_eq!(tools.len(), 7);

    let first = backend.invoke("server_pid", json!({})).await.unwrap();
    let second = backend.invoke("server_pid", json!({})).await.unwrap();
    assert_ne!(first, second);
    backend.close().await;
}

#[tokio::test]
async fn test_pooled_sessions_are_reused() {
    let pool = SessionPool::new(stub_server(), 1, TIMEOUT);

    let mut lease = pool.acquire().await.unwrap();
    let first = lease.invoke("server_pid", json!({})).await.unwrap();
    assert_eq!(lease.process_id().map(|pid| pid.to_string()), Some(first.clone()));
    let again = lease.invoke("server_pid", json!({})).await.unwrap();
    assert_eq!(first, again);
    lease.close().await;
    drop(lease);
    assert_eq!(pool.idle_count().await, 1);

    // The next run gets the same process back
    let mut lease = pool.acquire().await.unwrap();
    let reused = lease.invoke("server_pid", json!({})).await.unwrap();
    assert_eq!(first, reused);
    lease.close().await;

    pool.shutdown().await;
    assert_eq!(pool.idle_count().await, 0);
}

#[tokio::test]
async fn test_failed_pooled_session_is_replaced() {
    let pool = SessionPool::new(stub_server(), 1, Duration::from_secs(1));

    let mut lease = pool.acquire().await.unwrap();
    let first = lease.invoke("server_pid", json!({})).await.unwrap();
    let timed_out = lease.invoke("slow", json!({"millis": 5000})).await;
    assert!(matches!(timed_out, Err(ToolInvocationError::Timeout { .. })));

    // The failed session is not reused within the run
    let replacement = lease.invoke("server_pid", json!({})).await.unwrap();
    assert_ne!(first, replacement);
    lease.close().await;

    pool.shutdown().await;
}

#[tokio::test]
async fn test_exited_idle_session_is_not_handed_out() {
    let pool = SessionPool::new(stub_server(), 1, TIMEOUT);

    let mut lease = pool.acquire().await.unwrap();
    let pid = lease.process_id().expect("server is running");
    lease.close().await;
    drop(lease);
    assert_eq!(pool.idle_count().await, 1);

    // The server dies while it waits in the pool
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut lease = pool.acquire().await.unwrap();
    assert_ne!(lease.process_id(), Some(pid));
    let tools = lease.list_tools().await.unwrap();
    assert_eq!(tools.len(), 7);
    let served_by = lease.invoke("server_pid", json!({})).await.unwrap();
    assert_ne!(served_by, pid.to_string());
    lease.close().await;

    pool.shutdown().await;
}

#[tokio::test]
async fn test_lease_caches_tool_listing() {
    let pool = SessionPool::new(stub_server(), 2, TIMEOUT);
    let mut lease = pool.acquire().await.unwrap();

    let first = lease.list_tools().await.unwrap();
    let second = lease.list_tools().await.unwrap();
    assert_eq!(first, second);
    lease.close().await;
    pool.shutdown().await;
}
