//! Client side of the tool server protocol: JSON-RPC over a child process'
//! stdio, session lifecycle and the backends the orchestrator talks to.

mod backend;
mod session;
pub mod types;

pub use backend::{EphemeralSessions, PooledLease, SessionPolicy, SessionPool, ToolBackend};
pub use session::{
    ProtocolError, SessionState, ToolInvocationError, ToolServerConfig, ToolSession,
};
pub use types::ToolDescriptor;
