//! MCP worker-client layer.
//!
//! Three concerns live here: spawning and multiplexing stdio-framed worker
//! subprocesses (`session`), executing typed tool calls with retry and
//! safe-default degradation (`client`, `protocol`), and degrading to local
//! filesystem scans when a worker is unreachable entirely (`fallback`).

pub mod client;
pub mod fallback;
pub mod protocol;
pub mod session;

pub use client::{
    CodeIntelClient, ContractClient, DecomposerClient, RetryPolicy, ToolClient, check_mcp_health,
};
pub use protocol::CallResult;
pub use session::{McpSession, SessionSpec};
