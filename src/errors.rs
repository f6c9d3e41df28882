//! Typed error hierarchy for the Gauntlet pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `PipelineError`: conductor-level failures (fatal phases, budget)
//! - `SessionError`: MCP session and tool-call failures
//! - `HealthError`: health-prober failures
//!
//! Note that most failures in this system never surface as errors at all:
//! the MCP client layer degrades to safe defaults and the builder runner
//! folds subprocess failures into `BuilderResult`. The enums here cover the
//! conditions that legitimately stop a phase or a run.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the pipeline conductor.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Health check failed: no endpoint reached the consecutive-success threshold")]
    HealthCheckFailed(#[source] HealthError),

    #[error("Decomposition produced no services; nothing to build")]
    NoServices,

    #[error("Budget exceeded: total ${total:.2} + projected ${projected:.2} > ceiling ${ceiling:.2}")]
    BudgetExceeded {
        total: f64,
        projected: f64,
        ceiling: f64,
    },

    #[error("Cannot resume: no usable checkpoint at {path} (missing, corrupt, or schema mismatch)")]
    ResumeUnavailable { path: PathBuf },

    #[error("Another pipeline run holds the lock at {path}")]
    AlreadyRunning { path: PathBuf },

    #[error("Failed to write checkpoint at {path}: {source}")]
    CheckpointWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read PRD at {path}: {source}")]
    PrdReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Compose orchestrator failed: {0}")]
    Compose(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from an MCP worker session.
///
/// The retry loop classifies these: transient variants are retried with
/// backoff, protocol-level variants fail fast.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to spawn worker process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pipe error: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("Worker closed its stdout stream")]
    ClosedStream,

    #[error("Timed out after {ms}ms waiting for worker response")]
    Timeout { ms: u64 },

    #[error("Tool '{0}' not found on worker")]
    ToolNotFound(String),

    #[error("Invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("Malformed tool payload: {0}")]
    MalformedPayload(String),

    #[error("Worker reported tool error: {0}")]
    ToolError(String),
}

impl SessionError {
    /// Whether the retry loop should attempt this call again.
    ///
    /// Pipe breaks, timeouts, and server-reported transient errors are
    /// retriable. "Tool not found" and "invalid arguments" indicate a
    /// contract mismatch that retrying cannot fix.
    pub fn is_retriable(&self) -> bool {
        match self {
            SessionError::Spawn { .. }
            | SessionError::Pipe(_)
            | SessionError::ClosedStream
            | SessionError::Timeout { .. }
            | SessionError::ToolError(_) => true,
            SessionError::ToolNotFound(_)
            | SessionError::InvalidArguments { .. }
            | SessionError::MalformedPayload(_) => false,
            // JSON-RPC server errors (-32000..-32099) are transient by
            // convention; everything else is a hard protocol fault.
            SessionError::Protocol { code, .. } => (-32099..=-32000).contains(code),
        }
    }
}

/// Errors from the health prober.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Deadline expired with endpoints below threshold: {laggards:?}")]
    DeadlineExpired { laggards: Vec<String> },
}
