//! Scoped MCP worker sessions over stdio.
//!
//! Opening a session spawns the worker subprocess with a sanitized
//! environment, performs the `initialize` handshake, and lists its tools.
//! Closing guarantees the subprocess is signaled and reaped; `Drop` is the
//! backstop for panic and early-return paths.

use super::protocol::{
    self, CODE_INVALID_PARAMS, CODE_METHOD_NOT_FOUND, CallResult, JsonRpcRequest, JsonRpcResponse,
};
use crate::config::WorkerConfig;
use crate::errors::SessionError;
use crate::util::filtered_env;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{Instant, timeout_at};

/// How to spawn one worker: command, argv, and its sanitized environment.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl SessionSpec {
    /// Build a spec from worker config. The environment starts from the
    /// filtered process env, with the worker's own entries layered on top
    /// and the whole map re-filtered through the secret denylist.
    pub fn from_worker(name: impl Into<String>, worker: &WorkerConfig) -> Self {
        let mut env = crate::util::filtered_process_env();
        env.extend(worker.env.clone());
        Self {
            name: name.into(),
            command: worker.command.clone(),
            args: worker.args.clone(),
            env: filtered_env(env),
        }
    }
}

/// A live stdio session with one MCP worker.
///
/// Tool calls within a session are serialized by the request-id counter;
/// there is no cross-session ordering.
#[derive(Debug)]
pub struct McpSession {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    tool_names: Vec<String>,
}

impl McpSession {
    /// Spawn the worker and complete the handshake within `startup_timeout`.
    pub async fn open(spec: &SessionSpec, startup_timeout: Duration) -> Result<Self, SessionError> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                command: spec.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SessionError::ClosedStream)?;
        let stdout = child.stdout.take().ok_or(SessionError::ClosedStream)?;

        let mut session = Self {
            name: spec.name.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
            tool_names: Vec::new(),
        };

        let deadline = Instant::now() + startup_timeout;
        match session.handshake(deadline).await {
            Ok(()) => Ok(session),
            Err(err) => {
                session.teardown().await;
                Err(err)
            }
        }
    }

    async fn handshake(&mut self, deadline: Instant) -> Result<(), SessionError> {
        let id = self.alloc_id();
        self.send(&JsonRpcRequest::initialize(id, "gauntlet")).await?;
        self.read_result(id, deadline).await?;

        self.send(&JsonRpcRequest::notification("notifications/initialized"))
            .await?;

        let id = self.alloc_id();
        self.send(&JsonRpcRequest::call(id, "tools/list", Value::Null))
            .await?;
        let listing = self.read_result(id, deadline).await?;
        self.tool_names = protocol::extract_tool_names(&listing);
        Ok(())
    }

    pub fn worker_name(&self) -> &str {
        &self.name
    }

    /// Tools advertised at handshake time.
    pub fn tool_names(&self) -> &[String] {
        &self.tool_names
    }

    /// Issue one tool call and return its payload (or worker-flagged error).
    pub async fn call_tool(
        &mut self,
        tool: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<CallResult, SessionError> {
        let id = self.alloc_id();
        let request = JsonRpcRequest::call(
            id,
            "tools/call",
            serde_json::json!({ "name": tool, "arguments": args }),
        );
        self.send(&request).await?;

        let deadline = Instant::now() + timeout;
        let result = match self.read_response(id, deadline).await? {
            ResponseBody::Result(value) => value,
            ResponseBody::Error { code, message } => {
                return Err(classify_rpc_error(tool, code, message));
            }
        };
        protocol::extract_call_result(&result)
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), SessionError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| SessionError::MalformedPayload(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(SessionError::Pipe)?;
        self.stdin.flush().await.map_err(SessionError::Pipe)
    }

    async fn read_result(&mut self, id: u64, deadline: Instant) -> Result<Value, SessionError> {
        match self.read_response(id, deadline).await? {
            ResponseBody::Result(value) => Ok(value),
            ResponseBody::Error { code, message } => Err(SessionError::Protocol { code, message }),
        }
    }

    /// Read lines until the response matching `id` arrives or the deadline
    /// passes. Notifications, unmatched ids, and unparseable lines (worker
    /// noise) are skipped.
    async fn read_response(
        &mut self,
        id: u64,
        deadline: Instant,
    ) -> Result<ResponseBody, SessionError> {
        let budget_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        loop {
            let mut line = String::new();
            let read = timeout_at(deadline, self.stdout.read_line(&mut line))
                .await
                .map_err(|_| SessionError::Timeout { ms: budget_ms })?;
            let n = read.map_err(SessionError::Pipe)?;
            if n == 0 {
                return Err(SessionError::ClosedStream);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
                tracing::debug!(worker = %self.name, "skipping non-JSON line on worker stdout");
                continue;
            };
            if !response.matches(id) {
                continue;
            }
            if let Some(error) = response.error {
                return Ok(ResponseBody::Error {
                    code: error.code,
                    message: error.message,
                });
            }
            return Ok(ResponseBody::Result(response.result.unwrap_or(Value::Null)));
        }
    }

    /// Close the session: signal EOF, give the worker a short grace period
    /// to exit, then kill and reap.
    pub async fn close(mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        // Dropping stdin closes the pipe; well-behaved workers exit on EOF.
        let _ = self.stdin.shutdown().await;
        let grace = Duration::from_secs(2);
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        // Backstop for panic/early-return paths; kill_on_drop on the Child
        // handles the signal, this makes the intent explicit.
        let _ = self.child.start_kill();
    }
}

enum ResponseBody {
    Result(Value),
    Error { code: i64, message: String },
}

fn classify_rpc_error(tool: &str, code: i64, message: String) -> SessionError {
    match code {
        CODE_METHOD_NOT_FOUND => SessionError::ToolNotFound(tool.to_string()),
        CODE_INVALID_PARAMS => SessionError::InvalidArguments {
            tool: tool.to_string(),
            message,
        },
        _ => SessionError::Protocol { code, message },
    }
}
