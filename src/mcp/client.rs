//! Typed MCP clients with retry, backoff, and safe-default degradation.
//!
//! Every client method wraps the raw tool call in a bounded retry loop and,
//! on final exhaustion, returns the safe default for its return type rather
//! than propagating the error. Callers of this layer never observe an MCP
//! failure as an error; that is the layer's core invariant.
//!
//! | Return type       | Safe default |
//! |-------------------|--------------|
//! | object            | `{}`         |
//! | list              | `[]`         |
//! | string            | `""`         |
//! | optional object   | `None`       |

use super::protocol::CallResult;
use super::session::{McpSession, SessionSpec};
use crate::errors::SessionError;
use crate::state::McpHealth;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

/// Retry policy for tool calls: `max_attempts` tries with exponential
/// backoff `base × 2^(attempt−1)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based): 1s, 2s, 4s with
    /// the default base.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// One session handle with the shared retry/safe-default discipline. The
/// three typed clients compose over this rather than inheriting from it.
pub struct ToolClient {
    session: Mutex<McpSession>,
    retry: RetryPolicy,
    tool_timeout: Duration,
}

impl ToolClient {
    pub fn new(session: McpSession, retry: RetryPolicy, tool_timeout: Duration) -> Self {
        Self {
            session: Mutex::new(session),
            retry,
            tool_timeout,
        }
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.session.lock().await.tool_names().to_vec()
    }

    pub async fn close(self) {
        self.session.into_inner().close().await;
    }

    /// The raw retry loop. Worker-flagged tool errors are treated as
    /// transient; protocol-level contract mismatches fail fast.
    async fn call(&self, tool: &str, args: Value) -> Result<CallResult, SessionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = {
                let mut session = self.session.lock().await;
                session.call_tool(tool, args.clone(), self.tool_timeout).await
            };
            let err = match outcome {
                Ok(result) if result.is_error => SessionError::ToolError(result.text),
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            if !err.is_retriable() || attempt >= self.retry.max_attempts {
                return Err(err);
            }
            let delay = self.retry.delay_after(attempt);
            tracing::warn!(tool, attempt, delay_ms = delay.as_millis() as u64, error = %err,
                "tool call failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Call a tool whose result is a JSON object. Safe default: `{}`.
    pub async fn call_object(&self, tool: &str, args: Value) -> Value {
        match self.call(tool, args).await.and_then(|r| r.parse_json()) {
            Ok(value) if value.is_object() => value,
            Ok(_) | Err(_) => {
                self.note_degraded(tool);
                Value::Object(serde_json::Map::new())
            }
        }
    }

    /// Call a tool whose result is a JSON list. Safe default: `[]`.
    pub async fn call_list(&self, tool: &str, args: Value) -> Vec<Value> {
        match self.call(tool, args).await.and_then(|r| r.parse_json()) {
            Ok(Value::Array(items)) => items,
            Ok(_) | Err(_) => {
                self.note_degraded(tool);
                Vec::new()
            }
        }
    }

    /// Call a tool whose result is raw text, not JSON. Safe default: `""`.
    pub async fn call_string(&self, tool: &str, args: Value) -> String {
        match self.call(tool, args).await {
            Ok(result) => result.text,
            Err(_) => {
                self.note_degraded(tool);
                String::new()
            }
        }
    }

    /// Call a tool whose absent result is meaningful. Safe default: `None`.
    pub async fn call_optional(&self, tool: &str, args: Value) -> Option<Value> {
        match self.call(tool, args).await.and_then(|r| r.parse_json()) {
            Ok(value) if value.is_object() => Some(value),
            Ok(_) | Err(_) => {
                self.note_degraded(tool);
                None
            }
        }
    }

    fn note_degraded(&self, tool: &str) {
        tracing::warn!(tool, "retries exhausted; returning safe default");
    }
}

/// Client for the decomposer worker.
pub struct DecomposerClient {
    tools: ToolClient,
    /// HTTP endpoint of the contract worker, for the one worker-to-worker
    /// fetch that must not re-enter MCP.
    contract_http_url: Option<String>,
    http: reqwest::Client,
}

/// Explicit timeout for the cross-worker HTTP fetch, never inherited from
/// client defaults.
const CROSS_WORKER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

impl DecomposerClient {
    pub fn new(tools: ToolClient, contract_http_url: Option<String>) -> Self {
        Self {
            tools,
            contract_http_url,
            http: reqwest::Client::new(),
        }
    }

    /// Decompose a PRD into a service map + domain model. `None` means the
    /// worker could not produce a decomposition.
    pub async fn decompose(&self, prd_text: &str) -> Option<Value> {
        self.tools
            .call_optional("decompose", serde_json::json!({ "prd": prd_text }))
            .await
    }

    pub async fn get_service_map(&self) -> Value {
        self.tools
            .call_object("get_service_map", serde_json::json!({}))
            .await
    }

    /// Contracts for one service, fetched over the contract worker's HTTP
    /// surface. Failure returns an empty list.
    pub async fn get_contracts_for_service(&self, service: &str) -> Vec<Value> {
        let Some(base) = &self.contract_http_url else {
            return Vec::new();
        };
        let url = format!("{}/contracts/{}", base.trim_end_matches('/'), service);
        let response = self
            .http
            .get(&url)
            .timeout(CROSS_WORKER_HTTP_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    pub async fn get_domain_model(&self) -> Value {
        self.tools
            .call_object("get_domain_model", serde_json::json!({}))
            .await
    }

    pub async fn close(self) {
        self.tools.close().await;
    }
}

/// Client for the contract worker.
pub struct ContractClient {
    tools: ToolClient,
}

impl ContractClient {
    pub fn new(tools: ToolClient) -> Self {
        Self { tools }
    }

    pub async fn create_contract(&self, contract: Value) -> Value {
        self.tools
            .call_object("create_contract", serde_json::json!({ "contract": contract }))
            .await
    }

    pub async fn validate_spec(&self, spec: Value) -> Value {
        self.tools
            .call_object("validate_spec", serde_json::json!({ "spec": spec }))
            .await
    }

    pub async fn list_contracts(&self) -> Vec<Value> {
        self.tools
            .call_list("list_contracts", serde_json::json!({}))
            .await
    }

    pub async fn get_contract(&self, name: &str) -> Value {
        self.tools
            .call_object("get_contract", serde_json::json!({ "name": name }))
            .await
    }

    pub async fn validate_endpoint(&self, service: &str, endpoint: &str) -> Value {
        self.tools
            .call_object(
                "validate_endpoint",
                serde_json::json!({ "service": service, "endpoint": endpoint }),
            )
            .await
    }

    /// Returns raw test source code, the one non-JSON MCP response.
    pub async fn generate_tests(&self, contract_name: &str) -> String {
        self.tools
            .call_string("generate_tests", serde_json::json!({ "name": contract_name }))
            .await
    }

    pub async fn check_breaking_changes(&self, name: &str, candidate: Value) -> Value {
        self.tools
            .call_object(
                "check_breaking_changes",
                serde_json::json!({ "name": name, "candidate": candidate }),
            )
            .await
    }

    pub async fn mark_implemented(&self, name: &str) -> Value {
        self.tools
            .call_object("mark_implemented", serde_json::json!({ "name": name }))
            .await
    }

    pub async fn get_unimplemented_contracts(&self) -> Vec<Value> {
        self.tools
            .call_list("get_unimplemented_contracts", serde_json::json!({}))
            .await
    }

    pub async fn close(self) {
        self.tools.close().await;
    }
}

/// Client for the code-intelligence worker.
pub struct CodeIntelClient {
    tools: ToolClient,
}

impl CodeIntelClient {
    pub fn new(tools: ToolClient) -> Self {
        Self { tools }
    }

    pub async fn find_definition(&self, symbol: &str) -> Value {
        self.tools
            .call_object("find_definition", serde_json::json!({ "symbol": symbol }))
            .await
    }

    pub async fn find_callers(&self, symbol: &str) -> Vec<Value> {
        self.tools
            .call_list("find_callers", serde_json::json!({ "symbol": symbol }))
            .await
    }

    pub async fn find_dependencies(&self, service: &str) -> Vec<Value> {
        self.tools
            .call_list("find_dependencies", serde_json::json!({ "service": service }))
            .await
    }

    pub async fn search_semantic(&self, query: &str) -> Vec<Value> {
        self.tools
            .call_list("search_semantic", serde_json::json!({ "query": query }))
            .await
    }

    pub async fn get_service_interface(&self, service: &str) -> Value {
        self.tools
            .call_object(
                "get_service_interface",
                serde_json::json!({ "service": service }),
            )
            .await
    }

    pub async fn check_dead_code(&self, service: &str) -> Vec<Value> {
        self.tools
            .call_list("check_dead_code", serde_json::json!({ "service": service }))
            .await
    }

    pub async fn register_artifact(&self, artifact: Value) -> Value {
        self.tools
            .call_object("register_artifact", serde_json::json!({ "artifact": artifact }))
            .await
    }

    pub async fn close(self) {
        self.tools.close().await;
    }
}

/// Smoke-check one worker: open a session, list tools, close.
///
/// Any failure (spawn, handshake timeout, broken pipe) becomes
/// `status = "unhealthy"` with a populated error field, never an error to
/// the caller.
pub async fn check_mcp_health(spec: &SessionSpec, timeout: Duration) -> McpHealth {
    match McpSession::open(spec, timeout).await {
        Ok(session) => {
            let tool_names = session.tool_names().to_vec();
            session.close().await;
            McpHealth {
                status: "healthy".to_string(),
                tools_count: tool_names.len(),
                tool_names,
                error: None,
            }
        }
        Err(err) => McpHealth {
            status: "unhealthy".to_string(),
            tools_count: 0,
            tool_names: Vec::new(),
            error: Some(err.to_string()),
        },
    }
}
