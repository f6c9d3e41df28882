//! Pipeline phases and their ordering.
//!
//! Seven phases execute strictly forward; the fix loop cycles internally
//! between `Build`-adjacent work and the final `QualityGate` evaluation but
//! never moves the conductor backwards.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One indivisible unit of pipeline progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    HealthCheck,
    McpSmoke,
    Decompose,
    ContractRegister,
    Build,
    DeployAndTest,
    QualityGate,
}

impl Phase {
    /// The fixed execution order.
    pub const ORDER: [Phase; 7] = [
        Phase::HealthCheck,
        Phase::McpSmoke,
        Phase::Decompose,
        Phase::ContractRegister,
        Phase::Build,
        Phase::DeployAndTest,
        Phase::QualityGate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::HealthCheck => "health_check",
            Phase::McpSmoke => "mcp_smoke",
            Phase::Decompose => "decompose",
            Phase::ContractRegister => "contract_register",
            Phase::Build => "build",
            Phase::DeployAndTest => "deploy_and_test",
            Phase::QualityGate => "quality_gate",
        }
    }

    /// A failure in a fatal phase terminates the run; failures elsewhere are
    /// recorded as findings and the pipeline continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Phase::HealthCheck | Phase::Decompose)
    }

    /// Position in the execution order.
    pub fn index(&self) -> usize {
        Self::ORDER.iter().position(|p| p == self).unwrap_or(0)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
