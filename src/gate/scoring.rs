//! Deterministic scoring: per-service, integration, aggregate, traffic
//! light, and the good-enough gate.
//!
//! All formulas clamp into [0, 100] and guard every division against a zero
//! denominator (1 is the fallback).

use crate::state::{PipelineState, Priority, TrafficLight};
use serde::Serialize;

/// Inputs to one service's score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceScoreInput {
    /// Fraction of PRD requirements satisfied.
    pub req_pass_rate: f64,
    pub test_pass_rate: f64,
    pub contract_pass_rate: f64,
    /// Violations attributed to this service.
    pub violations: usize,
    /// Lines of generated code.
    pub loc: u64,
    /// 1.0 when the deployed service is healthy.
    pub health_rate: f64,
    /// Fraction of expected artifacts present.
    pub artifacts_ratio: f64,
}

/// Per-service score:
/// `30·req + 20·test + 20·contract + max(0, 15 − 1.5·density) + 10·health + 5·artifacts`
/// where `density = violations / (LoC / 1000)`.
pub fn service_score(input: &ServiceScoreInput) -> f64 {
    let kloc = if input.loc == 0 {
        1.0
    } else {
        input.loc as f64 / 1000.0
    };
    let density = input.violations as f64 / kloc;
    let violation_component = (15.0 - 1.5 * density).max(0.0);

    let score = 30.0 * input.req_pass_rate.clamp(0.0, 1.0)
        + 20.0 * input.test_pass_rate.clamp(0.0, 1.0)
        + 20.0 * input.contract_pass_rate.clamp(0.0, 1.0)
        + violation_component
        + 10.0 * input.health_rate.clamp(0.0, 1.0)
        + 5.0 * input.artifacts_ratio.clamp(0.0, 1.0);
    score.clamp(0.0, 100.0)
}

/// Inputs to the integration score.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrationScoreInput {
    /// MCP tools responding, out of the expected 20.
    pub mcp_tools_ok: u32,
    pub flows_passing: u32,
    pub flows_total: u32,
    /// Cross-build violations (layer 4).
    pub cross_build_violations: usize,
    pub phases_complete: u32,
    pub phases_total: u32,
}

/// Integration score:
/// `25·tools/20 + 25·flows + max(0, 25 − 2.5·cross_violations) + 25·phases`.
pub fn integration_score(input: &IntegrationScoreInput) -> f64 {
    let tools = f64::from(input.mcp_tools_ok) / 20.0;
    let flows = f64::from(input.flows_passing) / f64::from(input.flows_total.max(1));
    let cross = (25.0 - 2.5 * input.cross_build_violations as f64).max(0.0);
    let phases = f64::from(input.phases_complete) / f64::from(input.phases_total.max(1));

    let score = 25.0 * tools.clamp(0.0, 1.0) + 25.0 * flows.clamp(0.0, 1.0) + cross
        + 25.0 * phases.clamp(0.0, 1.0);
    score.clamp(0.0, 100.0)
}

/// Aggregate = `0.30·build1 + 0.25·build2 + 0.25·build3 + 0.20·integration`.
pub fn aggregate_score(build1: f64, build2: f64, build3: f64, integration: f64) -> f64 {
    (0.30 * build1 + 0.25 * build2 + 0.25 * build3 + 0.20 * integration).clamp(0.0, 100.0)
}

/// Good-enough thresholds, all of which must hold.
#[derive(Debug, Clone, Copy)]
pub struct GoodEnoughThresholds {
    pub aggregate_min: f64,
    pub per_system_min: f64,
    pub integration_min: f64,
    pub open_p1_max: usize,
    pub test_pass_rate_min: f64,
    pub mcp_tool_coverage_min: f64,
    pub fix_convergence_min: f64,
}

impl Default for GoodEnoughThresholds {
    fn default() -> Self {
        Self {
            aggregate_min: 65.0,
            per_system_min: 60.0,
            integration_min: 50.0,
            open_p1_max: 3,
            test_pass_rate_min: 0.85,
            mcp_tool_coverage_min: 0.90,
            fix_convergence_min: 0.70,
        }
    }
}

/// The gate's boolean verdict with an enumerated reason list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GoodEnough {
    pub verdict: bool,
    pub failed_reasons: Vec<String>,
}

/// Evaluate the eight good-enough conditions against the final state.
pub fn good_enough(
    state: &PipelineState,
    mcp_tool_coverage: f64,
    thresholds: &GoodEnoughThresholds,
) -> GoodEnough {
    let mut failed = Vec::new();

    if state.aggregate_score < thresholds.aggregate_min {
        failed.push(format!(
            "aggregate {:.1} < {:.0}",
            state.aggregate_score, thresholds.aggregate_min
        ));
    }

    for system in ["build1", "build2", "build3"] {
        let score = state.scores.get(system).copied().unwrap_or(0.0);
        if score < thresholds.per_system_min {
            failed.push(format!(
                "{system} score {score:.1} < {:.0}",
                thresholds.per_system_min
            ));
        }
    }

    let integration = state.scores.get("integration").copied().unwrap_or(0.0);
    if integration < thresholds.integration_min {
        failed.push(format!(
            "integration {integration:.1} < {:.0}",
            thresholds.integration_min
        ));
    }

    let open_p0 = state.open_count(Priority::P0);
    if open_p0 > 0 {
        failed.push(format!("{open_p0} open P0 finding(s)"));
    }

    let open_p1 = state.open_count(Priority::P1);
    if open_p1 > thresholds.open_p1_max {
        failed.push(format!(
            "{open_p1} open P1 findings > {}",
            thresholds.open_p1_max
        ));
    }

    let test_rate = state.overall_test_pass_rate();
    if test_rate < thresholds.test_pass_rate_min {
        failed.push(format!(
            "test pass rate {test_rate:.2} < {:.2}",
            thresholds.test_pass_rate_min
        ));
    }

    if mcp_tool_coverage < thresholds.mcp_tool_coverage_min {
        failed.push(format!(
            "MCP tool coverage {mcp_tool_coverage:.2} < {:.2}",
            thresholds.mcp_tool_coverage_min
        ));
    }

    let convergence = state.mean_convergence();
    if convergence < thresholds.fix_convergence_min {
        failed.push(format!(
            "fix convergence {convergence:.2} < {:.2}",
            thresholds.fix_convergence_min
        ));
    }

    GoodEnough {
        verdict: failed.is_empty(),
        failed_reasons: failed,
    }
}
