//! Defensive parsing of the builder's `STATE.json`.
//!
//! The builder is an opaque external program; the only thing it owes us is
//! `<cwd>/.agent-team/STATE.json`. Every field is cast defensively, missing
//! fields default to their zero value, and a missing or corrupt file yields
//! a zero-filled summary with `success = false`. This parser never fails.

use crate::state::HealthColor;
use serde_json::Value;
use std::path::Path;

/// Relative location of the builder's state file inside its workspace.
pub const STATE_JSON_RELPATH: &str = ".agent-team/STATE.json";

/// The fields read out of STATE.json. Extra keys are tolerated; the file's
/// own `schema_version` is observed but not validated (it is not the
/// pipeline state schema).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuilderStateSummary {
    pub success: bool,
    pub test_passed: u32,
    pub test_total: u32,
    pub convergence_ratio: f64,
    pub total_cost: f64,
    pub health: HealthColor,
    pub completed_phases: Vec<String>,
}

/// Parse `<cwd>/.agent-team/STATE.json`.
pub fn parse_builder_state(cwd: &Path) -> BuilderStateSummary {
    let path = cwd.join(STATE_JSON_RELPATH);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return BuilderStateSummary::default();
    };
    let Ok(value) = serde_json::from_str::<Value>(&raw) else {
        tracing::warn!(path = %path.display(), "corrupt STATE.json; using zero-filled summary");
        return BuilderStateSummary::default();
    };

    let summary = value.get("summary").cloned().unwrap_or(Value::Null);
    BuilderStateSummary {
        success: summary
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        test_passed: as_u32(summary.get("test_passed")),
        test_total: as_u32(summary.get("test_total")),
        convergence_ratio: as_f64(summary.get("convergence_ratio")),
        total_cost: as_f64(value.get("total_cost")),
        health: value
            .get("health")
            .and_then(Value::as_str)
            .map(HealthColor::parse)
            .unwrap_or_default(),
        completed_phases: value
            .get("completed_phases")
            .and_then(Value::as_array)
            .map(|phases| {
                phases
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Numbers arrive as ints, floats, or numeric strings depending on the
/// builder version; accept all three.
fn as_u32(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0) as u32,
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn as_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}
