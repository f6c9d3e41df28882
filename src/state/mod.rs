//! Persistent pipeline state: the one mutable record threaded through all
//! phases, plus the finding catalog that lives inside it.
//!
//! Only the conductor mutates `PipelineState`, and only between phase
//! boundaries; every other component communicates by return value. The
//! `store` submodule owns the atomic checkpoint format.

pub mod store;

use crate::phase::Phase;
use crate::util::short_run_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current on-disk schema. Load fails cleanly (fresh-start sentinel) on any
/// other value.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Finding priority, P0 (blocker) through P3 (informational).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        };
        write!(f, "{s}")
    }
}

/// Which system a finding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemTag {
    Build1,
    Build2,
    Build3,
    Integration,
}

impl fmt::Display for SystemTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemTag::Build1 => "Build1",
            SystemTag::Build2 => "Build2",
            SystemTag::Build3 => "Build3",
            SystemTag::Integration => "Integration",
        };
        write!(f, "{s}")
    }
}

/// Finding lifecycle. The only legal transitions are OPEN → FIXED and
/// OPEN → WONTFIX.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Resolution {
    #[default]
    Open,
    Fixed,
    Wontfix,
}

/// One persistent defect record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// `FINDING-NNN`, three-digit zero-padded, dense and strictly increasing
    /// within a run.
    #[serde(rename = "finding_id", default)]
    pub id: String,
    pub priority: Priority,
    pub system: SystemTag,
    /// File path or module the finding points at.
    #[serde(default)]
    pub component: String,
    /// Reproducer text or test output.
    #[serde(default)]
    pub evidence: String,
    /// Actionable fix text.
    #[serde(default)]
    pub recommendation: String,
    #[serde(default)]
    pub resolution: Resolution,
    /// Pass that fixed it; 0 = unfixed.
    #[serde(default)]
    pub fix_pass_number: u32,
    /// Test identifier that verifies the fix.
    #[serde(default)]
    pub fix_verification: String,
    pub created_at: DateTime<Utc>,
}

impl Finding {
    pub fn new(priority: Priority, system: SystemTag, component: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            priority,
            system,
            component: component.into(),
            evidence: String::new(),
            recommendation: String::new(),
            resolution: Resolution::Open,
            fix_pass_number: 0,
            fix_verification: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = recommendation.into();
        self
    }

    pub fn is_open(&self) -> bool {
        self.resolution == Resolution::Open
    }

    /// Apply a lifecycle transition. Transitions out of a terminal state are
    /// ignored and reported as `false`.
    pub fn resolve(&mut self, resolution: Resolution, fix_pass: u32) -> bool {
        if self.resolution != Resolution::Open || resolution == Resolution::Open {
            return false;
        }
        self.resolution = resolution;
        if resolution == Resolution::Fixed {
            self.fix_pass_number = fix_pass;
        }
        true
    }
}

/// Builder service health as reported in STATE.json.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthColor {
    Green,
    Yellow,
    Red,
    #[default]
    Unknown,
}

impl HealthColor {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "green" => HealthColor::Green,
            "yellow" => HealthColor::Yellow,
            "red" => HealthColor::Red,
            _ => HealthColor::Unknown,
        }
    }
}

/// One builder invocation's outcome: process metadata merged with the fields
/// the builder reports through STATE.json.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderResult {
    pub service_name: String,
    pub success: bool,
    pub test_passed: u32,
    pub test_total: u32,
    pub convergence_ratio: f64,
    pub total_cost: f64,
    pub health: HealthColor,
    pub completed_phases: Vec<String>,
    /// -1 when the builder never ran or was killed.
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_s: f64,
}

impl BuilderResult {
    /// Zero-filled failure record for a builder that never produced state.
    pub fn failed(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            exit_code: -1,
            ..Default::default()
        }
    }

    pub fn test_pass_rate(&self) -> f64 {
        if self.test_total == 0 {
            0.0
        } else {
            f64::from(self.test_passed) / f64::from(self.test_total)
        }
    }
}

/// Violation severity from the quality gate. Unknown severities deserialize
/// into `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
    /// Catch-all for severities this version does not know.
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// Unknown severities fall into the `error` bucket.
    pub fn normalized(self) -> Severity {
        match self {
            Severity::Unknown => Severity::Error,
            other => other,
        }
    }

    /// Severity → finding priority mapping.
    pub fn priority(self) -> Priority {
        match self.normalized() {
            Severity::Critical => Priority::P0,
            Severity::Error => Priority::P1,
            Severity::Warning => Priority::P2,
            Severity::Info => Priority::P3,
            Severity::Unknown => Priority::P1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self.normalized() {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Unknown => "error",
        }
    }
}

/// One classification record from the quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractViolation {
    /// Short rule token, e.g. `SEC-SCAN-001`.
    pub code: String,
    pub severity: Severity,
    pub service: String,
    pub endpoint: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl ContractViolation {
    pub fn new(
        code: impl Into<String>,
        severity: Severity,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            severity,
            service: service.into(),
            endpoint: String::new(),
            message: message.into(),
            expected: None,
            actual: None,
            file_path: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_expected_actual(
        mut self,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    pub fn priority(&self) -> Priority {
        self.severity.priority()
    }

    /// Stable identity used for regression comparison between passes.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.code,
            self.service,
            self.endpoint,
            self.file_path.as_deref().unwrap_or("")
        )
    }

    /// Location to show a human: file path when known, service/endpoint
    /// otherwise.
    pub fn component(&self) -> String {
        if let Some(path) = &self.file_path {
            path.clone()
        } else if self.endpoint.is_empty() {
            self.service.clone()
        } else {
            format!("{} {}", self.service, self.endpoint)
        }
    }
}

/// Summary of one fix-loop pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixPassSummary {
    pub pass_number: u32,
    pub fixed: usize,
    pub remaining: usize,
    pub regressions: usize,
    pub effectiveness: f64,
    pub regression_rate: f64,
    pub cost_delta: f64,
}

/// MCP worker smoke-check outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpHealth {
    pub status: String,
    pub tools_count: usize,
    pub tool_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate traffic-light verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrafficLight {
    #[default]
    Red,
    Yellow,
    Green,
}

impl TrafficLight {
    /// ≥80 → GREEN, 50–79 → YELLOW, <50 → RED.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            TrafficLight::Green
        } else if score >= 50.0 {
            TrafficLight::Yellow
        } else {
            TrafficLight::Red
        }
    }
}

impl fmt::Display for TrafficLight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrafficLight::Red => "RED",
            TrafficLight::Yellow => "YELLOW",
            TrafficLight::Green => "GREEN",
        };
        write!(f, "{s}")
    }
}

/// One service named by the decomposition, with its contract obligations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub contracts: Vec<serde_json::Value>,
}

/// The singular persistent pipeline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: u32,
    pub run_id: String,
    pub current_phase: Phase,
    #[serde(default)]
    pub completed_phases: Vec<Phase>,
    #[serde(default)]
    pub mcp_health: BTreeMap<String, McpHealth>,
    #[serde(default)]
    pub builder_results: BTreeMap<String, BuilderResult>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub fix_passes: Vec<FixPassSummary>,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub aggregate_score: f64,
    #[serde(default)]
    pub traffic_light: TrafficLight,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub phase_costs: BTreeMap<String, f64>,
    /// The decomposed service map, persisted so a resumed run can rebuild
    /// without re-decomposing.
    #[serde(default)]
    pub service_map: Vec<ServiceEntry>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh state at the start of a new run.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run_id: short_run_id(),
            current_phase: Phase::HealthCheck,
            completed_phases: Vec::new(),
            mcp_health: BTreeMap::new(),
            builder_results: BTreeMap::new(),
            findings: Vec::new(),
            fix_passes: Vec::new(),
            scores: BTreeMap::new(),
            aggregate_score: 0.0,
            traffic_light: TrafficLight::Red,
            total_cost: 0.0,
            phase_costs: BTreeMap::new(),
            service_map: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Allocate the next dense `FINDING-NNN` identifier.
    ///
    /// Scans existing IDs for the maximum numeric suffix; malformed IDs are
    /// ignored.
    pub fn next_finding_id(&self) -> String {
        let max = self
            .findings
            .iter()
            .filter_map(|f| f.id.strip_prefix("FINDING-"))
            .filter_map(|suffix| suffix.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        format!("FINDING-{:03}", max + 1)
    }

    /// Append a finding, assigning an ID when the caller left it empty.
    /// Insertion order is preserved; no deduplication.
    pub fn add_finding(&mut self, mut finding: Finding) -> String {
        if finding.id.is_empty() {
            finding.id = self.next_finding_id();
        }
        let id = finding.id.clone();
        self.findings.push(finding);
        id
    }

    /// Count of open findings at a given priority.
    pub fn open_count(&self, priority: Priority) -> usize {
        self.findings
            .iter()
            .filter(|f| f.is_open() && f.priority == priority)
            .count()
    }

    /// Accumulate cost into the running total. The accumulator is
    /// monotonically non-decreasing; negative deltas are ignored.
    pub fn add_cost(&mut self, delta: f64) {
        if delta > 0.0 {
            self.total_cost += delta;
        }
    }

    pub fn mark_phase_complete(&mut self, phase: Phase, phase_cost: f64) {
        if !self.completed_phases.contains(&phase) {
            self.completed_phases.push(phase);
        }
        self.phase_costs.insert(phase.as_str().to_string(), phase_cost);
    }

    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// Overall test pass rate across all builder results.
    pub fn overall_test_pass_rate(&self) -> f64 {
        let total: u32 = self.builder_results.values().map(|r| r.test_total).sum();
        let passed: u32 = self.builder_results.values().map(|r| r.test_passed).sum();
        if total == 0 {
            0.0
        } else {
            f64::from(passed) / f64::from(total)
        }
    }

    /// Mean convergence ratio across builder results.
    pub fn mean_convergence(&self) -> f64 {
        if self.builder_results.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .builder_results
            .values()
            .map(|r| r.convergence_ratio)
            .sum();
        sum / self.builder_results.len() as f64
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_ids_are_dense_and_zero_padded() {
        let mut state = PipelineState::new();
        for i in 0..12 {
            let id = state.add_finding(Finding::new(
                Priority::P2,
                SystemTag::Build1,
                format!("src/module_{i}.py"),
            ));
            assert_eq!(id, format!("FINDING-{:03}", i + 1));
        }
        assert_eq!(state.findings[9].id, "FINDING-010");
    }

    #[test]
    fn malformed_ids_are_ignored_during_allocation() {
        let mut state = PipelineState::new();
        let mut bogus = Finding::new(Priority::P3, SystemTag::Integration, "x");
        bogus.id = "FINDING-abc".to_string();
        state.findings.push(bogus);
        let mut odd = Finding::new(Priority::P3, SystemTag::Integration, "y");
        odd.id = "DEFECT-007".to_string();
        state.findings.push(odd);

        assert_eq!(state.next_finding_id(), "FINDING-001");
    }

    #[test]
    fn preassigned_ids_are_kept() {
        let mut state = PipelineState::new();
        let mut finding = Finding::new(Priority::P0, SystemTag::Build2, "api");
        finding.id = "FINDING-041".to_string();
        state.add_finding(finding);
        assert_eq!(state.next_finding_id(), "FINDING-042");
    }

    #[test]
    fn resolution_transitions_only_leave_open() {
        let mut finding = Finding::new(Priority::P1, SystemTag::Build1, "auth");
        assert!(finding.resolve(Resolution::Fixed, 2));
        assert_eq!(finding.fix_pass_number, 2);
        // Terminal states are sticky.
        assert!(!finding.resolve(Resolution::Wontfix, 3));
        assert_eq!(finding.resolution, Resolution::Fixed);

        let mut other = Finding::new(Priority::P1, SystemTag::Build1, "auth");
        assert!(!other.resolve(Resolution::Open, 1));
        assert!(other.is_open());
    }

    #[test]
    fn finding_serializes_with_finding_id_key() {
        let mut state = PipelineState::new();
        state.add_finding(Finding::new(Priority::P0, SystemTag::Build3, "db"));
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"finding_id\":\"FINDING-001\""));
        assert!(json.contains("\"priority\":\"P0\""));
    }

    #[test]
    fn unknown_severity_falls_into_error_bucket() {
        let severity: Severity = serde_json::from_str("\"catastrophic\"").unwrap();
        assert_eq!(severity.normalized(), Severity::Error);
        assert_eq!(severity.priority(), Priority::P1);
    }

    #[test]
    fn severity_priority_mapping() {
        assert_eq!(Severity::Critical.priority(), Priority::P0);
        assert_eq!(Severity::Error.priority(), Priority::P1);
        assert_eq!(Severity::Warning.priority(), Priority::P2);
        assert_eq!(Severity::Info.priority(), Priority::P3);
    }

    #[test]
    fn traffic_light_thresholds() {
        assert_eq!(TrafficLight::from_score(80.0), TrafficLight::Green);
        assert_eq!(TrafficLight::from_score(95.5), TrafficLight::Green);
        assert_eq!(TrafficLight::from_score(79.9), TrafficLight::Yellow);
        assert_eq!(TrafficLight::from_score(50.0), TrafficLight::Yellow);
        assert_eq!(TrafficLight::from_score(49.9), TrafficLight::Red);
        assert_eq!(TrafficLight::from_score(0.0), TrafficLight::Red);
    }

    #[test]
    fn cost_accumulator_is_monotonic() {
        let mut state = PipelineState::new();
        state.add_cost(1.5);
        state.add_cost(-10.0);
        state.add_cost(0.25);
        assert!((state.total_cost - 1.75).abs() < 1e-9);
    }

    #[test]
    fn open_count_tracks_resolution() {
        let mut state = PipelineState::new();
        state.add_finding(Finding::new(Priority::P0, SystemTag::Build1, "a"));
        state.add_finding(Finding::new(Priority::P0, SystemTag::Build1, "b"));
        state.add_finding(Finding::new(Priority::P1, SystemTag::Build2, "c"));
        assert_eq!(state.open_count(Priority::P0), 2);

        state.findings[0].resolve(Resolution::Fixed, 1);
        assert_eq!(state.open_count(Priority::P0), 1);
    }

    #[test]
    fn violation_key_distinguishes_location() {
        let a = ContractViolation::new("CORS-001", Severity::Error, "auth", "wildcard origin")
            .with_file_path("auth/config.yaml");
        let b = ContractViolation::new("CORS-001", Severity::Error, "order", "wildcard origin")
            .with_file_path("order/config.yaml");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn builder_result_failed_has_sentinel_exit_code() {
        let result = BuilderResult::failed("auth");
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.test_total, 0);
        assert_eq!(result.health, HealthColor::Unknown);
    }

    #[test]
    fn health_color_parse_is_case_insensitive() {
        assert_eq!(HealthColor::parse("GREEN"), HealthColor::Green);
        assert_eq!(HealthColor::parse("yellow"), HealthColor::Yellow);
        assert_eq!(HealthColor::parse("bogus"), HealthColor::Unknown);
    }
}
