//! Quality gate: the four-layer verification engine.
//!
//! Layer 1 consumes builder results, layer 2 the integration report, layer 3
//! scans the generated tree (`rules`), layer 4 runs cross-service analysis
//! (`statics`). All four always run; their violations are classified into
//! severity buckets, recorded as findings, and fed to the scoring engine
//! (`scoring`).

pub mod rules;
pub mod scoring;
pub mod statics;

pub use rules::run_code_quality_rules;
pub use scoring::{
    GoodEnough, GoodEnoughThresholds, IntegrationScoreInput, ServiceScoreInput, aggregate_score,
    good_enough, integration_score, service_score,
};
pub use statics::{StaticAnalysisInput, run_static_analysis};

use crate::state::{ContractViolation, Finding, PipelineState, SystemTag, TrafficLight};
use crate::tester::IntegrationReport;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// Everything one gate evaluation produces.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub violations: Vec<ContractViolation>,
    pub layer3_count: usize,
    pub layer4_count: usize,
}

/// Run layers 2 through 4. Layer 1 (builder results) is already in the
/// state; scoring reads it from there.)
pub fn evaluate(
    generated_root: &Path,
    static_input: &StaticAnalysisInput,
    integration: &IntegrationReport,
) -> GateOutcome {
    let mut violations: Vec<ContractViolation> = integration.violations.clone();

    let layer3 = run_code_quality_rules(generated_root);
    let layer3_count = layer3.len();
    violations.extend(layer3);

    let layer4 = run_static_analysis(static_input);
    let layer4_count = layer4.len();
    violations.extend(layer4);

    tracing::info!(
        total = violations.len(),
        layer3 = layer3_count,
        layer4 = layer4_count,
        "quality gate evaluated"
    );

    GateOutcome {
        violations,
        layer3_count,
        layer4_count,
    }
}

/// Group violations into the four severity buckets. Unknown severities land
/// in `error`.
pub fn classify_violations(
    violations: &[ContractViolation],
) -> BTreeMap<String, Vec<ContractViolation>> {
    let mut buckets: BTreeMap<String, Vec<ContractViolation>> = BTreeMap::new();
    for violation in violations {
        buckets
            .entry(violation.severity.as_str().to_string())
            .or_default()
            .push(violation.clone());
    }
    buckets
}

/// The category → violation-key map the fix loop diffs between passes.
pub fn violation_categories(
    violations: &[ContractViolation],
) -> BTreeMap<String, Vec<String>> {
    let mut categories: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for violation in violations {
        categories
            .entry(violation.severity.as_str().to_string())
            .or_default()
            .push(violation.key());
    }
    categories
}

/// Which system a service belongs to: position in the decomposed service
/// map selects Build1/Build2/Build3; everything else is Integration.
pub fn system_for_service(state: &PipelineState, service: &str) -> SystemTag {
    match state
        .service_map
        .iter()
        .position(|entry| entry.name == service)
    {
        Some(0) => SystemTag::Build1,
        Some(1) => SystemTag::Build2,
        Some(2) => SystemTag::Build3,
        _ => SystemTag::Integration,
    }
}

/// Record each violation as a finding (severity → priority mapping), and
/// return the allocated IDs.
pub fn record_violations_as_findings(
    state: &mut PipelineState,
    violations: &[ContractViolation],
) -> Vec<String> {
    let mut ids = Vec::with_capacity(violations.len());
    for violation in violations {
        let system = system_for_service(state, &violation.service);
        let finding = Finding::new(violation.priority(), system, violation.component())
            .with_evidence(render_evidence(violation))
            .with_recommendation(format!("resolve {}", violation.code));
        ids.push(state.add_finding(finding));
    }
    ids
}

fn render_evidence(violation: &ContractViolation) -> String {
    match (&violation.expected, &violation.actual) {
        (Some(expected), Some(actual)) => format!(
            "{} (expected {expected}, actual {actual})",
            violation.message
        ),
        _ => violation.message.clone(),
    }
}

/// Count source lines per service directory, for violation density.
pub fn count_service_loc(generated_root: &Path) -> BTreeMap<String, u64> {
    let mut loc: BTreeMap<String, u64> = BTreeMap::new();
    for entry in WalkDir::new(generated_root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let is_source = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| matches!(ext, "py" | "js" | "ts" | "go" | "sql"));
        if !is_source {
            continue;
        }
        let service = entry
            .path()
            .strip_prefix(generated_root)
            .ok()
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .unwrap_or_default();
        let lines = std::fs::read_to_string(entry.path())
            .map(|content| content.lines().count() as u64)
            .unwrap_or(0);
        *loc.entry(service).or_insert(0) += lines;
    }
    loc
}

/// Compute all scores into the state: one per system, integration, the
/// aggregate, and the traffic light.
pub fn compute_scores(
    state: &mut PipelineState,
    report: &IntegrationReport,
    violations: &[ContractViolation],
    generated_root: &Path,
    mcp_tools_ok: u32,
) {
    let loc = count_service_loc(generated_root);
    let per_service_violations: BTreeMap<String, usize> =
        violations.iter().fold(BTreeMap::new(), |mut acc, violation| {
            *acc.entry(violation.service.clone()).or_insert(0) += 1;
            acc
        });

    let mut system_scores = [0.0f64; 3];
    for (idx, entry) in state.service_map.iter().take(3).enumerate() {
        let result = state.builder_results.get(&entry.name);
        let input = ServiceScoreInput {
            req_pass_rate: result.map(|r| r.convergence_ratio).unwrap_or(0.0),
            test_pass_rate: result.map(|r| r.test_pass_rate()).unwrap_or(0.0),
            contract_pass_rate: report.contract_pass_rate(),
            violations: per_service_violations
                .get(&entry.name)
                .copied()
                .unwrap_or(0),
            loc: loc.get(&entry.name).copied().unwrap_or(0),
            health_rate: match result.map(|r| r.health) {
                Some(crate::state::HealthColor::Green) => 1.0,
                Some(crate::state::HealthColor::Yellow) => 0.5,
                _ => 0.0,
            },
            artifacts_ratio: result
                .map(|r| (r.completed_phases.len() as f64 / 5.0).clamp(0.0, 1.0))
                .unwrap_or(0.0),
        };
        system_scores[idx] = service_score(&input);
    }

    let cross_build = violations
        .iter()
        .filter(|v| matches!(v.code.as_str(), "DEAD-001" | "DEAD-002" | "ORPHAN-001" | "NAME-001"))
        .count();
    let integration = integration_score(&IntegrationScoreInput {
        mcp_tools_ok,
        flows_passing: report.integration_tests_passed,
        flows_total: report.integration_tests_total,
        cross_build_violations: cross_build,
        phases_complete: state.completed_phases.len() as u32,
        phases_total: crate::phase::Phase::ORDER.len() as u32,
    });

    state.scores.insert("build1".to_string(), system_scores[0]);
    state.scores.insert("build2".to_string(), system_scores[1]);
    state.scores.insert("build3".to_string(), system_scores[2]);
    state.scores.insert("integration".to_string(), integration);
    state.aggregate_score = aggregate_score(
        system_scores[0],
        system_scores[1],
        system_scores[2],
        integration,
    );
    state.traffic_light = TrafficLight::from_score(state.aggregate_score);
}
