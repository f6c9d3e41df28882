//! Fix loop: violation-to-instruction feedback with convergence and
//! regression detection.
//!
//! Each pass snapshots the violation set, feeds per-service buckets to the
//! builder in quick mode, re-runs the quality gate, and measures
//! effectiveness and regressions. The loop is pass-bounded and terminates
//! on any of: effectiveness below the floor, regression rate above the
//! ceiling, the pass cap, or no open P0/P1 work remaining. The pipeline
//! proceeds to final scoring regardless of which way the loop ends.

use crate::gate::violation_categories;
use crate::state::{
    BuilderResult, ContractViolation, FixPassSummary, PipelineState, Priority,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// Loop bounds, lifted from `LimitsConfig` at the call site.
#[derive(Debug, Clone, Copy)]
pub struct FixLoopConfig {
    pub max_passes: u32,
    pub effectiveness_floor: f64,
    pub regression_ceiling: f64,
}

impl Default for FixLoopConfig {
    fn default() -> Self {
        Self {
            max_passes: 5,
            effectiveness_floor: 0.30,
            regression_ceiling: 0.25,
        }
    }
}

/// A violation present after a pass that was absent before it, within the
/// same category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Regression {
    pub category: String,
    pub violation: String,
}

/// Diff two category → violation maps. A regression is any violation in
/// `after[category]` that `before[category]` did not contain.
pub fn detect_regressions(
    before: &BTreeMap<String, Vec<String>>,
    after: &BTreeMap<String, Vec<String>>,
) -> Vec<Regression> {
    let mut regressions = Vec::new();
    for (category, violations) in after {
        let baseline = before.get(category);
        for violation in violations {
            let known = baseline.is_some_and(|b| b.contains(violation));
            if !known {
                regressions.push(Regression {
                    category: category.clone(),
                    violation: violation.clone(),
                });
            }
        }
    }
    regressions
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Effectiveness fell below the floor.
    EffectivenessFloor,
    /// Regression rate exceeded the ceiling.
    RegressionCeiling,
    /// Pass cap reached.
    PassCap,
    /// No open P0/P1 violations remain.
    Clean,
}

/// Final loop outcome.
#[derive(Debug)]
pub struct FixLoopOutcome {
    pub reason: TerminationReason,
    pub final_violations: Vec<ContractViolation>,
}

/// The seam between the loop and the world: feed fixes to a builder, re-run
/// the gate. The conductor wires this to the real builder runner and gate;
/// tests script it.
#[async_trait]
pub trait FixExecutor: Send {
    async fn apply_fixes(
        &mut self,
        service: &str,
        violations: &[ContractViolation],
    ) -> BuilderResult;

    async fn reevaluate(&mut self) -> Vec<ContractViolation>;
}

fn has_open_blockers(violations: &[ContractViolation]) -> bool {
    violations
        .iter()
        .any(|v| matches!(v.priority(), Priority::P0 | Priority::P1))
}

/// Group violations by affected service, dropping P3 noise the builder
/// should not be asked to fix.
fn by_service(violations: &[ContractViolation]) -> BTreeMap<String, Vec<ContractViolation>> {
    let mut grouped: BTreeMap<String, Vec<ContractViolation>> = BTreeMap::new();
    for violation in violations {
        if violation.priority() == Priority::P3 {
            continue;
        }
        grouped
            .entry(violation.service.clone())
            .or_default()
            .push(violation.clone());
    }
    grouped
}

/// Run the loop. Pass summaries land in `state.fix_passes` with strictly
/// increasing pass numbers; builder quick-pass results update
/// `state.builder_results`; costs accumulate into the state.
pub async fn run_fix_loop(
    config: &FixLoopConfig,
    initial: Vec<ContractViolation>,
    executor: &mut dyn FixExecutor,
    state: &mut PipelineState,
) -> FixLoopOutcome {
    let mut current = initial;

    loop {
        if !has_open_blockers(&current) {
            return FixLoopOutcome {
                reason: TerminationReason::Clean,
                final_violations: current,
            };
        }
        if state.fix_passes.len() as u32 >= config.max_passes {
            return FixLoopOutcome {
                reason: TerminationReason::PassCap,
                final_violations: current,
            };
        }

        let pass_number = state.fix_passes.len() as u32 + 1;
        let pre_count = current.len();
        let before_categories = violation_categories(&current);

        let mut cost_delta = 0.0;
        for (service, bucket) in by_service(&current) {
            tracing::info!(pass = pass_number, service = %service, violations = bucket.len(),
                "feeding violations to builder");
            let result = executor.apply_fixes(&service, &bucket).await;
            cost_delta += result.total_cost;
            state.builder_results.insert(service, result);
        }

        let after = executor.reevaluate().await;
        let post_count = after.len();
        let after_categories = violation_categories(&after);

        let effectiveness =
            (pre_count as f64 - post_count as f64) / pre_count.max(1) as f64;
        let regressions = detect_regressions(&before_categories, &after_categories);
        let regression_rate = regressions.len() as f64 / pre_count.max(1) as f64;

        let summary = FixPassSummary {
            pass_number,
            fixed: pre_count.saturating_sub(post_count),
            remaining: post_count,
            regressions: regressions.len(),
            effectiveness,
            regression_rate,
            cost_delta,
        };
        tracing::info!(
            pass = pass_number,
            fixed = summary.fixed,
            remaining = summary.remaining,
            effectiveness,
            regression_rate,
            "fix pass complete"
        );
        state.fix_passes.push(summary);
        state.add_cost(cost_delta);
        current = after;

        if effectiveness < config.effectiveness_floor {
            return FixLoopOutcome {
                reason: TerminationReason::EffectivenessFloor,
                final_violations: current,
            };
        }
        if regression_rate > config.regression_ceiling {
            return FixLoopOutcome {
                reason: TerminationReason::RegressionCeiling,
                final_violations: current,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Severity;
    use std::collections::VecDeque;

    fn violations(count: usize) -> Vec<ContractViolation> {
        (0..count)
            .map(|i| {
                ContractViolation::new(
                    format!("CV-{i:03}"),
                    Severity::Error,
                    "order",
                    format!("violation {i}"),
                )
            })
            .collect()
    }

    /// Scripted executor: pops the next violation set per reevaluation.
    struct Scripted {
        rounds: VecDeque<Vec<ContractViolation>>,
        fix_calls: Vec<(String, usize)>,
        cost_per_fix: f64,
    }

    impl Scripted {
        fn new(rounds: Vec<Vec<ContractViolation>>) -> Self {
            Self {
                rounds: rounds.into(),
                fix_calls: Vec::new(),
                cost_per_fix: 0.5,
            }
        }
    }

    #[async_trait]
    impl FixExecutor for Scripted {
        async fn apply_fixes(
            &mut self,
            service: &str,
            violations: &[ContractViolation],
        ) -> BuilderResult {
            self.fix_calls.push((service.to_string(), violations.len()));
            let mut result = BuilderResult::failed(service);
            result.success = true;
            result.exit_code = 0;
            result.total_cost = self.cost_per_fix;
            result
        }

        async fn reevaluate(&mut self) -> Vec<ContractViolation> {
            self.rounds.pop_front().unwrap_or_default()
        }
    }

    #[test]
    fn regression_diff_matches_category_semantics() {
        let before = BTreeMap::from([(
            "cat1".to_string(),
            vec!["v1".to_string(), "v2".to_string()],
        )]);
        let after = BTreeMap::from([(
            "cat1".to_string(),
            vec!["v1".to_string(), "v3".to_string()],
        )]);

        let regressions = detect_regressions(&before, &after);
        assert_eq!(
            regressions,
            vec![Regression {
                category: "cat1".to_string(),
                violation: "v3".to_string(),
            }]
        );
    }

    #[test]
    fn new_category_counts_entirely_as_regressions() {
        let before = BTreeMap::from([("error".to_string(), vec!["a".to_string()])]);
        let after = BTreeMap::from([
            ("error".to_string(), vec!["a".to_string()]),
            ("critical".to_string(), vec!["x".to_string(), "y".to_string()]),
        ]);
        assert_eq!(detect_regressions(&before, &after).len(), 2);
    }

    #[tokio::test]
    async fn converging_run_stops_when_effectiveness_drops() {
        // 10 → 6 (0.40) → 4 (0.33) → 3 (0.25 < 0.30, stop): three passes.
        let mut executor = Scripted::new(vec![violations(6), violations(4), violations(3)]);
        let mut state = PipelineState::new();

        let outcome = run_fix_loop(
            &FixLoopConfig::default(),
            violations(10),
            &mut executor,
            &mut state,
        )
        .await;

        assert_eq!(outcome.reason, TerminationReason::EffectivenessFloor);
        assert_eq!(state.fix_passes.len(), 3);
        let numbers: Vec<u32> = state.fix_passes.iter().map(|p| p.pass_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(state.fix_passes[0].fixed, 4);
        assert_eq!(state.fix_passes[0].remaining, 6);
        assert!((state.fix_passes[0].effectiveness - 0.4).abs() < 1e-9);
        assert_eq!(outcome.final_violations.len(), 3);
    }

    #[tokio::test]
    async fn pass_numbers_strictly_increase_and_respect_cap() {
        // Each round fixes just over 30% of the prior count, so
        // effectiveness stays at the floor and only the cap stops the loop.
        let config = FixLoopConfig {
            max_passes: 3,
            ..Default::default()
        };
        let mut executor = Scripted::new(vec![violations(70), violations(49), violations(34)]);
        let mut state = PipelineState::new();

        let outcome = run_fix_loop(&config, violations(100), &mut executor, &mut state).await;

        assert_eq!(outcome.reason, TerminationReason::PassCap);
        assert_eq!(state.fix_passes.len(), 3);
        for window in state.fix_passes.windows(2) {
            assert!(window[1].pass_number > window[0].pass_number);
        }
    }

    #[tokio::test]
    async fn regression_ceiling_terminates_loop() {
        // Pass fixes many but introduces new violations in the same
        // category: 10 pre, 4 post of which 3 are brand new → regression
        // rate 0.3 > 0.25.
        let mut after = violations(1); // CV-000 survives
        for i in 100..103 {
            after.push(ContractViolation::new(
                format!("CV-{i}"),
                Severity::Error,
                "order",
                "fresh breakage",
            ));
        }
        let mut executor = Scripted::new(vec![after]);
        let mut state = PipelineState::new();

        let outcome = run_fix_loop(
            &FixLoopConfig::default(),
            violations(10),
            &mut executor,
            &mut state,
        )
        .await;

        assert_eq!(outcome.reason, TerminationReason::RegressionCeiling);
        assert_eq!(state.fix_passes.len(), 1);
        assert_eq!(state.fix_passes[0].regressions, 3);
    }

    #[tokio::test]
    async fn warning_only_backlog_is_already_clean() {
        let only_warnings = vec![ContractViolation::new(
            "LOG-001",
            Severity::Warning,
            "auth",
            "print statement",
        )];
        let mut executor = Scripted::new(vec![]);
        let mut state = PipelineState::new();

        let outcome = run_fix_loop(
            &FixLoopConfig::default(),
            only_warnings,
            &mut executor,
            &mut state,
        )
        .await;

        assert_eq!(outcome.reason, TerminationReason::Clean);
        assert!(state.fix_passes.is_empty());
        assert!(executor.fix_calls.is_empty());
    }

    #[tokio::test]
    async fn fixes_are_fed_per_service_and_costs_accumulate() {
        let mixed = vec![
            ContractViolation::new("CV-001", Severity::Error, "auth", "a"),
            ContractViolation::new("CV-002", Severity::Error, "order", "b"),
            ContractViolation::new("CV-003", Severity::Critical, "order", "c"),
            // P3 noise must not be fed to the builder.
            ContractViolation::new("CV-004", Severity::Info, "auth", "note"),
        ];
        let mut executor = Scripted::new(vec![Vec::new()]);
        let mut state = PipelineState::new();

        let outcome = run_fix_loop(
            &FixLoopConfig::default(),
            mixed,
            &mut executor,
            &mut state,
        )
        .await;

        assert_eq!(outcome.reason, TerminationReason::Clean);
        assert_eq!(executor.fix_calls.len(), 2);
        assert!(executor.fix_calls.contains(&("auth".to_string(), 1)));
        assert!(executor.fix_calls.contains(&("order".to_string(), 2)));
        // Two services fixed at 0.5 each.
        assert!((state.total_cost - 1.0).abs() < 1e-9);
        assert!((state.fix_passes[0].cost_delta - 1.0).abs() < 1e-9);
        // Quick-pass results land in builder_results.
        assert!(state.builder_results.contains_key("auth"));
        assert!(state.builder_results.contains_key("order"));
    }

    #[tokio::test]
    async fn fix_pass_count_never_exceeds_cap() {
        // Violations never shrink enough to trip the floor but shrink just
        // at it; rounds beyond the cap exist but must not run.
        let rounds: Vec<Vec<ContractViolation>> = (0..10)
            .map(|i| violations(100usize.saturating_sub((i + 1) * 30).max(5)))
            .collect();
        let mut executor = Scripted::new(rounds);
        let mut state = PipelineState::new();

        run_fix_loop(
            &FixLoopConfig::default(),
            violations(100),
            &mut executor,
            &mut state,
        )
        .await;

        assert!(state.fix_passes.len() as u32 <= FixLoopConfig::default().max_passes);
    }
}
