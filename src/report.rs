//! Markdown audit report rendered from the final pipeline state.

use crate::gate::GoodEnough;
use crate::state::{PipelineState, Priority, Resolution, TrafficLight};
use std::fmt::Write;

/// Render the run report. A RED verdict is a normal outcome, reported the
/// same way as any other.
pub fn render_markdown(state: &PipelineState, verdict: Option<&GoodEnough>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Gauntlet Audit Report");
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Run**: `{}`", state.run_id);
    let _ = writeln!(out, "- **Traffic light**: {} {}", light_emoji(state.traffic_light), state.traffic_light);
    let _ = writeln!(out, "- **Aggregate score**: {:.1} / 100", state.aggregate_score);
    let _ = writeln!(out, "- **Total cost**: ${:.2}", state.total_cost);
    let _ = writeln!(out, "- **Started**: {}", state.started_at.to_rfc3339());
    let _ = writeln!(out, "- **Updated**: {}", state.updated_at.to_rfc3339());

    if let Some(verdict) = verdict {
        let _ = writeln!(out);
        if verdict.verdict {
            let _ = writeln!(out, "**Verdict: good enough.**");
        } else {
            let _ = writeln!(out, "**Verdict: not good enough.** Failed thresholds:");
            for reason in &verdict.failed_reasons {
                let _ = writeln!(out, "- {reason}");
            }
        }
    }

    if !state.scores.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Scores");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Category | Score |");
        let _ = writeln!(out, "|---|---|");
        for (category, score) in &state.scores {
            let _ = writeln!(out, "| {category} | {score:.1} |");
        }
    }

    if !state.builder_results.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Builders");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Service | Success | Tests | Convergence | Cost | Exit |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for (name, result) in &state.builder_results {
            let _ = writeln!(
                out,
                "| {name} | {} | {}/{} | {:.2} | ${:.2} | {} |",
                result.success,
                result.test_passed,
                result.test_total,
                result.convergence_ratio,
                result.total_cost,
                result.exit_code
            );
        }
    }

    if !state.fix_passes.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Fix passes");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "| Pass | Fixed | Remaining | Regressions | Effectiveness | Cost |"
        );
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for pass in &state.fix_passes {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {:.2} | ${:.2} |",
                pass.pass_number,
                pass.fixed,
                pass.remaining,
                pass.regressions,
                pass.effectiveness,
                pass.cost_delta
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Findings ({})", state.findings.len());
    if state.findings.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "No findings recorded.");
    }
    for priority in [Priority::P0, Priority::P1, Priority::P2, Priority::P3] {
        let in_bucket: Vec<_> = state
            .findings
            .iter()
            .filter(|f| f.priority == priority)
            .collect();
        if in_bucket.is_empty() {
            continue;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "### {priority}");
        for finding in in_bucket {
            let marker = match finding.resolution {
                Resolution::Open => "OPEN",
                Resolution::Fixed => "FIXED",
                Resolution::Wontfix => "WONTFIX",
            };
            let _ = writeln!(
                out,
                "- **{}** [{marker}] {}: {}",
                finding.id, finding.component, finding.evidence
            );
            if !finding.recommendation.is_empty() {
                let _ = writeln!(out, "  - recommendation: {}", finding.recommendation);
            }
        }
    }

    out
}

fn light_emoji(light: TrafficLight) -> &'static str {
    match light {
        TrafficLight::Green => "🟢",
        TrafficLight::Yellow => "🟡",
        TrafficLight::Red => "🔴",
    }
}
