//! Artifacts the pipeline hands to the builder: the generated `config.yaml`
//! and the `FIX_INSTRUCTIONS.md` rendered from quality-gate violations.

use crate::state::{ContractViolation, Priority};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const FIX_INSTRUCTIONS_FILENAME: &str = "FIX_INSTRUCTIONS.md";

/// The config.yaml document the builder consumes. Its loader tolerates
/// unknown keys, so new fields here are forward-compatible.
#[derive(Debug, Serialize)]
struct BuilderConfigDoc<'a> {
    milestone: String,
    depth: &'a str,
    e2e_testing: bool,
    post_orchestration_scans: bool,
    service_name: &'a str,
    mcp: McpSection,
    contracts: &'a [Value],
}

#[derive(Debug, Serialize)]
struct McpSection {
    enabled: bool,
    servers: BTreeMap<String, Value>,
}

/// Write the builder's `config.yaml` into `output_dir` and return its path.
pub fn generate_builder_config(
    service_name: &str,
    output_dir: &Path,
    depth: &str,
    contracts: &[Value],
    mcp_enabled: bool,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating builder workspace {}", output_dir.display()))?;

    let doc = BuilderConfigDoc {
        milestone: format!("build-{service_name}"),
        depth,
        e2e_testing: true,
        post_orchestration_scans: true,
        service_name,
        mcp: McpSection {
            enabled: mcp_enabled,
            servers: BTreeMap::new(),
        },
        contracts,
    };

    let path = output_dir.join("config.yaml");
    let yaml = serde_yaml::to_string(&doc).context("serializing builder config")?;
    std::fs::write(&path, yaml)
        .with_context(|| format!("writing builder config {}", path.display()))?;
    Ok(path)
}

/// The keys the builder's loader actually recognizes, parsed back out of a
/// generated config. Everything else lands in `unknown_keys`.
#[derive(Debug, Deserialize)]
pub struct RecognizedBuilderConfig {
    #[serde(default)]
    pub milestone: String,
    #[serde(default)]
    pub depth: String,
    #[serde(default)]
    pub e2e_testing: bool,
    #[serde(default)]
    pub post_orchestration_scans: bool,
    #[serde(default)]
    pub mcp: Option<Value>,
    #[serde(default)]
    pub contracts: Vec<Value>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl RecognizedBuilderConfig {
    pub fn unknown_keys(&self) -> BTreeSet<String> {
        self.unknown.keys().cloned().collect()
    }
}

/// Parse a generated config.yaml the way the builder's loader would.
pub fn parse_builder_config(path: &Path) -> Result<RecognizedBuilderConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading builder config {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing builder config {}", path.display()))
}

/// Section headers rendered into FIX_INSTRUCTIONS.md, in priority order.
/// P3/info violations are not fed back to the builder.
const PRIORITY_SECTIONS: [(Priority, &str); 3] = [
    (Priority::P0, "## Priority: P0 (Must Fix)"),
    (Priority::P1, "## Priority: P1 (Should Fix)"),
    (Priority::P2, "## Priority: P2 (Nice to Have)"),
];

/// Write `FIX_INSTRUCTIONS.md` into the builder workspace, grouping
/// violations by priority. Empty sections are omitted.
pub fn write_fix_instructions(cwd: &Path, violations: &[ContractViolation]) -> Result<PathBuf> {
    let mut grouped: BTreeMap<Priority, Vec<&ContractViolation>> = BTreeMap::new();
    for violation in violations {
        grouped.entry(violation.priority()).or_default().push(violation);
    }

    let mut out = String::from("# Fix Instructions\n");
    for (priority, header) in PRIORITY_SECTIONS {
        let Some(bucket) = grouped.get(&priority) else {
            continue;
        };
        if bucket.is_empty() {
            continue;
        }
        out.push('\n');
        out.push_str(header);
        out.push('\n');
        for violation in bucket {
            out.push('\n');
            out.push_str(&format!("### {}: {}\n", violation.code, violation.message));
            out.push_str(&format!("- **Component**: {}\n", violation.component()));
            out.push_str(&format!("- **Evidence**: {}\n", render_evidence(violation)));
            out.push_str(&format!("- **Action**: {}\n", suggested_action(violation)));
        }
    }

    std::fs::create_dir_all(cwd)
        .with_context(|| format!("creating builder workspace {}", cwd.display()))?;
    let path = cwd.join(FIX_INSTRUCTIONS_FILENAME);
    std::fs::write(&path, out)
        .with_context(|| format!("writing fix instructions {}", path.display()))?;
    Ok(path)
}

fn render_evidence(violation: &ContractViolation) -> String {
    match (&violation.expected, &violation.actual) {
        (Some(expected), Some(actual)) => {
            format!("expected `{expected}`, got `{actual}`")
        }
        _ => violation.message.clone(),
    }
}

/// Rule-specific remediation text; generic fallback otherwise.
fn suggested_action(violation: &ContractViolation) -> String {
    match violation.code.as_str() {
        "SEC-SCAN-001" => "Move the credential into an environment variable or secret store".into(),
        "CORS-001" => "Replace the wildcard CORS origin with an explicit allowlist".into(),
        "LOG-001" => "Replace print statements with the structured logger".into(),
        "LOG-002" => "Attach the request-logging middleware to every route".into(),
        "DOCKER-001" => "Add a HEALTHCHECK directive to the service Dockerfile".into(),
        "DOCKER-002" => "Pin the base image to an explicit version tag".into(),
        _ => "Resolve the violation and re-run the quality gate".into(),
    }
}

/// Re-parse a FIX_INSTRUCTIONS.md document into its priority groupings
/// (violation codes per priority).
pub fn parse_fix_instructions(text: &str) -> BTreeMap<Priority, Vec<String>> {
    let mut grouped: BTreeMap<Priority, Vec<String>> = BTreeMap::new();
    let mut current: Option<Priority> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("## Priority: ") {
            current = match rest.split_whitespace().next() {
                Some("P0") => Some(Priority::P0),
                Some("P1") => Some(Priority::P1),
                Some("P2") => Some(Priority::P2),
                Some("P3") => Some(Priority::P3),
                _ => None,
            };
        } else if let Some(rest) = trimmed.strip_prefix("### ")
            && let Some(priority) = current
            && let Some((code, _)) = rest.split_once(':')
        {
            grouped.entry(priority).or_default().push(code.trim().to_string());
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Severity;
    use tempfile::tempdir;

    fn sample_violations() -> Vec<ContractViolation> {
        vec![
            ContractViolation::new(
                "SEC-SCAN-001",
                Severity::Critical,
                "auth",
                "hardcoded secret in settings",
            )
            .with_file_path("auth/settings.py"),
            ContractViolation::new("CORS-001", Severity::Error, "order", "wildcard CORS origin")
                .with_file_path("order/config.yaml"),
            ContractViolation::new(
                "CV-014",
                Severity::Error,
                "order",
                "response missing order_id field",
            )
            .with_endpoint("/orders")
            .with_expected_actual("order_id present", "absent"),
            ContractViolation::new("LOG-001", Severity::Warning, "notification", "print statement")
                .with_file_path("notification/worker.py"),
        ]
    }

    #[test]
    fn config_yaml_carries_recognized_keys() {
        let dir = tempdir().unwrap();
        let contracts = vec![serde_json::json!({"name": "auth-api", "version": 1})];
        let path =
            generate_builder_config("auth", dir.path(), "standard", &contracts, true).unwrap();

        let parsed = parse_builder_config(&path).unwrap();
        assert_eq!(parsed.milestone, "build-auth");
        assert_eq!(parsed.depth, "standard");
        assert!(parsed.e2e_testing);
        assert!(parsed.post_orchestration_scans);
        assert_eq!(parsed.contracts.len(), 1);
        let mcp = parsed.mcp.as_ref().unwrap();
        assert_eq!(mcp["enabled"], true);
    }

    #[test]
    fn config_yaml_unrecognized_keys_are_surfaced() {
        let dir = tempdir().unwrap();
        let path = generate_builder_config("order", dir.path(), "quick", &[], false).unwrap();

        let parsed = parse_builder_config(&path).unwrap();
        // service_name is written for humans but is not a recognized loader key.
        assert!(parsed.unknown_keys().contains("service_name"));
        assert_eq!(
            parsed.unknown["service_name"],
            serde_json::json!("order")
        );
    }

    #[test]
    fn fix_instructions_group_by_priority_with_exact_headers() {
        let dir = tempdir().unwrap();
        let path = write_fix_instructions(dir.path(), &sample_violations()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        assert!(text.contains("## Priority: P0 (Must Fix)"));
        assert!(text.contains("## Priority: P1 (Should Fix)"));
        assert!(text.contains("## Priority: P2 (Nice to Have)"));
        assert!(text.contains("### SEC-SCAN-001: hardcoded secret in settings"));
        assert!(text.contains("- **Component**: auth/settings.py"));
        assert!(text.contains("- **Evidence**: expected `order_id present`, got `absent`"));
        assert!(text.contains("- **Action**: "));

        // P0 section appears before P1, P1 before P2.
        let p0 = text.find("P0 (Must Fix)").unwrap();
        let p1 = text.find("P1 (Should Fix)").unwrap();
        let p2 = text.find("P2 (Nice to Have)").unwrap();
        assert!(p0 < p1 && p1 < p2);
    }

    #[test]
    fn empty_sections_are_omitted() {
        let dir = tempdir().unwrap();
        let only_warning = vec![ContractViolation::new(
            "LOG-001",
            Severity::Warning,
            "auth",
            "print statement",
        )];
        let path = write_fix_instructions(dir.path(), &only_warning).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        assert!(!text.contains("P0 (Must Fix)"));
        assert!(!text.contains("P1 (Should Fix)"));
        assert!(text.contains("P2 (Nice to Have)"));
    }

    #[test]
    fn instructions_reparse_into_same_groupings() {
        let dir = tempdir().unwrap();
        let violations = sample_violations();
        let path = write_fix_instructions(dir.path(), &violations).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        let grouped = parse_fix_instructions(&text);
        assert_eq!(grouped[&Priority::P0], vec!["SEC-SCAN-001".to_string()]);
        assert_eq!(
            grouped[&Priority::P1],
            vec!["CORS-001".to_string(), "CV-014".to_string()]
        );
        assert_eq!(grouped[&Priority::P2], vec!["LOG-001".to_string()]);
    }

    #[test]
    fn info_violations_are_not_rendered() {
        let dir = tempdir().unwrap();
        let violations = vec![ContractViolation::new(
            "NOTE-001",
            Severity::Info,
            "auth",
            "informational only",
        )];
        let path = write_fix_instructions(dir.path(), &violations).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("NOTE-001"));
    }
}
