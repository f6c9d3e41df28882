//! Layer 4: cross-service static analysis.
//!
//! | Code       | Rule                                              |
//! |------------|---------------------------------------------------|
//! | DEAD-001   | Events published but never consumed               |
//! | DEAD-002   | Contracts registered but never validated          |
//! | ORPHAN-001 | Service in manifest but no proxy route            |
//! | NAME-001   | Inconsistent service names across the artifacts   |

use crate::state::{ContractViolation, Severity};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

static PUBLISH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:publish|emit)\s*\(\s*["']([\w.-]+)["']"#).expect("publish regex")
});

static CONSUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:subscribe|consume|on_event)\s*\(\s*["']([\w.-]+)["']"#)
        .expect("consume regex")
});

/// The structured inputs layer 4 works over. The gate assembles this from
/// the manifest, the generated tree, and what the contract phase recorded.
#[derive(Debug, Clone, Default)]
pub struct StaticAnalysisInput {
    /// Services declared in the merged compose manifest.
    pub manifest_services: BTreeSet<String>,
    /// Services with a route in the proxy tier.
    pub proxy_routes: BTreeSet<String>,
    /// Service directories present in the generated tree.
    pub code_services: BTreeSet<String>,
    /// Contract names registered during contract_register.
    pub registered_contracts: BTreeSet<String>,
    /// Contract names that were actually validated.
    pub validated_contracts: BTreeSet<String>,
    /// Event topics published / consumed across the tree.
    pub published_events: BTreeSet<String>,
    pub consumed_events: BTreeSet<String>,
}

impl StaticAnalysisInput {
    /// Sweep the generated tree for publish/consume sites.
    pub fn collect_events(&mut self, root: &Path) {
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let is_source = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| matches!(ext, "py" | "js" | "ts" | "go"));
            if !is_source {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            for capture in PUBLISH_RE.captures_iter(&content) {
                self.published_events.insert(capture[1].to_string());
            }
            for capture in CONSUME_RE.captures_iter(&content) {
                self.consumed_events.insert(capture[1].to_string());
            }
        }
    }
}

/// Run all four static rules.
pub fn run_static_analysis(input: &StaticAnalysisInput) -> Vec<ContractViolation> {
    let mut violations = Vec::new();

    // DEAD-001: published, never consumed.
    for topic in input.published_events.difference(&input.consumed_events) {
        violations.push(
            ContractViolation::new(
                "DEAD-001",
                Severity::Warning,
                "integration",
                format!("event '{topic}' is published but never consumed"),
            )
            .with_endpoint(topic.clone()),
        );
    }

    // DEAD-002: registered, never validated.
    for contract in input
        .registered_contracts
        .difference(&input.validated_contracts)
    {
        violations.push(
            ContractViolation::new(
                "DEAD-002",
                Severity::Warning,
                "integration",
                format!("contract '{contract}' registered but never validated"),
            )
            .with_endpoint(contract.clone()),
        );
    }

    // ORPHAN-001: in the manifest, unreachable through the proxy.
    for service in input.manifest_services.difference(&input.proxy_routes) {
        violations.push(
            ContractViolation::new(
                "ORPHAN-001",
                Severity::Error,
                service.clone(),
                "service is deployed but has no proxy route",
            ),
        );
    }

    // NAME-001: name sets disagree across manifest / code / contracts.
    let contract_services: BTreeSet<String> = input
        .registered_contracts
        .iter()
        .filter_map(|c| c.split(['-', '.']).next())
        .map(str::to_string)
        .collect();
    for service in &input.manifest_services {
        let in_code = input.code_services.contains(service);
        let in_contracts =
            contract_services.is_empty() || contract_services.contains(service);
        if !in_code || !in_contracts {
            violations.push(
                ContractViolation::new(
                    "NAME-001",
                    Severity::Error,
                    service.clone(),
                    format!(
                        "service in manifest but inconsistent elsewhere: code={in_code}, contracts={in_contracts}"
                    ),
                ),
            );
        }
    }
    for service in &input.code_services {
        if !input.manifest_services.contains(service) {
            violations.push(
                ContractViolation::new(
                    "NAME-001",
                    Severity::Error,
                    service.clone(),
                    "service directory present in code but absent from manifest",
                ),
            );
        }
    }

    violations
}
