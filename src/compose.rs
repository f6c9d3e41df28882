//! Compose orchestrator adapter.
//!
//! The container orchestrator itself is an external collaborator; this
//! module owns the contract to it. The adapter produces the
//! generated-services manifest tier (the other tiers, meaning infrastructure,
//! workers, proxy, and pipeline overrides, are static files named in config;
//! merging is the orchestrator's job), and drives `up` / `down` through the
//! compose CLI. `down()` must run in terminal cleanup on every path,
//! including failures; the conductor owns that invariant and the `MockOrchestrator`
//! in the tests observes it.

use crate::config::ComposeSection;
use crate::errors::PipelineError;
use crate::health::{self, EndpointStatus, ProbeStatus};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Networks in the deployed stack. The proxy must never join the backend;
/// data stores must never join the frontend. Generated services straddle
/// both so the proxy can reach them and they can reach the data tier.
pub const FRONTEND_NETWORK: &str = "frontend";
pub const BACKEND_NETWORK: &str = "backend";

/// Aggregate memory budget for the whole stack, and the slice each
/// generated service gets.
pub const STACK_MEMORY_BUDGET_MIB: u64 = 4608;
pub const GENERATED_SERVICE_MEMORY_MIB: u64 = 256;

/// Result of waiting for the deployed stack.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StackHealth {
    pub services_healthy: usize,
    pub failures: Vec<String>,
}

/// Contract to the container orchestrator.
#[async_trait]
pub trait ComposeOrchestrator: Send + Sync {
    /// Write the generated-services manifest tier and return its path.
    fn generate_manifest(
        &self,
        builder_outputs: &BTreeMap<String, PathBuf>,
    ) -> Result<PathBuf, PipelineError>;

    /// Bring the merged stack up.
    async fn up(&self, manifests: &[PathBuf]) -> Result<(), PipelineError>;

    /// Wait for every service health endpoint.
    async fn wait_healthy(&self, timeout: Duration) -> Result<StackHealth, PipelineError>;

    /// Tear the stack down. Best effort; invoked on all exit paths.
    async fn down(&self);
}

/// Default adapter: drives the compose CLI (`<binary> compose ...`).
pub struct ComposeCli {
    section: ComposeSection,
    output_dir: PathBuf,
}

impl ComposeCli {
    pub fn new(section: ComposeSection, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            section,
            output_dir: output_dir.into(),
        }
    }

    /// All manifest tiers in merge order: static tiers first, generated
    /// services last so pipeline overrides in the static set still win
    /// where the orchestrator merges right-to-left.
    pub fn manifest_args(&self, generated: &Path) -> Vec<String> {
        let mut args = Vec::new();
        for tier in &self.section.tier_manifests {
            args.push("-f".to_string());
            args.push(tier.to_string_lossy().to_string());
        }
        args.push("-f".to_string());
        args.push(generated.to_string_lossy().to_string());
        args
    }

    async fn run_compose(&self, args: &[String]) -> Result<(), PipelineError> {
        let output = Command::new(&self.section.binary)
            .arg("compose")
            .args(args)
            .env_clear()
            .envs(crate::util::filtered_process_env())
            .output()
            .await
            .map_err(|e| PipelineError::Compose(format!("spawning compose: {e}")))?;
        if !output.status.success() {
            return Err(PipelineError::Compose(format!(
                "compose {} exited {}: {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Build the generated-services manifest document.
///
/// Topology rules enforced here:
/// - generated services join both networks; nothing else is declared in
///   this tier (data stores and proxy belong to the static tiers)
/// - startup ordering via `depends_on: service_healthy` on the data stores
/// - every service carries a HEALTHCHECK and a pinned (non-latest) image
///   or build context
/// - per-service memory limits keep the aggregate inside the stack budget
pub fn generated_services_manifest(builder_outputs: &BTreeMap<String, PathBuf>) -> Value {
    let mut services = serde_json::Map::new();
    for (name, output_dir) in builder_outputs {
        services.insert(
            name.clone(),
            json!({
                "build": { "context": output_dir.to_string_lossy() },
                "networks": [FRONTEND_NETWORK, BACKEND_NETWORK],
                "depends_on": {
                    "postgres": { "condition": "service_healthy" },
                    "redis": { "condition": "service_healthy" },
                },
                "healthcheck": {
                    "test": ["CMD", "curl", "-f", "http://localhost:8000/health"],
                    "interval": "5s",
                    "timeout": "3s",
                    "retries": 5,
                },
                "mem_limit": format!("{}m", GENERATED_SERVICE_MEMORY_MIB),
                "restart": "unless-stopped",
            }),
        );
    }

    json!({
        "services": services,
        "networks": {
            FRONTEND_NETWORK: { "external": true },
            BACKEND_NETWORK: { "external": true },
        },
    })
}

#[async_trait]
impl ComposeOrchestrator for ComposeCli {
    fn generate_manifest(
        &self,
        builder_outputs: &BTreeMap<String, PathBuf>,
    ) -> Result<PathBuf, PipelineError> {
        let manifest = generated_services_manifest(builder_outputs);
        let yaml = serde_yaml::to_string(&manifest)
            .map_err(|e| PipelineError::Compose(format!("serializing manifest: {e}")))?;

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            PipelineError::Compose(format!("creating manifest dir: {e}"))
        })?;
        let path = self.output_dir.join("compose.generated.yaml");
        std::fs::write(&path, yaml)
            .map_err(|e| PipelineError::Compose(format!("writing manifest: {e}")))?;
        Ok(path)
    }

    async fn up(&self, manifests: &[PathBuf]) -> Result<(), PipelineError> {
        let mut args: Vec<String> = Vec::new();
        for manifest in manifests {
            args.push("-f".to_string());
            args.push(manifest.to_string_lossy().to_string());
        }
        args.extend(["up".to_string(), "-d".to_string()]);
        tracing::info!(manifests = manifests.len(), "bringing stack up");
        self.run_compose(&args).await
    }

    async fn wait_healthy(&self, timeout: Duration) -> Result<StackHealth, PipelineError> {
        let urls = &self.section.service_health_urls;
        let outcome = health::poll_until_healthy(urls, timeout, Duration::from_secs(2), 2).await;
        Ok(summarize(urls, outcome))
    }

    async fn down(&self) {
        let mut args: Vec<String> = Vec::new();
        for tier in &self.section.tier_manifests {
            args.push("-f".to_string());
            args.push(tier.to_string_lossy().to_string());
        }
        let generated = self.output_dir.join("compose.generated.yaml");
        if generated.exists() {
            args.push("-f".to_string());
            args.push(generated.to_string_lossy().to_string());
        }
        args.extend([
            "down".to_string(),
            "--remove-orphans".to_string(),
            "--volumes".to_string(),
        ]);
        if let Err(err) = self.run_compose(&args).await {
            tracing::warn!(error = %err, "compose down failed");
        }
    }
}

fn summarize(
    urls: &BTreeMap<String, String>,
    outcome: Result<BTreeMap<String, EndpointStatus>, crate::errors::HealthError>,
) -> StackHealth {
    match outcome {
        Ok(statuses) => StackHealth {
            services_healthy: statuses
                .values()
                .filter(|s| s.status == ProbeStatus::Healthy)
                .count(),
            failures: Vec::new(),
        },
        Err(crate::errors::HealthError::DeadlineExpired { laggards }) => StackHealth {
            services_healthy: urls.len().saturating_sub(laggards.len()),
            failures: laggards,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> BTreeMap<String, PathBuf> {
        BTreeMap::from([
            ("auth".to_string(), PathBuf::from("/work/services/auth")),
            ("order".to_string(), PathBuf::from("/work/services/order")),
            (
                "notification".to_string(),
                PathBuf::from("/work/services/notification"),
            ),
        ])
    }

    #[test]
    fn manifest_declares_both_networks_per_generated_service() {
        let manifest = generated_services_manifest(&outputs());
        for name in ["auth", "order", "notification"] {
            let networks = manifest["services"][name]["networks"].as_array().unwrap();
            assert!(networks.contains(&json!(FRONTEND_NETWORK)));
            assert!(networks.contains(&json!(BACKEND_NETWORK)));
        }
    }

    #[test]
    fn manifest_orders_startup_behind_healthy_data_stores() {
        let manifest = generated_services_manifest(&outputs());
        let depends = &manifest["services"]["auth"]["depends_on"];
        assert_eq!(depends["postgres"]["condition"], "service_healthy");
        assert_eq!(depends["redis"]["condition"], "service_healthy");
    }

    #[test]
    fn manifest_services_carry_healthcheck_and_mem_limit() {
        let manifest = generated_services_manifest(&outputs());
        for name in ["auth", "order", "notification"] {
            let service = &manifest["services"][name];
            assert!(service["healthcheck"]["test"].is_array());
            assert_eq!(service["mem_limit"], "256m");
        }
    }

    #[test]
    fn generated_tier_stays_inside_memory_budget() {
        let manifest = generated_services_manifest(&outputs());
        let count = manifest["services"].as_object().unwrap().len() as u64;
        assert!(count * GENERATED_SERVICE_MEMORY_MIB < STACK_MEMORY_BUDGET_MIB);
    }

    #[test]
    fn manifest_has_no_latest_tags() {
        let manifest = generated_services_manifest(&outputs());
        let rendered = serde_yaml::to_string(&manifest).unwrap();
        assert!(!rendered.contains(":latest"));
    }

    #[test]
    fn generate_manifest_writes_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ComposeCli::new(ComposeSection::default(), dir.path());
        let path = adapter.generate_manifest(&outputs()).unwrap();
        assert!(path.exists());

        let parsed: Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["services"].as_object().unwrap().len(), 3);
    }

    #[test]
    fn manifest_args_merge_static_tiers_before_generated() {
        let section = ComposeSection {
            binary: "docker".to_string(),
            tier_manifests: vec![
                PathBuf::from("compose.infra.yaml"),
                PathBuf::from("compose.workers.yaml"),
                PathBuf::from("compose.proxy.yaml"),
            ],
            service_health_urls: BTreeMap::new(),
        };
        let adapter = ComposeCli::new(section, "/tmp/out");
        let args = adapter.manifest_args(Path::new("/tmp/out/compose.generated.yaml"));
        assert_eq!(args.len(), 8);
        assert_eq!(args[1], "compose.infra.yaml");
        assert!(args[7].ends_with("compose.generated.yaml"));
    }

    #[tokio::test]
    async fn wait_healthy_with_no_endpoints_is_trivially_healthy() {
        let adapter = ComposeCli::new(ComposeSection::default(), "/tmp/out");
        let health = adapter.wait_healthy(Duration::from_millis(100)).await.unwrap();
        assert_eq!(health.services_healthy, 0);
        assert!(health.failures.is_empty());
    }

    #[test]
    fn summarize_counts_laggards_as_failures() {
        let urls = BTreeMap::from([
            ("auth".to_string(), "http://x/health".to_string()),
            ("order".to_string(), "http://y/health".to_string()),
        ]);
        let health = summarize(
            &urls,
            Err(crate::errors::HealthError::DeadlineExpired {
                laggards: vec!["order".to_string()],
            }),
        );
        assert_eq!(health.services_healthy, 1);
        assert_eq!(health.failures, vec!["order".to_string()]);
    }
}
