//! Pipeline configuration loaded from `gauntlet.toml`.
//!
//! The config is read once at process start, validated, and shared read-only
//! with every component. Layering is file → environment → CLI flags; every
//! field has a serde default so a minimal file stays minimal.
//!
//! # Configuration File Format
//!
//! ```toml
//! [paths]
//! prd = "docs/PRD.md"
//! output_dir = ".gauntlet"
//! build1 = "inputs/build1"
//! build2 = "inputs/build2"
//! build3 = "inputs/build3"
//!
//! [timeouts]
//! health_poll_timeout_s = 60
//! builder_timeout_s = 1800
//! mcp_tool_timeout_ms = 30000
//!
//! [limits]
//! max_concurrent_builders = 3
//! max_fix_passes = 5
//! max_budget_usd = 50.0
//!
//! [builder]
//! interpreter = "python3"
//! module = "agent_team"
//! depth = "standard"
//!
//! [workers.decomposer]
//! command = "python3"
//! args = ["-m", "decomposer_worker"]
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Input and output path roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Product Requirements Document driving the whole run.
    #[serde(default = "default_prd")]
    pub prd: PathBuf,
    /// Directory holding pipeline state, logs, and generated artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// The three build-input roots.
    #[serde(default = "default_build1")]
    pub build1: PathBuf,
    #[serde(default = "default_build2")]
    pub build2: PathBuf,
    #[serde(default = "default_build3")]
    pub build3: PathBuf,
}

fn default_prd() -> PathBuf {
    PathBuf::from("PRD.md")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".gauntlet")
}
fn default_build1() -> PathBuf {
    PathBuf::from("build1")
}
fn default_build2() -> PathBuf {
    PathBuf::from("build2")
}
fn default_build3() -> PathBuf {
    PathBuf::from("build3")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            prd: default_prd(),
            output_dir: default_output_dir(),
            build1: default_build1(),
            build2: default_build2(),
            build3: default_build3(),
        }
    }
}

impl PathsConfig {
    /// The three build roots in system order.
    pub fn build_roots(&self) -> [(&'static str, &Path); 3] {
        [
            ("build1", self.build1.as_path()),
            ("build2", self.build2.as_path()),
            ("build3", self.build3.as_path()),
        ]
    }
}

/// Timeout knobs, one per blocking boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_health_poll_timeout_s")]
    pub health_poll_timeout_s: u64,
    #[serde(default = "default_health_poll_interval_s")]
    pub health_poll_interval_s: u64,
    /// MCP session startup on warm starts.
    #[serde(default = "default_mcp_startup_timeout_ms")]
    pub mcp_startup_timeout_ms: u64,
    /// Longer grace on the first invocation while workers warm caches.
    #[serde(default = "default_mcp_first_start_timeout_ms")]
    pub mcp_first_start_timeout_ms: u64,
    #[serde(default = "default_mcp_tool_timeout_ms")]
    pub mcp_tool_timeout_ms: u64,
    /// Builder wall-clock ceiling.
    #[serde(default = "default_builder_timeout_s")]
    pub builder_timeout_s: u64,
    /// Constrained ceiling for quick-mode fix passes.
    #[serde(default = "default_fix_builder_timeout_s")]
    pub fix_builder_timeout_s: u64,
}

fn default_health_poll_timeout_s() -> u64 {
    60
}
fn default_health_poll_interval_s() -> u64 {
    2
}
fn default_mcp_startup_timeout_ms() -> u64 {
    10_000
}
fn default_mcp_first_start_timeout_ms() -> u64 {
    30_000
}
fn default_mcp_tool_timeout_ms() -> u64 {
    30_000
}
fn default_builder_timeout_s() -> u64 {
    1800
}
fn default_fix_builder_timeout_s() -> u64 {
    600
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            health_poll_timeout_s: default_health_poll_timeout_s(),
            health_poll_interval_s: default_health_poll_interval_s(),
            mcp_startup_timeout_ms: default_mcp_startup_timeout_ms(),
            mcp_first_start_timeout_ms: default_mcp_first_start_timeout_ms(),
            mcp_tool_timeout_ms: default_mcp_tool_timeout_ms(),
            builder_timeout_s: default_builder_timeout_s(),
            fix_builder_timeout_s: default_fix_builder_timeout_s(),
        }
    }
}

impl TimeoutsConfig {
    pub fn health_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.health_poll_timeout_s)
    }
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_interval_s)
    }
    pub fn mcp_startup(&self, first_start: bool) -> Duration {
        if first_start {
            Duration::from_millis(self.mcp_first_start_timeout_ms)
        } else {
            Duration::from_millis(self.mcp_startup_timeout_ms)
        }
    }
    pub fn mcp_tool(&self) -> Duration {
        Duration::from_millis(self.mcp_tool_timeout_ms)
    }
    pub fn builder(&self) -> Duration {
        Duration::from_secs(self.builder_timeout_s)
    }
    pub fn fix_builder(&self) -> Duration {
        Duration::from_secs(self.fix_builder_timeout_s)
    }
}

/// Concurrency caps, fix-loop limits, and the budget ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_concurrent_builders")]
    pub max_concurrent_builders: usize,
    #[serde(default = "default_max_fix_passes")]
    pub max_fix_passes: u32,
    #[serde(default = "default_fix_effectiveness_floor")]
    pub fix_effectiveness_floor: f64,
    #[serde(default = "default_regression_rate_ceiling")]
    pub regression_rate_ceiling: f64,
    #[serde(default = "default_max_budget_usd")]
    pub max_budget_usd: f64,
    /// Threshold of consecutive 2xx responses per endpoint.
    #[serde(default = "default_required_consecutive")]
    pub required_consecutive: u32,
}

fn default_max_concurrent_builders() -> usize {
    3
}
fn default_max_fix_passes() -> u32 {
    5
}
fn default_fix_effectiveness_floor() -> f64 {
    0.30
}
fn default_regression_rate_ceiling() -> f64 {
    0.25
}
fn default_max_budget_usd() -> f64 {
    100.0
}
fn default_required_consecutive() -> u32 {
    2
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builders: default_max_concurrent_builders(),
            max_fix_passes: default_max_fix_passes(),
            fix_effectiveness_floor: default_fix_effectiveness_floor(),
            regression_rate_ceiling: default_regression_rate_ceiling(),
            max_budget_usd: default_max_budget_usd(),
            required_consecutive: default_required_consecutive(),
        }
    }
}

/// How to launch the opaque builder program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderLaunch {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Module passed via `-m`.
    #[serde(default = "default_builder_module")]
    pub module: String,
    #[serde(default = "default_depth")]
    pub depth: String,
}

fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_builder_module() -> String {
    "agent_team".to_string()
}
fn default_depth() -> String {
    "standard".to_string()
}

impl Default for BuilderLaunch {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            module: default_builder_module(),
            depth: default_depth(),
        }
    }
}

/// How to spawn one MCP worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra env entries for the worker (e.g. `DATABASE_PATH`). Merged over
    /// the filtered process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// HTTP endpoint for worker-to-worker calls, where the worker has one.
    #[serde(default)]
    pub http_url: Option<String>,
}

/// Execution backend selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BackendSection {
    /// Prefer the in-process agent backend.
    #[serde(default)]
    pub enabled: bool,
    /// Fall back to the subprocess backend when the agent CLI is absent.
    #[serde(default)]
    pub fallback_to_cli: bool,
}

/// Compose orchestrator contract inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeSection {
    #[serde(default = "default_compose_binary")]
    pub binary: String,
    /// Static manifest tiers merged under the generated-services manifest:
    /// infrastructure, workers, proxy, pipeline overrides.
    #[serde(default)]
    pub tier_manifests: Vec<PathBuf>,
    /// Health endpoints of the deployed stack, keyed by service name.
    #[serde(default)]
    pub service_health_urls: BTreeMap<String, String>,
}

fn default_compose_binary() -> String {
    "docker".to_string()
}

impl Default for ComposeSection {
    fn default() -> Self {
        Self {
            binary: default_compose_binary(),
            tier_manifests: Vec::new(),
            service_health_urls: BTreeMap::new(),
        }
    }
}

/// Contract / integration tester inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterSection {
    /// External property-testing command (invoked per service).
    #[serde(default = "default_tester_command")]
    pub command: String,
    /// Base URL of the auth service for the preliminary login.
    #[serde(default = "default_auth_url")]
    pub auth_base_url: String,
    /// Per-service base URLs for the integration flow.
    #[serde(default)]
    pub service_base_urls: BTreeMap<String, String>,
}

fn default_tester_command() -> String {
    "schemathesis".to_string()
}
fn default_auth_url() -> String {
    "http://localhost:8001".to_string()
}

impl Default for TesterSection {
    fn default() -> Self {
        Self {
            command: default_tester_command(),
            auth_base_url: default_auth_url(),
            service_base_urls: BTreeMap::new(),
        }
    }
}

/// The process-wide, read-only pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub builder: BuilderLaunch,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub compose: ComposeSection,
    #[serde(default)]
    pub tester: TesterSection,
    /// MCP workers keyed by name (decomposer, contract, codeintel).
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
    /// Infrastructure / worker health endpoints probed in phase 1.
    #[serde(default)]
    pub health_endpoints: BTreeMap<String, String>,
}

impl PipelineConfig {
    /// Load from a TOML file, apply env overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: PipelineConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment layer: a handful of deployment-dependent knobs may be
    /// overridden without editing the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GAUNTLET_MAX_BUDGET_USD")
            && let Ok(parsed) = v.parse::<f64>()
        {
            self.limits.max_budget_usd = parsed;
        }
        if let Ok(v) = std::env::var("GAUNTLET_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GAUNTLET_BUILDER_TIMEOUT_S")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.timeouts.builder_timeout_s = parsed;
        }
    }

    /// The three build roots must exist; limits must be sane.
    pub fn validate(&self) -> Result<()> {
        for (name, root) in self.paths.build_roots() {
            if !root.exists() {
                bail!("build root '{}' does not exist: {}", name, root.display());
            }
        }
        if !self.paths.prd.exists() {
            bail!("PRD file does not exist: {}", self.paths.prd.display());
        }
        if self.limits.max_concurrent_builders == 0 {
            bail!("max_concurrent_builders must be at least 1");
        }
        if self.limits.max_budget_usd <= 0.0 {
            bail!("max_budget_usd must be positive");
        }
        Ok(())
    }

    /// Path of the persistent pipeline state file.
    pub fn state_path(&self) -> PathBuf {
        self.paths.output_dir.join("pipeline_state.json")
    }

    /// Directory where per-service builder workspaces live.
    pub fn services_dir(&self) -> PathBuf {
        self.paths.output_dir.join("services")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.limits.max_concurrent_builders, 3);
        assert_eq!(config.limits.max_fix_passes, 5);
        assert!((config.limits.fix_effectiveness_floor - 0.30).abs() < f64::EPSILON);
        assert!((config.limits.regression_rate_ceiling - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.limits.required_consecutive, 2);
        assert_eq!(config.builder.interpreter, "python3");
    }

    #[test]
    fn first_start_grace_exceeds_warm_start() {
        let timeouts = TimeoutsConfig::default();
        assert!(timeouts.mcp_startup(true) > timeouts.mcp_startup(false));
    }

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [limits]
            max_budget_usd = 25.0
            "#,
        )
        .unwrap();
        assert!((config.limits.max_budget_usd - 25.0).abs() < f64::EPSILON);
        assert_eq!(config.limits.max_fix_passes, 5);
    }

    #[test]
    fn unknown_toml_keys_are_tolerated() {
        let config: Result<PipelineConfig, _> = toml::from_str(
            r#"
            future_knob = true

            [paths]
            prd = "PRD.md"
            "#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn validate_rejects_missing_build_roots() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.paths.prd = dir.path().join("PRD.md");
        std::fs::write(&config.paths.prd, "# PRD").unwrap();
        config.paths.build1 = dir.path().join("nope");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("build root"));
    }

    #[test]
    fn validate_accepts_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        for sub in ["b1", "b2", "b3"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        config.paths.build1 = dir.path().join("b1");
        config.paths.build2 = dir.path().join("b2");
        config.paths.build3 = dir.path().join("b3");
        config.paths.prd = dir.path().join("PRD.md");
        std::fs::write(&config.paths.prd, "# PRD").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn worker_config_parses_env_map() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [workers.decomposer]
            command = "python3"
            args = ["-m", "decomposer_worker"]
            http_url = "http://localhost:9100"

            [workers.decomposer.env]
            DATABASE_PATH = "/data/db.sqlite"
            "#,
        )
        .unwrap();
        let worker = config.workers.get("decomposer").unwrap();
        assert_eq!(worker.args.len(), 2);
        assert_eq!(
            worker.env.get("DATABASE_PATH").map(String::as_str),
            Some("/data/db.sqlite")
        );
    }
}
