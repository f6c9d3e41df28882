//! Builder runner: bounded-parallel subprocess execution with environment
//! sanitization and kill-on-timeout.
//!
//! The builder program is opaque; its contract is a working directory with a
//! generated `config.yaml` (and optionally `FIX_INSTRUCTIONS.md`) in, and
//! `.agent-team/STATE.json` out. Failures of any kind fold into
//! `BuilderResult`; this module never errors on a builder's behalf.

pub mod instructions;
pub mod state_json;

pub use instructions::{
    generate_builder_config, parse_builder_config, parse_fix_instructions, write_fix_instructions,
};
pub use state_json::{BuilderStateSummary, parse_builder_state};

use crate::config::BuilderLaunch;
use crate::state::{BuilderResult, ContractViolation};
use crate::util::{filtered_env, filtered_process_env};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Grace period between the kill signal and the hard reap on timeout.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// One builder job: a distinct working directory and a depth setting.
/// Parallel builders must not share directories; results are keyed by the
/// directory's final component.
#[derive(Debug, Clone)]
pub struct BuilderJob {
    pub cwd: PathBuf,
    pub depth: String,
}

impl BuilderJob {
    pub fn new(cwd: impl Into<PathBuf>, depth: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            depth: depth.into(),
        }
    }

    fn service_name(&self) -> String {
        self.cwd
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Run one builder to completion (or kill it at the wall-clock ceiling).
///
/// The child environment starts from `env_override` when given, otherwise
/// the process environment, and is always filtered through the secret
/// denylist. On timeout the child is signaled, given a short grace period,
/// and reaped before this function returns; no orphans on any exit path.
pub async fn invoke_builder(
    launch: &BuilderLaunch,
    cwd: &Path,
    depth: &str,
    timeout: Duration,
    env_override: Option<&BTreeMap<String, String>>,
) -> BuilderResult {
    let service_name = cwd
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let env = match env_override {
        Some(map) => filtered_env(map.clone()),
        None => filtered_process_env(),
    };

    let started = Instant::now();
    let spawn = Command::new(&launch.interpreter)
        .arg("-m")
        .arg(&launch.module)
        .arg("--cwd")
        .arg(cwd)
        .arg("--depth")
        .arg(depth)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawn {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(service = %service_name, error = %err, "failed to spawn builder");
            let mut result = BuilderResult::failed(&service_name);
            result.stderr = format!("spawn failed: {err}");
            return result;
        }
    };

    // Drain stdout/stderr concurrently so a chatty builder cannot fill the
    // pipe buffers and deadlock against wait().
    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(err)) => {
            tracing::error!(service = %service_name, error = %err, "failed waiting for builder");
            (-1, false)
        }
        Err(_) => {
            tracing::warn!(service = %service_name, timeout_s = timeout.as_secs(),
                "builder hit wall-clock ceiling; killing");
            let _ = child.start_kill();
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
            (-1, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let duration_s = started.elapsed().as_secs_f64();

    let summary = state_json::parse_builder_state(cwd);
    BuilderResult {
        service_name,
        success: summary.success && !timed_out,
        test_passed: summary.test_passed,
        test_total: summary.test_total,
        convergence_ratio: summary.convergence_ratio,
        total_cost: summary.total_cost,
        health: summary.health,
        completed_phases: summary.completed_phases,
        exit_code,
        stdout,
        stderr,
        duration_s,
    }
}

fn spawn_reader<R>(source: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut source) = source else {
            return String::new();
        };
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = source.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run builders with bounded parallelism.
///
/// A semaphore of `max_concurrent` permits gates the fan-out. Results come
/// back in input order regardless of completion order, and a failed or
/// timed-out builder never aborts its peers.
pub async fn run_parallel_builders(
    launch: &BuilderLaunch,
    jobs: &[BuilderJob],
    max_concurrent: usize,
    timeout: Duration,
) -> Vec<BuilderResult> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    let handles: Vec<_> = jobs
        .iter()
        .cloned()
        .map(|job| {
            let semaphore = Arc::clone(&semaphore);
            let launch = launch.clone();
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("builder semaphore never closed");
                invoke_builder(&launch, &job.cwd, &job.depth, timeout, None).await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (handle, job) in handles.into_iter().zip(jobs) {
        match handle.await {
            Ok(result) => results.push(result),
            // A panicked task still yields a positional failure record.
            Err(join_err) => {
                tracing::error!(service = %job.service_name(), error = %join_err,
                    "builder task panicked");
                results.push(BuilderResult::failed(job.service_name()));
            }
        }
    }
    results
}

/// Render fix instructions into the builder workspace and re-run the builder
/// in quick mode under the constrained timeout.
pub async fn feed_violations_to_builder(
    launch: &BuilderLaunch,
    cwd: &Path,
    violations: &[ContractViolation],
    timeout: Duration,
) -> BuilderResult {
    if let Err(err) = instructions::write_fix_instructions(cwd, violations) {
        tracing::error!(cwd = %cwd.display(), error = %err, "failed writing fix instructions");
        let mut result = BuilderResult::failed(
            cwd.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        result.stderr = format!("fix instructions write failed: {err}");
        return result;
    }
    invoke_builder(launch, cwd, "quick", timeout, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HealthColor;
    use tempfile::tempdir;

    /// A fake builder: a shell script invoked as `sh -m <script> --cwd ...`.
    fn fake_builder(dir: &Path, body: &str) -> BuilderLaunch {
        let script = dir.join("builder.sh");
        std::fs::write(&script, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }
        BuilderLaunch {
            interpreter: "sh".to_string(),
            module: script.to_string_lossy().to_string(),
            depth: "standard".to_string(),
        }
    }

    /// Script body that writes a successful STATE.json into the --cwd arg.
    const HAPPY_BUILDER: &str = r#"
cwd=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cwd) cwd="$2"; shift 2 ;;
    --depth) depth="$2"; shift 2 ;;
    *) shift ;;
  esac
done
mkdir -p "$cwd/.agent-team"
cat > "$cwd/.agent-team/STATE.json" <<EOF
{"summary": {"success": true, "test_passed": 9, "test_total": 10, "convergence_ratio": 0.9},
 "total_cost": 1.25, "health": "green", "completed_phases": ["scaffold", "implement"]}
EOF
echo "built $depth"
"#;

    #[tokio::test]
    async fn invoke_builder_merges_process_and_state_fields() {
        let dir = tempdir().unwrap();
        let launch = fake_builder(dir.path(), HAPPY_BUILDER);
        let workspace = dir.path().join("auth");
        std::fs::create_dir_all(&workspace).unwrap();

        let result = invoke_builder(
            &launch,
            &workspace,
            "standard",
            Duration::from_secs(30),
            None,
        )
        .await;

        assert_eq!(result.service_name, "auth");
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.test_passed, 9);
        assert_eq!(result.test_total, 10);
        assert_eq!(result.health, HealthColor::Green);
        assert!((result.total_cost - 1.25).abs() < 1e-9);
        assert!(result.stdout.contains("built standard"));
        assert!(result.duration_s > 0.0);
    }

    #[tokio::test]
    async fn timeout_kills_and_reaps_within_grace() {
        let dir = tempdir().unwrap();
        let launch = fake_builder(dir.path(), "sleep 100\n");
        let workspace = dir.path().join("slow");
        std::fs::create_dir_all(&workspace).unwrap();

        let started = std::time::Instant::now();
        let result = invoke_builder(
            &launch,
            &workspace,
            "standard",
            Duration::from_millis(300),
            None,
        )
        .await;

        // Returns within timeout + grace, not the builder's 100s.
        assert!(started.elapsed() < Duration::from_secs(6));
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn secrets_are_filtered_from_child_env() {
        let dir = tempdir().unwrap();
        // Dump the child environment into the workspace.
        let launch = fake_builder(
            dir.path(),
            r#"
cwd=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cwd) cwd="$2"; shift 2 ;;
    *) shift ;;
  esac
done
mkdir -p "$cwd"
env > "$cwd/child_env.txt"
"#,
        );
        let workspace = dir.path().join("envcheck");
        std::fs::create_dir_all(&workspace).unwrap();

        let mut parent_env = filtered_process_env();
        parent_env.insert("ANTHROPIC_API_KEY".to_string(), "sk-should-vanish".to_string());
        parent_env.insert("AWS_ACCESS_KEY_ID".to_string(), "AKIA-should-vanish".to_string());
        parent_env.insert("DATABASE_PATH".to_string(), "/data/db.sqlite".to_string());

        let result = invoke_builder(
            &launch,
            &workspace,
            "standard",
            Duration::from_secs(30),
            Some(&parent_env),
        )
        .await;
        assert_eq!(result.exit_code, 0);

        let child_env = std::fs::read_to_string(workspace.join("child_env.txt")).unwrap();
        assert!(!child_env.contains("ANTHROPIC_API_KEY"));
        assert!(!child_env.contains("AWS_ACCESS_KEY_ID"));
        assert!(child_env.contains("DATABASE_PATH=/data/db.sqlite"));
    }

    #[tokio::test]
    async fn spawn_failure_folds_into_result() {
        let launch = BuilderLaunch {
            interpreter: "/nonexistent/interpreter".to_string(),
            module: "agent_team".to_string(),
            depth: "standard".to_string(),
        };
        let dir = tempdir().unwrap();
        let workspace = dir.path().join("ghost");
        std::fs::create_dir_all(&workspace).unwrap();

        let result =
            invoke_builder(&launch, &workspace, "standard", Duration::from_secs(1), None).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("spawn failed"));
    }

    #[tokio::test]
    async fn builder_crash_without_state_json_is_zero_filled() {
        let dir = tempdir().unwrap();
        let launch = fake_builder(dir.path(), "echo doomed >&2\nexit 7\n");
        let workspace = dir.path().join("crash");
        std::fs::create_dir_all(&workspace).unwrap();

        let result =
            invoke_builder(&launch, &workspace, "standard", Duration::from_secs(30), None).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.test_total, 0);
        assert!(result.stderr.contains("doomed"));
    }

    #[tokio::test]
    async fn parallel_results_preserve_input_order() {
        let dir = tempdir().unwrap();
        // Sleep inversely to input order so completion order is reversed.
        let launch = fake_builder(
            dir.path(),
            r#"
cwd=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cwd) cwd="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$cwd" in
  *auth) sleep 1 ;;
  *order) sleep 0.5 ;;
  *) ;;
esac
mkdir -p "$cwd/.agent-team"
printf '{"summary": {"success": true}}' > "$cwd/.agent-team/STATE.json"
"#,
        );

        let jobs: Vec<BuilderJob> = ["auth", "order", "notification"]
            .iter()
            .map(|name| {
                let cwd = dir.path().join(name);
                std::fs::create_dir_all(&cwd).unwrap();
                BuilderJob::new(cwd, "standard")
            })
            .collect();

        let results = run_parallel_builders(&launch, &jobs, 3, Duration::from_secs(30)).await;
        let names: Vec<&str> = results.iter().map(|r| r.service_name.as_str()).collect();
        assert_eq!(names, vec!["auth", "order", "notification"]);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn one_failing_builder_does_not_abort_peers() {
        let dir = tempdir().unwrap();
        let launch = fake_builder(
            dir.path(),
            r#"
cwd=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cwd) cwd="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$cwd" in
  *bad) exit 3 ;;
esac
mkdir -p "$cwd/.agent-team"
printf '{"summary": {"success": true}}' > "$cwd/.agent-team/STATE.json"
"#,
        );

        let jobs: Vec<BuilderJob> = ["good", "bad", "fine"]
            .iter()
            .map(|name| {
                let cwd = dir.path().join(name);
                std::fs::create_dir_all(&cwd).unwrap();
                BuilderJob::new(cwd, "standard")
            })
            .collect();

        let results = run_parallel_builders(&launch, &jobs, 2, Duration::from_secs(30)).await;
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].exit_code, 3);
        assert!(results[2].success);
    }

    #[tokio::test]
    async fn semaphore_bounds_concurrency() {
        let dir = tempdir().unwrap();
        // Each builder records its start, then holds the permit briefly.
        let launch = fake_builder(
            dir.path(),
            r#"
cwd=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cwd) cwd="$2"; shift 2 ;;
    *) shift ;;
  esac
done
mkdir -p "$cwd/.agent-team"
date +%s.%N > "$cwd/started_at"
sleep 0.4
printf '{"summary": {"success": true}}' > "$cwd/.agent-team/STATE.json"
"#,
        );

        let jobs: Vec<BuilderJob> = (0..4)
            .map(|i| {
                let cwd = dir.path().join(format!("svc{i}"));
                std::fs::create_dir_all(&cwd).unwrap();
                BuilderJob::new(cwd, "standard")
            })
            .collect();

        let started = std::time::Instant::now();
        let results = run_parallel_builders(&launch, &jobs, 1, Duration::from_secs(30)).await;
        // With a single permit the four 0.4s builders must serialize.
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn feed_violations_writes_instructions_and_runs_quick() {
        use crate::state::Severity;
        let dir = tempdir().unwrap();
        // Assert quick depth and the instructions file from inside the builder.
        let launch = fake_builder(
            dir.path(),
            r#"
cwd=""
depth=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cwd) cwd="$2"; shift 2 ;;
    --depth) depth="$2"; shift 2 ;;
    *) shift ;;
  esac
done
mkdir -p "$cwd/.agent-team"
if [ "$depth" = "quick" ] && [ -f "$cwd/FIX_INSTRUCTIONS.md" ]; then
  printf '{"summary": {"success": true}}' > "$cwd/.agent-team/STATE.json"
else
  printf '{"summary": {"success": false}}' > "$cwd/.agent-team/STATE.json"
fi
"#,
        );
        let workspace = dir.path().join("order");
        std::fs::create_dir_all(&workspace).unwrap();

        let violations = vec![ContractViolation::new(
            "CORS-001",
            Severity::Error,
            "order",
            "wildcard origin",
        )];
        let result =
            feed_violations_to_builder(&launch, &workspace, &violations, Duration::from_secs(30))
                .await;
        assert!(result.success);
        assert!(workspace.join(instructions::FIX_INSTRUCTIONS_FILENAME).exists());
    }
}
