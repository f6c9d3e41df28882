//! Integration tests for Gauntlet
//!
//! These tests drive the CLI end-to-end: a fake builder stands in for the
//! opaque external builder program, and the compose binary is absent on
//! purpose so the deploy phase degrades into a finding while the rest of
//! the pipeline still settles a verdict.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a gauntlet Command
fn gauntlet() -> Command {
    cargo_bin_cmd!("gauntlet")
}

/// Lay out a runnable sandbox: PRD, build roots, a fake builder script,
/// and a gauntlet.toml wired to all of it.
fn create_sandbox() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    fs::write(
        root.join("PRD.md"),
        "# Shop Platform\n\n\
         ### Service: auth\n\
         ### Service: order\n\
         ### Service: notification\n\n\
         Users register, log in, place orders, and receive notifications.\n",
    )
    .unwrap();

    for sub in ["build1", "build2", "build3"] {
        fs::create_dir_all(root.join(sub)).unwrap();
    }
    fs::write(
        root.join("build1/auth.yaml"),
        "openapi: 3.0.0\ninfo:\n  title: Auth API\npaths: {}\n",
    )
    .unwrap();

    write_script(
        &root.join("builder.sh"),
        r#"
cwd=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cwd) cwd="$2"; shift 2 ;;
    *) shift ;;
  esac
done
mkdir -p "$cwd/.agent-team"
cat > "$cwd/.agent-team/STATE.json" <<EOF
{"summary": {"success": true, "test_passed": 18, "test_total": 20, "convergence_ratio": 0.9},
 "total_cost": 0.25, "health": "green", "completed_phases": ["a","b","c","d","e"]}
EOF
"#,
    );

    fs::write(
        root.join("gauntlet.toml"),
        format!(
            r#"
[paths]
prd = "{root}/PRD.md"
output_dir = "{root}/out"
build1 = "{root}/build1"
build2 = "{root}/build2"
build3 = "{root}/build3"

[builder]
interpreter = "sh"
module = "{root}/builder.sh"

[timeouts]
health_poll_timeout_s = 1
builder_timeout_s = 30
fix_builder_timeout_s = 30

[compose]
binary = "definitely-not-docker"
"#,
            root = root.display()
        ),
    )
    .unwrap();

    dir
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_gauntlet_help() {
        gauntlet().arg("--help").assert().success();
    }

    #[test]
    fn test_gauntlet_version() {
        gauntlet().arg("--version").assert().success();
    }

    #[test]
    fn test_missing_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        gauntlet()
            .current_dir(dir.path())
            .args(["run"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("loading config"));
    }

    #[test]
    fn test_report_without_state_is_fatal() {
        let dir = create_sandbox();
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "report"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("no usable state"));
    }
}

// =============================================================================
// Full pipeline runs
// =============================================================================

mod pipeline_runs {
    use super::*;

    #[test]
    fn test_run_settles_a_verdict_without_docker() {
        let dir = create_sandbox();

        // The compose binary is fake, so deploy fails; that is a finding,
        // not a fatal error. The run finishes and reports not-good-enough.
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "run"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Pipeline finished"));

        let state_raw =
            fs::read_to_string(dir.path().join("out/pipeline_state.json")).unwrap();
        let state: serde_json::Value = serde_json::from_str(&state_raw).unwrap();
        assert_eq!(state["schema_version"], 1);

        let completed: Vec<&str> = state["completed_phases"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p.as_str())
            .collect();
        assert!(completed.contains(&"health_check"));
        assert!(completed.contains(&"build"));
        assert!(completed.contains(&"quality_gate"));
        // Deploy failed against the fake compose binary.
        assert!(!completed.contains(&"deploy_and_test"));

        // All three builders ran and reported through STATE.json.
        let builders = state["builder_results"].as_object().unwrap();
        assert_eq!(builders.len(), 3);
        assert_eq!(builders["auth"]["test_passed"], 18);
    }

    #[test]
    fn test_run_then_report_renders_markdown() {
        let dir = create_sandbox();
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "run"])
            .assert()
            .code(1);

        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "report"])
            .assert()
            .success()
            .stdout(predicate::str::contains("# Gauntlet Audit Report"))
            .stdout(predicate::str::contains("Traffic light"));
    }

    #[test]
    fn test_report_to_file() {
        let dir = create_sandbox();
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "run"])
            .assert()
            .code(1);

        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "report", "--output", "audit.md"])
            .assert()
            .success();
        let report = fs::read_to_string(dir.path().join("audit.md")).unwrap();
        assert!(report.contains("## Builders"));
    }

    #[test]
    fn test_resume_without_checkpoint_is_fatal() {
        let dir = create_sandbox();
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "resume"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("Cannot resume"));
    }

    #[test]
    fn test_resume_preserves_completed_prefix() {
        let dir = create_sandbox();
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "run"])
            .assert()
            .code(1);

        let before: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("out/pipeline_state.json")).unwrap(),
        )
        .unwrap();
        let prefix: Vec<String> = before["completed_phases"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect();
        let run_id = before["run_id"].as_str().unwrap().to_string();

        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "resume"])
            .assert()
            .code(1);

        let after: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("out/pipeline_state.json")).unwrap(),
        )
        .unwrap();
        // Same run, and the completed sequence still begins with the
        // checkpoint's phases in the same order.
        assert_eq!(after["run_id"].as_str().unwrap(), run_id);
        let resumed: Vec<String> = after["completed_phases"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect();
        assert!(resumed.starts_with(&prefix));
    }

    #[test]
    fn test_corrupt_state_file_means_fresh_run_not_crash() {
        let dir = create_sandbox();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(
            dir.path().join("out/pipeline_state.json"),
            "{ this is not json",
        )
        .unwrap();

        // `run` treats the corrupt checkpoint as fresh-start.
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "run"])
            .assert()
            .code(1);

        let state: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("out/pipeline_state.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(state["schema_version"], 1);
    }

    #[test]
    fn test_timed_out_builder_leaves_no_orphans_and_fails_service() {
        let dir = create_sandbox();
        // Replace the builder with one that would run far past the ceiling.
        write_script(&dir.path().join("builder.sh"), "sleep 100\n");
        let config = fs::read_to_string(dir.path().join("gauntlet.toml")).unwrap();
        fs::write(
            dir.path().join("gauntlet.toml"),
            config
                .replace("builder_timeout_s = 30", "builder_timeout_s = 1")
                .replace("fix_builder_timeout_s = 30", "fix_builder_timeout_s = 1"),
        )
        .unwrap();

        let started = std::time::Instant::now();
        gauntlet()
            .current_dir(dir.path())
            .args(["--config", "gauntlet.toml", "run"])
            .assert()
            .code(1);
        // Three services at 1s ceiling plus kill grace; nowhere near 100s.
        assert!(started.elapsed() < std::time::Duration::from_secs(60));

        let state: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("out/pipeline_state.json")).unwrap(),
        )
        .unwrap();
        let builders = state["builder_results"].as_object().unwrap();
        for (_, result) in builders {
            assert_eq!(result["success"], false);
            assert_eq!(result["exit_code"], -1);
        }
    }
}
