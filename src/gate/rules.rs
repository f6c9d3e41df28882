//! Layer 3: code-quality rules over the generated source tree.
//!
//! | Code         | Rule                                             |
//! |--------------|--------------------------------------------------|
//! | SEC-SCAN-001 | No hardcoded secrets                             |
//! | CORS-001     | CORS origin must not be `"*"`                    |
//! | LOG-001      | No `print` statements in service source          |
//! | LOG-002      | Request-logging middleware on every routed app   |
//! | DOCKER-001   | Every Dockerfile declares HEALTHCHECK            |
//! | DOCKER-002   | No `:latest` image tag in FROM                   |

use crate::state::{ContractViolation, Severity};
use glob::Pattern;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

static SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(password|secret|api_key)\s*=\s*["'][^"']+["']"#).expect("secret regex")
});

static PRINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*print\s*\(").expect("print regex"));

static ROUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@\w+\.(get|post|put|patch|delete|route)\s*\(").expect("route regex")
});

/// Glob patterns for paths excluded from the secret and logging scans:
/// tests and fixtures legitimately contain literal credentials and prints.
const EXCLUDED_PATH_GLOBS: &[&str] = &[
    "**/tests/**",
    "**/test/**",
    "**/fixtures/**",
    "**/test_*/**",
    "**/test_*",
    "**/*_test.py",
];

static EXCLUDED_PATHS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    EXCLUDED_PATH_GLOBS
        .iter()
        .map(|p| Pattern::new(p).expect("exclusion glob"))
        .collect()
});

fn is_excluded(path: &Path) -> bool {
    EXCLUDED_PATHS
        .iter()
        .any(|pattern| pattern.matches_path(path))
}

/// Service name = first path component under the scan root.
fn service_of(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Run all six code-quality rules over the generated tree.
pub fn run_code_quality_rules(root: &Path) -> Vec<ContractViolation> {
    let mut violations = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let service = service_of(root, path);
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        if matches!(ext, "py" | "yaml" | "yml" | "json" | "env" | "cfg" | "toml")
            && !is_excluded(path)
        {
            violations.extend(scan_secrets(&content, &service, &rel));
        }

        if matches!(ext, "yaml" | "yml" | "json" | "env" | "cfg" | "toml" | "py") {
            violations.extend(scan_cors(&content, &service, &rel));
        }

        if ext == "py" && !is_excluded(path) {
            violations.extend(scan_prints(&content, &service, &rel));
            violations.extend(scan_logging_middleware(&content, &service, &rel));
        }

        if file_name == "Dockerfile" || file_name.starts_with("Dockerfile.") {
            violations.extend(scan_dockerfile(&content, &service, &rel));
        }
    }

    violations
}

fn scan_secrets(content: &str, service: &str, rel: &str) -> Vec<ContractViolation> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| SECRET_RE.is_match(&line.to_ascii_lowercase()))
        .map(|(idx, line)| {
            ContractViolation::new(
                "SEC-SCAN-001",
                Severity::Critical,
                service,
                format!("hardcoded credential at line {}", idx + 1),
            )
            .with_file_path(rel)
            .with_expected_actual("credential from environment", line.trim().to_string())
        })
        .collect()
}

fn scan_cors(content: &str, service: &str, rel: &str) -> Vec<ContractViolation> {
    let mut violations = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let lowered = line.to_ascii_lowercase();
        let mentions_cors = lowered.contains("cors") || lowered.contains("allow_origins");
        if mentions_cors && (line.contains("\"*\"") || line.contains("'*'") || line.contains(": *"))
        {
            violations.push(
                ContractViolation::new(
                    "CORS-001",
                    Severity::Error,
                    service,
                    format!("wildcard CORS origin at line {}", idx + 1),
                )
                .with_file_path(rel)
                .with_expected_actual("explicit origin allowlist", "\"*\""),
            );
        }
    }
    violations
}

fn scan_prints(content: &str, service: &str, rel: &str) -> Vec<ContractViolation> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| PRINT_RE.is_match(line))
        .map(|(idx, _)| {
            ContractViolation::new(
                "LOG-001",
                Severity::Warning,
                service,
                format!("print statement at line {}", idx + 1),
            )
            .with_file_path(rel)
        })
        .collect()
}

/// A file that declares routes must also attach logging middleware.
fn scan_logging_middleware(content: &str, service: &str, rel: &str) -> Vec<ContractViolation> {
    let has_routes = ROUTE_RE.is_match(content);
    let has_middleware =
        content.contains("add_middleware") || content.contains("@app.middleware");
    if has_routes && !has_middleware {
        vec![
            ContractViolation::new(
                "LOG-002",
                Severity::Warning,
                service,
                "routes declared without request-logging middleware",
            )
            .with_file_path(rel),
        ]
    } else {
        Vec::new()
    }
}

fn scan_dockerfile(content: &str, service: &str, rel: &str) -> Vec<ContractViolation> {
    let mut violations = Vec::new();

    let has_healthcheck = content
        .lines()
        .any(|line| line.trim_start().to_ascii_uppercase().starts_with("HEALTHCHECK"));
    if !has_healthcheck {
        violations.push(
            ContractViolation::new(
                "DOCKER-001",
                Severity::Error,
                service,
                "Dockerfile missing HEALTHCHECK directive",
            )
            .with_file_path(rel),
        );
    }

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.to_ascii_uppercase().starts_with("FROM ") && trimmed.contains(":latest") {
            violations.push(
                ContractViolation::new(
                    "DOCKER-002",
                    Severity::Error,
                    service,
                    format!("unpinned :latest base image at line {}", idx + 1),
                )
                .with_file_path(rel)
                .with_expected_actual("pinned version tag", ":latest"),
            );
        }
    }

    violations
}
