//! Filesystem fallbacks for unreachable workers.
//!
//! When a worker never initializes (spawn failure, missing binary), each
//! client surface has a local approximation that replicates the minimal
//! contract from filesystem scans. Every fallback result carries a
//! `fallback: true` marker so downstream consumers know the data is
//! approximate.

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// Service-name keywords swept when a PRD has no explicit service headers.
const SERVICE_KEYWORDS: &[&str] = &[
    "auth",
    "user",
    "order",
    "payment",
    "notification",
    "inventory",
    "catalog",
    "billing",
];

/// Decomposer fallback: derive a minimal service map from PRD text.
///
/// Explicit `### Service: <name>` (or `## Service:`) headers win; otherwise
/// the text is swept for well-known service keywords. The result mirrors
/// the worker's `get_service_map` shape.
pub fn fallback_service_map(prd_text: &str) -> Value {
    let mut names: Vec<String> = Vec::new();

    for line in prd_text.lines() {
        let trimmed = line.trim();
        let header = trimmed
            .strip_prefix("### Service:")
            .or_else(|| trimmed.strip_prefix("## Service:"));
        if let Some(rest) = header {
            let name = rest.trim().to_ascii_lowercase().replace(' ', "-");
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
    }

    if names.is_empty() {
        let lowered = prd_text.to_ascii_lowercase();
        for keyword in SERVICE_KEYWORDS {
            if lowered.contains(keyword) {
                names.push((*keyword).to_string());
            }
        }
    }

    let services: Vec<Value> = names
        .iter()
        .map(|name| json!({ "name": name, "contracts": [] }))
        .collect();

    json!({ "services": services, "fallback": true })
}

/// Contract fallback: walk `project_root` for `*.json`, `*.yaml`, `*.yml`,
/// attempt a structural parse of each, and return the parseable ones keyed
/// by file path.
pub fn scan_api_contracts(project_root: &Path) -> Value {
    let mut contracts: Vec<Value> = Vec::new();

    for entry in WalkDir::new(project_root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let format = match ext {
            "json" => "json",
            "yaml" | "yml" => "yaml",
            _ => continue,
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            continue;
        };
        let parsed: Option<Value> = match format {
            "json" => serde_json::from_str(&raw).ok(),
            _ => serde_yaml::from_str(&raw).ok(),
        };
        let Some(document) = parsed else {
            continue;
        };

        let title = document
            .get("info")
            .and_then(|i| i.get("title"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        contracts.push(json!({
            "file_path": path.to_string_lossy(),
            "format": format,
            "title": title,
            "top_level_keys": top_level_keys(&document),
        }));
    }

    contracts.sort_by(|a, b| {
        a["file_path"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["file_path"].as_str().unwrap_or_default())
    });

    json!({ "contracts": contracts, "fallback": true })
}

fn top_level_keys(document: &Value) -> Vec<String> {
    document
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default()
}

/// Code-intel fallback: walk the tree, classify files by extension into a
/// language set, and return counts plus per-file metadata.
pub fn generate_codebase_map(project_root: &Path) -> Value {
    let mut languages: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut files: Vec<Value> = Vec::new();

    for entry in WalkDir::new(project_root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let Some(language) = classify_language(path) else {
            continue;
        };
        *languages.entry(language).or_insert(0) += 1;
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        files.push(json!({
            "path": path.to_string_lossy(),
            "language": language,
            "size_bytes": size,
        }));
    }

    files.sort_by(|a, b| {
        a["path"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["path"].as_str().unwrap_or_default())
    });

    json!({
        "languages": languages,
        "file_count": files.len(),
        "files": files,
        "fallback": true,
    })
}

fn classify_language(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "py" => Some("python"),
        "rs" => Some("rust"),
        "go" => Some("go"),
        "js" | "mjs" => Some("javascript"),
        "ts" => Some("typescript"),
        "java" => Some("java"),
        "rb" => Some("ruby"),
        "sql" => Some("sql"),
        "sh" => Some("shell"),
        "yaml" | "yml" => Some("yaml"),
        "json" => Some("json"),
        "toml" => Some("toml"),
        "md" => Some("markdown"),
        _ => None,
    }
}
