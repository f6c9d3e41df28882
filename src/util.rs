//! Small shared helpers: environment sanitization and run identifiers.

use std::collections::BTreeMap;

/// Environment keys that must never reach a child process.
///
/// Applied on every subprocess spawn (builders, fix passes, MCP workers).
/// Both AWS keys are filtered even though only the secret half is strictly
/// credential material.
pub const SECRET_ENV_DENYLIST: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_ACCESS_KEY_ID",
];

/// Filter an environment map through the secret denylist.
pub fn filtered_env<I, K, V>(base: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    base.into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| !SECRET_ENV_DENYLIST.contains(&k.as_str()))
        .collect()
}

/// Filter the current process environment through the secret denylist.
pub fn filtered_process_env() -> BTreeMap<String, String> {
    filtered_env(std::env::vars())
}

/// Generate a short opaque run identifier.
pub fn short_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_env_removes_denylisted_keys() {
        let base = vec![
            ("ANTHROPIC_API_KEY", "sk-secret"),
            ("OPENAI_API_KEY", "sk-other"),
            ("AWS_SECRET_ACCESS_KEY", "aws-secret"),
            ("AWS_ACCESS_KEY_ID", "aws-id"),
            ("PATH", "/usr/bin"),
            ("DATABASE_PATH", "/data/db.sqlite"),
        ];
        let filtered = filtered_env(base);

        for key in SECRET_ENV_DENYLIST {
            assert!(!filtered.contains_key(*key), "{key} leaked through filter");
        }
        assert_eq!(filtered.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(
            filtered.get("DATABASE_PATH").map(String::as_str),
            Some("/data/db.sqlite")
        );
    }

    #[test]
    fn filtered_env_keeps_worker_passthrough_vars() {
        let base = vec![
            ("CONTRACT_ENGINE_URL", "http://localhost:9100"),
            ("CHROMA_PATH", "/data/chroma"),
            ("GRAPH_PATH", "/data/graph"),
        ];
        let filtered = filtered_env(base);
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn short_run_id_is_short_and_unique() {
        let a = short_run_id();
        let b = short_run_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
