//! Atomic, versioned persistence of `PipelineState`.
//!
//! Saves write the whole state to `<path>.tmp`, fsync, then rename over the
//! real path, so a crash mid-write never corrupts the previous checkpoint.
//! Loads never fail: anything unreadable is the "start fresh" sentinel.

use super::{PipelineState, STATE_SCHEMA_VERSION};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Persist the state atomically at `path`.
///
/// Updates `updated_at`, creates parent directories as needed. On any
/// failure mid-write the `.tmp` file is removed and the original error
/// propagated; the previous checkpoint at `path` is untouched.
pub fn save(state: &mut PipelineState, path: &Path) -> Result<()> {
    state.updated_at = Utc::now();

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    let result = write_tmp(state, &tmp).and_then(|()| {
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} over {}", tmp.display(), path.display()))
    });

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_tmp(state: &PipelineState, tmp: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("serializing pipeline state")?;
    let mut file =
        File::create(tmp).with_context(|| format!("creating temp file {}", tmp.display()))?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("writing temp file {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing temp file {}", tmp.display()))?;
    Ok(())
}

/// Load the state from `path`, or `None` meaning "start fresh".
///
/// The sentinel is returned for exactly these conditions: missing file,
/// invalid JSON, non-object content, absent or mismatched `schema_version`.
/// This function never errors; a caller holding state in memory keeps it.
pub fn load(path: &Path) -> Option<PipelineState> {
    let raw = fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let object = value.as_object()?;

    let version = object.get("schema_version")?.as_u64()?;
    if version != u64::from(STATE_SCHEMA_VERSION) {
        tracing::warn!(
            found = version,
            expected = STATE_SCHEMA_VERSION,
            "state schema mismatch; starting fresh"
        );
        return None;
    }

    // Unknown top-level keys are discarded by the typed parse.
    serde_json::from_value(value).ok()
}
