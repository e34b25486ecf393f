//! Atomic write-temp-then-rename persistence shared by the Bandit and Deploy
//! Gate state stores, and the append-only Feedback Store ledger.

use crate::error::{CoreError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Read and deserialize a JSON state file. Missing files return `Ok(None)`;
/// malformed files are logged and treated as absent rather than failing
/// startup outright.
pub fn read_json_state<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CoreError::Persistence(format!(
                "failed to read state file {}: {e}",
                path.display()
            )));
        }
    };
    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(
                "ignoring malformed state file at {}: {e}",
                path.display()
            );
            Ok(None)
        }
    }
}

/// Serialize and atomically persist a JSON state file: write to a sibling
/// `.tmp` path, fsync it, then rename over the target so readers never
/// observe a partial write (spec.md §4.3 "write to a temp path in the same
/// directory, fsync, then rename").
pub fn write_json_state<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use std::io::Write as _;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Persistence(format!(
                    "failed to create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| CoreError::Persistence(format!("failed to serialize state: {e}")))?;
    {
        let mut file = std::fs::File::create(&tmp_path).map_err(|e| {
            CoreError::Persistence(format!(
                "failed to open state temp file {}: {e}",
                tmp_path.display()
            ))
        })?;
        file.write_all(&json).map_err(|e| {
            CoreError::Persistence(format!(
                "failed to write state temp file {}: {e}",
                tmp_path.display()
            ))
        })?;
        file.sync_all().map_err(|e| {
            CoreError::Persistence(format!(
                "failed to fsync state temp file {}: {e}",
                tmp_path.display()
            ))
        })?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| {
        CoreError::Persistence(format!(
            "failed to finalize state file {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

/// Append one line to a ledger file, creating it (and parent dirs) if
/// absent. Used by the Feedback Store's JSONL ledger.
pub fn append_jsonl_line(path: &Path, line: &str) -> Result<()> {
    use std::io::Write as _;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Persistence(format!(
                    "failed to create ledger directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            CoreError::Persistence(format!("failed to open ledger {}: {e}", path.display()))
        })?;
    writeln!(file, "{line}")
        .map_err(|e| CoreError::Persistence(format!("failed to append to ledger: {e}")))?;
    file.sync_data().map_err(|e| {
        CoreError::Persistence(format!("failed to fsync ledger {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn missing_state_file_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nope.json");
        let result: Option<Sample> = read_json_state(&path).expect("read");
        assert_eq!(result, None);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_json_state(&path, &Sample { n: 42 }).expect("write");
        let back: Option<Sample> = read_json_state(&path).expect("read");
        assert_eq!(back, Some(Sample { n: 42 }));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn malformed_state_file_is_treated_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").expect("write raw");
        let result: Option<Sample> = read_json_state(&path).expect("read");
        assert_eq!(result, None);
    }

    #[test]
    fn append_jsonl_creates_file_and_appends_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.jsonl");
        append_jsonl_line(&path, "{\"n\":1}").expect("append");
        append_jsonl_line(&path, "{\"n\":2}").expect("append");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), 2);
    }
}
