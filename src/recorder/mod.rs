//! Recorder (spec.md §4.11, optional): bounded-retention PCM capture of a
//! call's inbound/outbound audio for QA review.

use crate::config::RecorderConfig;
use crate::error::{CoreError, Result};
use crate::model::AudioFrame;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Per-call PCM capture file, bounded by `max_bytes_per_call`
/// (spec.md §9 Open Questions: "adopt a concrete cap, e.g. 50 MiB/call").
pub struct CallRecorder {
    path: PathBuf,
    max_bytes: u64,
    file: Mutex<std::fs::File>,
    bytes_written: std::sync::atomic::AtomicU64,
}

impl CallRecorder {
    pub fn open(dir: &Path, call_id: &str, max_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(CoreError::Io)?;
        let path = dir.join(format!("{call_id}.pcm"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(CoreError::Io)?;
        Ok(Self {
            path,
            max_bytes,
            file: Mutex::new(file),
            bytes_written: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Append one frame's PCM payload, silently dropping bytes once the
    /// per-call cap is reached rather than erroring the call.
    pub async fn record(&self, frame: &AudioFrame) -> Result<()> {
        use std::sync::atomic::Ordering;
        let bytes = frame.to_pcm_bytes();
        let written = self.bytes_written.load(Ordering::Relaxed);
        if written >= self.max_bytes {
            return Ok(());
        }
        let remaining = (self.max_bytes - written) as usize;
        let slice = &bytes[..bytes.len().min(remaining)];

        let mut file = self.file.lock().await;
        file.write_all(slice).map_err(CoreError::Io)?;
        self.bytes_written
            .fetch_add(slice.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and finalize the recording (spec.md §4.11 "On call end, flush
    /// and finalize").
    pub async fn finalize(&self) -> Result<()> {
        self.file.lock().await.flush().map_err(CoreError::Io)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether the recorder is permitted to run given the operator's backend
/// configuration (spec.md §4.11 "MUST NOT be enabled ... without explicit
/// operator opt-in"). `uses_external_backend` is true whenever this call's
/// active backend is the Provider. `allow_external_backend` is the
/// process-wide opt-in gate (`CoreConfig::allow_external_backend`).
#[must_use]
pub fn recording_allowed(
    config: &RecorderConfig,
    uses_external_backend: bool,
    allow_external_backend: bool,
) -> bool {
    config.enabled && (!uses_external_backend || allow_external_backend)
}

/// Delete recordings older than `retention_hours`. Intended to run on a
/// periodic `tokio::time::interval` janitor task.
pub fn run_janitor_sweep(dir: &Path, retention_hours: u64) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_hours * 3600))
        .unwrap_or(UNIX_EPOCH);

    let mut deleted = 0u64;
    for entry in std::fs::read_dir(dir).map_err(CoreError::Io)? {
        let entry = entry.map_err(CoreError::Io)?;
        let metadata = entry.metadata().map_err(CoreError::Io)?;
        let modified = metadata.modified().unwrap_or(SystemTime::now());
        if modified < cutoff {
            std::fs::remove_file(entry.path()).map_err(CoreError::Io)?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_bytes_do_not_exceed_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder = CallRecorder::open(dir.path(), "call-1", 100).expect("open");
        for seq in 0..5 {
            recorder
                .record(&AudioFrame::silence(seq, 0))
                .await
                .expect("record");
        }
        recorder.finalize().await.expect("finalize");
        let on_disk = std::fs::metadata(recorder.path()).expect("metadata").len();
        assert!(on_disk <= 100);
    }

    #[test]
    fn janitor_deletes_only_stale_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fresh = dir.path().join("fresh.pcm");
        std::fs::write(&fresh, b"data").expect("write");

        let deleted = run_janitor_sweep(dir.path(), 24).expect("sweep");
        assert_eq!(deleted, 0);
        assert!(fresh.exists());
    }

    #[test]
    fn recording_requires_opt_in_when_external_backend_is_active() {
        let config = RecorderConfig {
            enabled: true,
            dir: PathBuf::from("recordings"),
            retention_hours: 24,
            max_bytes_per_call: 1024,
        };
        assert!(!recording_allowed(&config, true, false));
        assert!(recording_allowed(&config, true, true));
        assert!(recording_allowed(&config, false, false));
    }
}
