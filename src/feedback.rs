//! Feedback Store (spec.md §4.2): an append-only log of anonymized
//! Feedback Events, keyed by `(ts_hour, call_id_hash)`.

use crate::error::{CoreError, Result};
use crate::persist::append_jsonl_line;
use crate::reward::RewardSignals;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A persisted, anonymized call outcome (spec.md §3 "Feedback Event"). Raw
/// call-id, raw timestamp, and profile identifier never reach this type —
/// [`FeedbackEvent::from_raw`] hashes/truncates them first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub call_id_hash: String,
    pub ts_hour: i64,
    pub profile: String,
    pub policy_variant_id: String,
    pub signals: RewardSignals,
}

impl FeedbackEvent {
    /// Build an anonymized event from raw call identity plus signals. The
    /// store refuses to persist anything that skips this constructor by
    /// validating shape again in [`FeedbackStore::append`].
    #[must_use]
    pub fn from_raw(
        raw_call_id: &str,
        unix_ts_secs: i64,
        profile: &str,
        policy_variant_id: &str,
        signals: RewardSignals,
    ) -> Self {
        Self {
            call_id_hash: hash_identifier(raw_call_id),
            ts_hour: unix_ts_secs.div_euclid(3600),
            profile: hash_identifier(profile),
            policy_variant_id: policy_variant_id.to_owned(),
            signals,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.call_id_hash.is_empty() {
            return Err(CoreError::Validation(
                "feedback event missing call_id_hash".to_owned(),
            ));
        }
        if self.policy_variant_id.is_empty() {
            return Err(CoreError::Validation(
                "feedback event missing policy_variant_id".to_owned(),
            ));
        }
        if let Some(rating) = self.signals.user_rating {
            if !(1..=5).contains(&rating) {
                return Err(CoreError::Validation(format!(
                    "feedback event user_rating out of range: {rating}"
                )));
            }
        }
        Ok(())
    }
}

/// Truncated SHA-256 digest used to anonymize call ids and profile ids
/// before they reach disk.
#[must_use]
pub fn hash_identifier(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..12])
}

/// Summary statistics over a window of feedback events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub event_count: u64,
    pub mean_duration_sec: f64,
    pub resolution_rate: f64,
}

/// Append-only JSONL-backed feedback log.
pub struct FeedbackStore {
    path: PathBuf,
}

impl FeedbackStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one event. Writes are durable (explicit `fsync` in
    /// [`crate::persist::append_jsonl_line`]) before this returns. Events
    /// missing required fields are rejected and never reach disk.
    pub fn append(&self, event: &FeedbackEvent) -> Result<()> {
        event.validate()?;
        let line = serde_json::to_string(event)
            .map_err(|e| CoreError::Persistence(format!("failed to serialize event: {e}")))?;
        append_jsonl_line(&self.path, &line)
    }

    /// Compute summary statistics over events with `ts_hour * 3600 >= since_ts`.
    pub fn stats(&self, since_ts: i64) -> Result<FeedbackStats> {
        let events = self.read_all()?;
        let since_hour = since_ts.div_euclid(3600);
        let relevant: Vec<&FeedbackEvent> =
            events.iter().filter(|e| e.ts_hour >= since_hour).collect();

        if relevant.is_empty() {
            return Ok(FeedbackStats::default());
        }
        let count = relevant.len() as u64;
        let mean_duration =
            relevant.iter().map(|e| e.signals.duration_sec).sum::<f64>() / relevant.len() as f64;
        let resolved = relevant.iter().filter(|e| e.signals.resolution).count();
        Ok(FeedbackStats {
            event_count: count,
            mean_duration_sec: mean_duration,
            resolution_rate: resolved as f64 / relevant.len() as f64,
        })
    }

    /// Rewrite the ledger keeping only events with `ts_hour * 3600 >= older_than_ts`.
    pub fn cleanup(&self, older_than_ts: i64) -> Result<u64> {
        let events = self.read_all()?;
        let cutoff_hour = older_than_ts.div_euclid(3600);
        let (keep, drop): (Vec<_>, Vec<_>) =
            events.into_iter().partition(|e| e.ts_hour >= cutoff_hour);

        let mut body = String::new();
        for event in &keep {
            let line = serde_json::to_string(event)
                .map_err(|e| CoreError::Persistence(format!("failed to serialize event: {e}")))?;
            body.push_str(&line);
            body.push('\n');
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp_path, body)
            .map_err(|e| CoreError::Persistence(format!("failed to rewrite ledger: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| CoreError::Persistence(format!("failed to finalize ledger: {e}")))?;
        Ok(drop.len() as u64)
    }

    fn read_all(&self) -> Result<Vec<FeedbackEvent>> {
        read_events(&self.path)
    }
}

fn read_events(path: &Path) -> Result<Vec<FeedbackEvent>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CoreError::Persistence(format!(
                "failed to read feedback ledger: {e}"
            )))
        }
    };
    let mut events = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedbackEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!("skipping malformed feedback ledger line: {e}"),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(variant: &str) -> FeedbackEvent {
        FeedbackEvent::from_raw(
            "call-123",
            1_700_000_000,
            "profile-a",
            variant,
            RewardSignals {
                resolution: true,
                user_rating: Some(5),
                barge_in_count: 0,
                repeats: 0,
                handover: false,
                duration_sec: 90.0,
            },
        )
    }

    #[test]
    fn raw_call_id_never_appears_in_stored_event() {
        let event = sample_event("v0");
        assert_ne!(event.call_id_hash, "call-123");
        assert_ne!(event.profile, "profile-a");
    }

    #[test]
    fn append_then_stats_reflects_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feedback.jsonl");
        let store = FeedbackStore::new(path);
        store.append(&sample_event("v0")).expect("append");
        let stats = store.stats(0).expect("stats");
        assert_eq!(stats.event_count, 1);
        assert!((stats.resolution_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn event_missing_policy_variant_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feedback.jsonl");
        let store = FeedbackStore::new(path);
        let mut event = sample_event("v0");
        event.policy_variant_id.clear();
        assert!(store.append(&event).is_err());
    }

    #[test]
    fn cleanup_drops_events_older_than_cutoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feedback.jsonl");
        let store = FeedbackStore::new(path);
        store.append(&sample_event("v0")).expect("append");

        let dropped = store.cleanup(2_000_000_000).expect("cleanup");
        assert_eq!(dropped, 1);
        let stats = store.stats(0).expect("stats");
        assert_eq!(stats.event_count, 0);
    }

    #[test]
    fn out_of_range_rating_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feedback.jsonl");
        let store = FeedbackStore::new(path);
        let mut event = sample_event("v0");
        event.signals.user_rating = Some(9);
        assert!(store.append(&event).is_err());
    }
}
