//! Metrics collection for observability.
//!
//! The [`MetricsCollector`] trait allows pluggable metrics backends
//! (Prometheus, StatsD, etc.) while keeping the core decoupled from any
//! specific metrics system. All methods take `&self`; implementors use
//! interior mutability (`AtomicU64`, `parking_lot::Mutex`) for concurrent
//! access from multiple session tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collection interface for the voice-session core.
pub trait MetricsCollector: Send + Sync {
    /// Record end-to-end turn latency (speech end to first audio back).
    fn record_turn_latency_ms(&self, backend: &str, latency_ms: u64);

    /// Record failover controller state residency time before a transition.
    fn record_failover_state_duration_ms(&self, state: &str, duration_ms: u64);

    /// Record a generic event count (increment by 1), e.g. `barge_in`,
    /// `handover`, `blacklist`, `rate_limited`.
    fn count_event(&self, event_name: &str, label: &str);

    /// Record a failover transition between two named states.
    fn count_failover_transition(&self, from_state: &str, to_state: &str);

    /// Record one reward observation routed into the Bandit.
    fn record_reward(&self, policy_variant_id: &str, reward: f64);

    /// Record current gateway connection gauge value.
    fn set_active_connections(&self, count: u64);
}

/// No-op metrics collector. Zero runtime cost; used when metrics collection
/// is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn record_turn_latency_ms(&self, _backend: &str, _latency_ms: u64) {}
    fn record_failover_state_duration_ms(&self, _state: &str, _duration_ms: u64) {}
    fn count_event(&self, _event_name: &str, _label: &str) {}
    fn count_failover_transition(&self, _from_state: &str, _to_state: &str) {}
    fn record_reward(&self, _policy_variant_id: &str, _reward: f64) {}
    fn set_active_connections(&self, _count: u64) {}
}

/// In-process atomic counters, useful for tests and for a `/debug/metrics`
/// style introspection endpoint without pulling in a Prometheus exporter.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    turns_recorded: AtomicU64,
    turn_latency_ms_sum: AtomicU64,
    failover_transitions: AtomicU64,
    events_counted: AtomicU64,
    rewards_recorded: AtomicU64,
    active_connections: AtomicU64,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn turns_recorded(&self) -> u64 {
        self.turns_recorded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn mean_turn_latency_ms(&self) -> f64 {
        let turns = self.turns_recorded.load(Ordering::Relaxed);
        if turns == 0 {
            return 0.0;
        }
        self.turn_latency_ms_sum.load(Ordering::Relaxed) as f64 / turns as f64
    }

    #[must_use]
    pub fn failover_transitions(&self) -> u64 {
        self.failover_transitions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn events_counted(&self) -> u64 {
        self.events_counted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

impl MetricsCollector for AtomicMetrics {
    fn record_turn_latency_ms(&self, _backend: &str, latency_ms: u64) {
        self.turns_recorded.fetch_add(1, Ordering::Relaxed);
        self.turn_latency_ms_sum
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    fn record_failover_state_duration_ms(&self, _state: &str, _duration_ms: u64) {}

    fn count_event(&self, _event_name: &str, _label: &str) {
        self.events_counted.fetch_add(1, Ordering::Relaxed);
    }

    fn count_failover_transition(&self, _from_state: &str, _to_state: &str) {
        self.failover_transitions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reward(&self, _policy_variant_id: &str, _reward: f64) {
        self.rewards_recorded.fetch_add(1, Ordering::Relaxed);
    }

    fn set_active_connections(&self, count: u64) {
        self.active_connections.store(count, Ordering::Relaxed);
    }
}

/// Convert a [`Duration`] to milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_metrics_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopMetrics>();
    }

    #[test]
    fn atomic_metrics_accumulates_turn_latency() {
        let metrics = AtomicMetrics::new();
        metrics.record_turn_latency_ms("local", 100);
        metrics.record_turn_latency_ms("local", 300);
        assert_eq!(metrics.turns_recorded(), 2);
        assert!((metrics.mean_turn_latency_ms() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn atomic_metrics_counts_failover_transitions() {
        let metrics = AtomicMetrics::new();
        metrics.count_failover_transition("primary_up", "degraded");
        metrics.count_failover_transition("degraded", "switching");
        assert_eq!(metrics.failover_transitions(), 2);
    }

    #[test]
    fn duration_to_ms_conversion() {
        assert_eq!(duration_to_ms(Duration::from_millis(1234)), 1234);
        assert_eq!(duration_to_ms(Duration::from_secs(2)), 2000);
    }
}
