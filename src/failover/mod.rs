//! Failover Controller (spec.md §4.8): a health-weighted selector that
//! presents a single [`Session`] handle backed by a provider and/or local
//! session.
//!
//! State machine: `PrimaryUp -> Degraded -> Switching -> SecondaryUp ->
//! Cooldown -> PrimaryUp`. Grounded on the same trip/cooldown/half-open
//! shape as a circuit breaker, composed with a primary/fallback wrapper
//! around the uniform [`Session`] contract.

use crate::config::FailoverConfig;
use crate::error::{CoreError, Result};
use crate::metrics::MetricsCollector;
use crate::model::{AudioFrame, BackendKind};
use crate::session::{Session, SessionEvent, SessionStartContext};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Failover policy (spec.md §4.8 "Policy values").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    ProviderOnly,
    LocalOnly,
    ProviderThenLocal,
    LocalThenProvider,
}

impl From<crate::config::BackendMode> for BackendMode {
    fn from(mode: crate::config::BackendMode) -> Self {
        match mode {
            crate::config::BackendMode::ProviderOnly => BackendMode::ProviderOnly,
            crate::config::BackendMode::LocalOnly => BackendMode::LocalOnly,
            crate::config::BackendMode::ProviderThenLocal => BackendMode::ProviderThenLocal,
            crate::config::BackendMode::LocalThenProvider => BackendMode::LocalThenProvider,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FailoverState {
    PrimaryUp = 0,
    Degraded = 1,
    Switching = 2,
    SecondaryUp = 3,
    Cooldown = 4,
}

impl FailoverState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FailoverState::PrimaryUp,
            1 => FailoverState::Degraded,
            2 => FailoverState::Switching,
            3 => FailoverState::SecondaryUp,
            _ => FailoverState::Cooldown,
        }
    }
}

/// Rolling window of end-to-end latencies and raised errors, used to
/// detect sustained degradation (spec.md §4.8 "Health signals").
struct HealthWindow {
    latencies: VecDeque<(Instant, u64)>,
    errors: VecDeque<Instant>,
    degraded_since: Option<Instant>,
}

impl HealthWindow {
    fn new() -> Self {
        Self {
            latencies: VecDeque::new(),
            errors: VecDeque::new(),
            degraded_since: None,
        }
    }

    fn record_latency(&mut self, now: Instant, latency_ms: u64) {
        self.latencies.push_back((now, latency_ms));
        while let Some((t, _)) = self.latencies.front() {
            if now.duration_since(*t) > Duration::from_secs(60) {
                self.latencies.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_error(&mut self, now: Instant, window: Duration) {
        self.errors.push_back(now);
        while let Some(t) = self.errors.front() {
            if now.duration_since(*t) > window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }

    fn p95_latency_ms(&self) -> Option<u64> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.latencies.iter().map(|(_, ms)| *ms).collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted.get(idx.saturating_sub(1)).copied()
    }

    fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Whether the latency trigger has been sustained for the required
    /// duration, starting the degradation clock on first breach.
    fn latency_trigger(&mut self, now: Instant, trigger_ms: u64, sustained: Duration) -> bool {
        match self.p95_latency_ms() {
            Some(p95) if p95 > trigger_ms => {
                let since = *self.degraded_since.get_or_insert(now);
                now.duration_since(since) >= sustained
            }
            _ => {
                self.degraded_since = None;
                false
            }
        }
    }
}

/// Health-weighted selector presenting a single [`Session`] handle.
pub struct FailoverController {
    mode: BackendMode,
    provider: Option<Arc<dyn Session>>,
    local: Option<Arc<dyn Session>>,
    config: FailoverConfig,
    metrics: Arc<dyn MetricsCollector>,
    state: AtomicU8,
    active_is_provider: std::sync::atomic::AtomicBool,
    cooldown_until_ms: AtomicU64,
    health: parking_lot::Mutex<HealthWindow>,
    epoch: Instant,
}

impl FailoverController {
    #[must_use]
    pub fn new(
        mode: BackendMode,
        provider: Option<Arc<dyn Session>>,
        local: Option<Arc<dyn Session>>,
        config: FailoverConfig,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        let active_is_provider = matches!(
            mode,
            BackendMode::ProviderOnly | BackendMode::ProviderThenLocal
        );
        Self {
            mode,
            provider,
            local,
            config,
            metrics,
            state: AtomicU8::new(FailoverState::PrimaryUp as u8),
            active_is_provider: std::sync::atomic::AtomicBool::new(active_is_provider),
            cooldown_until_ms: AtomicU64::new(0),
            health: parking_lot::Mutex::new(HealthWindow::new()),
            epoch: Instant::now(),
        }
    }

    fn state(&self) -> FailoverState {
        FailoverState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: FailoverState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    #[must_use]
    pub fn active_backend(&self) -> BackendKind {
        if self.active_is_provider.load(Ordering::Relaxed) {
            BackendKind::Provider
        } else {
            BackendKind::Local
        }
    }

    fn active_session(&self) -> Result<Arc<dyn Session>> {
        let session = if self.active_is_provider.load(Ordering::Relaxed) {
            self.provider.clone()
        } else {
            self.local.clone()
        };
        session.ok_or_else(|| {
            CoreError::BackendUnavailable("active backend has no session configured".to_owned())
        })
    }

    fn alternate_session(&self) -> Option<Arc<dyn Session>> {
        if self.active_is_provider.load(Ordering::Relaxed) {
            self.local.clone()
        } else {
            self.provider.clone()
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn in_cooldown(&self) -> bool {
        self.now_ms() < self.cooldown_until_ms.load(Ordering::Relaxed)
    }

    /// Record an end-to-end turn latency and evaluate the latency trigger.
    pub fn record_latency_ms(&self, latency_ms: u64) {
        let now = Instant::now();
        let triggered = {
            let mut health = self.health.lock();
            health.record_latency(now, latency_ms);
            health.latency_trigger(
                now,
                self.config.trigger_ms,
                Duration::from_secs(self.config.sustained_secs),
            )
        };
        if triggered {
            self.set_state(FailoverState::Degraded);
        }
    }

    /// Record a backend error and evaluate the error-burst trigger.
    pub fn record_error(&self) -> bool {
        let now = Instant::now();
        let burst = {
            let mut health = self.health.lock();
            health.record_error(now, Duration::from_secs(self.config.error_window_secs));
            health.error_count() >= self.config.error_burst as usize
        };
        if burst {
            self.set_state(FailoverState::Degraded);
        }
        burst
    }

    /// Attempt the primary -> secondary switch if policy allows it and the
    /// controller is not in cooldown (spec.md §4.8 "Switch").
    pub async fn maybe_switch(&self) -> Result<bool> {
        if self.in_cooldown() {
            return Ok(false);
        }
        if !matches!(self.state(), FailoverState::Degraded) {
            return Ok(false);
        }
        if !matches!(
            self.mode,
            BackendMode::ProviderThenLocal | BackendMode::LocalThenProvider
        ) {
            return Ok(false);
        }
        let Some(_secondary) = self.alternate_session() else {
            self.set_state(FailoverState::PrimaryUp);
            return Err(CoreError::Terminal(
                "both backends unavailable, no alternate to switch to".to_owned(),
            ));
        };

        self.set_state(FailoverState::Switching);
        let from = self.active_backend();
        self.active_is_provider.fetch_xor(true, Ordering::Relaxed);
        let to = self.active_backend();
        self.metrics.count_failover_transition(from.as_str(), to.as_str());
        self.metrics.count_event("failover", to.as_str());
        self.metrics.set_active_connections(1);

        self.set_state(FailoverState::SecondaryUp);
        self.cooldown_until_ms.store(
            self.now_ms() + self.config.cooldown_secs * 1000,
            Ordering::Relaxed,
        );
        self.set_state(FailoverState::Cooldown);
        Ok(true)
    }

    #[must_use]
    pub fn is_in_cooldown(&self) -> bool {
        self.in_cooldown()
    }

    /// Recovery probe (spec.md §4.8 state diagram "recovery probe"): once
    /// the cooldown window has elapsed, push one silent frame at the
    /// backend that was active before the switch. Success returns the
    /// controller to `PrimaryUp` on that backend; failure restarts the
    /// cooldown window rather than leaving the controller stuck probing on
    /// every call. No-op outside `Cooldown` or while still within the
    /// window. Intended to be polled periodically by the caller (e.g. from
    /// the gateway's idle tick), not driven by call traffic.
    pub async fn maybe_recover(&self) -> Result<bool> {
        if !matches!(self.state(), FailoverState::Cooldown) || self.in_cooldown() {
            return Ok(false);
        }
        let Some(candidate) = self.alternate_session() else {
            return Ok(false);
        };
        match candidate.push_frame(AudioFrame::silence(0, 0)).await {
            Ok(()) => {
                let from = self.active_backend();
                self.active_is_provider.fetch_xor(true, Ordering::Relaxed);
                let to = self.active_backend();
                self.metrics.count_failover_transition(from.as_str(), to.as_str());
                self.metrics.count_event("failover_recovery", to.as_str());
                self.set_state(FailoverState::PrimaryUp);
                Ok(true)
            }
            Err(_) => {
                self.cooldown_until_ms.store(
                    self.now_ms() + self.config.cooldown_secs * 1000,
                    Ordering::Relaxed,
                );
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Session for FailoverController {
    async fn start(&self, ctx: SessionStartContext) -> Result<()> {
        self.active_session()?.start(ctx).await
    }

    async fn push_frame(&self, frame: AudioFrame) -> Result<()> {
        let started = Instant::now();
        match self.active_session()?.push_frame(frame).await {
            Ok(()) => {
                self.record_latency_ms(started.elapsed().as_millis() as u64);
                Ok(())
            }
            Err(e) if e.is_retryable_by_failover() => {
                self.record_error();
                self.maybe_switch().await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn next_event(&self) -> Option<SessionEvent> {
        self.active_session().ok()?.next_event().await
    }

    async fn stop_output(&self) -> Result<()> {
        self.active_session()?.stop_output().await
    }

    async fn close(&self) -> Result<()> {
        if let Some(provider) = &self.provider {
            provider.close().await?;
        }
        if let Some(local) = &self.local {
            local.close().await?;
        }
        Ok(())
    }
}
