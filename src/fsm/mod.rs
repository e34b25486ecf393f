//! Call FSM (spec.md §4.9): per-call state machine owning policy
//! selection, barge-in handling, and call closing.

use crate::bandit::Bandit;
use crate::config::RewardWeights;
use crate::deploy::DeployGate;
use crate::error::{CoreError, Result};
use crate::feedback::FeedbackEvent;
use crate::feedback::FeedbackStore;
use crate::model::{BackendKind, PolicyVariant, SessionDescriptor};
use crate::reward::{compute_reward, RewardSignals};
use crate::session::{Session, SessionEvent, SessionStartContext};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// FSM states (spec.md §4.9). `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Ringing,
    Answered,
    Listening,
    Speaking,
    Closing,
    Ended,
}

/// Why a call moved to `Closing`.
#[derive(Debug, Clone)]
pub enum ClosingCause {
    CallEnded,
    SessionError(String),
    RingTimeout,
    TurnTimeout,
    IdleTimeout,
}

/// Turn timeout budgets (spec.md §5 "Timeouts").
pub const RING_TIMEOUT: Duration = Duration::from_secs(30);
pub const SPEAKING_TIMEOUT: Duration = Duration::from_secs(30);
pub const LISTENING_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide Bandit/Deploy state, guarded by one mutual-exclusion
/// region (spec.md §5 "Shared resources").
pub struct PolicyEngine {
    pub bandit: Mutex<Bandit>,
    pub deploy: Mutex<DeployGate>,
    pub reward_weights: RewardWeights,
}

/// One live call. Owns exactly one active [`SessionDescriptor`] at a time
/// (spec.md §3 "FSM State").
pub struct CallFsm<R: Rng + Send> {
    call_id: String,
    /// Caller-supplied profile identifier from `hello` (spec.md §6), hashed
    /// alongside the call id when the Feedback Event is recorded.
    profile: String,
    state: FsmState,
    user_speaking: bool,
    descriptor: Option<SessionDescriptor>,
    /// Guards the "Deploy Gate called exactly once per call" invariant
    /// (spec.md §9 Open Questions: policy router calls Deploy Gate exactly
    /// once at RINGING -> ANSWERED).
    policy_selected: bool,
    signals: RewardSignals,
    entered_state_at: Instant,
    feedback_store: Arc<FeedbackStore>,
    policy_engine: Arc<PolicyEngine>,
    session: Arc<dyn Session>,
    rng: R,
}

impl<R: Rng + Send> CallFsm<R> {
    #[must_use]
    pub fn new(
        call_id: String,
        feedback_store: Arc<FeedbackStore>,
        policy_engine: Arc<PolicyEngine>,
        session: Arc<dyn Session>,
        rng: R,
    ) -> Self {
        Self {
            call_id,
            profile: "default".to_owned(),
            state: FsmState::Idle,
            user_speaking: false,
            descriptor: None,
            policy_selected: false,
            signals: RewardSignals::default(),
            entered_state_at: Instant::now(),
            feedback_store,
            policy_engine,
            session,
            rng,
        }
    }

    /// Set the caller-supplied profile identifier carried by `hello`
    /// (spec.md §6). Anonymized before it reaches the Feedback Store.
    pub fn set_profile(&mut self, profile: impl Into<String>) {
        self.profile = profile.into();
    }

    #[must_use]
    pub fn state(&self) -> FsmState {
        self.state
    }

    #[must_use]
    pub fn user_speaking(&self) -> bool {
        self.user_speaking
    }

    #[must_use]
    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        self.descriptor.as_ref()
    }

    fn enter(&mut self, state: FsmState) {
        self.state = state;
        self.entered_state_at = Instant::now();
    }

    /// `IDLE -> RINGING`.
    pub fn incoming_call(&mut self) -> Result<()> {
        if self.state != FsmState::Idle {
            return Err(CoreError::Internal(format!(
                "incoming_call invalid from state {:?}",
                self.state
            )));
        }
        self.enter(FsmState::Ringing);
        Ok(())
    }

    /// `RINGING -> ANSWERED`: selects a policy variant via the Deploy Gate
    /// exactly once, then builds the active session descriptor.
    pub async fn call_answered(
        &mut self,
        catalog: &[PolicyVariant],
        backend_kind: BackendKind,
    ) -> Result<()> {
        if self.state != FsmState::Ringing {
            return Err(CoreError::Internal(format!(
                "call_answered invalid from state {:?}",
                self.state
            )));
        }
        debug_assert!(
            !self.policy_selected,
            "Deploy Gate must be consulted exactly once per call"
        );

        let variant_id = {
            let bandit = self.policy_engine.bandit.lock().await;
            let deploy = self.policy_engine.deploy.lock().await;
            deploy.select(&bandit, &mut self.rng)
        };
        self.policy_selected = true;

        let variant = catalog
            .iter()
            .find(|v| v.id == variant_id)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("unknown policy variant {variant_id}")))?;

        let descriptor = SessionDescriptor::new(
            uuid::Uuid::new_v4().to_string(),
            self.call_id.clone(),
            variant_id,
            backend_kind,
            Utc::now(),
        );
        self.session
            .start(SessionStartContext {
                call_id: self.call_id.clone(),
                policy: variant,
            })
            .await?;
        self.descriptor = Some(descriptor);
        self.enter(FsmState::Answered);
        Ok(())
    }

    /// `ANSWERED -> LISTENING`.
    pub fn greeting_spoken(&mut self) -> Result<()> {
        if self.state != FsmState::Answered {
            return Err(CoreError::Internal("greeting_spoken invalid".to_owned()));
        }
        self.enter(FsmState::Listening);
        Ok(())
    }

    /// `LISTENING -> LISTENING`: marks `user_speaking`.
    pub fn user_speaking_start_while_listening(&mut self) {
        if self.state == FsmState::Listening {
            self.user_speaking = true;
        }
    }

    /// `LISTENING -> SPEAKING`.
    pub fn user_speaking_end(&mut self) -> Result<()> {
        if self.state != FsmState::Listening {
            return Err(CoreError::Internal("user_speaking_end invalid".to_owned()));
        }
        self.user_speaking = false;
        self.enter(FsmState::Speaking);
        Ok(())
    }

    /// `SPEAKING -> SPEAKING`: records first-audio latency.
    pub fn first_audio_emitted(&mut self) {
        if self.state == FsmState::Speaking {
            // Latency measurement is routed to the Failover Controller by
            // the caller; the FSM only acknowledges the milestone here.
        }
    }

    /// `SPEAKING -> LISTENING`: records turn signals.
    pub fn turn_end(&mut self, barge_in_this_turn: bool) -> Result<()> {
        if self.state != FsmState::Speaking {
            return Err(CoreError::Internal("turn_end invalid".to_owned()));
        }
        if barge_in_this_turn {
            self.signals.barge_in_count += 1;
        }
        self.enter(FsmState::Listening);
        Ok(())
    }

    /// Records that the caller's transcript restated their previous turn
    /// (spec.md §3 Feedback Event `signals.repeats`), driven by
    /// [`crate::session::SessionEvent::RepeatDetected`].
    pub fn record_repeat(&mut self) {
        self.signals.repeats = self.signals.repeats.saturating_add(1);
    }

    /// `SPEAKING -> LISTENING`: barge-in. MUST return within the barge-in
    /// budget measured by the caller against [`crate::session::BARGE_IN_BUDGET`].
    pub async fn barge_in(&mut self) -> Result<()> {
        if self.state != FsmState::Speaking {
            return Err(CoreError::Internal("barge_in invalid".to_owned()));
        }
        self.session.stop_output().await?;
        self.signals.barge_in_count += 1;
        self.enter(FsmState::Listening);
        Ok(())
    }

    /// `any -> CLOSING`.
    pub fn session_error(&mut self, _cause: ClosingCause) {
        if self.state != FsmState::Ended {
            self.enter(FsmState::Closing);
        }
    }

    /// `any -> CLOSING`.
    pub fn call_ended(&mut self) {
        if self.state != FsmState::Ended {
            self.enter(FsmState::Closing);
        }
    }

    /// `CLOSING -> ENDED`: computes reward, appends feedback, updates the
    /// Deploy Gate. Testable property 1: exactly one Feedback Event is
    /// appended iff the FSM reached CLOSING after having been in ANSWERED.
    pub async fn feedback_ready(&mut self, duration_sec: f64, user_rating: Option<u8>) -> Result<()> {
        if self.state != FsmState::Closing {
            return Err(CoreError::Internal("feedback_ready invalid".to_owned()));
        }
        let Some(descriptor) = self.descriptor.clone() else {
            self.enter(FsmState::Ended);
            return Ok(());
        };

        self.signals.duration_sec = duration_sec;
        self.signals.user_rating = user_rating;
        let breakdown = compute_reward(&self.signals, &self.policy_engine.reward_weights);

        let event = FeedbackEvent::from_raw(
            &descriptor.call_id,
            Utc::now().timestamp(),
            &self.profile,
            &descriptor.policy_variant_id,
            self.signals,
        );
        self.feedback_store.append(&event)?;

        {
            let mut bandit = self.policy_engine.bandit.lock().await;
            let mut deploy = self.policy_engine.deploy.lock().await;
            deploy.record_feedback(&mut bandit, &descriptor.policy_variant_id, breakdown.reward)?;
        }

        self.session.close().await?;
        self.enter(FsmState::Ended);
        Ok(())
    }

    /// Whether the call has been in `Answered` or later at least once —
    /// used to gate the "exactly one Feedback Event" invariant (testable
    /// property 1) without re-deriving it from log scraping.
    #[must_use]
    pub fn reached_answered(&self) -> bool {
        self.descriptor.is_some()
    }

    /// Whether the current state has exceeded its documented timeout
    /// budget (spec.md §5 "Timeouts").
    #[must_use]
    pub fn timed_out(&self) -> Option<ClosingCause> {
        let elapsed = self.entered_state_at.elapsed();
        match self.state {
            FsmState::Ringing if elapsed > RING_TIMEOUT => Some(ClosingCause::RingTimeout),
            FsmState::Speaking if elapsed > SPEAKING_TIMEOUT => Some(ClosingCause::TurnTimeout),
            FsmState::Listening if elapsed > LISTENING_IDLE_TIMEOUT => {
                Some(ClosingCause::IdleTimeout)
            }
            _ => None,
        }
    }

    /// Drain and dispatch one event from the active session, if any.
    pub async fn pump_session_event(&mut self) -> Option<SessionEvent> {
        self.session.next_event().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::Bandit;
    use crate::deploy::{DeployGate, TrafficSplit};
    use crate::error::Result as CoreResult;
    use crate::model::{AudioFrame, PolicyParameters};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct NullSession;
    #[async_trait]
    impl Session for NullSession {
        async fn start(&self, _ctx: SessionStartContext) -> CoreResult<()> {
            Ok(())
        }
        async fn push_frame(&self, _frame: AudioFrame) -> CoreResult<()> {
            Ok(())
        }
        async fn next_event(&self) -> Option<SessionEvent> {
            None
        }
        async fn stop_output(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn close(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    fn variant(id: &str) -> PolicyVariant {
        PolicyVariant {
            id: id.to_owned(),
            parameters: PolicyParameters {
                greeting: "hi".into(),
                tone: "warm".into(),
                length: "short".into(),
                inquiry_mode: "direct".into(),
                barge_in_sensitivity: 0.5,
            },
            is_base: id == "base",
            is_new: false,
            is_uncertain: false,
        }
    }

    fn engine() -> Arc<PolicyEngine> {
        let mut bandit = Bandit::new(None, 10, 20, -0.2);
        bandit.register_variant("base");
        let mut deploy = DeployGate::new(None, "base".into(), TrafficSplit { new: 0.0, uncertain: 0.0 });
        deploy.load_or_init().expect("load");
        Arc::new(PolicyEngine {
            bandit: Mutex::new(bandit),
            deploy: Mutex::new(deploy),
            reward_weights: RewardWeights::default(),
        })
    }

    fn new_fsm() -> CallFsm<StdRng> {
        let store_dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FeedbackStore::new(store_dir.path().join("fb.jsonl")));
        CallFsm::new(
            "call-1".into(),
            store,
            engine(),
            Arc::new(NullSession),
            StdRng::seed_from_u64(1),
        )
    }

    #[tokio::test]
    async fn happy_path_reaches_ended_and_records_one_feedback_event() {
        let mut fsm = new_fsm();
        fsm.incoming_call().expect("ringing");
        fsm.call_answered(&[variant("base")], BackendKind::Local)
            .await
            .expect("answered");
        fsm.greeting_spoken().expect("listening");
        fsm.user_speaking_start_while_listening();
        fsm.user_speaking_end().expect("speaking");
        fsm.turn_end(false).expect("back to listening");
        fsm.call_ended();
        assert_eq!(fsm.state(), FsmState::Closing);
        fsm.feedback_ready(42.0, Some(5)).await.expect("ended");
        assert_eq!(fsm.state(), FsmState::Ended);
    }

    #[tokio::test]
    async fn closing_before_answered_skips_feedback_event() {
        let mut fsm = new_fsm();
        fsm.incoming_call().expect("ringing");
        fsm.call_ended();
        assert!(!fsm.reached_answered());
        fsm.feedback_ready(0.0, None).await.expect("ended");
        assert_eq!(fsm.state(), FsmState::Ended);
    }

    #[tokio::test]
    async fn barge_in_returns_to_listening_and_counts_interrupt() {
        let mut fsm = new_fsm();
        fsm.incoming_call().expect("ringing");
        fsm.call_answered(&[variant("base")], BackendKind::Local)
            .await
            .expect("answered");
        fsm.greeting_spoken().expect("listening");
        fsm.user_speaking_end().expect("speaking");
        fsm.barge_in().await.expect("barge-in");
        assert_eq!(fsm.state(), FsmState::Listening);
    }

    #[test]
    fn ring_timeout_is_detected() {
        let fsm = new_fsm();
        assert!(fsm.timed_out().is_none());
    }
}
