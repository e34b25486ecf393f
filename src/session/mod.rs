//! Session capability set (spec.md §9 "Duck-typed backends"): a uniform
//! interface realized by Local Session (C6), Provider Session (C7), and by
//! composition in the Failover Controller (C8).

mod local;
mod provider;

pub use local::{LanguageModel, LlmTokenStream, LocalSession, SpeechToText, TextToSpeech};
pub use provider::ProviderSession;

use crate::error::Result;
use crate::model::{AudioFrame, PolicyVariant};
use async_trait::async_trait;
use std::time::Duration;

/// Non-audio events a session surfaces back to the Call FSM, ordered
/// cause-effect relative to the inbound frame that produced them (spec.md
/// §5 "Ordering guarantees").
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// VAD crossed the start-of-speech boundary (spec.md §4.6 "VAD"). Drives
    /// the FSM's `LISTENING -> LISTENING` mark and, while `SPEAKING`, the
    /// barge-in transition (spec.md §4.9).
    UserSpeakingStart { ts_ms: u32 },
    /// VAD crossed the end-of-speech boundary; the FSM routes this to
    /// `LISTENING -> SPEAKING` (spec.md §4.9).
    UserSpeakingEnd { ts_ms: u32 },
    SttPartial { text: String, ts_ms: u32 },
    SttFinal { text: String, ts_ms: u32 },
    LlmToken { text: String, ts_ms: u32 },
    FirstAudioEmitted { ts_ms: u32 },
    TurnEnd { turn_id: u64, durations: TurnDurations },
    /// Cost-relevant per-component timings (spec.md §4.7, Provider Session).
    CostMetadata { turn_id: u64, stt_ms: u64, llm_ms: u64, tts_ms: u64 },
    /// This turn's transcript restates the previous one (spec.md §3 Feedback
    /// Event `signals.repeats`); folded into the in-flight call signals by
    /// the FSM.
    RepeatDetected,
    SessionError(String),
}

/// Per-turn latency breakdown reported in `turn_end` (spec.md §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnDurations {
    pub stt_ms: u64,
    pub llm_ms: u64,
    pub tts_ms: u64,
    pub e2e_ms: u64,
}

/// Context handed to a session at start: which call, which policy variant.
#[derive(Debug, Clone)]
pub struct SessionStartContext {
    pub call_id: String,
    pub policy: PolicyVariant,
}

/// The capability set every backend (Local, Provider, Failover-by-composition)
/// realizes (spec.md §9).
#[async_trait]
pub trait Session: Send + Sync {
    /// Begin serving a call under the given policy variant.
    async fn start(&self, ctx: SessionStartContext) -> Result<()>;

    /// Hand one inbound audio frame to the session.
    async fn push_frame(&self, frame: AudioFrame) -> Result<()>;

    /// Pop the next non-audio event, if one is queued. Outbound audio
    /// itself travels over the session's [`crate::audio::AudioFrameBus`],
    /// not through this stream.
    async fn next_event(&self) -> Option<SessionEvent>;

    /// Stop TTS synthesis and flush pending outbound frames down to the
    /// documented barge-in floor (spec.md §4.6, ≤ 40 ms queued). MUST return
    /// within the barge-in budget (120 ms, spec.md §4.9).
    async fn stop_output(&self) -> Result<()>;

    /// Release all resources. Idempotent (spec.md §5 "Cancellation").
    async fn close(&self) -> Result<()>;
}

/// Barge-in budget: `stop_output` must observably complete within this
/// window, measured from the inbound frame that triggered it (spec.md §4.6).
pub const BARGE_IN_BUDGET: Duration = Duration::from_millis(120);
