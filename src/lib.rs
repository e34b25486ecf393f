//! Realtime voice-session core: barge-in duplex audio, provider/local
//! failover, and a bandit-driven policy deploy gate for a telephony
//! assistant.
//!
//! # Architecture
//!
//! A call's lifecycle runs through independently testable components wired
//! together by the [`fsm::CallFsm`]:
//! - **Transport**: [`gateway`] terminates an authenticated duplex
//!   WebSocket connection per call and relays audio/control traffic.
//! - **Audio plumbing**: [`audio::AudioFrameBus`] carries frames between the
//!   transport and the active session without blocking either side.
//! - **Sessions**: [`session::LocalSession`] (VAD → STT → LLM → TTS) and
//!   [`session::ProviderSession`] (remote duplex adapter) both realize the
//!   [`session::Session`] capability set; [`failover::FailoverController`]
//!   composes them behind the same contract.
//! - **Policy selection**: [`bandit::Bandit`] (Thompson sampling over
//!   persisted Beta posteriors) is wrapped by [`deploy::DeployGate`]
//!   (traffic split + blacklist), consulted once per call by the FSM.
//! - **Learning loop**: [`reward::compute_reward`] turns end-of-call
//!   signals into a scalar, [`feedback::FeedbackStore`] persists the
//!   anonymized outcome, and the Deploy Gate folds it back into the Bandit.
//! - **Optional QA capture**: [`recorder::CallRecorder`].

pub mod audio;
pub mod bandit;
pub mod config;
pub mod deploy;
pub mod error;
pub mod failover;
pub mod feedback;
pub mod fsm;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod persist;
pub mod recorder;
pub mod reward;
pub mod session;
pub mod startup;
pub mod vad;

pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use fsm::{CallFsm, PolicyEngine};
pub use startup::CoreHandle;
