//! Gateway daemon: boots the voice-session core and serves the duplex
//! WebSocket transport (spec.md §4.10).
//!
//! This binary wires [`tom_voice_core::startup::CoreHandle`] to a
//! [`SessionFactory`] built from demo STT/LLM/TTS backends. Acoustic
//! modeling, language modeling, and speech synthesis themselves are
//! explicitly out of scope for this core (spec.md §1 Non-goals) — the
//! demo backends below exist only so this binary is runnable standalone;
//! a real deployment links its own [`SpeechToText`]/[`LanguageModel`]/
//! [`TextToSpeech`] implementations in their place.

use async_trait::async_trait;
use std::sync::Arc;
use tom_voice_core::audio::AudioFrameBus;
use tom_voice_core::config::CoreConfig;
use tom_voice_core::error::Result;
use tom_voice_core::gateway::{GatewayState, SessionFactory};
use tom_voice_core::metrics::AtomicMetrics;
use tom_voice_core::model::AudioFrame;
use tom_voice_core::session::{
    LanguageModel, LlmTokenStream, LocalSession, Session, SpeechToText, TextToSpeech,
};
use tom_voice_core::startup::{init_tracing, CoreHandle};
use tom_voice_core::vad::VadConfig;

/// Placeholder STT: does not transcribe anything, just reports how much
/// audio it was handed. Stands in for a real acoustic model.
struct DemoStt;

#[async_trait]
impl SpeechToText for DemoStt {
    async fn transcribe(&self, samples: &[i16]) -> Result<String> {
        Ok(format!("<{} samples of captured speech>", samples.len()))
    }
}

/// Placeholder LLM: replies with one fixed token. Stands in for a real
/// language model backend.
struct DemoLlm;

#[async_trait]
impl LanguageModel for DemoLlm {
    async fn stream_reply(&self, _transcript: &str) -> Result<LlmTokenStream> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send("Thanks for calling. A live agent will follow up shortly.".to_owned())
            .await;
        Ok(rx)
    }
}

/// Placeholder TTS: emits one second of silence per utterance. Stands in
/// for a real speech synthesis backend.
struct DemoTts;

#[async_trait]
impl TextToSpeech for DemoTts {
    async fn synthesize(&self, _text: &str) -> Result<Vec<AudioFrame>> {
        Ok((0..50)
            .map(|i| AudioFrame::silence(i, i as u32 * 20))
            .collect())
    }
}

/// Builds a fresh [`LocalSession`] per call. A production deployment would
/// instead build a [`tom_voice_core::failover::FailoverController`] wrapping
/// a [`tom_voice_core::session::ProviderSession`] and this local session,
/// per `config.backend_mode`.
struct DemoSessionFactory;

#[async_trait]
impl SessionFactory for DemoSessionFactory {
    async fn build(&self, _call_id: &str, bus: AudioFrameBus) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(LocalSession::new(
            bus,
            VadConfig::default(),
            Arc::new(DemoStt),
            Arc::new(DemoLlm),
            Arc::new(DemoTts),
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = CoreConfig::from_env();
    tracing::info!(port = config.gateway.port, "starting tom-gatewayd");

    let handle = CoreHandle::init(config)?;
    let _metrics = Arc::new(AtomicMetrics::new());

    let gateway_state = GatewayState::new(
        handle.config.gateway.clone(),
        handle.config.recorder.clone(),
        handle.config.allow_external_backend,
        handle.policy_engine.clone(),
        handle.feedback_store.clone(),
        Arc::new(DemoSessionFactory),
        handle.catalog.clone(),
    );

    let bind_addr = format!("{}:{}", handle.config.gateway.host, handle.config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "gateway listening");

    axum::serve(listener, tom_voice_core::gateway::router(gateway_state)).await?;
    Ok(())
}
