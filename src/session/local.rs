//! Local Session (spec.md §4.6): a classical STT -> LLM -> TTS pipeline
//! driven by VAD, run as a single-writer cooperative scheduler.

use super::{Session, SessionEvent, SessionStartContext, TurnDurations};
use crate::audio::AudioFrameBus;
use crate::error::Result;
use crate::model::AudioFrame;
use crate::vad::{EnergyVad, VadConfig, VadEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Speech-to-text capability (spec.md §9 "Duck-typed backends" ->
/// capability set). Implementations may stream partial transcripts before
/// the final one.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, samples: &[i16]) -> Result<String>;
}

/// A finite, non-restartable stream of text tokens from the LLM.
pub type LlmTokenStream = mpsc::Receiver<String>;

/// Language-model capability: yields a lazy token stream for one transcript.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_reply(&self, transcript: &str) -> Result<LlmTokenStream>;
}

/// Text-to-speech capability: synthesizes 20 ms PCM frames for one sentence.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<AudioFrame>>;
}

struct TurnState {
    turn_id: u64,
    captured_samples: Vec<i16>,
    outbound_seq: u64,
    /// Final transcript of the previous turn, used to detect the caller
    /// repeating themselves (spec.md §3 Feedback Event `signals.repeats`).
    last_transcript: Option<String>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            turn_id: 0,
            captured_samples: Vec::new(),
            outbound_seq: 0,
            last_transcript: None,
        }
    }
}

/// Drives VAD -> STT -> LLM -> TTS over one call's [`AudioFrameBus`].
pub struct LocalSession {
    bus: AudioFrameBus,
    vad: Mutex<EnergyVad>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    turn: Arc<Mutex<TurnState>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<mpsc::Receiver<SessionEvent>>,
    /// Set by `stop_output` to interrupt an in-flight TTS synthesis loop.
    interrupt: Arc<AtomicBool>,
    closed: AtomicBool,
    started_at_ms: AtomicU64,
}

impl LocalSession {
    #[must_use]
    pub fn new(
        bus: AudioFrameBus,
        vad_config: VadConfig,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            bus,
            vad: Mutex::new(EnergyVad::new(vad_config, crate::model::FRAME_DURATION_MS)),
            stt,
            llm,
            tts,
            turn: Arc::new(Mutex::new(TurnState::default())),
            events_tx,
            events_rx: Mutex::new(events_rx),
            interrupt: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            started_at_ms: AtomicU64::new(0),
        }
    }

    /// Spawn the STT -> LLM -> TTS pipeline for one turn as an independent
    /// task so the caller (`push_frame`) returns immediately. Without this,
    /// a `tokio::select!` loop awaiting `push_frame` inline would be unable
    /// to poll for a concurrent `user_speaking_start` (barge-in) while a
    /// turn's synthesis is in flight, making barge-in structurally
    /// unreachable (spec.md §4.6 barge-in budget).
    fn spawn_turn(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        bus: AudioFrameBus,
        turn: Arc<Mutex<TurnState>>,
        events_tx: mpsc::Sender<SessionEvent>,
        interrupt: Arc<AtomicBool>,
        samples: Vec<i16>,
    ) {
        tokio::spawn(async move {
            if let Err(e) =
                run_turn(stt, llm, tts, bus, turn, events_tx.clone(), interrupt, samples).await
            {
                let _ = events_tx.send(SessionEvent::SessionError(e.to_string())).await;
            }
        });
    }
}

/// Whether `current` looks like a restatement of `previous` — a
/// case-insensitive exact match, which is what a caller repeating
/// themselves verbatim after a misheard/unresolved turn looks like.
fn is_repeat(previous: &str, current: &str) -> bool {
    !previous.is_empty() && !current.is_empty() && previous.eq_ignore_ascii_case(current)
}

async fn run_turn(
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    bus: AudioFrameBus,
    turn: Arc<Mutex<TurnState>>,
    events_tx: mpsc::Sender<SessionEvent>,
    interrupt: Arc<AtomicBool>,
    samples: Vec<i16>,
) -> Result<()> {
    interrupt.store(false, Ordering::Relaxed);

    let stt_started = tokio::time::Instant::now();
    let transcript = stt.transcribe(&samples).await?;
    let stt_ms = stt_started.elapsed().as_millis() as u64;

    let (turn_id, repeated) = {
        let mut turn = turn.lock().await;
        turn.turn_id += 1;
        let repeated = turn
            .last_transcript
            .as_deref()
            .is_some_and(|prev| is_repeat(prev, &transcript));
        turn.last_transcript = Some(transcript.clone());
        (turn.turn_id, repeated)
    };
    if repeated {
        let _ = events_tx.send(SessionEvent::RepeatDetected).await;
    }

    let _ = events_tx
        .send(SessionEvent::SttFinal {
            text: transcript.clone(),
            ts_ms: 0,
        })
        .await;

    let llm_started = tokio::time::Instant::now();
    let mut tokens = llm.stream_reply(&transcript).await?;
    let mut first_audio_emitted = false;
    let mut tts_ms_total: u64 = 0;

    let mut tick = tokio::time::interval(Duration::from_millis(20));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }
            }
            token = tokens.recv() => {
                let Some(token) = token else { break; };
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }
                let _ = events_tx
                    .send(SessionEvent::LlmToken { text: token.clone(), ts_ms: 0 })
                    .await;

                let tts_started = tokio::time::Instant::now();
                let frames = tts.synthesize(&token).await?;
                tts_ms_total += tts_started.elapsed().as_millis() as u64;

                for mut frame in frames {
                    if interrupt.load(Ordering::Relaxed) {
                        break;
                    }
                    let mut turn_guard = turn.lock().await;
                    frame.seq = turn_guard.outbound_seq;
                    turn_guard.outbound_seq += 1;
                    drop(turn_guard);
                    bus.outbound.push(frame);
                    if !first_audio_emitted {
                        first_audio_emitted = true;
                        let _ = events_tx.send(SessionEvent::FirstAudioEmitted { ts_ms: 0 }).await;
                    }
                }
            }
        }
    }

    let llm_ms = llm_started.elapsed().as_millis() as u64;
    let durations = TurnDurations {
        stt_ms,
        llm_ms,
        tts_ms: tts_ms_total,
        e2e_ms: stt_ms + llm_ms + tts_ms_total,
    };
    let _ = events_tx.send(SessionEvent::TurnEnd { turn_id, durations }).await;
    Ok(())
}

#[async_trait]
impl Session for LocalSession {
    async fn start(&self, _ctx: SessionStartContext) -> Result<()> {
        self.started_at_ms.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn push_frame(&self, frame: AudioFrame) -> Result<()> {
        let event = {
            let mut vad = self.vad.lock().await;
            vad.process_frame(&frame)
        };
        let ts_ms = frame.ts_ms;

        let mut turn = self.turn.lock().await;
        turn.captured_samples.extend_from_slice(&frame.samples);

        match event {
            Some(VadEvent::UserSpeakingStart) => {
                drop(turn);
                // Surfaced unconditionally: while SPEAKING this is the
                // gateway's barge-in signal (spec.md §4.9); while LISTENING
                // it is just the sticky `user_speaking` mark.
                let _ = self
                    .events_tx
                    .send(SessionEvent::UserSpeakingStart { ts_ms })
                    .await;
            }
            Some(VadEvent::UserSpeakingEnd) => {
                let samples = std::mem::take(&mut turn.captured_samples);
                drop(turn);
                let _ = self
                    .events_tx
                    .send(SessionEvent::UserSpeakingEnd { ts_ms })
                    .await;
                Self::spawn_turn(
                    self.stt.clone(),
                    self.llm.clone(),
                    self.tts.clone(),
                    self.bus.clone(),
                    self.turn.clone(),
                    self.events_tx.clone(),
                    self.interrupt.clone(),
                    samples,
                );
            }
            None => {}
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<SessionEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn stop_output(&self) -> Result<()> {
        self.interrupt.store(true, Ordering::Relaxed);
        // Drop all but the already-queued-within-40ms tail (spec.md §4.6):
        // two frames at 20 ms cadence.
        while self.bus.outbound.len() > 2 {
            self.bus.outbound.pop();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.interrupt.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AudioFrame;

    struct EchoStt;
    #[async_trait]
    impl SpeechToText for EchoStt {
        async fn transcribe(&self, samples: &[i16]) -> Result<String> {
            Ok(format!("heard {} samples", samples.len()))
        }
    }

    struct OneTokenLlm;
    #[async_trait]
    impl LanguageModel for OneTokenLlm {
        async fn stream_reply(&self, _transcript: &str) -> Result<LlmTokenStream> {
            let (tx, rx) = mpsc::channel(4);
            tx.send("hello".to_owned()).await.ok();
            Ok(rx)
        }
    }

    struct SilentTts;
    #[async_trait]
    impl TextToSpeech for SilentTts {
        async fn synthesize(&self, _text: &str) -> Result<Vec<AudioFrame>> {
            Ok(vec![AudioFrame::silence(0, 0)])
        }
    }

    fn loud_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(seq, (seq * 20) as u32, vec![i16::MAX / 2; 320])
    }

    fn silent_frame(seq: u64) -> AudioFrame {
        AudioFrame::silence(seq, (seq * 20) as u32)
    }

    #[tokio::test]
    async fn speaking_end_drives_a_full_turn_and_emits_turn_end() {
        let session = LocalSession::new(
            AudioFrameBus::default(),
            VadConfig::default(),
            Arc::new(EchoStt),
            Arc::new(OneTokenLlm),
            Arc::new(SilentTts),
        );

        for seq in 0..6 {
            session.push_frame(loud_frame(seq)).await.expect("push");
        }
        for seq in 6..26 {
            session.push_frame(silent_frame(seq)).await.expect("push");
        }

        let mut saw_turn_end = false;
        for _ in 0..10 {
            match session.next_event().await {
                Some(SessionEvent::TurnEnd { .. }) => {
                    saw_turn_end = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_turn_end);
    }

    #[tokio::test]
    async fn stop_output_sets_interrupt_and_trims_outbound_queue() {
        let session = LocalSession::new(
            AudioFrameBus::default(),
            VadConfig::default(),
            Arc::new(EchoStt),
            Arc::new(OneTokenLlm),
            Arc::new(SilentTts),
        );
        for seq in 0..8 {
            session.bus.outbound.push(AudioFrame::silence(seq, 0));
        }
        session.stop_output().await.expect("stop");
        assert!(session.bus.outbound.len() <= 2);
        assert!(session.interrupt.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = LocalSession::new(
            AudioFrameBus::default(),
            VadConfig::default(),
            Arc::new(EchoStt),
            Arc::new(OneTokenLlm),
            Arc::new(SilentTts),
        );
        session.close().await.expect("close");
        session.close().await.expect("close again");
    }
}
