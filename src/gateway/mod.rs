//! Gateway (spec.md §4.10, §6): the WebSocket duplex transport that binds a
//! network connection to one [`CallFsm`] for the lifetime of a call.
//!
//! Grounded on the shape of the axum webhook gateway in the teacher's
//! `channels::gateway` (router construction, bearer-token check, JSON
//! body types) plus the split-socket/mpsc-writer pattern used by realtime
//! voice WebSocket handlers in the retrieved example pack, generalized
//! from one-shot HTTP webhooks to a long-lived duplex audio+control
//! connection.

pub mod auth;
pub mod rate_limit;
pub mod wire;

use crate::audio::AudioFrameBus;
use crate::config::GatewayConfig;
use crate::error::{CoreError, Result};
use crate::fsm::{CallFsm, ClosingCause, FsmState, PolicyEngine};
use crate::model::{BackendKind, PolicyVariant};
use crate::feedback::FeedbackStore;
use crate::recorder::{recording_allowed, CallRecorder};
use crate::session::{Session, SessionEvent};
use auth::NonceStore;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rate_limit::TokenBucket;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use wire::{pack_audio_frame, unpack_audio_frame, TransportMessage};

/// Builds the [`Session`] that drives a single call for its lifetime.
/// Implementations decide Local vs Provider vs Failover-composed sessions;
/// the gateway itself is backend-agnostic (spec.md §9 "Duck-typed backends").
///
/// `bus` is the same [`AudioFrameBus`] the gateway's outbound pump polls;
/// implementations MUST construct their session(s) over this bus (cloning
/// it, not making a fresh one) so audio frames the session emits are the
/// frames the transport actually sends.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    async fn build(&self, call_id: &str, bus: AudioFrameBus) -> Result<Arc<dyn Session>>;
}

/// Process-wide gateway dependencies, cloned (cheaply, via `Arc`) into
/// every connection task.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub policy_engine: Arc<PolicyEngine>,
    pub feedback_store: Arc<FeedbackStore>,
    pub session_factory: Arc<dyn SessionFactory>,
    pub catalog: Arc<Vec<PolicyVariant>>,
    pub nonces: Arc<NonceStore>,
    pub recorder_config: Arc<crate::config::RecorderConfig>,
    pub allow_external_backend: bool,
}

impl GatewayState {
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        recorder_config: crate::config::RecorderConfig,
        allow_external_backend: bool,
        policy_engine: Arc<PolicyEngine>,
        feedback_store: Arc<FeedbackStore>,
        session_factory: Arc<dyn SessionFactory>,
        catalog: Vec<PolicyVariant>,
    ) -> Self {
        let nonces = Arc::new(NonceStore::new(Duration::from_secs(config.nonce_ttl_secs)));
        Self {
            config: Arc::new(config),
            policy_engine,
            feedback_store,
            session_factory,
            catalog: Arc::new(catalog),
            nonces,
            recorder_config: Arc::new(recorder_config),
            allow_external_backend,
        }
    }
}

/// Build the gateway's axum router: a liveness probe plus the per-call
/// WebSocket upgrade endpoint.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{call_id}", get(ws_upgrade))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Whether `headers` carries an `Origin` present in `allowed`. An empty
/// allow-list denies every origin (spec.md §6 "CORS/origin allow-list"
/// fails closed rather than open); a literal `"*"` entry allows all.
fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.iter().any(|o| o == "*") {
        return true;
    }
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    allowed.iter().any(|o| o == origin)
}

/// Pull the bearer token out of band from the `hello` payload (spec.md §6
/// "Authentication"): an `Authorization: Bearer <token>` header takes
/// precedence, falling back to a `token` query parameter.
fn extract_token(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_owned());
        }
    }
    params.get("token").cloned()
}

fn auth_error_response(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(auth_error(message))).into_response()
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    Path(call_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_is_allowed(&headers, &state.config.allowed_origins) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    let Some(token) = extract_token(&headers, &params) else {
        return auth_error_response("missing bearer token");
    };
    if let Err(e) = state.nonces.admit(
        state.config.auth_secret.as_bytes(),
        &token,
        chrono::Utc::now().timestamp(),
        &call_id,
    ) {
        return (StatusCode::UNAUTHORIZED, Json(error_message(&e))).into_response();
    }
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = run_connection(socket, state, call_id.clone()).await {
            tracing::warn!(call_id, error = %e, "gateway connection ended with error");
        }
    })
}

enum Outbound {
    Json(TransportMessage),
    Audio(Vec<u8>),
}

/// Drive one call end-to-end: authenticate the `hello`, select a policy via
/// the Call FSM, pump inbound/outbound audio and control messages until the
/// socket closes or the call ends, then settle the FSM into `ENDED`.
async fn run_connection(socket: WebSocket, state: GatewayState, call_id: String) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(128);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let sent = match msg {
                Outbound::Json(m) => {
                    let text = serde_json::to_string(&m).unwrap_or_default();
                    ws_tx.send(Message::Text(text.into())).await
                }
                Outbound::Audio(bytes) => ws_tx.send(Message::Binary(bytes.into())).await,
            };
            if sent.is_err() {
                break;
            }
        }
    });

    let hello = match ws_rx.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            let _ = out_tx
                .send(Outbound::Json(auth_error("expected hello as first message")))
                .await;
            writer.abort();
            return Ok(());
        }
    };
    let TransportMessage::Hello { call_id: hello_call_id, profile } =
        serde_json::from_str::<TransportMessage>(&hello)
            .map_err(|e| CoreError::Validation(format!("malformed hello: {e}")))?
    else {
        let _ = out_tx
            .send(Outbound::Json(auth_error("first message must be hello")))
            .await;
        writer.abort();
        return Ok(());
    };
    if hello_call_id != call_id {
        let _ = out_tx
            .send(Outbound::Json(auth_error("hello call_id does not match connection target")))
            .await;
        writer.abort();
        return Ok(());
    }

    let bus = AudioFrameBus::default();
    let session = state.session_factory.build(&call_id, bus.clone()).await?;
    let policy_engine = state.policy_engine.clone();
    let feedback_store = state.feedback_store.clone();
    let rng = StdRng::from_entropy();
    let mut fsm = CallFsm::new(
        call_id.clone(),
        feedback_store,
        policy_engine,
        session.clone(),
        rng,
    );
    fsm.set_profile(profile);

    fsm.incoming_call()?;
    fsm.call_answered(&state.catalog, BackendKind::Local).await?;
    fsm.greeting_spoken()?;

    let recorder = if recording_allowed(
        &state.recorder_config,
        false,
        state.allow_external_backend,
    ) {
        match CallRecorder::open(
            &state.recorder_config.dir,
            &call_id,
            state.recorder_config.max_bytes_per_call,
        ) {
            Ok(r) => Some(Arc::new(r)),
            Err(e) => {
                tracing::warn!(call_id, error = %e, "failed to open call recording");
                None
            }
        }
    } else {
        None
    };

    let mut bucket = TokenBucket::new(state.config.rate_limit_msgs_per_sec);
    let max_frame_bytes = state.config.max_frame_bytes;
    let call_started = Instant::now();
    let mut barge_in_this_turn = false;

    let mut outbound_pump = tokio::time::interval(Duration::from_millis(10));
    outbound_pump.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let closing_cause = 'conn: loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        if bytes.len() > max_frame_bytes {
                            let _ = out_tx.send(Outbound::Json(error_message(
                                &CoreError::FrameTooLarge(format!("{} bytes", bytes.len())),
                            ))).await;
                            break ClosingCause::SessionError("frame too large".into());
                        }
                        if !bucket.try_consume() {
                            let _ = out_tx.send(Outbound::Json(error_message(
                                &CoreError::RateLimited("message rate exceeded".into()),
                            ))).await;
                            break ClosingCause::SessionError("rate limited".into());
                        }
                        let Some(frame) = unpack_audio_frame(&bytes) else {
                            let _ = out_tx.send(Outbound::Json(error_message(
                                &CoreError::Validation("malformed audio frame header".into()),
                            ))).await;
                            continue;
                        };
                        // Route through the Audio Frame Bus's inbound queue
                        // (spec.md §4.1) so its bounded-capacity drop-oldest
                        // and seq-gap detection actually run on live traffic,
                        // then drain whatever it accepted to the session.
                        bus.inbound.push(frame);
                        while let Some(queued) = bus.inbound.pop() {
                            if let Some(rec) = &recorder {
                                let _ = rec.record(&queued).await;
                            }
                            if let Err(e) = session.push_frame(queued).await {
                                let _ = out_tx.send(Outbound::Json(error_message(&e))).await;
                                break 'conn ClosingCause::SessionError(e.to_string());
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if !bucket.try_consume() {
                            let _ = out_tx.send(Outbound::Json(error_message(
                                &CoreError::RateLimited("message rate exceeded".into()),
                            ))).await;
                            break ClosingCause::SessionError("rate limited".into());
                        }
                        match serde_json::from_str::<TransportMessage>(&text) {
                            Ok(TransportMessage::Bye { .. }) => {
                                break ClosingCause::CallEnded;
                            }
                            Ok(TransportMessage::Ping) => {
                                let _ = out_tx.send(Outbound::Json(TransportMessage::Pong)).await;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                let _ = out_tx.send(Outbound::Json(error_message(
                                    &CoreError::Validation(format!("malformed message: {e}")),
                                ))).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break ClosingCause::CallEnded;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break ClosingCause::SessionError(e.to_string());
                    }
                }
            }
            event = fsm.pump_session_event() => {
                match event {
                    Some(SessionEvent::UserSpeakingStart { .. }) => {
                        if fsm.state() == FsmState::Speaking {
                            barge_in_this_turn = true;
                            if let Err(e) = fsm.barge_in().await {
                                break ClosingCause::SessionError(e.to_string());
                            }
                        } else {
                            fsm.user_speaking_start_while_listening();
                        }
                    }
                    Some(SessionEvent::UserSpeakingEnd { .. }) => {
                        if let Err(e) = fsm.user_speaking_end() {
                            break ClosingCause::SessionError(e.to_string());
                        }
                    }
                    Some(SessionEvent::SttFinal { text, ts_ms }) => {
                        let _ = out_tx.send(Outbound::Json(TransportMessage::SttFinal { text, ts_ms })).await;
                    }
                    Some(SessionEvent::SttPartial { text, ts_ms }) => {
                        let _ = out_tx.send(Outbound::Json(TransportMessage::SttPartial { text, ts_ms })).await;
                    }
                    Some(SessionEvent::LlmToken { text, ts_ms }) => {
                        let _ = out_tx.send(Outbound::Json(TransportMessage::LlmToken { text, ts_ms })).await;
                    }
                    Some(SessionEvent::FirstAudioEmitted { .. }) => {
                        fsm.first_audio_emitted();
                    }
                    Some(SessionEvent::TurnEnd { turn_id, durations }) => {
                        let _ = out_tx.send(Outbound::Json(TransportMessage::TurnEnd {
                            turn_id,
                            stt_ms: durations.stt_ms,
                            llm_ms: durations.llm_ms,
                            tts_ms: durations.tts_ms,
                            e2e_ms: durations.e2e_ms,
                        })).await;
                        if let Err(e) = fsm.turn_end(barge_in_this_turn) {
                            break ClosingCause::SessionError(e.to_string());
                        }
                        barge_in_this_turn = false;
                    }
                    Some(SessionEvent::CostMetadata { .. }) => {}
                    Some(SessionEvent::RepeatDetected) => {
                        fsm.record_repeat();
                    }
                    Some(SessionEvent::SessionError(msg)) => {
                        let _ = out_tx.send(Outbound::Json(error_message(
                            &CoreError::BackendUnavailable(msg.clone()),
                        ))).await;
                        break ClosingCause::SessionError(msg);
                    }
                    None => {
                        // Session closed its event stream; treat as a clean end.
                        break ClosingCause::CallEnded;
                    }
                }
            }
            _ = outbound_pump.tick() => {
                while let Some(frame) = bus.outbound.pop() {
                    if let Some(rec) = &recorder {
                        let _ = rec.record(&frame).await;
                    }
                    let _ = out_tx.send(Outbound::Audio(pack_audio_frame(&frame))).await;
                }
            }
        }

        if let Some(cause) = fsm.timed_out() {
            break cause;
        }
    };

    match &closing_cause {
        ClosingCause::CallEnded => fsm.call_ended(),
        other => fsm.session_error((*other).clone()),
    }
    let duration_sec = call_started.elapsed().as_secs_f64();
    fsm.feedback_ready(duration_sec, None).await?;

    if let Some(rec) = &recorder {
        let _ = rec.finalize().await;
    }

    let _ = out_tx
        .send(Outbound::Json(TransportMessage::Bye {
            reason: "call ended".to_owned(),
        }))
        .await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn auth_error(message: &str) -> TransportMessage {
    TransportMessage::Error {
        code: CoreError::Auth(message.to_owned()).code().to_owned(),
        message: message.to_owned(),
    }
}

fn error_message(err: &CoreError) -> TransportMessage {
    TransportMessage::Error {
        code: err.code().to_owned(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_denies_every_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "https://example.com".parse().unwrap());
        assert!(!origin_is_allowed(&headers, &[]));
    }

    #[test]
    fn wildcard_allows_any_origin_including_missing_header() {
        assert!(origin_is_allowed(&HeaderMap::new(), &["*".to_owned()]));
    }

    #[test]
    fn exact_origin_match_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "https://good.example".parse().unwrap());
        let allowed = vec!["https://good.example".to_owned()];
        assert!(origin_is_allowed(&headers, &allowed));

        let mut other = HeaderMap::new();
        other.insert(header::ORIGIN, "https://bad.example".parse().unwrap());
        assert!(!origin_is_allowed(&other, &allowed));
    }
}
