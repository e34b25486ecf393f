//! Wire formats for the gateway's WebSocket transport (spec.md §6).
//!
//! Two independent encodings share one socket: binary audio frames carry a
//! fixed 12-byte header ahead of raw PCM, and everything else is a single
//! tagged JSON object per axum text message.

use crate::model::AudioFrame;
use serde::{Deserialize, Serialize};

/// Binary frame kind tag (header byte 1). Only `Audio` is defined today;
/// the byte is reserved so a future kind doesn't require a header-shape
/// change.
pub const FRAME_KIND_AUDIO: u8 = 1;

/// Current binary header version (header byte 0).
pub const FRAME_VERSION: u8 = 1;

/// Fixed header length ahead of raw PCM16 payload in a binary message:
/// `version:u8, kind:u8, reserved:u16, seq:u32, ts_ms:u32`.
pub const FRAME_HEADER_LEN: usize = 12;

/// Pack one inbound/outbound [`AudioFrame`] into its wire form: a 12-byte
/// header followed by little-endian PCM16 samples.
#[must_use]
pub fn pack_audio_frame(frame: &AudioFrame) -> Vec<u8> {
    let pcm = frame.to_pcm_bytes();
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + pcm.len());
    out.push(FRAME_VERSION);
    out.push(FRAME_KIND_AUDIO);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(frame.seq as u32).to_le_bytes());
    out.extend_from_slice(&frame.ts_ms.to_le_bytes());
    out.extend_from_slice(&pcm);
    out
}

/// Unpack a binary message into an [`AudioFrame`]. Returns `None` on a
/// header that is too short, carries an unsupported version, or is not
/// tagged as audio.
#[must_use]
pub fn unpack_audio_frame(bytes: &[u8]) -> Option<AudioFrame> {
    if bytes.len() < FRAME_HEADER_LEN {
        return None;
    }
    let version = bytes[0];
    let kind = bytes[1];
    if version != FRAME_VERSION || kind != FRAME_KIND_AUDIO {
        return None;
    }
    let seq = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let ts_ms = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    AudioFrame::from_pcm_bytes(u64::from(seq), ts_ms, &bytes[FRAME_HEADER_LEN..])
}

/// The JSON-tagged control message set carried over the WebSocket's text
/// frames (spec.md §6). Field `type` carries the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportMessage {
    /// Client -> server: opens a call. The bearer token is carried out of
    /// band (query parameter or header, spec.md §6 "Authentication"), not
    /// in this payload.
    Hello { call_id: String, profile: String },
    /// Either direction: graceful close.
    Bye { reason: String },
    SttPartial { text: String, ts_ms: u32 },
    SttFinal { text: String, ts_ms: u32 },
    LlmToken { text: String, ts_ms: u32 },
    TurnEnd {
        turn_id: u64,
        stt_ms: u64,
        llm_ms: u64,
        tts_ms: u64,
        e2e_ms: u64,
    },
    /// Server -> client: the session stopped TTS output for a user interrupt.
    BargeIn { ts_ms: u32 },
    Ping,
    Pong,
    /// A stable, spec-table error code (spec.md §7) plus a human message.
    Error { code: String, message: String },
}
