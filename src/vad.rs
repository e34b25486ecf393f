//! Voice activity detection using energy-based analysis (spec.md §4.6
//! "Local Session — VAD").
//!
//! RMS energy thresholding over 20 ms frames. Start-of-speech fires once
//! energy has stayed above threshold for `min_speech_ms` (default 120 ms);
//! end-of-speech fires after `min_silence_ms` (default 400 ms) of
//! sub-threshold energy. The threshold itself scales with a policy
//! variant's `barge_in_sensitivity` (higher sensitivity -> lower threshold,
//! so speech is recognized sooner).

use crate::model::AudioFrame;

/// VAD tuning derived from a policy variant's `barge_in_sensitivity`
/// (spec.md §3 "Policy Variant").
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// Base RMS energy threshold before sensitivity scaling, `[0, 1]`.
    pub base_threshold: f32,
    pub min_speech_ms: u32,
    pub min_silence_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            base_threshold: 0.02,
            min_speech_ms: 120,
            min_silence_ms: 400,
        }
    }
}

impl VadConfig {
    /// Scale the base threshold by a variant's `barge_in_sensitivity`
    /// (`0.0` = least sensitive, `1.0` = most sensitive).
    #[must_use]
    pub fn with_sensitivity(mut self, barge_in_sensitivity: f32) -> Self {
        let sensitivity = barge_in_sensitivity.clamp(0.0, 1.0);
        self.base_threshold *= 1.0 - 0.8 * sensitivity;
        self
    }
}

/// Events a VAD pass over one frame can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    UserSpeakingStart,
    UserSpeakingEnd,
}

/// Streaming energy-based voice activity detector.
pub struct EnergyVad {
    config: VadConfig,
    frame_ms: u32,
    in_speech: bool,
    above_threshold_ms: u32,
    below_threshold_ms: u32,
}

impl EnergyVad {
    #[must_use]
    pub fn new(config: VadConfig, frame_ms: u32) -> Self {
        Self {
            config,
            frame_ms,
            in_speech: false,
            above_threshold_ms: 0,
            below_threshold_ms: 0,
        }
    }

    #[must_use]
    pub fn is_user_speaking(&self) -> bool {
        self.in_speech
    }

    /// Feed one frame and return an edge event, if the running state just
    /// crossed a start/end-of-speech boundary.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let energy = frame.rms_energy();
        let is_loud = energy > self.config.base_threshold;

        if is_loud {
            self.below_threshold_ms = 0;
            self.above_threshold_ms = self.above_threshold_ms.saturating_add(self.frame_ms);
            if !self.in_speech && self.above_threshold_ms >= self.config.min_speech_ms {
                self.in_speech = true;
                return Some(VadEvent::UserSpeakingStart);
            }
        } else {
            self.above_threshold_ms = 0;
            if self.in_speech {
                self.below_threshold_ms = self.below_threshold_ms.saturating_add(self.frame_ms);
                if self.below_threshold_ms >= self.config.min_silence_ms {
                    self.in_speech = false;
                    self.below_threshold_ms = 0;
                    return Some(VadEvent::UserSpeakingEnd);
                }
            }
        }
        None
    }

    /// Reset all running state, e.g. at the start of a new turn.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.above_threshold_ms = 0;
        self.below_threshold_ms = 0;
    }
}
