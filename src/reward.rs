//! Reward Calculator (spec.md §4.5): a pure function from call signals to a
//! scalar reward in `[-1, 1]`.

use crate::config::RewardWeights;
use serde::{Deserialize, Serialize};

/// Raw per-call signals the Reward Calculator folds into a scalar (spec.md
/// §3 "Feedback Event" `signals`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RewardSignals {
    pub resolution: bool,
    /// `1..=5`, or `None` if the caller never rated the call.
    pub user_rating: Option<u8>,
    pub barge_in_count: u32,
    pub repeats: u32,
    pub handover: bool,
    pub duration_sec: f64,
}

impl RewardSignals {
    /// Signals with every field at its documented neutral default (spec.md
    /// §4.5 "Missing signals default to neutral").
    #[must_use]
    pub fn neutral(weights: &RewardWeights) -> Self {
        Self {
            resolution: false,
            user_rating: None,
            barge_in_count: 0,
            repeats: 0,
            handover: false,
            duration_sec: weights.duration_bonus_center_sec,
        }
    }
}

/// Per-term contribution breakdown for diagnostics (spec.md §4.5 "emits, on
/// request, a per-term breakdown").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub resolution_term: f64,
    pub rating_term: f64,
    pub barge_in_term: f64,
    pub repeats_term: f64,
    pub handover_term: f64,
    pub duration_term: f64,
    /// Sum of the terms above, before clipping to `[-1, 1]`.
    pub raw_total: f64,
    /// `raw_total` clipped to `[-1, 1]`; this is the value fed to the Bandit.
    pub reward: f64,
}

/// Compute the scalar reward for one call's signals.
#[must_use]
pub fn compute_reward(signals: &RewardSignals, weights: &RewardWeights) -> RewardBreakdown {
    let resolution_term = weights.resolution * f64::from(signals.resolution);

    let rating_term = signals
        .user_rating
        .map(|r| weights.rating * ((f64::from(r) - 3.0) / 2.0))
        .unwrap_or(0.0);

    let barge_in_term = -weights.barge_in * (f64::from(signals.barge_in_count.min(3)) / 3.0);
    let repeats_term = -weights.repeats * (f64::from(signals.repeats.min(3)) / 3.0);
    let handover_term = -weights.handover * f64::from(signals.handover);

    let duration_raw = (weights.duration_bonus_center_sec - signals.duration_sec)
        / weights.duration_bonus_center_sec;
    let duration_term = duration_raw.clamp(-weights.duration_bonus_clip, weights.duration_bonus_clip);

    let raw_total = resolution_term
        + rating_term
        + barge_in_term
        + repeats_term
        + handover_term
        + duration_term;
    let reward = raw_total.clamp(-1.0, 1.0);

    RewardBreakdown {
        resolution_term,
        rating_term,
        barge_in_term,
        repeats_term,
        handover_term,
        duration_term,
        raw_total,
        reward,
    }
}
