//! Thompson-sampling policy selector with persisted Beta posteriors
//! (spec.md §4.3 "Bandit").
//!
//! Update rule: the source material describes both a Bernoulli-draw update
//! and a fractional α/β update for the same posterior. This core uses the
//! fractional form — `alpha += p`, `beta += (1-p)` where `p = (reward+1)/2`
//! — because it is deterministic given `(variant, reward)`, which is what
//! makes property S4/S8-style determinism tests meaningful without also
//! seeding the update step's own RNG draw.

use crate::error::Result;
use crate::persist::{read_json_state, write_json_state};
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default Beta prior shape parameters for a newly-registered arm.
pub const PRIOR_ALPHA: f64 = 1.0;
pub const PRIOR_BETA: f64 = 1.0;

/// One arm's posterior state (spec.md §3 "Bandit Arm").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditArm {
    pub variant_id: String,
    pub alpha: f64,
    pub beta: f64,
    pub pulls: u64,
    pub last_reward: Option<f64>,
}

impl BanditArm {
    #[must_use]
    pub fn new(variant_id: String) -> Self {
        Self {
            variant_id,
            alpha: PRIOR_ALPHA,
            beta: PRIOR_BETA,
            pulls: 0,
            last_reward: None,
        }
    }

    /// Empirical mean of the underlying Beta posterior.
    #[must_use]
    pub fn mean_reward_unit(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Mean reward remapped back to the `[-1, 1]` reward scale.
    #[must_use]
    pub fn mean_reward(&self) -> f64 {
        self.mean_reward_unit() * 2.0 - 1.0
    }

    #[must_use]
    pub fn is_uncertain(&self, min_pulls_for_confidence: u64) -> bool {
        self.pulls < min_pulls_for_confidence
    }

    #[must_use]
    pub fn is_blacklist_candidate(&self, min_samples: u64, min_reward: f64) -> bool {
        self.pulls >= min_samples && self.mean_reward() <= min_reward
    }

    /// Fold one reward observation (`[-1, 1]`) into the posterior.
    fn apply_update(&mut self, reward: f64) {
        let p = ((reward + 1.0) / 2.0).clamp(0.0, 1.0);
        self.alpha += p;
        self.beta += 1.0 - p;
        self.pulls += 1;
        self.last_reward = Some(reward);
    }
}

/// On-disk Bandit state document (spec.md §6 "Persisted state layout").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BanditStateDocument {
    version: u32,
    arms: Vec<BanditArm>,
}

/// Thompson-sampling bandit over a set of policy variant arms.
pub struct Bandit {
    state_path: Option<PathBuf>,
    arms: BTreeMap<String, BanditArm>,
    min_pulls_for_confidence: u64,
    blacklist_min_samples: u64,
    blacklist_min_reward: f64,
}

impl Bandit {
    #[must_use]
    pub fn new(
        state_path: Option<PathBuf>,
        min_pulls_for_confidence: u64,
        blacklist_min_samples: u64,
        blacklist_min_reward: f64,
    ) -> Self {
        Self {
            state_path,
            arms: BTreeMap::new(),
            min_pulls_for_confidence,
            blacklist_min_samples,
            blacklist_min_reward,
        }
    }

    /// Load persisted state, if any, initializing any variant ids missing
    /// from the file with a fresh `α=β=1` prior.
    pub fn load_or_init(&mut self, known_variant_ids: &[String]) -> Result<()> {
        if let Some(path) = &self.state_path {
            if let Some(doc) = read_json_state::<BanditStateDocument>(path)? {
                for arm in doc.arms {
                    self.arms.insert(arm.variant_id.clone(), arm);
                }
            }
        }
        for id in known_variant_ids {
            self.arms
                .entry(id.clone())
                .or_insert_with(|| BanditArm::new(id.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn arm(&self, variant_id: &str) -> Option<&BanditArm> {
        self.arms.get(variant_id)
    }

    pub fn arms(&self) -> impl Iterator<Item = &BanditArm> {
        self.arms.values()
    }

    /// Register a brand-new variant id with a fresh prior, if not already present.
    pub fn register_variant(&mut self, variant_id: &str) {
        self.arms
            .entry(variant_id.to_owned())
            .or_insert_with(|| BanditArm::new(variant_id.to_owned()));
    }

    /// Draw from each eligible arm's Beta posterior and return the argmax,
    /// breaking ties by highest pulls then lexicographic id (spec.md §4.3).
    pub fn sample<R: Rng + ?Sized>(&self, eligible_ids: &[String], rng: &mut R) -> Option<String> {
        let mut best: Option<(f64, u64, &str)> = None;
        for id in eligible_ids {
            let Some(arm) = self.arms.get(id) else {
                continue;
            };
            let beta = Beta::new(arm.alpha, arm.beta).ok()?;
            let draw = beta.sample(rng);
            let candidate = (draw, arm.pulls, arm.variant_id.as_str());
            best = Some(match best {
                None => candidate,
                Some(current) => pick_better(current, candidate),
            });
        }
        best.map(|(_, _, id)| id.to_owned())
    }

    /// Fold a reward observation into `variant_id`'s posterior and persist.
    pub fn update(&mut self, variant_id: &str, reward: f64) -> Result<()> {
        let arm = self
            .arms
            .entry(variant_id.to_owned())
            .or_insert_with(|| BanditArm::new(variant_id.to_owned()));
        arm.apply_update(reward.clamp(-1.0, 1.0));
        self.persist()
    }

    #[must_use]
    pub fn is_uncertain(&self, variant_id: &str) -> bool {
        self.arms
            .get(variant_id)
            .is_some_and(|a| a.is_uncertain(self.min_pulls_for_confidence))
    }

    /// Variant ids newly eligible for blacklisting at the current state.
    #[must_use]
    pub fn blacklist_candidates(&self, base_variant_id: &str) -> Vec<String> {
        self.arms
            .values()
            .filter(|a| a.variant_id != base_variant_id)
            .filter(|a| a.is_blacklist_candidate(self.blacklist_min_samples, self.blacklist_min_reward))
            .map(|a| a.variant_id.clone())
            .collect()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let doc = BanditStateDocument {
            version: 1,
            arms: self.arms.values().cloned().collect(),
        };
        write_json_state(path, &doc)
    }

    /// Persist current state immediately. `register_variant` and
    /// `load_or_init` do not persist on their own; maintenance tools that
    /// register variants outside the per-call feedback loop call this
    /// explicitly once they are done.
    pub fn save(&self) -> Result<()> {
        self.persist()
    }
}

/// Tie-break rule: higher draw wins; ties broken by higher pulls, then by
/// lexicographically smaller id.
fn pick_better<'a>(
    a: (f64, u64, &'a str),
    b: (f64, u64, &'a str),
) -> (f64, u64, &'a str) {
    use std::cmp::Ordering;
    match a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal) {
        Ordering::Greater => a,
        Ordering::Less => b,
        Ordering::Equal => {
            if a.1 != b.1 {
                if a.1 > b.1 {
                    a
                } else {
                    b
                }
            } else if a.2 <= b.2 {
                a
            } else {
                b
            }
        }
    }
}

/// Validate the S1-style invariant that every arm stays within its
/// documented bounds (testable property 2).
pub fn arm_invariants_hold(arm: &BanditArm) -> bool {
    arm.alpha >= 1.0 && arm.beta >= 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn fresh_arm_has_prior_one_one() {
        let arm = BanditArm::new("v0".into());
        assert_eq!(arm.alpha, 1.0);
        assert_eq!(arm.beta, 1.0);
        assert_eq!(arm.pulls, 0);
    }

    #[test]
    fn update_increments_pulls_and_moves_posterior_toward_reward() {
        let mut arm = BanditArm::new("v0".into());
        arm.apply_update(1.0);
        assert_eq!(arm.pulls, 1);
        assert!((arm.alpha - 2.0).abs() < 1e-9);
        assert!((arm.beta - 1.0).abs() < 1e-9);

        arm.apply_update(-1.0);
        assert_eq!(arm.pulls, 2);
        assert!((arm.alpha - 2.0).abs() < 1e-9);
        assert!((arm.beta - 2.0).abs() < 1e-9);
    }

    #[test]
    fn invariants_hold_after_updates() {
        let mut arm = BanditArm::new("v0".into());
        for _ in 0..50 {
            arm.apply_update(-0.3);
        }
        assert!(arm_invariants_hold(&arm));
        assert!(arm.pulls == 50);
    }

    #[test]
    fn uncertain_below_min_pulls() {
        let mut arm = BanditArm::new("v0".into());
        assert!(arm.is_uncertain(10));
        for _ in 0..10 {
            arm.apply_update(0.5);
        }
        assert!(!arm.is_uncertain(10));
    }

    #[test]
    fn blacklist_candidate_requires_samples_and_low_mean() {
        let mut arm = BanditArm::new("v3".into());
        for _ in 0..20 {
            arm.apply_update(-0.3);
        }
        assert!(arm.is_blacklist_candidate(20, -0.2));
    }

    #[test]
    fn base_variant_excluded_from_blacklist_candidates() {
        let mut bandit = Bandit::new(None, 10, 20, -0.2);
        bandit.register_variant("base");
        bandit.register_variant("v3");
        for _ in 0..20 {
            bandit.update("base", -0.9).expect("update");
            bandit.update("v3", -0.9).expect("update");
        }
        let candidates = bandit.blacklist_candidates("base");
        assert_eq!(candidates, vec!["v3".to_owned()]);
    }

    #[test]
    fn sample_is_deterministic_given_seed() {
        let mut bandit = Bandit::new(None, 10, 20, -0.2);
        bandit.register_variant("v0");
        bandit.register_variant("v1");
        let ids = vec!["v0".to_owned(), "v1".to_owned()];

        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let first = bandit.sample(&ids, &mut rng_a);
        let second = bandit.sample(&ids, &mut rng_b);
        assert_eq!(first, second);
    }

    #[test]
    fn save_then_load_round_trips_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bandit.json");
        let mut bandit = Bandit::new(Some(path.clone()), 10, 20, -0.2);
        bandit.register_variant("v0");
        bandit.update("v0", 0.5).expect("update");

        let mut reloaded = Bandit::new(Some(path), 10, 20, -0.2);
        reloaded
            .load_or_init(&["v0".to_owned()])
            .expect("load");
        assert_eq!(
            reloaded.arm("v0").unwrap().pulls,
            bandit.arm("v0").unwrap().pulls
        );
    }

    #[test]
    fn empty_eligible_set_returns_none() {
        let bandit = Bandit::new(None, 10, 20, -0.2);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(bandit.sample(&[], &mut rng), None);
    }
}
