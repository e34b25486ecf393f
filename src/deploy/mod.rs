//! Traffic-split and blacklist wrapper over the Bandit (spec.md §4.4
//! "Deploy Gate").

use crate::bandit::Bandit;
use crate::error::Result;
use crate::persist::{read_json_state, write_json_state};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Exploration probabilities for new/uncertain variants (spec.md §4.4).
#[derive(Debug, Clone, Copy)]
pub struct TrafficSplit {
    pub new: f64,
    pub uncertain: f64,
}

/// On-disk Deploy state document (spec.md §6 "Persisted state layout").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeployStateDocument {
    version: u32,
    active: Vec<String>,
    blacklist: Vec<String>,
    new_variants: Vec<String>,
    uncertain_variants: Vec<String>,
    base_variant_id: String,
}

/// Ordered variant-id sets plus the base variant (spec.md §3 "Deploy State").
pub struct DeployGate {
    state_path: Option<PathBuf>,
    active: Vec<String>,
    blacklist: Vec<String>,
    new_variants: Vec<String>,
    uncertain_variants: Vec<String>,
    base_variant_id: String,
    traffic_split: TrafficSplit,
}

impl DeployGate {
    #[must_use]
    pub fn new(
        state_path: Option<PathBuf>,
        base_variant_id: String,
        traffic_split: TrafficSplit,
    ) -> Self {
        Self {
            state_path,
            active: vec![base_variant_id.clone()],
            blacklist: Vec::new(),
            new_variants: Vec::new(),
            uncertain_variants: Vec::new(),
            base_variant_id,
            traffic_split,
        }
    }

    /// Load persisted state if present; otherwise keep the freshly-seeded
    /// base-only state built by [`DeployGate::new`].
    pub fn load_or_init(&mut self) -> Result<()> {
        if let Some(path) = &self.state_path {
            if let Some(doc) = read_json_state::<DeployStateDocument>(path)? {
                self.active = doc.active;
                self.blacklist = doc.blacklist;
                self.new_variants = doc.new_variants;
                self.uncertain_variants = doc.uncertain_variants;
                self.base_variant_id = doc.base_variant_id;
            }
        }
        self.ensure_base_active();
        Ok(())
    }

    fn ensure_base_active(&mut self) {
        if !self.active.contains(&self.base_variant_id) {
            self.active.push(self.base_variant_id.clone());
        }
        self.blacklist.retain(|id| id != &self.base_variant_id);
    }

    /// Register a catalog id not yet known to this state: added to `active`
    /// and `new_variants`, initialized in the Bandit with a fresh prior
    /// (spec.md §6 "Policy catalog").
    pub fn register_new_variant(&mut self, bandit: &mut Bandit, variant_id: &str) {
        if self.active.iter().any(|id| id == variant_id) {
            return;
        }
        self.active.push(variant_id.to_owned());
        self.new_variants.push(variant_id.to_owned());
        bandit.register_variant(variant_id);
    }

    #[must_use]
    pub fn active(&self) -> &[String] {
        &self.active
    }

    #[must_use]
    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    #[must_use]
    pub fn base_variant_id(&self) -> &str {
        &self.base_variant_id
    }

    #[must_use]
    pub fn new_variants(&self) -> &[String] {
        &self.new_variants
    }

    #[must_use]
    pub fn uncertain_variants(&self) -> &[String] {
        &self.uncertain_variants
    }

    fn eligible(&self) -> Vec<String> {
        self.active
            .iter()
            .filter(|id| !self.blacklist.contains(id))
            .cloned()
            .collect()
    }

    /// Select a policy variant for a new call (spec.md §4.4 steps 1-4).
    pub fn select<R: Rng + ?Sized>(&self, bandit: &Bandit, rng: &mut R) -> String {
        let active_new: Vec<String> = self
            .new_variants
            .iter()
            .filter(|id| self.active.contains(id) && !self.blacklist.contains(id))
            .cloned()
            .collect();
        let active_uncertain: Vec<String> = self
            .uncertain_variants
            .iter()
            .filter(|id| self.active.contains(id) && !self.blacklist.contains(id))
            .cloned()
            .collect();

        if !active_new.is_empty() && rng.gen_bool(self.traffic_split.new) {
            let idx = rng.gen_range(0..active_new.len());
            return active_new[idx].clone();
        }
        if !active_uncertain.is_empty() && rng.gen_bool(self.traffic_split.uncertain) {
            let idx = rng.gen_range(0..active_uncertain.len());
            return active_uncertain[idx].clone();
        }
        bandit
            .sample(&self.eligible(), rng)
            .unwrap_or_else(|| self.base_variant_id.clone())
    }

    /// Feed one reward observation to the Bandit, then sweep for newly
    /// eligible blacklist candidates and reclassify uncertain/new variants
    /// that have crossed the confidence threshold.
    pub fn record_feedback(&mut self, bandit: &mut Bandit, variant_id: &str, reward: f64) -> Result<()> {
        bandit.update(variant_id, reward)?;
        self.reclassify(bandit);

        for candidate in bandit.blacklist_candidates(&self.base_variant_id) {
            if !self.blacklist.contains(&candidate) {
                self.blacklist.push(candidate.clone());
            }
            self.active.retain(|id| id != &candidate);
        }
        self.ensure_base_active();
        self.persist()
    }

    fn reclassify(&mut self, bandit: &Bandit) {
        self.new_variants.retain(|id| {
            bandit
                .arm(id)
                .map(|a| a.pulls == 0)
                .unwrap_or(true)
        });
        self.uncertain_variants.clear();
        for id in &self.active {
            if id == &self.base_variant_id {
                continue;
            }
            if self.new_variants.contains(id) {
                continue;
            }
            if bandit.is_uncertain(id) {
                self.uncertain_variants.push(id.clone());
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let doc = DeployStateDocument {
            version: 1,
            active: self.active.clone(),
            blacklist: self.blacklist.clone(),
            new_variants: self.new_variants.clone(),
            uncertain_variants: self.uncertain_variants.clone(),
            base_variant_id: self.base_variant_id.clone(),
        };
        write_json_state(path, &doc)
    }

    /// Persist current state immediately. `register_new_variant` does not
    /// persist on its own; maintenance tools call this explicitly once
    /// they are done registering.
    pub fn save(&self) -> Result<()> {
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn split(new: f64, uncertain: f64) -> TrafficSplit {
        TrafficSplit { new, uncertain }
    }

    #[test]
    fn base_always_active_never_blacklisted() {
        let mut gate = DeployGate::new(None, "base".into(), split(0.10, 0.05));
        let mut bandit = Bandit::new(None, 10, 20, -0.2);
        bandit.register_variant("base");
        for _ in 0..50 {
            gate.record_feedback(&mut bandit, "base", -1.0).expect("record");
        }
        assert!(gate.active().contains(&"base".to_owned()));
        assert!(!gate.blacklist().contains(&"base".to_owned()));
    }

    #[test]
    fn blacklisted_variant_leaves_active_set() {
        let mut gate = DeployGate::new(None, "base".into(), split(0.10, 0.05));
        let mut bandit = Bandit::new(None, 10, 20, -0.2);
        bandit.register_variant("base");
        gate.register_new_variant(&mut bandit, "v3");

        for _ in 0..20 {
            gate.record_feedback(&mut bandit, "v3", -0.3).expect("record");
        }
        assert!(gate.blacklist().contains(&"v3".to_owned()));
        assert!(!gate.active().contains(&"v3".to_owned()));

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let picked = gate.select(&bandit, &mut rng);
            assert_ne!(picked, "v3");
        }
    }

    #[test]
    fn zero_eligible_arms_returns_base() {
        let gate = DeployGate::new(None, "base".into(), split(0.0, 0.0));
        let bandit = Bandit::new(None, 10, 20, -0.2);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(gate.select(&bandit, &mut rng), "base");
    }

    #[test]
    fn selection_is_deterministic_given_seed_and_state() {
        let mut gate = DeployGate::new(None, "base".into(), split(0.10, 0.05));
        let mut bandit = Bandit::new(None, 10, 20, -0.2);
        bandit.register_variant("base");
        gate.register_new_variant(&mut bandit, "v1");

        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let seq_a: Vec<String> = (0..50).map(|_| gate.select(&bandit, &mut rng_a)).collect();
        let seq_b: Vec<String> = (0..50).map(|_| gate.select(&bandit, &mut rng_b)).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn save_then_load_round_trips_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deploy.json");
        let mut bandit = Bandit::new(None, 10, 20, -0.2);
        bandit.register_variant("base");

        let mut gate = DeployGate::new(Some(path.clone()), "base".into(), split(0.1, 0.05));
        gate.register_new_variant(&mut bandit, "v1");
        gate.record_feedback(&mut bandit, "v1", 0.5).expect("record");

        let mut reloaded = DeployGate::new(Some(path), "base".into(), split(0.1, 0.05));
        reloaded.load_or_init().expect("load");
        assert!(reloaded.active().contains(&"v1".to_owned()));
    }
}
