//! Process bootstrap: tracing init, policy catalog load, and construction
//! of the process-wide [`PolicyEngine`] singleton (spec.md §9 "Module-level
//! globals for bandit/deploy" redesign flag — an explicitly owned handle
//! constructed at boot and passed by reference, not a global).

use crate::bandit::Bandit;
use crate::config::CoreConfig;
use crate::deploy::{DeployGate, TrafficSplit};
use crate::error::Result;
use crate::feedback::FeedbackStore;
use crate::fsm::PolicyEngine;
use crate::model::{PolicyCatalogDocument, PolicyParameters, PolicyVariant};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. Reads `RUST_LOG`, defaulting to
/// `info` for this crate and `warn` for dependencies. Call once at process
/// start, before any component logs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn,hyper=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// The catalog this core falls back to when no `POLICY_CATALOG_PATH` is
/// configured: a single always-eligible base variant, matching spec.md §3
/// "exactly one variant is `is_base`".
#[must_use]
pub fn default_catalog() -> PolicyCatalogDocument {
    PolicyCatalogDocument {
        variants: vec![crate::model::CatalogEntry {
            id: "base".to_owned(),
            parameters: PolicyParameters {
                greeting: "Hello, how can I help you today?".to_owned(),
                tone: "neutral".to_owned(),
                length: "medium".to_owned(),
                inquiry_mode: "open".to_owned(),
                barge_in_sensitivity: 0.5,
            },
            is_base: true,
        }],
    }
}

/// Load the policy catalog from `POLICY_CATALOG_PATH`, falling back to
/// [`default_catalog`] if unset or unreadable (spec.md §6 "Policy catalog").
pub fn load_catalog() -> Result<PolicyCatalogDocument> {
    match std::env::var_os("POLICY_CATALOG_PATH") {
        Some(path) => {
            let text = std::fs::read_to_string(&path).map_err(crate::error::CoreError::Io)?;
            PolicyCatalogDocument::parse(&text)
        }
        None => Ok(default_catalog()),
    }
}

/// Process-wide dependencies constructed once at boot and handed to the
/// Gateway (spec.md §9 "init(config) -> handle / shutdown(handle)
/// lifecycle").
pub struct CoreHandle {
    pub config: CoreConfig,
    pub policy_engine: Arc<PolicyEngine>,
    pub feedback_store: Arc<FeedbackStore>,
    pub catalog: Vec<PolicyVariant>,
}

impl CoreHandle {
    /// Validate configuration, load the policy catalog, initialize (or
    /// load persisted) Bandit/Deploy state, and register any catalog ids
    /// the persisted state has not seen before.
    pub fn init(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let catalog_doc = load_catalog()?;
        let base_id = catalog_doc
            .variants
            .iter()
            .find(|v| v.is_base)
            .map(|v| v.id.clone())
            .ok_or_else(|| {
                crate::error::CoreError::Validation("catalog has no base variant".to_owned())
            })?;

        let known_ids: Vec<String> = catalog_doc.variants.iter().map(|v| v.id.clone()).collect();

        let mut bandit = Bandit::new(
            Some(config.bandit.state_path.clone()),
            u64::from(config.bandit.min_pulls_for_confidence),
            u64::from(config.bandit.blacklist_min_samples),
            config.bandit.blacklist_min_reward,
        );
        bandit.load_or_init(&known_ids)?;

        let mut deploy = DeployGate::new(
            Some(config.deploy.state_path.clone()),
            base_id,
            TrafficSplit {
                new: config.deploy.traffic_split_new,
                uncertain: config.deploy.traffic_split_uncertain,
            },
        );
        deploy.load_or_init()?;
        for id in &known_ids {
            deploy.register_new_variant(&mut bandit, id);
        }

        let new_variants: Vec<String> = deploy.new_variants().to_vec();
        let uncertain_variants: Vec<String> = deploy.uncertain_variants().to_vec();

        let policy_engine = Arc::new(PolicyEngine {
            bandit: tokio::sync::Mutex::new(bandit),
            deploy: tokio::sync::Mutex::new(deploy),
            reward_weights: config.reward.clone(),
        });

        let catalog: Vec<PolicyVariant> = catalog_doc
            .variants
            .into_iter()
            .map(|entry| PolicyVariant {
                is_new: new_variants.contains(&entry.id),
                is_uncertain: uncertain_variants.contains(&entry.id),
                id: entry.id.clone(),
                parameters: entry.parameters,
                is_base: entry.is_base,
            })
            .collect();

        let feedback_store = Arc::new(FeedbackStore::new(config.feedback.state_path.clone()));

        Ok(Self {
            config,
            policy_engine,
            feedback_store,
            catalog,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_has_exactly_one_base_variant() {
        let doc = default_catalog();
        assert!(doc.validate().is_ok());
        assert_eq!(doc.variants.iter().filter(|v| v.is_base).count(), 1);
    }

    #[test]
    fn core_handle_init_succeeds_with_default_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = CoreConfig::default();
        config.bandit.state_path = dir.path().join("bandit.json");
        config.deploy.state_path = dir.path().join("deploy.json");
        config.recorder.dir = dir.path().to_path_buf();
        config.feedback.state_path = dir.path().join("feedback.jsonl");

        let handle = CoreHandle::init(config).expect("init");
        assert_eq!(handle.catalog.len(), 1);
        assert!(handle.catalog[0].is_base);
    }
}
