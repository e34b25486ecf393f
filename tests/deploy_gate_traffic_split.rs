//! End-to-end coverage of the catalog -> Bandit/Deploy Gate -> Call FSM ->
//! Feedback Store loop, wiring the pieces the way a real gateway would
//! rather than exercising any one of them in isolation.

use async_trait::async_trait;
use std::sync::Arc;
use tom_voice_core::bandit::Bandit;
use tom_voice_core::config::RewardWeights;
use tom_voice_core::deploy::{DeployGate, TrafficSplit};
use tom_voice_core::error::Result as CoreResult;
use tom_voice_core::feedback::FeedbackStore;
use tom_voice_core::fsm::{CallFsm, FsmState, PolicyEngine};
use tom_voice_core::model::{AudioFrame, BackendKind, PolicyCatalogDocument, PolicyVariant};
use tom_voice_core::session::{Session, SessionEvent, SessionStartContext};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;

struct NullSession;

#[async_trait]
impl Session for NullSession {
    async fn start(&self, _ctx: SessionStartContext) -> CoreResult<()> {
        Ok(())
    }
    async fn push_frame(&self, _frame: AudioFrame) -> CoreResult<()> {
        Ok(())
    }
    async fn next_event(&self) -> Option<SessionEvent> {
        None
    }
    async fn stop_output(&self) -> CoreResult<()> {
        Ok(())
    }
    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

const CATALOG_JSON: &str = r#"{
    "variants": [
        {
            "id": "base",
            "is_base": true,
            "parameters": {
                "greeting": "Thanks for calling.",
                "tone": "neutral",
                "length": "short",
                "inquiry_mode": "direct",
                "barge_in_sensitivity": 0.5
            }
        },
        {
            "id": "v1-warm",
            "is_base": false,
            "parameters": {
                "greeting": "Hi there, thanks for reaching out!",
                "tone": "warm",
                "length": "medium",
                "inquiry_mode": "open",
                "barge_in_sensitivity": 0.8
            }
        }
    ]
}"#;

fn variants(catalog: &PolicyCatalogDocument) -> Vec<PolicyVariant> {
    catalog
        .variants
        .iter()
        .map(|entry| PolicyVariant {
            id: entry.id.clone(),
            parameters: entry.parameters.clone(),
            is_base: entry.is_base,
            is_new: false,
            is_uncertain: false,
        })
        .collect()
}

/// Run one call end to end and return the policy variant id the Deploy
/// Gate selected for it.
async fn run_one_call(
    call_id: &str,
    catalog: &[PolicyVariant],
    engine: &Arc<PolicyEngine>,
    feedback_store: &Arc<FeedbackStore>,
    rng_seed: u64,
    reward_duration_sec: f64,
    user_rating: Option<u8>,
) -> String {
    let mut fsm = CallFsm::new(
        call_id.to_owned(),
        feedback_store.clone(),
        engine.clone(),
        Arc::new(NullSession),
        StdRng::seed_from_u64(rng_seed),
    );
    fsm.incoming_call().expect("ringing");
    fsm.call_answered(catalog, BackendKind::Local)
        .await
        .expect("answered");
    let variant_id = fsm
        .descriptor()
        .expect("descriptor set after answered")
        .policy_variant_id
        .clone();
    fsm.greeting_spoken().expect("listening");
    fsm.user_speaking_start_while_listening();
    fsm.user_speaking_end().expect("speaking");
    fsm.turn_end(false).expect("back to listening");
    fsm.call_ended();
    assert_eq!(fsm.state(), FsmState::Closing);
    fsm.feedback_ready(reward_duration_sec, user_rating)
        .await
        .expect("ended");
    assert_eq!(fsm.state(), FsmState::Ended);
    variant_id
}

#[tokio::test]
async fn new_variant_is_explored_then_matures_out_of_uncertainty() {
    let catalog = PolicyCatalogDocument::parse(CATALOG_JSON).expect("parse catalog");
    let known_ids: Vec<String> = catalog.variants.iter().map(|v| v.id.clone()).collect();
    let catalog_variants = variants(&catalog);

    let state_dir = tempfile::tempdir().expect("tempdir");
    let bandit_path = state_dir.path().join("bandit.json");
    let deploy_path = state_dir.path().join("deploy.json");
    let feedback_path = state_dir.path().join("feedback.jsonl");

    let mut bandit = Bandit::new(Some(bandit_path.clone()), 5, 20, -0.2);
    bandit.load_or_init(&known_ids).expect("bandit load_or_init");

    let mut deploy = DeployGate::new(
        Some(deploy_path.clone()),
        "base".to_owned(),
        TrafficSplit {
            new: 1.0,
            uncertain: 1.0,
        },
    );
    deploy.load_or_init().expect("deploy load_or_init");
    deploy.register_new_variant(&mut bandit, "v1-warm");
    assert!(deploy.new_variants().contains(&"v1-warm".to_owned()));

    let feedback_store = Arc::new(FeedbackStore::new(feedback_path));
    let engine = Arc::new(PolicyEngine {
        bandit: Mutex::new(bandit),
        deploy: Mutex::new(deploy),
        reward_weights: RewardWeights::default(),
    });

    // `traffic_split.new == 1.0` forces every call onto the freshly
    // registered variant while it is still in `new_variants`.
    let first_pick = run_one_call(
        "call-1",
        &catalog_variants,
        &engine,
        &feedback_store,
        1,
        120.0,
        Some(5),
    )
    .await;
    assert_eq!(first_pick, "v1-warm");

    {
        let deploy = engine.deploy.lock().await;
        // One observed pull reclassifies the arm out of `new_variants` and
        // into `uncertain_variants` (min_pulls_for_confidence == 5).
        assert!(!deploy.new_variants().contains(&"v1-warm".to_owned()));
        assert!(deploy.uncertain_variants().contains(&"v1-warm".to_owned()));
    }

    // Four more positive-reward calls cross the confidence threshold.
    for seed in 2..6 {
        let pick = run_one_call(
            &format!("call-{seed}"),
            &catalog_variants,
            &engine,
            &feedback_store,
            seed,
            150.0,
            Some(5),
        )
        .await;
        assert_eq!(pick, "v1-warm");
    }

    {
        let bandit = engine.bandit.lock().await;
        let deploy = engine.deploy.lock().await;
        let arm = bandit.arm("v1-warm").expect("arm present");
        assert_eq!(arm.pulls, 5);
        assert!(!deploy.uncertain_variants().contains(&"v1-warm".to_owned()));
        assert!(deploy.active().contains(&"v1-warm".to_owned()));
        assert!(!deploy.blacklist().contains(&"v1-warm".to_owned()));
    }

    // Five feedback events were appended: one per completed call.
    let stats = feedback_store.stats(0).expect("stats");
    assert_eq!(stats.event_count, 5);

    // Persisted state round-trips into fresh instances pointed at the same
    // files, confirming the write-temp-then-rename persistence actually
    // lands the variant's matured posterior on disk.
    let mut reloaded_bandit = Bandit::new(Some(bandit_path), 5, 20, -0.2);
    reloaded_bandit
        .load_or_init(&known_ids)
        .expect("reload bandit");
    assert_eq!(reloaded_bandit.arm("v1-warm").expect("reloaded arm").pulls, 5);

    let mut reloaded_deploy = DeployGate::new(
        Some(deploy_path),
        "base".to_owned(),
        TrafficSplit {
            new: 0.1,
            uncertain: 0.05,
        },
    );
    reloaded_deploy.load_or_init().expect("reload deploy");
    assert!(reloaded_deploy.active().contains(&"v1-warm".to_owned()));
}

#[tokio::test]
async fn persistently_poor_variant_is_blacklisted_and_traffic_falls_back_to_base() {
    let catalog = PolicyCatalogDocument::parse(CATALOG_JSON).expect("parse catalog");
    let known_ids: Vec<String> = catalog.variants.iter().map(|v| v.id.clone()).collect();
    let catalog_variants = variants(&catalog);

    let mut bandit = Bandit::new(None, 5, 10, -0.2);
    bandit.load_or_init(&known_ids).expect("load_or_init");

    let mut deploy = DeployGate::new(
        None,
        "base".to_owned(),
        TrafficSplit {
            new: 1.0,
            uncertain: 1.0,
        },
    );
    deploy.load_or_init().expect("load_or_init");
    deploy.register_new_variant(&mut bandit, "v1-warm");

    let feedback_dir = tempfile::tempdir().expect("tempdir");
    let feedback_store = Arc::new(FeedbackStore::new(feedback_dir.path().join("feedback.jsonl")));
    let engine = Arc::new(PolicyEngine {
        bandit: Mutex::new(bandit),
        deploy: Mutex::new(deploy),
        reward_weights: RewardWeights::default(),
    });

    // Ten calls rated poorly and running far past the duration bonus
    // center drive the reward negative enough to cross the blacklist
    // threshold (low rating plus a heavily over-long call each clip to
    // their worst term).
    for seed in 0..10 {
        run_one_call(
            &format!("call-{seed}"),
            &catalog_variants,
            &engine,
            &feedback_store,
            seed,
            10_000.0,
            Some(1),
        )
        .await;
    }

    {
        let deploy = engine.deploy.lock().await;
        assert!(deploy.blacklist().contains(&"v1-warm".to_owned()));
        assert!(!deploy.active().contains(&"v1-warm".to_owned()));
        // Base survives blacklisting unconditionally.
        assert!(deploy.active().contains(&"base".to_owned()));
        assert!(!deploy.blacklist().contains(&"base".to_owned()));
    }

    // With `v1-warm` blacklisted, every subsequent selection must fall back
    // to `base` even though the traffic split still favors exploration.
    let pick = run_one_call(
        "call-final",
        &catalog_variants,
        &engine,
        &feedback_store,
        99,
        10_000.0,
        Some(1),
    )
    .await;
    assert_eq!(pick, "base");
}
