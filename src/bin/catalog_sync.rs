//! Catalog sync: loads a policy catalog document and reconciles it against
//! persisted Bandit/Deploy state without starting the gateway (spec.md §6
//! "Policy catalog"). Run after editing the catalog file and before (or
//! instead of) restarting `tom-gatewayd`, whose own boot path performs the
//! same reconciliation implicitly.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tom_voice_core::bandit::Bandit;
use tom_voice_core::config::CoreConfig;
use tom_voice_core::deploy::{DeployGate, TrafficSplit};
use tom_voice_core::model::PolicyCatalogDocument;
use tom_voice_core::startup::init_tracing;

#[derive(Parser)]
#[command(
    name = "tom-catalog-sync",
    version,
    about = "Reconcile a policy catalog document against persisted Bandit/Deploy state"
)]
struct Cli {
    /// Path to the policy catalog JSON document.
    #[arg(short, long)]
    catalog: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the catalog and report variants not yet present in the
    /// persisted Deploy state, without writing anything.
    Diff,
    /// Validate, then register any unregistered variants into the
    /// persisted Bandit/Deploy state.
    Apply,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let text = std::fs::read_to_string(&cli.catalog)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", cli.catalog.display()))?;
    let catalog = PolicyCatalogDocument::parse(&text)?;
    let known_ids: Vec<String> = catalog.variants.iter().map(|v| v.id.clone()).collect();
    let base_id = catalog
        .variants
        .iter()
        .find(|v| v.is_base)
        .map(|v| v.id.clone())
        .expect("PolicyCatalogDocument::parse guarantees exactly one base variant");

    let config = CoreConfig::from_env();

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

    let previously_active: Vec<String> = deploy.active().to_vec();
    let unregistered: Vec<&String> = known_ids
        .iter()
        .filter(|id| !previously_active.contains(id))
        .collect();

    match cli.command {
        Command::Diff => {
            if unregistered.is_empty() {
                println!(
                    "catalog {} matches persisted state: {} variant(s) active, nothing to register",
                    cli.catalog.display(),
                    previously_active.len()
                );
            } else {
                println!("{} variant(s) in the catalog are not yet registered:", unregistered.len());
                for id in unregistered {
                    println!("  + {id}");
                }
            }
        }
        Command::Apply => {
            let to_register = unregistered.len();
            for id in &known_ids {
                deploy.register_new_variant(&mut bandit, id);
            }
            bandit.save()?;
            deploy.save()?;
            println!(
                "registered {to_register} new variant(s); {} active total",
                deploy.active().len()
            );
        }
    }

    Ok(())
}
