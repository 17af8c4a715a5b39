//! Costing ledger server binary

use anyhow::Context;
use costing_core::{Config, InventoryLedger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting costing ledger server");

    // Load configuration: explicit file first, environment otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        None => Config::from_env().context("loading config from environment")?,
    };
    let verify_on_startup = config.ledger.verify_on_startup;

    // Open ledger
    let ledger = tokio::task::spawn_blocking(move || InventoryLedger::open(config))
        .await?
        .context("opening ledger")?;
    tracing::info!(ledger = ?ledger, "Ledger opened successfully");

    let ledger = if verify_on_startup {
        tokio::task::spawn_blocking(move || {
            let reports = ledger.verify_all()?;
            let inconsistent = reports.iter().filter(|r| !r.is_consistent()).count();
            if inconsistent > 0 {
                tracing::warn!(inconsistent, "Ledger has items that do not refold cleanly");
            }
            Ok::<_, costing_core::Error>(ledger)
        })
        .await?
        .context("verifying ledger")?
    } else {
        ledger
    };

    let stats = ledger.stats()?;
    tracing::info!(
        transactions = stats.total_transactions,
        snapshots = stats.total_snapshots,
        items = stats.total_items,
        "Ledger ready"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down costing ledger server");
    ledger.close()?;
    Ok(())
}
