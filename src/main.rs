//! Evidence Chain of Custody service
//!
//! Serves the capture / verify boundary over HTTP for the demo backends.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use custody_chain::server::run_server;
use custody_chain::utils::init_logging;
use custody_chain::{Collector, CollectorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = CollectorConfig::from_env()?;
    let _log_guard = init_logging(config.log_dir.as_deref())?;

    println!("\n{}", "═".repeat(60));
    println!("⛓️  Evidence Chain of Custody v{}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", "═".repeat(60));

    let collector = Arc::new(
        Collector::open(config)
            .await
            .context("Failed to open evidence collector")?,
    );

    // Replay once at startup so a damaged ledger is visible immediately.
    let outcome = collector.verify_chain().await.context("Startup verification could not read the ledger")?;
    if outcome.verified {
        info!("Startup verification passed ({} entries)", outcome.entries);
    } else {
        warn!(
            "Startup verification FAILED at #{:?}: {}",
            outcome.first_failure,
            outcome.reason.as_deref().unwrap_or("unknown")
        );
    }

    let orphans = collector.orphaned_evidence().await?;
    if !orphans.is_empty() {
        warn!("{} evidence blob(s) are not referenced by the ledger", orphans.len());
    }

    run_server(collector).await
}
