//! Operator CLI for the evidence chain.
//!
//! Usage:
//!   chain_cli [--dir <path>] capture <type> <application> <severity> [metadata-json]
//!   chain_cli [--dir <path>] verify
//!   chain_cli [--dir <path>] list [--min-severity <sev>] [--limit <n>]
//!   chain_cli [--dir <path>] show <incident_id>
//!   chain_cli [--dir <path>] orphans
//!   chain_cli [--dir <path>] demo

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;

use custody_chain::evidence::collector::IncidentQuery;
use custody_chain::{Collector, CollectorConfig, Severity};

const USAGE: &str = "usage: chain_cli [--dir <path>] <capture|verify|list|show|orphans|demo> [args...]";

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    match args.iter().position(|a| a == flag) {
        Some(i) => {
            if i + 1 >= args.len() {
                bail!("{} needs a value", flag);
            }
            let value = args.remove(i + 1);
            args.remove(i);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("custody_chain=warn")),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = match take_flag(&mut args, "--dir")? {
        Some(dir) => CollectorConfig::in_dir(dir),
        None => CollectorConfig::from_env()?,
    };

    let Some(command) = (!args.is_empty()).then(|| args.remove(0)) else {
        bail!(USAGE);
    };

    let collector = Collector::open(config).await.context("Failed to open evidence collector")?;

    match command.as_str() {
        "capture" => {
            if args.len() < 3 {
                bail!("usage: chain_cli capture <type> <application> <severity> [metadata-json]");
            }
            let severity: Severity = args[2].parse()?;
            let metadata = match args.get(3) {
                Some(text) => serde_json::from_str(text).context("metadata must be JSON")?,
                None => json!({}),
            };
            let receipt = collector.capture_incident(&args[0], &args[1], severity, metadata).await?;
            print_json(&receipt)?;
        }
        "verify" => {
            let outcome = collector.verify_chain().await?;
            print_json(&outcome)?;
            if !outcome.verified {
                std::process::exit(2);
            }
        }
        "list" => {
            let min_severity = take_flag(&mut args, "--min-severity")?
                .map(|s| s.parse::<Severity>())
                .transpose()?;
            let limit = take_flag(&mut args, "--limit")?
                .map(|n| n.parse::<usize>())
                .transpose()
                .context("--limit must be a number")?;
            let entries = collector.list_incidents(&IncidentQuery { min_severity, limit }).await?;
            print_json(&entries)?;
        }
        "show" => {
            let Some(id) = args.first() else {
                bail!("usage: chain_cli show <incident_id>");
            };
            print_json(&collector.get_incident(id).await?)?;
        }
        "orphans" => {
            print_json(&collector.orphaned_evidence().await?)?;
        }
        "demo" => {
            // The three incidents the trading and manufacturing demos raise.
            let incidents = [
                (
                    "FDA_VALIDATION_FAILURE",
                    "lims-backend",
                    Severity::Critical,
                    json!({"regulation": "21 CFR Part 11", "batch": "LOT-2291", "test": "dissolution"}),
                ),
                (
                    "SOX_COMPLIANCE_ALERT",
                    "finance-trading",
                    Severity::High,
                    json!({"amount": "$1,247,892.00"}),
                ),
                (
                    "GMP_DEVIATION",
                    "pharma-manufacturing",
                    Severity::High,
                    json!({"duration": "47 minutes"}),
                ),
            ];
            let mut receipts = Vec::new();
            for (kind, app, severity, metadata) in incidents {
                receipts.push(collector.capture_incident(kind, app, severity, metadata).await?);
            }
            print_json(&receipts)?;
            print_json(&collector.verify_chain().await?)?;
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }

    Ok(())
}
