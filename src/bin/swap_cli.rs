use std::path::PathBuf;

use anyhow::{Context as _, Result};
use bridge_swap::swap::store::{SqliteTradeLedger, TradeLedger as _};
use bridge_swap::swap::{Direction, SwapRecord};
use clap::{Parser as _, Subcommand};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "data/ledger.sqlite3")]
    ledger_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Latest snapshot of one swap.
    Get {
        #[arg(long)]
        request_id: String,
    },
    /// Every snapshot of one swap, oldest first.
    History {
        #[arg(long)]
        request_id: String,
    },
    List,
    InFlight,
    LastCompleted {
        #[arg(long)]
        direction: Direction,
    },
}

fn main() -> Result<()> {
    bridge_swap::logging::init().ok();
    let args = Args::parse();

    anyhow::ensure!(
        args.ledger_path.exists(),
        "ledger {} does not exist",
        args.ledger_path.display()
    );
    let ledger = SqliteTradeLedger::open(args.ledger_path).context("open ledger")?;

    let out = match args.command {
        Command::Get { request_id } => {
            let record = ledger
                .get_latest(&request_id)?
                .with_context(|| format!("swap not found: {request_id}"))?;
            record_json(&record)
        }
        Command::History { request_id } => {
            let history = ledger.history(&request_id)?;
            anyhow::ensure!(!history.is_empty(), "swap not found: {request_id}");
            json!(history.iter().map(record_json).collect::<Vec<_>>())
        }
        Command::List => {
            let records = ledger.list_latest()?;
            json!(records.iter().map(record_json).collect::<Vec<_>>())
        }
        Command::InFlight => match ledger.in_flight()? {
            Some(record) => record_json(&record),
            None => serde_json::Value::Null,
        },
        Command::LastCompleted { direction } => match ledger.get_latest_completed(direction)? {
            Some(record) => record_json(&record),
            None => serde_json::Value::Null,
        },
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn record_json(record: &SwapRecord) -> serde_json::Value {
    json!({
      "request_id": record.request_id,
      "direction": record.direction.as_str(),
      "amount": record.amount.to_string(),
      "phase": record.phase.as_str(),
      "failure_reason": record.phase.failure_reason().map(|r| r.as_str()),
      "source_tx_id": record.source_tx_id.as_ref().map(|t| t.as_str()),
      "sequence": record.sequence,
      "attestation_key": record.attestation.as_ref().map(|a| a.key.to_string()),
      "dest_tx_id": record.dest_tx_id.as_ref().map(|t| t.as_str()),
      "result_amount": record.result_amount.map(|a| a.to_string()),
      "started_at": record.started_at.to_rfc3339(),
      "updated_at": record.updated_at.to_rfc3339(),
      "error": record.error,
    })
}
