mod support {
    pub mod network;
}

use anyhow::Result;
use assert_cmd::Command;
use bridge_swap::swap::{Direction, SwapRequest};
use predicates::prelude::*;
use rust_decimal_macros::dec;

use support::network::Harness;

fn cli(h: &Harness) -> Result<Command> {
    let mut cmd = Command::cargo_bin("swap_cli")?;
    cmd.arg("--ledger-path").arg(&h.ledger_path);
    Ok(cmd)
}

#[tokio::test]
async fn cli_reads_swaps_from_the_ledger() -> Result<()> {
    let h = Harness::new(dec!(10), dec!(0))?;
    let record = h
        .orchestrator
        .execute(SwapRequest::new(Direction::Buy, dec!(1)))
        .await?;

    cli(&h)?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(record.request_id.as_str()))
        .stdout(predicate::str::contains(r#""phase": "completed""#));

    cli(&h)?
        .args(["get", "--request-id", &record.request_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""direction": "buy""#))
        .stdout(predicate::str::contains(r#""result_amount": "1""#));

    cli(&h)?
        .args(["history", "--request-id", &record.request_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""phase": "attestation_pending""#));

    cli(&h)?
        .args(["last-completed", "--direction", "buy"])
        .assert()
        .success()
        .stdout(predicate::str::contains(record.request_id.as_str()));

    cli(&h)?
        .args(["last-completed", "--direction", "sell"])
        .assert()
        .success()
        .stdout(predicate::str::diff("null\n"));

    cli(&h)?
        .arg("in-flight")
        .assert()
        .success()
        .stdout(predicate::str::diff("null\n"));
    Ok(())
}

#[tokio::test]
async fn cli_reports_unknown_swaps_and_bad_input() -> Result<()> {
    let h = Harness::new(dec!(10), dec!(0))?;

    cli(&h)?
        .args(["get", "--request-id", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("swap not found: missing"));

    cli(&h)?
        .args(["last-completed", "--direction", "sideways"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown direction"));

    Command::cargo_bin("swap_cli")?
        .args(["--ledger-path", "/nonexistent/ledger.sqlite3", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
    Ok(())
}
