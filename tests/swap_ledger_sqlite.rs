use anyhow::{Context as _, Result};
use bridge_swap::bridge::{Attestation, AttestationKey, EmitterAddress};
use bridge_swap::chain::TxId;
use bridge_swap::swap::store::{SqliteTradeLedger, TradeLedger as _};
use bridge_swap::swap::{Direction, FailureReason, SwapPhase, SwapRecord, SwapRequest};
use rust_decimal_macros::dec;

fn advance(
    ledger: &mut SqliteTradeLedger,
    record: &mut SwapRecord,
    phase: SwapPhase,
    update: impl FnOnce(&mut SwapRecord),
) -> Result<()> {
    update(record);
    record.advance(phase)?;
    ledger
        .append(record)
        .with_context(|| format!("append {phase}"))
}

fn run_to_completion(ledger: &mut SqliteTradeLedger, request: &SwapRequest) -> Result<SwapRecord> {
    let mut record = SwapRecord::initiated(request);
    ledger.append(&record).context("append initiated")?;
    advance(ledger, &mut record, SwapPhase::SourceSubmitted, |r| {
        r.source_tx_id = Some(TxId::new(format!("src-{}", request.request_id)));
    })?;
    advance(ledger, &mut record, SwapPhase::SourceConfirmed, |_| {})?;
    advance(ledger, &mut record, SwapPhase::SequenceObtained, |r| {
        r.sequence = Some(11)
    })?;
    advance(ledger, &mut record, SwapPhase::AttestationPending, |_| {})?;
    advance(ledger, &mut record, SwapPhase::AttestationObtained, |r| {
        r.attestation = Some(Attestation {
            key: AttestationKey {
                emitter_chain: 1,
                emitter_address: EmitterAddress::from_bytes([7; 32]),
                sequence: 11,
            },
            vaa: "01ab".to_string(),
        });
    })?;
    advance(ledger, &mut record, SwapPhase::DestSubmitted, |r| {
        r.dest_tx_id = Some(TxId::new(format!("dst-{}", request.request_id)));
    })?;
    advance(ledger, &mut record, SwapPhase::DestConfirmed, |r| {
        r.result_amount = Some(dec!(0.97));
    })?;
    advance(ledger, &mut record, SwapPhase::Completed, |_| {})?;
    Ok(record)
}

#[test]
fn sqlite_ledger_append_get_history_list() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("ledger.sqlite3");

    let mut ledger = SqliteTradeLedger::open(path.clone()).context("open ledger")?;
    assert!(!ledger.has_in_flight()?);
    assert!(ledger.get_latest("missing")?.is_none());

    let buy = SwapRequest::new(Direction::Buy, dec!(1.0));
    let completed = run_to_completion(&mut ledger, &buy)?;

    let got = ledger
        .get_latest(&buy.request_id)?
        .context("buy missing")?;
    assert_eq!(got, completed);
    assert_eq!(ledger.history(&buy.request_id)?.len(), 9);

    let last_buy = ledger
        .get_latest_completed(Direction::Buy)?
        .context("no completed buy")?;
    assert_eq!(last_buy.request_id, buy.request_id);
    assert!(ledger.get_latest_completed(Direction::Sell)?.is_none());

    let sell = SwapRequest::new(Direction::Sell, dec!(0.97));
    let mut pending = SwapRecord::initiated(&sell);
    ledger.append(&pending)?;
    advance(&mut ledger, &mut pending, SwapPhase::SourceSubmitted, |r| {
        r.source_tx_id = Some(TxId::new("sell-src"));
    })?;

    let in_flight = ledger.in_flight()?.context("sell in flight")?;
    assert_eq!(in_flight.request_id, sell.request_id);
    assert_eq!(in_flight.phase, SwapPhase::SourceSubmitted);

    let list = ledger.list_latest()?;
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].request_id, buy.request_id);
    assert_eq!(list[1].request_id, sell.request_id);
    drop(ledger);

    // State survives a reopen.
    let ledger = SqliteTradeLedger::open(path).context("reopen ledger")?;
    assert_eq!(
        ledger.in_flight()?.map(|r| r.request_id),
        Some(sell.request_id.clone())
    );
    assert_eq!(
        ledger.get_latest(&buy.request_id)?.context("buy after reopen")?,
        completed
    );
    Ok(())
}

#[test]
fn sqlite_ledger_rejects_illegal_snapshots() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut ledger = SqliteTradeLedger::open(dir.path().join("ledger.sqlite3"))?;

    let request = SwapRequest::new(Direction::Buy, dec!(2));
    let mut skipped = SwapRecord::initiated(&request);
    skipped.phase = SwapPhase::SourceConfirmed;
    let err = ledger.append(&skipped).unwrap_err();
    assert!(err.to_string().contains("first snapshot"));

    let mut record = SwapRecord::initiated(&request);
    ledger.append(&record)?;

    let mut jump = record.clone();
    jump.phase = SwapPhase::SequenceObtained;
    assert!(ledger.append(&jump).is_err());

    let mut other_amount = record.clone();
    other_amount.amount = dec!(3);
    other_amount.phase = SwapPhase::SourceSubmitted;
    assert!(ledger.append(&other_amount).is_err());

    advance(&mut ledger, &mut record, SwapPhase::SourceSubmitted, |r| {
        r.source_tx_id = Some(TxId::new("a"));
    })?;
    let mut rewritten = record.clone();
    rewritten.source_tx_id = Some(TxId::new("b"));
    rewritten.phase = SwapPhase::SourceConfirmed;
    assert!(ledger.append(&rewritten).is_err());

    advance(
        &mut ledger,
        &mut record,
        SwapPhase::Failed(FailureReason::SourceTxReverted),
        |r| r.error = Some("reverted".to_string()),
    )?;
    let mut revived = record.clone();
    revived.phase = SwapPhase::SourceConfirmed;
    assert!(ledger.append(&revived).is_err());

    let history: Vec<_> = ledger
        .history(&request.request_id)?
        .into_iter()
        .map(|r| r.phase)
        .collect();
    assert_eq!(
        history,
        vec![
            SwapPhase::Initiated,
            SwapPhase::SourceSubmitted,
            SwapPhase::Failed(FailureReason::SourceTxReverted),
        ]
    );
    assert!(!ledger.has_in_flight()?);
    Ok(())
}

#[test]
fn sqlite_ledger_refuses_a_second_in_flight_swap() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut ledger = SqliteTradeLedger::open(dir.path().join("ledger.sqlite3"))?;

    ledger.append(&SwapRecord::initiated(&SwapRequest::new(Direction::Buy, dec!(1))))?;
    ledger.append(&SwapRecord::initiated(&SwapRequest::new(Direction::Buy, dec!(1))))?;

    let err = ledger.in_flight().unwrap_err();
    assert!(format!("{err:#}").contains("in-flight swaps"));
    Ok(())
}
