use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bridge_swap::bridge::EmitterAddress;
use bridge_swap::bridge::poller::{AttestationClient, BackoffPolicy};
use bridge_swap::paper::{PaperChainParams, PaperNetwork};
use bridge_swap::swap::service::{OrchestratorConfig, SwapOrchestrator};
use bridge_swap::swap::store::{self, SharedLedger, SqliteTradeLedger, TradeLedger};
use bridge_swap::swap::{Direction, SwapPhase, SwapRecord};
use rust_decimal::Decimal;
use tempfile::TempDir;

pub const SOURCE_WALLET: &str = "src-wallet";
pub const DEST_WALLET: &str = "dst-wallet";

pub fn chain_params(name: &str, chain_id: u16, wallet: &str, balance: Decimal) -> PaperChainParams {
    PaperChainParams {
        name: name.to_string(),
        chain_id,
        wallet_address: wallet.to_string(),
        emitter: EmitterAddress::from_bytes([chain_id as u8; 32]),
        balance,
    }
}

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        confirmation_timeout: Duration::from_millis(20),
        confirmation_attempts: 2,
        attestation_deadline: Duration::from_millis(300),
    }
}

pub fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_hard_errors: 3,
    }
}

/// Ledger whose appends can be made to fail for one phase, to model a
/// storage outage at a precise point of the protocol.
pub struct FlakyLedger {
    inner: SqliteTradeLedger,
    fail_on: Arc<Mutex<Option<SwapPhase>>>,
}

impl TradeLedger for FlakyLedger {
    fn append(&mut self, record: &SwapRecord) -> Result<()> {
        if *self.fail_on.lock().unwrap() == Some(record.phase) {
            anyhow::bail!("disk full");
        }
        self.inner.append(record)
    }

    fn get_latest(&self, request_id: &str) -> Result<Option<SwapRecord>> {
        self.inner.get_latest(request_id)
    }

    fn get_latest_completed(&self, direction: Direction) -> Result<Option<SwapRecord>> {
        self.inner.get_latest_completed(direction)
    }

    fn in_flight(&self) -> Result<Option<SwapRecord>> {
        self.inner.in_flight()
    }

    fn history(&self, request_id: &str) -> Result<Vec<SwapRecord>> {
        self.inner.history(request_id)
    }

    fn list_latest(&self) -> Result<Vec<SwapRecord>> {
        self.inner.list_latest()
    }
}

pub struct Harness {
    _dir: TempDir,
    pub ledger_path: PathBuf,
    pub network: PaperNetwork,
    pub ledger: SharedLedger,
    pub fail_on: Arc<Mutex<Option<SwapPhase>>>,
    pub orchestrator: Arc<SwapOrchestrator>,
}

impl Harness {
    pub fn new(source_balance: Decimal, dest_balance: Decimal) -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let ledger_path = dir.path().join("ledger.sqlite3");
        let network = PaperNetwork::new(
            chain_params("solana", 1, SOURCE_WALLET, source_balance),
            chain_params("ethereum", 2, DEST_WALLET, dest_balance),
        );
        let fail_on = Arc::new(Mutex::new(None));
        let ledger = open_ledger(&ledger_path, fail_on.clone())?;
        let orchestrator = Arc::new(build(&network, ledger.clone())?);
        Ok(Self {
            _dir: dir,
            ledger_path,
            network,
            ledger,
            fail_on,
            orchestrator,
        })
    }

    /// Drops the orchestrator and reopens the ledger file, as a process
    /// restart would. The paper chains keep their state.
    pub fn restart(&mut self) -> Result<()> {
        *self.fail_on.lock().unwrap() = None;
        self.ledger = open_ledger(&self.ledger_path, self.fail_on.clone())?;
        self.orchestrator = Arc::new(build(&self.network, self.ledger.clone())?);
        Ok(())
    }

    pub fn fail_appends_of(&self, phase: SwapPhase) {
        *self.fail_on.lock().unwrap() = Some(phase);
    }

    pub fn latest(&self, request_id: &str) -> Result<SwapRecord> {
        self.ledger
            .lock()
            .unwrap()
            .get_latest(request_id)?
            .with_context(|| format!("no record for {request_id}"))
    }

    pub fn phases(&self, request_id: &str) -> Result<Vec<SwapPhase>> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .history(request_id)?
            .into_iter()
            .map(|r| r.phase)
            .collect())
    }
}

fn open_ledger(path: &std::path::Path, fail_on: Arc<Mutex<Option<SwapPhase>>>) -> Result<SharedLedger> {
    let inner = SqliteTradeLedger::open(path.to_path_buf()).context("open ledger")?;
    Ok(store::shared(FlakyLedger { inner, fail_on }))
}

fn build(network: &PaperNetwork, ledger: SharedLedger) -> Result<SwapOrchestrator> {
    let attestations = AttestationClient::new(network.guardian.clone(), fast_policy());
    SwapOrchestrator::new(fast_config(), network.chain_pair(), attestations, ledger)
}
