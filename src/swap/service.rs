use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use rust_decimal::Decimal;

use super::error::OrchestrationError;
use super::guard::BalanceGuard;
use super::store::{SharedLedger, TradeLedger};
use super::{Chain, FailureReason, SwapPhase, SwapRecord, SwapRequest};
use crate::bridge::poller::AttestationClient;
use crate::bridge::{Attestation, AttestationError, AttestationKey};
use crate::chain::{Beneficiary, ChainClient, ChainError, ChainPair, Receipt, TxId};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wait per confirmation attempt.
    pub confirmation_timeout: Duration,
    pub confirmation_attempts: u32,
    /// Total attestation polling time per `execute` call.
    pub attestation_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(120),
            confirmation_attempts: 3,
            attestation_deadline: Duration::from_secs(900),
        }
    }
}

#[derive(Debug)]
enum GateState {
    Idle,
    Running(String),
    /// A swap returned to its caller while still in flight.
    Parked(String),
}

/// Global single-in-flight gate. Only the parked request may re-enter.
#[derive(Debug)]
struct SwapGate {
    state: Mutex<GateState>,
}

impl SwapGate {
    fn new(parked: Option<String>) -> Self {
        let state = match parked {
            Some(request_id) => GateState::Parked(request_id),
            None => GateState::Idle,
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn enter(&self, request_id: &str) -> Result<GateTicket<'_>, OrchestrationError> {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        match &*state {
            GateState::Idle => {}
            GateState::Parked(active) if active == request_id => {}
            GateState::Running(active) | GateState::Parked(active) => {
                return Err(OrchestrationError::Busy {
                    active: active.clone(),
                });
            }
        }
        *state = GateState::Running(request_id.to_string());
        Ok(GateTicket {
            gate: self,
            request_id: request_id.to_string(),
            released: false,
        })
    }

    fn active(&self) -> Option<String> {
        match &*self.state.lock().expect("gate mutex poisoned") {
            GateState::Idle => None,
            GateState::Running(id) | GateState::Parked(id) => Some(id.clone()),
        }
    }
}

/// Held while a request runs. Dropping it without `release` parks the gate.
struct GateTicket<'a> {
    gate: &'a SwapGate,
    request_id: String,
    released: bool,
}

impl GateTicket<'_> {
    fn release(mut self) {
        self.released = true;
        *self.gate.state.lock().expect("gate mutex poisoned") = GateState::Idle;
    }
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        if !self.released {
            *self.gate.state.lock().expect("gate mutex poisoned") =
                GateState::Parked(std::mem::take(&mut self.request_id));
        }
    }
}

/// Drives one swap at a time through its phases, committing every
/// transition to the ledger before the next chain action.
pub struct SwapOrchestrator {
    cfg: OrchestratorConfig,
    chains: ChainPair,
    balances: BalanceGuard,
    attestations: AttestationClient,
    ledger: SharedLedger,
    gate: SwapGate,
}

impl SwapOrchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        chains: ChainPair,
        attestations: AttestationClient,
        ledger: SharedLedger,
    ) -> anyhow::Result<Self> {
        let parked = ledger
            .lock()
            .expect("ledger mutex poisoned")
            .in_flight()
            .context("load in-flight swap")?;
        if let Some(record) = &parked {
            tracing::warn!(
                request_id = %record.request_id,
                phase = %record.phase,
                "ledger holds an in-flight swap; new swaps are blocked until it settles"
            );
        }

        Ok(Self {
            cfg,
            balances: BalanceGuard::new(chains.clone()),
            chains,
            attestations,
            ledger,
            gate: SwapGate::new(parked.map(|r| r.request_id)),
        })
    }

    pub fn balances(&self) -> &BalanceGuard {
        &self.balances
    }

    /// Request currently holding the gate, running or parked.
    pub fn active_request(&self) -> Option<String> {
        self.gate.active()
    }

    /// Runs `request` to completion, or resumes it if the ledger already
    /// knows its `request_id`.
    pub async fn execute(&self, request: SwapRequest) -> Result<SwapRecord, OrchestrationError> {
        let ticket = self.gate.enter(&request.request_id)?;
        let result = self.run(&request).await;
        self.settle_gate(ticket, &request.request_id);
        result
    }

    /// Re-drives the in-flight swap recorded in the ledger, if there is one.
    pub async fn resume_in_flight(&self) -> Result<Option<SwapRecord>, OrchestrationError> {
        let in_flight = self
            .ledger()
            .in_flight()
            .map_err(OrchestrationError::Ledger)?;
        let Some(record) = in_flight else {
            return Ok(None);
        };

        tracing::info!(request_id = %record.request_id, phase = %record.phase, "resuming in-flight swap");
        self.execute(SwapRequest::from_record(&record))
            .await
            .map(Some)
    }

    /// Cancels a swap that has not yet touched the source chain.
    pub fn abort(&self, request_id: &str) -> Result<SwapRecord, OrchestrationError> {
        let ticket = self.gate.enter(request_id)?;
        let result = self.abort_locked(request_id);
        self.settle_gate(ticket, request_id);
        result
    }

    fn abort_locked(&self, request_id: &str) -> Result<SwapRecord, OrchestrationError> {
        let mut record = self
            .load(request_id)?
            .ok_or_else(|| OrchestrationError::UnknownSwap(request_id.to_string()))?;
        if record.phase != SwapPhase::Initiated {
            return Err(OrchestrationError::NotCancellable {
                request_id: request_id.to_string(),
                phase: record.phase,
            });
        }
        self.commit(&mut record, SwapPhase::Failed(FailureReason::Aborted), |r| {
            r.error = Some("aborted before source submission".to_string());
        })?;
        tracing::info!(%request_id, "swap aborted");
        Ok(record)
    }

    async fn run(&self, request: &SwapRequest) -> Result<SwapRecord, OrchestrationError> {
        let record = match self.load(&request.request_id)? {
            Some(record) if record.phase.is_terminal() => return settled(record),
            Some(record) => {
                tracing::info!(request_id = %record.request_id, phase = %record.phase, "resuming swap from ledger");
                record
            }
            None => self.start(request).await?,
        };
        self.drive(record).await
    }

    /// Keeps the gate only while the ledger still shows this swap in flight.
    fn settle_gate(&self, ticket: GateTicket<'_>, request_id: &str) {
        let latest = self.ledger().get_latest(request_id);
        match latest {
            Ok(Some(record)) if record.is_in_flight() => {
                tracing::warn!(%request_id, phase = %record.phase, "swap parked in flight; gate stays held");
                drop(ticket);
            }
            Ok(_) => ticket.release(),
            Err(err) => {
                tracing::error!(%request_id, error = %format!("{err:#}"), "cannot read ledger; gate stays held");
                drop(ticket);
            }
        }
    }

    /// Preflight, `Initiated`, and the source submission.
    async fn start(&self, request: &SwapRequest) -> Result<SwapRecord, OrchestrationError> {
        if request.amount <= Decimal::ZERO {
            tracing::warn!(request_id = %request.request_id, amount = %request.amount, "non-positive swap amount");
            return Err(OrchestrationError::InvalidAmount {
                request_id: request.request_id.clone(),
                amount: request.amount,
            });
        }

        let from_chain = request.direction.from_chain();
        let check = self
            .balances
            .check(from_chain, request.amount)
            .await
            .map_err(|source| OrchestrationError::BalanceUnavailable {
                chain: from_chain,
                source,
            })?;
        if !check.is_sufficient() {
            let detail = format!(
                "requested {} but only {} available on {from_chain} chain",
                check.requested, check.available
            );
            tracing::warn!(request_id = %request.request_id, %detail, "preflight balance check failed");
            self.persist(&SwapRecord::rejected(
                request,
                FailureReason::InsufficientFunds,
                detail,
            ))?;
            return Err(OrchestrationError::InsufficientFunds {
                chain: from_chain,
                requested: check.requested,
                available: check.available,
            });
        }

        let mut record = SwapRecord::initiated(request);
        self.persist(&record)?;
        tracing::info!(
            request_id = %record.request_id,
            direction = %record.direction,
            amount = %record.amount,
            "swap initiated"
        );

        let (from, to) = self.chains.legs(request.direction);
        let beneficiary = Beneficiary {
            chain_id: to.chain_id(),
            address: to.wallet_address().to_string(),
        };
        match from.submit_transfer(request.amount, &beneficiary).await {
            Ok(tx_id) => {
                tracing::info!(request_id = %record.request_id, chain = from.name(), %tx_id, "source transfer submitted");
                self.commit(&mut record, SwapPhase::SourceSubmitted, |r| {
                    r.source_tx_id = Some(tx_id);
                })?;
            }
            Err(err @ ChainError::Transport(_)) => {
                return Err(self.fail(
                    &mut record,
                    FailureReason::SourceSubmitUnknown,
                    format!("{err:#}; the transfer may have been broadcast, reconcile the source wallet"),
                ));
            }
            Err(err) => {
                return Err(self.fail(
                    &mut record,
                    FailureReason::SourceSubmitFailed,
                    format!("{err:#}"),
                ));
            }
        }
        Ok(record)
    }

    async fn drive(&self, mut record: SwapRecord) -> Result<SwapRecord, OrchestrationError> {
        let (from, to) = self.chains.legs(record.direction);
        let from_chain = record.direction.from_chain();
        let to_chain = record.direction.to_chain();
        let mut source_receipt: Option<Receipt> = None;

        loop {
            match record.phase {
                SwapPhase::Initiated => {
                    return Err(self.fail(
                        &mut record,
                        FailureReason::SourceSubmitUnknown,
                        "interrupted before the source transaction id was recorded; \
                         reconcile the source wallet manually"
                            .to_string(),
                    ));
                }
                SwapPhase::SourceSubmitted => {
                    let receipt = self.confirm_source(&mut record, from, from_chain).await?;
                    self.commit(&mut record, SwapPhase::SourceConfirmed, |_| {})?;
                    source_receipt = Some(receipt);
                }
                SwapPhase::SourceConfirmed => {
                    let receipt = match source_receipt.take() {
                        Some(receipt) => receipt,
                        None => self.confirm_source(&mut record, from, from_chain).await?,
                    };
                    match from.extract_sequence(&receipt) {
                        Ok(sequence) => {
                            self.commit(&mut record, SwapPhase::SequenceObtained, |r| {
                                r.sequence = Some(sequence);
                            })?;
                        }
                        Err(err) => {
                            return Err(self.fail(
                                &mut record,
                                FailureReason::SequenceNotFound,
                                err.to_string(),
                            ));
                        }
                    }
                }
                SwapPhase::SequenceObtained => {
                    self.commit(&mut record, SwapPhase::AttestationPending, |_| {})?;
                }
                SwapPhase::AttestationPending => {
                    let Some(sequence) = record.sequence else {
                        return Err(self.missing(&mut record, "sequence"));
                    };
                    let key = AttestationKey {
                        emitter_chain: from.chain_id(),
                        emitter_address: from.emitter_address().clone(),
                        sequence,
                    };
                    match self
                        .attestations
                        .fetch(&key, self.cfg.attestation_deadline)
                        .await
                    {
                        Ok(attestation) => {
                            self.commit(&mut record, SwapPhase::AttestationObtained, |r| {
                                r.attestation = Some(attestation);
                            })?;
                        }
                        Err(AttestationError::Timeout { waited, .. }) => {
                            tracing::warn!(
                                request_id = %record.request_id,
                                %key,
                                ?waited,
                                "attestation deadline passed; swap stays pending"
                            );
                            return Err(OrchestrationError::AttestationTimeout {
                                request_id: record.request_id.clone(),
                                sequence,
                            });
                        }
                        Err(err @ AttestationError::Unavailable { .. }) => {
                            return Err(self.fail(
                                &mut record,
                                FailureReason::AttestationUnavailable,
                                err.to_string(),
                            ));
                        }
                    }
                }
                SwapPhase::AttestationObtained => {
                    let Some(attestation) = record.attestation.clone() else {
                        return Err(self.missing(&mut record, "attestation"));
                    };
                    let tx_id = self.redeem(&mut record, to, to_chain, &attestation).await?;
                    self.commit(&mut record, SwapPhase::DestSubmitted, |r| {
                        r.dest_tx_id = Some(tx_id);
                    })?;
                }
                SwapPhase::DestSubmitted => {
                    let Some(tx_id) = record.dest_tx_id.clone() else {
                        return Err(self.missing(&mut record, "dest_tx_id"));
                    };
                    let receipt = self
                        .confirm(&mut record, to, to_chain, &tx_id, FailureReason::DestTxReverted)
                        .await?;
                    let Some(amount) = receipt.credited_amount() else {
                        return Err(self.fail(
                            &mut record,
                            FailureReason::Unexpected,
                            format!("destination receipt {tx_id} carries no credited amount"),
                        ));
                    };
                    self.commit(&mut record, SwapPhase::DestConfirmed, |r| {
                        r.result_amount = Some(amount);
                    })?;
                }
                SwapPhase::DestConfirmed => {
                    self.commit(&mut record, SwapPhase::Completed, |_| {})?;
                    tracing::info!(
                        request_id = %record.request_id,
                        direction = %record.direction,
                        amount = %record.amount,
                        result_amount = ?record.result_amount,
                        "swap completed"
                    );
                }
                SwapPhase::Completed | SwapPhase::Failed(_) => return settled(record),
            }
        }
    }

    async fn confirm_source(
        &self,
        record: &mut SwapRecord,
        from: &Arc<dyn ChainClient>,
        from_chain: Chain,
    ) -> Result<Receipt, OrchestrationError> {
        let Some(tx_id) = record.source_tx_id.clone() else {
            return Err(self.missing(record, "source_tx_id"));
        };
        self.confirm(
            record,
            from,
            from_chain,
            &tx_id,
            FailureReason::SourceTxReverted,
        )
        .await
    }

    /// Re-queries confirmation on timeouts; a revert is final.
    async fn confirm(
        &self,
        record: &mut SwapRecord,
        client: &Arc<dyn ChainClient>,
        chain: Chain,
        tx_id: &TxId,
        reverted: FailureReason,
    ) -> Result<Receipt, OrchestrationError> {
        let attempts = self.cfg.confirmation_attempts.max(1);
        for attempt in 1..=attempts {
            match client
                .await_confirmation(tx_id, self.cfg.confirmation_timeout)
                .await
            {
                Ok(receipt) => {
                    tracing::debug!(request_id = %record.request_id, chain = client.name(), %tx_id, block = receipt.block_height, "transaction confirmed");
                    return Ok(receipt);
                }
                Err(ChainError::Reverted { reason, .. }) => {
                    return Err(self.fail(record, reverted, format!("{tx_id} reverted: {reason}")));
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        request_id = %record.request_id,
                        chain = client.name(),
                        %tx_id,
                        attempt,
                        attempts,
                        error = %format!("{err:#}"),
                        "confirmation not available yet"
                    );
                }
                Err(err) => {
                    return Err(self.fail(
                        record,
                        FailureReason::Unexpected,
                        format!("await confirmation of {tx_id} on {chain} chain: {err:#}"),
                    ));
                }
            }
        }

        Err(OrchestrationError::ConfirmationTimeout {
            request_id: record.request_id.clone(),
            chain,
            tx_id: tx_id.clone(),
            attempts,
        })
    }

    /// Submits the redemption unless the destination already consumed this
    /// attestation, in which case the existing transaction is adopted.
    async fn redeem(
        &self,
        record: &mut SwapRecord,
        to: &Arc<dyn ChainClient>,
        to_chain: Chain,
        attestation: &Attestation,
    ) -> Result<TxId, OrchestrationError> {
        let unavailable = |request_id: &str, source| OrchestrationError::ChainUnavailable {
            request_id: request_id.to_string(),
            chain: to_chain,
            source,
        };

        match to.find_redemption(attestation).await {
            Ok(Some(tx_id)) => {
                tracing::info!(request_id = %record.request_id, %tx_id, "attestation already redeemed; adopting existing transaction");
                return Ok(tx_id);
            }
            Ok(None) => {}
            Err(source) => return Err(unavailable(&record.request_id, source)),
        }

        let err = match to.submit_redeem(attestation).await {
            Ok(tx_id) => {
                tracing::info!(request_id = %record.request_id, chain = to.name(), %tx_id, "redemption submitted");
                return Ok(tx_id);
            }
            Err(err) => err,
        };

        // The submission may have landed even though the call failed.
        match to.find_redemption(attestation).await {
            Ok(Some(tx_id)) => {
                tracing::warn!(request_id = %record.request_id, %tx_id, error = %format!("{err:#}"), "redeem call failed but attestation is redeemed; adopting");
                Ok(tx_id)
            }
            Ok(None) => Err(self.fail(
                record,
                FailureReason::DestSubmitFailed,
                format!("{err:#}"),
            )),
            Err(source) => Err(unavailable(&record.request_id, source)),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, dyn TradeLedger + 'static> {
        self.ledger.lock().expect("ledger mutex poisoned")
    }

    fn load(&self, request_id: &str) -> Result<Option<SwapRecord>, OrchestrationError> {
        self.ledger()
            .get_latest(request_id)
            .map_err(OrchestrationError::Ledger)
    }

    fn persist(&self, record: &SwapRecord) -> Result<(), OrchestrationError> {
        self.ledger()
            .append(record)
            .with_context(|| format!("append {} snapshot for {}", record.phase, record.request_id))
            .map_err(OrchestrationError::Ledger)
    }

    /// Applies `update`, advances to `phase` and persists. `record` only
    /// changes once the ledger write succeeded.
    fn commit(
        &self,
        record: &mut SwapRecord,
        phase: SwapPhase,
        update: impl FnOnce(&mut SwapRecord),
    ) -> Result<(), OrchestrationError> {
        let mut next = record.clone();
        update(&mut next);
        next.advance(phase)?;
        self.persist(&next)?;
        tracing::info!(request_id = %next.request_id, from = %record.phase, to = %phase, "phase committed");
        *record = next;
        Ok(())
    }

    fn fail(&self, record: &mut SwapRecord, reason: FailureReason, detail: String) -> OrchestrationError {
        tracing::error!(request_id = %record.request_id, phase = %record.phase, %reason, %detail, "swap failed");
        let request_id = record.request_id.clone();
        let stored = detail.clone();
        match self.commit(record, SwapPhase::Failed(reason), |r| r.error = Some(stored)) {
            Ok(()) => OrchestrationError::Failed {
                request_id,
                reason,
                detail,
            },
            Err(err) => err,
        }
    }

    fn missing(&self, record: &mut SwapRecord, field: &str) -> OrchestrationError {
        let detail = format!("{field} missing in phase {}", record.phase);
        self.fail(record, FailureReason::Unexpected, detail)
    }
}

fn settled(record: SwapRecord) -> Result<SwapRecord, OrchestrationError> {
    match record.phase {
        SwapPhase::Failed(reason) => Err(OrchestrationError::Failed {
            request_id: record.request_id,
            reason,
            detail: record.error.unwrap_or_default(),
        }),
        _ => Ok(record),
    }
}
