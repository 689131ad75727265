//! In-memory paper network: two chains sharing one bridge message log and a
//! guardian that signs whatever the chains published. Used for dry runs and
//! tests; supports fee simulation and fault injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bridge::{
    Attestation, AttestationApi, AttestationKey, EmitterAddress, PollError, PollOutcome,
};
use crate::chain::{Beneficiary, ChainClient, ChainError, ChainPair, Receipt, ReceiptEvent, TxId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BridgeMessage {
    key: AttestationKey,
    target_chain: u16,
    beneficiary: String,
    amount: Decimal,
}

impl BridgeMessage {
    fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }

    fn decode(vaa: &str) -> Option<Self> {
        let bytes = hex::decode(vaa).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[derive(Clone, Default)]
pub struct PaperBridge {
    messages: Arc<Mutex<HashMap<AttestationKey, BridgeMessage>>>,
}

impl PaperBridge {
    fn publish(&self, message: BridgeMessage) {
        self.messages
            .lock()
            .expect("bridge mutex poisoned")
            .insert(message.key.clone(), message);
    }

    fn get(&self, key: &AttestationKey) -> Option<BridgeMessage> {
        self.messages
            .lock()
            .expect("bridge mutex poisoned")
            .get(key)
            .cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaperFaults {
    pub reject_transfers: bool,
    pub revert_transfers: bool,
    /// Number of upcoming confirmation calls that time out.
    pub confirmation_timeouts: u32,
    /// Transfers land without publishing a bridge message.
    pub omit_message: bool,
    /// Next redemption lands on chain but the call reports an error.
    pub lose_redeem_response: bool,
    /// Next transfer lands on chain but the call reports an error.
    pub lose_transfer_response: bool,
}

/// Call counters, for asserting what the orchestrator did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperStats {
    pub transfers: u32,
    pub redeems: u32,
    pub confirmations: u32,
    pub balance_queries: u32,
}

#[derive(Debug)]
struct PaperTx {
    receipt: Receipt,
    reverted: Option<String>,
}

#[derive(Debug, Default)]
struct PaperChainState {
    balances: HashMap<String, Decimal>,
    next_tx: u64,
    next_sequence: u64,
    txs: HashMap<TxId, PaperTx>,
    redemptions: HashMap<String, TxId>,
    redeem_fee_rate: Decimal,
    faults: PaperFaults,
    stats: PaperStats,
}

impl PaperChainState {
    fn new_tx_id(&mut self, chain: &str) -> TxId {
        self.next_tx += 1;
        TxId::new(format!("{chain}-tx-{}", self.next_tx))
    }
}

#[derive(Debug, Clone)]
pub struct PaperChainParams {
    pub name: String,
    pub chain_id: u16,
    pub wallet_address: String,
    pub emitter: EmitterAddress,
    pub balance: Decimal,
}

pub struct PaperChain {
    name: String,
    chain_id: u16,
    wallet_address: String,
    emitter: EmitterAddress,
    bridge: PaperBridge,
    state: Mutex<PaperChainState>,
}

impl PaperChain {
    pub fn new(params: PaperChainParams, bridge: PaperBridge) -> Self {
        let mut state = PaperChainState::default();
        state
            .balances
            .insert(params.wallet_address.clone(), params.balance);
        Self {
            name: params.name,
            chain_id: params.chain_id,
            wallet_address: params.wallet_address,
            emitter: params.emitter,
            bridge,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PaperChainState> {
        self.state.lock().expect("paper chain mutex poisoned")
    }

    pub fn balance_of(&self, address: &str) -> Decimal {
        self.state()
            .balances
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_balance(&self, address: &str, amount: Decimal) {
        self.state().balances.insert(address.to_string(), amount);
    }

    /// Fraction of every redeemed amount kept as a fee.
    pub fn set_redeem_fee_rate(&self, rate: Decimal) {
        self.state().redeem_fee_rate = rate;
    }

    pub fn update_faults(&self, f: impl FnOnce(&mut PaperFaults)) {
        f(&mut self.state().faults);
    }

    pub fn stats(&self) -> PaperStats {
        self.state().stats
    }

    pub fn redemption_count(&self) -> usize {
        self.state().redemptions.len()
    }
}

#[async_trait]
impl ChainClient for PaperChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> u16 {
        self.chain_id
    }

    fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    fn emitter_address(&self) -> &EmitterAddress {
        &self.emitter
    }

    async fn submit_transfer(
        &self,
        amount: Decimal,
        beneficiary: &Beneficiary,
    ) -> Result<TxId, ChainError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.stats.transfers += 1;
        if state.faults.reject_transfers {
            return Err(ChainError::Rejected("transfer rejected by node".to_string()));
        }

        let available = state
            .balances
            .get(&self.wallet_address)
            .copied()
            .unwrap_or_default();
        if available < amount {
            return Err(ChainError::Rejected(format!(
                "insufficient balance: have {available}, need {amount}"
            )));
        }

        let tx_id = state.new_tx_id(&self.name);
        if state.faults.revert_transfers {
            state.txs.insert(
                tx_id.clone(),
                PaperTx {
                    receipt: Receipt {
                        tx_id: tx_id.clone(),
                        block_height: state.next_tx,
                        events: Vec::new(),
                    },
                    reverted: Some("execution reverted".to_string()),
                },
            );
            return Ok(tx_id);
        }

        state
            .balances
            .insert(self.wallet_address.clone(), available - amount);

        let mut events = Vec::new();
        if !state.faults.omit_message {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let key = AttestationKey {
                emitter_chain: self.chain_id,
                emitter_address: self.emitter.clone(),
                sequence,
            };
            self.bridge.publish(BridgeMessage {
                key,
                target_chain: beneficiary.chain_id,
                beneficiary: beneficiary.address.clone(),
                amount,
            });
            events.push(ReceiptEvent::MessagePublished {
                emitter: self.emitter.clone(),
                sequence,
            });
        }

        let receipt = Receipt {
            tx_id: tx_id.clone(),
            block_height: state.next_tx,
            events,
        };
        state.txs.insert(
            tx_id.clone(),
            PaperTx {
                receipt,
                reverted: None,
            },
        );

        if state.faults.lose_transfer_response {
            state.faults.lose_transfer_response = false;
            return Err(ChainError::Transport(anyhow::anyhow!(
                "connection closed before response"
            )));
        }
        Ok(tx_id)
    }

    async fn await_confirmation(
        &self,
        tx_id: &TxId,
        _timeout: Duration,
    ) -> Result<Receipt, ChainError> {
        let mut state = self.state();
        state.stats.confirmations += 1;
        if state.faults.confirmation_timeouts > 0 {
            state.faults.confirmation_timeouts -= 1;
            return Err(ChainError::Timeout(tx_id.clone()));
        }

        let tx = state
            .txs
            .get(tx_id)
            .ok_or_else(|| ChainError::Transport(anyhow::anyhow!("unknown transaction {tx_id}")))?;
        match &tx.reverted {
            Some(reason) => Err(ChainError::Reverted {
                tx_id: tx_id.clone(),
                reason: reason.clone(),
            }),
            None => Ok(tx.receipt.clone()),
        }
    }

    async fn submit_redeem(&self, attestation: &Attestation) -> Result<TxId, ChainError> {
        let message = BridgeMessage::decode(&attestation.vaa)
            .ok_or_else(|| ChainError::Rejected("undecodable attestation".to_string()))?;
        if message.target_chain != self.chain_id {
            return Err(ChainError::Rejected(format!(
                "attestation targets chain {}, this is {}",
                message.target_chain, self.chain_id
            )));
        }

        let mut guard = self.state();
        let state = &mut *guard;
        if state.redemptions.contains_key(&attestation.vaa) {
            return Err(ChainError::Rejected("attestation already redeemed".to_string()));
        }
        state.stats.redeems += 1;

        let credited = message.amount - message.amount * state.redeem_fee_rate;
        let balance = state
            .balances
            .get(&message.beneficiary)
            .copied()
            .unwrap_or_default();
        state
            .balances
            .insert(message.beneficiary.clone(), balance + credited);

        let tx_id = state.new_tx_id(&self.name);
        let receipt = Receipt {
            tx_id: tx_id.clone(),
            block_height: state.next_tx,
            events: vec![ReceiptEvent::Credited { amount: credited }],
        };
        state.txs.insert(
            tx_id.clone(),
            PaperTx {
                receipt,
                reverted: None,
            },
        );
        state
            .redemptions
            .insert(attestation.vaa.clone(), tx_id.clone());

        if state.faults.lose_redeem_response {
            state.faults.lose_redeem_response = false;
            return Err(ChainError::Transport(anyhow::anyhow!(
                "connection closed before response"
            )));
        }
        Ok(tx_id)
    }

    async fn query_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let mut state = self.state();
        state.stats.balance_queries += 1;
        Ok(state.balances.get(address).copied().unwrap_or_default())
    }

    async fn find_redemption(
        &self,
        attestation: &Attestation,
    ) -> Result<Option<TxId>, ChainError> {
        Ok(self.state().redemptions.get(&attestation.vaa).cloned())
    }
}

#[derive(Debug, Default)]
struct GuardianState {
    delay_polls: u32,
    malformed: bool,
    offline: bool,
    seen: HashMap<AttestationKey, u32>,
    polls: u32,
}

/// Signs published messages after a configurable number of polls.
pub struct PaperGuardian {
    bridge: PaperBridge,
    state: Mutex<GuardianState>,
}

impl PaperGuardian {
    pub fn new(bridge: PaperBridge) -> Self {
        Self {
            bridge,
            state: Mutex::new(GuardianState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GuardianState> {
        self.state.lock().expect("guardian mutex poisoned")
    }

    /// Polls answered "not yet" for each message before it is signed.
    pub fn set_delay_polls(&self, polls: u32) {
        self.state().delay_polls = polls;
    }

    /// While offline every poll answers "not yet".
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn set_malformed(&self, malformed: bool) {
        self.state().malformed = malformed;
    }

    pub fn polls(&self) -> u32 {
        self.state().polls
    }
}

#[async_trait]
impl AttestationApi for PaperGuardian {
    async fn poll(&self, key: &AttestationKey) -> Result<PollOutcome, PollError> {
        let mut state = self.state();
        state.polls += 1;
        if state.malformed {
            return Err(PollError::Malformed("garbled guardian response".to_string()));
        }
        if state.offline {
            return Ok(PollOutcome::NotYet);
        }
        let Some(message) = self.bridge.get(key) else {
            return Ok(PollOutcome::NotYet);
        };

        let delay = state.delay_polls;
        let seen = state.seen.entry(key.clone()).or_default();
        *seen += 1;
        if *seen <= delay {
            return Ok(PollOutcome::NotYet);
        }

        let vaa = message
            .encode()
            .map_err(|e| PollError::Malformed(format!("encode paper vaa: {e}")))?;
        Ok(PollOutcome::Ready(Attestation {
            key: key.clone(),
            vaa,
        }))
    }
}

/// Both chains plus the guardian, wired to one bridge.
pub struct PaperNetwork {
    pub source: Arc<PaperChain>,
    pub destination: Arc<PaperChain>,
    pub guardian: Arc<PaperGuardian>,
}

impl PaperNetwork {
    pub fn new(source: PaperChainParams, destination: PaperChainParams) -> Self {
        let bridge = PaperBridge::default();
        Self {
            source: Arc::new(PaperChain::new(source, bridge.clone())),
            destination: Arc::new(PaperChain::new(destination, bridge.clone())),
            guardian: Arc::new(PaperGuardian::new(bridge)),
        }
    }

    pub fn chain_pair(&self) -> ChainPair {
        ChainPair::new(self.source.clone(), self.destination.clone())
    }
}
