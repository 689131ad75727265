pub mod remote;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bridge::{Attestation, EmitterAddress};
use crate::swap::{Chain, Direction};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who receives the bridged value on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beneficiary {
    pub chain_id: u16,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReceiptEvent {
    /// The bridge core contract published a message.
    MessagePublished {
        emitter: EmitterAddress,
        sequence: u64,
    },
    /// Value credited to our wallet by a redemption.
    Credited { amount: Decimal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_id: TxId,
    pub block_height: u64,
    pub events: Vec<ReceiptEvent>,
}

impl Receipt {
    pub fn sequence_from(&self, emitter: &EmitterAddress) -> Option<u64> {
        self.events.iter().find_map(|event| match event {
            ReceiptEvent::MessagePublished {
                emitter: e,
                sequence,
            } if e == emitter => Some(*sequence),
            _ => None,
        })
    }

    pub fn credited_amount(&self) -> Option<Decimal> {
        let mut total: Option<Decimal> = None;
        for event in &self.events {
            if let ReceiptEvent::Credited { amount } = event {
                total = Some(total.unwrap_or_default() + amount);
            }
        }
        total
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(TxId),
    #[error("transaction {tx_id} failed on chain: {reason}")]
    Reverted { tx_id: TxId, reason: String },
    #[error("no message from emitter {emitter} in receipt of {tx_id}")]
    SequenceNotFound {
        tx_id: TxId,
        emitter: EmitterAddress,
    },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ChainError {
    /// Safe to repeat for read-only calls such as confirmation lookups.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Timeout(_) | ChainError::Transport(_))
    }
}

/// Narrow view of one chain: submit, confirm, redeem, query.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn name(&self) -> &str;

    fn chain_id(&self) -> u16;

    /// Our wallet on this chain; the beneficiary when value arrives here.
    fn wallet_address(&self) -> &str;

    /// Token bridge emitter whose messages carry our transfers.
    fn emitter_address(&self) -> &EmitterAddress;

    async fn submit_transfer(
        &self,
        amount: Decimal,
        beneficiary: &Beneficiary,
    ) -> Result<TxId, ChainError>;

    async fn await_confirmation(
        &self,
        tx_id: &TxId,
        timeout: Duration,
    ) -> Result<Receipt, ChainError>;

    fn extract_sequence(&self, receipt: &Receipt) -> Result<u64, ChainError> {
        let emitter = self.emitter_address();
        receipt
            .sequence_from(emitter)
            .ok_or_else(|| ChainError::SequenceNotFound {
                tx_id: receipt.tx_id.clone(),
                emitter: emitter.clone(),
            })
    }

    async fn submit_redeem(&self, attestation: &Attestation) -> Result<TxId, ChainError>;

    async fn query_balance(&self, address: &str) -> Result<Decimal, ChainError>;

    /// Returns the transaction that already redeemed `attestation`, if any.
    async fn find_redemption(&self, attestation: &Attestation)
    -> Result<Option<TxId>, ChainError>;
}

/// The two chain connections, shared process-wide.
#[derive(Clone)]
pub struct ChainPair {
    source: Arc<dyn ChainClient>,
    destination: Arc<dyn ChainClient>,
}

impl ChainPair {
    pub fn new(source: Arc<dyn ChainClient>, destination: Arc<dyn ChainClient>) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub fn get(&self, chain: Chain) -> &Arc<dyn ChainClient> {
        match chain {
            Chain::Source => &self.source,
            Chain::Destination => &self.destination,
        }
    }

    /// `(from, to)` legs for a swap direction.
    pub fn legs(&self, direction: Direction) -> (&Arc<dyn ChainClient>, &Arc<dyn ChainClient>) {
        (
            self.get(direction.from_chain()),
            self.get(direction.to_chain()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter(byte: u8) -> EmitterAddress {
        EmitterAddress::from_bytes([byte; 32])
    }

    #[test]
    fn sequence_only_comes_from_the_expected_emitter() {
        let receipt = Receipt {
            tx_id: TxId::new("tx"),
            block_height: 10,
            events: vec![
                ReceiptEvent::MessagePublished {
                    emitter: emitter(1),
                    sequence: 3,
                },
                ReceiptEvent::MessagePublished {
                    emitter: emitter(2),
                    sequence: 9,
                },
            ],
        };
        assert_eq!(receipt.sequence_from(&emitter(2)), Some(9));
        assert_eq!(receipt.sequence_from(&emitter(3)), None);
        assert_eq!(receipt.credited_amount(), None);
    }

    #[test]
    fn credited_amounts_add_up() {
        let receipt = Receipt {
            tx_id: TxId::new("tx"),
            block_height: 1,
            events: vec![
                ReceiptEvent::Credited {
                    amount: Decimal::new(5, 1),
                },
                ReceiptEvent::Credited {
                    amount: Decimal::new(47, 2),
                },
            ],
        };
        assert_eq!(receipt.credited_amount(), Some(Decimal::new(97, 2)));
    }
}
