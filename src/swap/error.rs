use rust_decimal::Decimal;

use super::{Chain, FailureReason, SwapPhase, TransitionError};
use crate::chain::{ChainError, TxId};

/// Coarse error classes callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Gate, amount or balance check failed; nothing happened on chain.
    PreflightFailed,
    /// The swap is terminally `Failed`; needs an operator.
    NonRetryable,
    /// The swap is parked in its current phase; call `execute` again later.
    Retryable,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("orchestrator busy: swap {active} is in flight")]
    Busy { active: String },

    #[error("swap {request_id}: amount must be positive, got {amount}")]
    InvalidAmount { request_id: String, amount: Decimal },

    #[error("insufficient funds on {chain} chain: requested {requested}, available {available}")]
    InsufficientFunds {
        chain: Chain,
        requested: Decimal,
        available: Decimal,
    },

    #[error("balance query on {chain} chain failed: {source}")]
    BalanceUnavailable {
        chain: Chain,
        #[source]
        source: ChainError,
    },

    #[error("swap {request_id} failed ({reason}): {detail}")]
    Failed {
        request_id: String,
        reason: FailureReason,
        detail: String,
    },

    #[error("swap {request_id}: attestation for sequence {sequence} not available before deadline")]
    AttestationTimeout { request_id: String, sequence: u64 },

    #[error("swap {request_id}: {chain} transaction {tx_id} not confirmed after {attempts} attempts")]
    ConfirmationTimeout {
        request_id: String,
        chain: Chain,
        tx_id: TxId,
        attempts: u32,
    },

    #[error("swap {request_id}: {chain} chain unavailable: {source}")]
    ChainUnavailable {
        request_id: String,
        chain: Chain,
        #[source]
        source: ChainError,
    },

    #[error("ledger access failed: {0:#}")]
    Ledger(#[source] anyhow::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("swap {request_id} cannot be aborted in phase {phase}")]
    NotCancellable { request_id: String, phase: SwapPhase },

    #[error("unknown swap {0}")]
    UnknownSwap(String),
}

impl OrchestrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestrationError::Busy { .. }
            | OrchestrationError::InvalidAmount { .. }
            | OrchestrationError::InsufficientFunds { .. }
            | OrchestrationError::BalanceUnavailable { .. }
            | OrchestrationError::NotCancellable { .. }
            | OrchestrationError::UnknownSwap(_) => ErrorClass::PreflightFailed,
            OrchestrationError::Failed { .. } | OrchestrationError::Transition(_) => {
                ErrorClass::NonRetryable
            }
            OrchestrationError::AttestationTimeout { .. }
            | OrchestrationError::ConfirmationTimeout { .. }
            | OrchestrationError::ChainUnavailable { .. }
            | OrchestrationError::Ledger(_) => ErrorClass::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            OrchestrationError::InsufficientFunds { .. } => Some(FailureReason::InsufficientFunds),
            OrchestrationError::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
