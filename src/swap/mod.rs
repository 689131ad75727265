pub mod error;
pub mod guard;
pub mod service;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::Attestation;
use crate::chain::TxId;

/// One of the two networks taking part in a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Source,
    Destination,
}

impl Chain {
    pub fn counterpart(self) -> Self {
        match self {
            Chain::Source => Chain::Destination,
            Chain::Destination => Chain::Source,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Source => f.write_str("source"),
            Chain::Destination => f.write_str("destination"),
        }
    }
}

/// A buy moves value Source -> Destination, a sell moves it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Chain the value leaves from.
    pub fn from_chain(self) -> Chain {
        match self {
            Direction::Buy => Chain::Source,
            Direction::Sell => Chain::Destination,
        }
    }

    /// Chain the value is redeemed on.
    pub fn to_chain(self) -> Chain {
        self.from_chain().counterpart()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Direction::Buy),
            "sell" => Ok(Direction::Sell),
            other => anyhow::bail!("unknown direction: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientFunds,
    SourceSubmitFailed,
    /// The process stopped between persisting `Initiated` and persisting the
    /// source transaction id; the transfer may or may not exist on chain.
    SourceSubmitUnknown,
    SourceTxReverted,
    SequenceNotFound,
    AttestationUnavailable,
    DestSubmitFailed,
    DestTxReverted,
    Aborted,
    Unexpected,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InsufficientFunds => "insufficient_funds",
            FailureReason::SourceSubmitFailed => "source_submit_failed",
            FailureReason::SourceSubmitUnknown => "source_submit_unknown",
            FailureReason::SourceTxReverted => "source_tx_reverted",
            FailureReason::SequenceNotFound => "sequence_not_found",
            FailureReason::AttestationUnavailable => "attestation_unavailable",
            FailureReason::DestSubmitFailed => "dest_submit_failed",
            FailureReason::DestTxReverted => "dest_tx_reverted",
            FailureReason::Aborted => "aborted",
            FailureReason::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = match s {
            "insufficient_funds" => FailureReason::InsufficientFunds,
            "source_submit_failed" => FailureReason::SourceSubmitFailed,
            "source_submit_unknown" => FailureReason::SourceSubmitUnknown,
            "source_tx_reverted" => FailureReason::SourceTxReverted,
            "sequence_not_found" => FailureReason::SequenceNotFound,
            "attestation_unavailable" => FailureReason::AttestationUnavailable,
            "dest_submit_failed" => FailureReason::DestSubmitFailed,
            "dest_tx_reverted" => FailureReason::DestTxReverted,
            "aborted" => FailureReason::Aborted,
            "unexpected" => FailureReason::Unexpected,
            other => anyhow::bail!("unknown failure reason: {other}"),
        };
        Ok(reason)
    }
}

/// Ordered swap lifecycle. Every phase but `Failed` has exactly one successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "reason")]
pub enum SwapPhase {
    Initiated,
    SourceSubmitted,
    SourceConfirmed,
    SequenceObtained,
    AttestationPending,
    AttestationObtained,
    DestSubmitted,
    DestConfirmed,
    Completed,
    Failed(FailureReason),
}

impl SwapPhase {
    pub fn next(self) -> Option<Self> {
        let next = match self {
            SwapPhase::Initiated => SwapPhase::SourceSubmitted,
            SwapPhase::SourceSubmitted => SwapPhase::SourceConfirmed,
            SwapPhase::SourceConfirmed => SwapPhase::SequenceObtained,
            SwapPhase::SequenceObtained => SwapPhase::AttestationPending,
            SwapPhase::AttestationPending => SwapPhase::AttestationObtained,
            SwapPhase::AttestationObtained => SwapPhase::DestSubmitted,
            SwapPhase::DestSubmitted => SwapPhase::DestConfirmed,
            SwapPhase::DestConfirmed => SwapPhase::Completed,
            SwapPhase::Completed | SwapPhase::Failed(_) => return None,
        };
        Some(next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SwapPhase::Completed | SwapPhase::Failed(_))
    }

    pub fn can_advance_to(self, to: SwapPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(to, SwapPhase::Failed(_)) || self.next() == Some(to)
    }

    /// Position in the lifecycle; `Failed` sorts after everything.
    pub fn rank(self) -> u8 {
        match self {
            SwapPhase::Initiated => 0,
            SwapPhase::SourceSubmitted => 1,
            SwapPhase::SourceConfirmed => 2,
            SwapPhase::SequenceObtained => 3,
            SwapPhase::AttestationPending => 4,
            SwapPhase::AttestationObtained => 5,
            SwapPhase::DestSubmitted => 6,
            SwapPhase::DestConfirmed => 7,
            SwapPhase::Completed => 8,
            SwapPhase::Failed(_) => u8::MAX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapPhase::Initiated => "initiated",
            SwapPhase::SourceSubmitted => "source_submitted",
            SwapPhase::SourceConfirmed => "source_confirmed",
            SwapPhase::SequenceObtained => "sequence_obtained",
            SwapPhase::AttestationPending => "attestation_pending",
            SwapPhase::AttestationObtained => "attestation_obtained",
            SwapPhase::DestSubmitted => "dest_submitted",
            SwapPhase::DestConfirmed => "dest_confirmed",
            SwapPhase::Completed => "completed",
            SwapPhase::Failed(_) => "failed",
        }
    }

    /// Rebuilds a phase from its stored name and, for `failed`, its reason.
    pub fn parse(name: &str, reason: Option<&str>) -> anyhow::Result<Self> {
        let phase = match name {
            "initiated" => SwapPhase::Initiated,
            "source_submitted" => SwapPhase::SourceSubmitted,
            "source_confirmed" => SwapPhase::SourceConfirmed,
            "sequence_obtained" => SwapPhase::SequenceObtained,
            "attestation_pending" => SwapPhase::AttestationPending,
            "attestation_obtained" => SwapPhase::AttestationObtained,
            "dest_submitted" => SwapPhase::DestSubmitted,
            "dest_confirmed" => SwapPhase::DestConfirmed,
            "completed" => SwapPhase::Completed,
            "failed" => {
                let reason = reason
                    .ok_or_else(|| anyhow::anyhow!("failed phase without a reason"))?
                    .parse()?;
                SwapPhase::Failed(reason)
            }
            other => anyhow::bail!("unknown swap phase: {other}"),
        };
        Ok(phase)
    }

    pub fn failure_reason(self) -> Option<FailureReason> {
        match self {
            SwapPhase::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapPhase::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// An accepted trade instruction. `request_id` is the idempotency key of the
/// whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub request_id: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl SwapRequest {
    pub fn new(direction: Direction, amount: Decimal) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            direction,
            amount,
            created_at: Utc::now(),
        }
    }

    pub fn from_record(record: &SwapRecord) -> Self {
        Self {
            request_id: record.request_id.clone(),
            direction: record.direction,
            amount: record.amount,
            created_at: record.started_at,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid phase transition for {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: SwapPhase,
        to: SwapPhase,
    },
    #[error("swap {request_id} is terminal ({phase}) and can no longer change")]
    AlreadyTerminal { request_id: String, phase: SwapPhase },
    #[error("swap {request_id}: {field} is already set and cannot change")]
    FieldOverwritten {
        request_id: String,
        field: &'static str,
    },
    #[error("swap {request_id}: {field} differs from the original request")]
    RequestMismatch {
        request_id: String,
        field: &'static str,
    },
}

/// Persisted unit; one per `request_id`, stored as a sequence of snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub request_id: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub phase: SwapPhase,

    pub source_tx_id: Option<TxId>,
    pub sequence: Option<u64>,
    pub attestation: Option<Attestation>,
    pub dest_tx_id: Option<TxId>,
    pub result_amount: Option<Decimal>,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl SwapRecord {
    pub fn initiated(request: &SwapRequest) -> Self {
        Self::with_phase(request, SwapPhase::Initiated)
    }

    /// A record that fails before any on-chain action (e.g. a failed balance
    /// check) still gets a single `Failed` snapshot for the audit trail.
    pub fn rejected(request: &SwapRequest, reason: FailureReason, detail: String) -> Self {
        let mut record = Self::with_phase(request, SwapPhase::Failed(reason));
        record.error = Some(detail);
        record
    }

    fn with_phase(request: &SwapRequest, phase: SwapPhase) -> Self {
        Self {
            request_id: request.request_id.clone(),
            direction: request.direction,
            amount: request.amount,
            phase,
            source_tx_id: None,
            sequence: None,
            attestation: None,
            dest_tx_id: None,
            result_amount: None,
            started_at: request.created_at,
            updated_at: Utc::now(),
            error: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// Moves to `to`, refusing anything but the next phase or `Failed`.
    pub fn advance(&mut self, to: SwapPhase) -> Result<(), TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                request_id: self.request_id.clone(),
                phase: self.phase,
            });
        }
        if !self.phase.can_advance_to(to) {
            return Err(TransitionError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Checks that `next` is a legal snapshot to store after `self`.
    pub fn check_successor(&self, next: &SwapRecord) -> Result<(), TransitionError> {
        let request_id = &self.request_id;
        let mismatch = |field| TransitionError::RequestMismatch {
            request_id: request_id.clone(),
            field,
        };
        if next.request_id != self.request_id {
            return Err(mismatch("request_id"));
        }
        if next.direction != self.direction {
            return Err(mismatch("direction"));
        }
        if next.amount != self.amount {
            return Err(mismatch("amount"));
        }
        if next.started_at != self.started_at {
            return Err(mismatch("started_at"));
        }

        if self.phase.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                request_id: request_id.clone(),
                phase: self.phase,
            });
        }
        if !self.phase.can_advance_to(next.phase) {
            return Err(TransitionError::InvalidTransition {
                request_id: request_id.clone(),
                from: self.phase,
                to: next.phase,
            });
        }

        let overwritten = |field| TransitionError::FieldOverwritten {
            request_id: request_id.clone(),
            field,
        };
        if self.source_tx_id.is_some() && next.source_tx_id != self.source_tx_id {
            return Err(overwritten("source_tx_id"));
        }
        if self.sequence.is_some() && next.sequence != self.sequence {
            return Err(overwritten("sequence"));
        }
        if self.attestation.is_some() && next.attestation != self.attestation {
            return Err(overwritten("attestation"));
        }
        if self.dest_tx_id.is_some() && next.dest_tx_id != self.dest_tx_id {
            return Err(overwritten("dest_tx_id"));
        }
        if self.result_amount.is_some() && next.result_amount != self.result_amount {
            return Err(overwritten("result_amount"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SwapRequest {
        SwapRequest::new(Direction::Buy, Decimal::ONE)
    }

    #[test]
    fn phases_walk_in_order_to_completed() {
        let mut phase = SwapPhase::Initiated;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next.rank() > phase.rank());
            phase = next;
            seen.push(phase);
        }
        assert_eq!(phase, SwapPhase::Completed);
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn failed_is_reachable_from_any_live_phase_and_absorbing() {
        let failed = SwapPhase::Failed(FailureReason::Unexpected);
        assert!(SwapPhase::Initiated.can_advance_to(failed));
        assert!(SwapPhase::DestConfirmed.can_advance_to(failed));
        assert!(!failed.can_advance_to(SwapPhase::Completed));
        assert!(!SwapPhase::Completed.can_advance_to(failed));
    }

    #[test]
    fn advance_rejects_skips_and_regressions() {
        let mut record = SwapRecord::initiated(&request());
        let err = record.advance(SwapPhase::SourceConfirmed).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));

        record.advance(SwapPhase::SourceSubmitted).unwrap();
        let err = record.advance(SwapPhase::Initiated).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn successor_cannot_clear_or_rewrite_set_fields() {
        let mut prev = SwapRecord::initiated(&request());
        prev.phase = SwapPhase::SequenceObtained;
        prev.source_tx_id = Some(TxId::new("tx-1"));
        prev.sequence = Some(7);

        let mut next = prev.clone();
        next.phase = SwapPhase::AttestationPending;
        assert_eq!(prev.check_successor(&next), Ok(()));

        next.sequence = Some(8);
        assert!(matches!(
            prev.check_successor(&next),
            Err(TransitionError::FieldOverwritten {
                field: "sequence",
                ..
            })
        ));

        next.sequence = None;
        assert!(prev.check_successor(&next).is_err());
    }

    #[test]
    fn phase_names_round_trip_through_storage_form() {
        let failed = SwapPhase::Failed(FailureReason::SequenceNotFound);
        let parsed = SwapPhase::parse(failed.as_str(), Some("sequence_not_found")).unwrap();
        assert_eq!(parsed, failed);
        assert!(SwapPhase::parse("failed", None).is_err());
        assert_eq!(
            SwapPhase::parse("attestation_pending", None).unwrap(),
            SwapPhase::AttestationPending
        );
    }

    #[test]
    fn direction_maps_onto_chains() {
        assert_eq!(Direction::Buy.from_chain(), Chain::Source);
        assert_eq!(Direction::Buy.to_chain(), Chain::Destination);
        assert_eq!(Direction::Sell.from_chain(), Chain::Destination);
        assert_eq!(Direction::Sell.to_chain(), Chain::Source);
    }
}
