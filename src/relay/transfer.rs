//! Transfer records: the unit of crosschain relay work

use crate::chain::ChainId;
use crate::error::{RelayError, RelayResult};
use crate::events::ChainEvent;

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a transfer. Transitions only move forward; `Settled` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Seen in a `CrosschainSend` event, not yet submitted
    Observed,
    /// Settlement submission in progress
    Dispatched,
    /// Settlement accepted by the counterpart chain
    Settled,
    /// Retry ceiling exhausted or rejected by the counterpart chain
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Observed => "observed",
            TransferStatus::Dispatched => "dispatched",
            TransferStatus::Settled => "settled",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "observed" => Some(TransferStatus::Observed),
            "dispatched" => Some(TransferStatus::Dispatched),
            "settled" => Some(TransferStatus::Settled),
            "failed" => Some(TransferStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status ends the lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Settled | TransferStatus::Failed)
    }

    /// Whether `next` is a legal forward move from this status
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Observed, Dispatched)
                | (Observed, Failed)
                | (Dispatched, Settled)
                | (Dispatched, Failed)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single crosschain transfer, keyed by the originating transaction hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Hash of the transaction that emitted the `CrosschainSend` event.
    /// Globally unique per transfer; the idempotency key.
    pub origin_tx_hash: H256,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub source_address: Address,
    pub destination_address: Address,
    pub amount: U256,
    pub status: TransferStatus,
    /// Settlement submission attempts so far
    pub attempts: u32,
    /// Populated when the transfer reaches `Failed`
    pub failure_reason: Option<String>,
    /// Operator has cleared this transfer after a failure
    pub acknowledged: bool,
}

impl Transfer {
    /// Build a freshly observed transfer from a send event. Returns `None`
    /// for non-send events.
    pub fn from_send_event(event: &ChainEvent) -> Option<Self> {
        match event {
            ChainEvent::Send {
                chain,
                source_address,
                destination_chain,
                destination_address,
                amount,
                tx_hash,
                ..
            } => Some(Transfer {
                origin_tx_hash: *tx_hash,
                source_chain: *chain,
                destination_chain: *destination_chain,
                source_address: *source_address,
                destination_address: *destination_address,
                amount: *amount,
                status: TransferStatus::Observed,
                attempts: 0,
                failure_reason: None,
                acknowledged: false,
            }),
            ChainEvent::Settled { .. } => None,
        }
    }

    /// Move the transfer forward. Rejects backward or out-of-order moves so
    /// terminal statuses stay terminal.
    pub fn advance(&mut self, next: TransferStatus) -> RelayResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(RelayError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transfer {
        Transfer {
            origin_tx_hash: H256::from_low_u64_be(1),
            source_chain: ChainId::Eth,
            destination_chain: ChainId::Etc,
            source_address: Address::from_low_u64_be(0xA),
            destination_address: Address::from_low_u64_be(0xC),
            amount: U256::from(100u64),
            status: TransferStatus::Observed,
            attempts: 0,
            failure_reason: None,
            acknowledged: false,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = sample();
        t.advance(TransferStatus::Dispatched).unwrap();
        t.advance(TransferStatus::Settled).unwrap();
        assert!(t.status.is_terminal());
    }

    #[test]
    fn terminal_statuses_absorb() {
        let mut t = sample();
        t.advance(TransferStatus::Dispatched).unwrap();
        t.advance(TransferStatus::Settled).unwrap();

        assert!(t.advance(TransferStatus::Dispatched).is_err());
        assert!(t.advance(TransferStatus::Failed).is_err());
        assert_eq!(t.status, TransferStatus::Settled);

        let mut f = sample();
        f.advance(TransferStatus::Failed).unwrap();
        assert!(f.advance(TransferStatus::Dispatched).is_err());
        assert_eq!(f.status, TransferStatus::Failed);
    }

    #[test]
    fn no_settling_without_dispatch() {
        let mut t = sample();
        assert!(t.advance(TransferStatus::Settled).is_err());
    }

    #[test]
    fn from_send_event_preserves_fields() {
        let event = ChainEvent::Send {
            chain: ChainId::Etc,
            source_address: Address::from_low_u64_be(0xB),
            destination_chain: ChainId::Eth,
            destination_address: Address::from_low_u64_be(0xD),
            amount: U256::from(42u64),
            tx_hash: H256::from_low_u64_be(7),
            block_number: 5,
        };
        let t = Transfer::from_send_event(&event).unwrap();
        assert_eq!(t.source_chain, ChainId::Etc);
        assert_eq!(t.destination_chain, ChainId::Eth);
        assert_eq!(t.amount, U256::from(42u64));
        assert_eq!(t.status, TransferStatus::Observed);
        assert_eq!(t.attempts, 0);
    }
}
