//! Error types for the crosschain relayer

use crate::chain::ChainId;
use ethers::types::H256;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Subscription error on {chain}: {message}")]
    Subscription { chain: ChainId, message: String },

    #[error("Submission error on {chain}: {message}")]
    Submission { chain: ChainId, message: String },

    /// The counterpart ledger reports the transfer as already processed.
    /// Not a failure: the dispatcher treats this as settlement confirmation.
    #[error("Transfer {origin_tx:?} already settled")]
    AlreadySettled { origin_tx: H256 },

    #[error("Settlement for {origin_tx:?} rejected by ledger: {reason}")]
    Validation { origin_tx: H256, reason: String },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Chain {chain} not configured")]
    ChainNotFound { chain: ChainId },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Check if the error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Subscription { .. }
                | RelayError::Submission { .. }
                | RelayError::Timeout { .. }
        )
    }

    /// Check if the error actually signals success (at-least-once submission
    /// landing on an already-processed transfer)
    pub fn is_already_settled(&self) -> bool {
        matches!(self, RelayError::AlreadySettled { .. })
    }
}

/// Result type for relayer operations
pub type RelayResult<T> = Result<T, RelayError>;
