//! Relay pipeline: transfer records and the dispatcher
//!
//! The dispatcher:
//! 1. Consumes deduplicated send events from all chains
//! 2. Owns the idempotency store keyed by origin transaction hash
//! 3. Submits exactly one settlement per transfer to the counterpart chain
//! 4. Retries transient failures and surfaces exhausted transfers as failed

pub mod dispatcher;
pub mod transfer;

pub use dispatcher::RelayDispatcher;
pub use transfer::{Transfer, TransferStatus};
