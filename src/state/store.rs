//! The transfer store seam

use crate::chain::ChainId;
use crate::error::RelayResult;
use crate::events::EventKind;
use crate::relay::{Transfer, TransferStatus};

use async_trait::async_trait;
use ethers::types::H256;

/// Counts of transfers by status
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub observed: u64,
    pub dispatched: u64,
    pub settled: u64,
    pub failed: u64,
}

/// Durable keyed store for transfer records and watcher checkpoints.
///
/// The origin transaction hash is the key everywhere; single-writer-per-key
/// discipline is the dispatcher's job, the store only has to be atomic per
/// operation.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Run schema migrations, if the backend has any
    async fn migrate(&self) -> RelayResult<()> {
        Ok(())
    }

    /// Insert a freshly observed transfer. Returns `false` without touching
    /// the record when the key already exists - the idempotency primitive.
    async fn insert_new(&self, transfer: &Transfer) -> RelayResult<bool>;

    /// Fetch a transfer by origin hash
    async fn get(&self, origin_tx_hash: H256) -> RelayResult<Option<Transfer>>;

    /// Persist the current state of a transfer (status, attempts, reason)
    async fn update(&self, transfer: &Transfer) -> RelayResult<()>;

    /// All transfers that have not reached `Settled` or `Failed`. Loaded on
    /// startup to resume interrupted work.
    async fn non_terminal(&self) -> RelayResult<Vec<Transfer>>;

    /// List transfers, optionally filtered by status
    async fn list(&self, status: Option<TransferStatus>) -> RelayResult<Vec<Transfer>>;

    /// Operator acknowledgement of a failed transfer. Returns `false` if the
    /// transfer does not exist or is not `Failed`.
    async fn acknowledge(&self, origin_tx_hash: H256) -> RelayResult<bool>;

    /// Last processed block for a (chain, event kind) subscription
    async fn get_checkpoint(&self, chain: ChainId, kind: EventKind) -> RelayResult<u64>;

    /// Persist the last processed block for a (chain, event kind) subscription
    async fn save_checkpoint(&self, chain: ChainId, kind: EventKind, block: u64)
        -> RelayResult<()>;

    /// Transfer counts by status
    async fn stats(&self) -> RelayResult<TransferStats>;

    /// Backend liveness probe
    async fn health_check(&self) -> RelayResult<()>;
}
