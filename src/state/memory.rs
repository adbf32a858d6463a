//! In-memory transfer store for development and tests
//!
//! Same contract as the PostgreSQL backend minus durability: contents are
//! lost on restart, so it does not satisfy the recovery requirement in
//! production.

use super::store::{TransferStats, TransferStore};
use crate::chain::ChainId;
use crate::error::RelayResult;
use crate::events::EventKind;
use crate::relay::{Transfer, TransferStatus};

use async_trait::async_trait;
use ethers::types::H256;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryTransferStore {
    transfers: RwLock<HashMap<H256, Transfer>>,
    checkpoints: RwLock<HashMap<(ChainId, EventKind), u64>>,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn insert_new(&self, transfer: &Transfer) -> RelayResult<bool> {
        let mut transfers = self.transfers.write().await;
        if transfers.contains_key(&transfer.origin_tx_hash) {
            return Ok(false);
        }
        transfers.insert(transfer.origin_tx_hash, transfer.clone());
        Ok(true)
    }

    async fn get(&self, origin_tx_hash: H256) -> RelayResult<Option<Transfer>> {
        Ok(self.transfers.read().await.get(&origin_tx_hash).cloned())
    }

    async fn update(&self, transfer: &Transfer) -> RelayResult<()> {
        self.transfers
            .write()
            .await
            .insert(transfer.origin_tx_hash, transfer.clone());
        Ok(())
    }

    async fn non_terminal(&self) -> RelayResult<Vec<Transfer>> {
        Ok(self
            .transfers
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list(&self, status: Option<TransferStatus>) -> RelayResult<Vec<Transfer>> {
        Ok(self
            .transfers
            .read()
            .await
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    async fn acknowledge(&self, origin_tx_hash: H256) -> RelayResult<bool> {
        let mut transfers = self.transfers.write().await;
        match transfers.get_mut(&origin_tx_hash) {
            Some(t) if t.status == TransferStatus::Failed => {
                t.acknowledged = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_checkpoint(&self, chain: ChainId, kind: EventKind) -> RelayResult<u64> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&(chain, kind))
            .copied()
            .unwrap_or(0))
    }

    async fn save_checkpoint(
        &self,
        chain: ChainId,
        kind: EventKind,
        block: u64,
    ) -> RelayResult<()> {
        self.checkpoints.write().await.insert((chain, kind), block);
        Ok(())
    }

    async fn stats(&self) -> RelayResult<TransferStats> {
        let transfers = self.transfers.read().await;
        let mut stats = TransferStats::default();
        for t in transfers.values() {
            match t.status {
                TransferStatus::Observed => stats.observed += 1,
                TransferStatus::Dispatched => stats.dispatched += 1,
                TransferStatus::Settled => stats.settled += 1,
                TransferStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RelayResult<()> {
        Ok(())
    }
}
