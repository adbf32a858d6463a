//! Chain module - per-chain gateways and event watching
//!
//! This module provides:
//! - The [`LedgerClient`] gateway trait and its EVM implementation
//! - Per-(chain, event kind) watchers with dedup and backoff resubscription
//! - The [`ChainManager`] tying clients and watchers together

pub mod client;
pub mod evm;
pub mod watcher;

pub use client::{EventStream, LedgerClient, RawEvent};
pub use evm::EvmLedgerClient;
pub use watcher::EventWatcher;

use crate::config::{RelayerConfig, Settings};
use crate::error::{RelayError, RelayResult};
use crate::events::{ChainEvent, EventKind};
use crate::state::TransferStore;

use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

/// First-class identifier of the two paired ledgers.
///
/// Wire identifiers (the numeric chain ids the token contracts use) live
/// only in [`ChainId::wire_id`] and [`ChainId::from_wire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Eth,
    Etc,
}

impl ChainId {
    pub const ALL: [ChainId; 2] = [ChainId::Eth, ChainId::Etc];

    /// Numeric id used in contract calls and events
    pub fn wire_id(&self) -> u64 {
        match self {
            ChainId::Eth => 1,
            ChainId::Etc => 2,
        }
    }

    pub fn from_wire(id: u64) -> Option<Self> {
        match id {
            1 => Some(ChainId::Eth),
            2 => Some(ChainId::Etc),
            _ => None,
        }
    }

    /// The chain settlements for this chain's sends land on
    pub fn counterpart(&self) -> ChainId {
        match self {
            ChainId::Eth => ChainId::Etc,
            ChainId::Etc => ChainId::Eth,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Eth => "eth",
            ChainId::Etc => "etc",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eth" => Ok(ChainId::Eth),
            "etc" => Ok(ChainId::Etc),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

/// Manages gateways and watchers for all configured chains
pub struct ChainManager {
    /// Ledger clients indexed by chain
    clients: DashMap<ChainId, Arc<dyn LedgerClient>>,
    /// Deduplicated canonical events from all watchers
    event_tx: broadcast::Sender<ChainEvent>,
    /// Store for watcher checkpoints
    store: Arc<dyn TransferStore>,
    /// Relayer tuning knobs shared with the watchers
    relayer_config: RelayerConfig,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl ChainManager {
    /// Create a manager with EVM gateways for all enabled chains
    pub async fn new(settings: &Settings, store: Arc<dyn TransferStore>) -> RelayResult<Self> {
        let clients = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!("Initializing chain {} ({})", chain_config.chain, name);
            let client =
                EvmLedgerClient::new(chain_config.clone(), &settings.wallet, &settings.relayer)
                    .await?;
            clients.insert(chain_config.chain, Arc::new(client) as Arc<dyn LedgerClient>);
        }

        Ok(Self::with_clients(clients, settings.relayer.clone(), store))
    }

    /// Wire a manager over pre-built clients. Test seam and extension point
    /// for non-EVM gateways.
    pub fn with_clients(
        clients: DashMap<ChainId, Arc<dyn LedgerClient>>,
        relayer_config: RelayerConfig,
        store: Arc<dyn TransferStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(10000);
        Self {
            clients,
            event_tx,
            store,
            relayer_config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Start one watcher per (chain, event kind). Watchers run until
    /// shutdown; each handles its own resubscription, so a stalled chain
    /// never delays the others.
    pub async fn start_watchers(&self) -> RelayResult<()> {
        let mut handles = Vec::new();

        for entry in self.clients.iter() {
            for kind in [EventKind::Send, EventKind::Settled] {
                let watcher = EventWatcher::new(
                    entry.value().clone(),
                    kind,
                    self.event_tx.clone(),
                    self.store.clone(),
                    self.relayer_config.clone(),
                    self.shutdown.clone(),
                );

                handles.push(tokio::spawn(async move {
                    if let Err(e) = watcher.run().await {
                        error!("Watcher error: {}", e);
                    }
                }));
            }
        }

        futures::future::join_all(handles).await;
        Ok(())
    }

    /// Subscribe to deduplicated events from all chains
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.event_tx.subscribe()
    }

    /// Get the gateway for a specific chain
    pub fn get_client(&self, chain: ChainId) -> RelayResult<Arc<dyn LedgerClient>> {
        self.clients
            .get(&chain)
            .map(|c| c.clone())
            .ok_or(RelayError::ChainNotFound { chain })
    }

    /// Gateway for the chain a transfer settles on
    pub fn destination_client(&self, chain: ChainId) -> RelayResult<Arc<dyn LedgerClient>> {
        self.get_client(chain)
    }

    /// Initiate an outbound transfer on `source_chain`. The resulting
    /// `CrosschainSend` event flows back through the watcher pipeline.
    pub async fn submit_transfer_request(
        &self,
        source_chain: ChainId,
        destination_address: Address,
        amount: U256,
    ) -> RelayResult<H256> {
        let client = self.get_client(source_chain)?;
        client
            .initiate_send(source_chain.counterpart(), destination_address, amount)
            .await
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainId, bool)> {
        // Snapshot the clients so no DashMap guard is held across the await
        // below (the guard over an `Arc<dyn LedgerClient>` value is not
        // Send-compatible under the watcher/handler HRTB bounds).
        let clients: Vec<(ChainId, Arc<dyn LedgerClient>)> = self
            .clients
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut results = Vec::new();

        for (chain, client) in clients {
            let healthy = client.get_block_number().await.is_ok();
            results.push((chain, healthy));

            crate::metrics::record_chain_health(chain, healthy);
        }

        results
    }

    /// All connected chains
    pub fn connected_chains(&self) -> Vec<ChainId> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    /// Stop all watchers
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_round_trip() {
        for chain in ChainId::ALL {
            assert_eq!(ChainId::from_wire(chain.wire_id()), Some(chain));
        }
        assert_eq!(ChainId::from_wire(0), None);
        assert_eq!(ChainId::from_wire(3), None);
    }

    #[test]
    fn counterparts_are_symmetric() {
        for chain in ChainId::ALL {
            assert_eq!(chain.counterpart().counterpart(), chain);
            assert_ne!(chain.counterpart(), chain);
        }
    }

    #[test]
    fn parses_from_str() {
        assert_eq!("eth".parse::<ChainId>().unwrap(), ChainId::Eth);
        assert_eq!("etc".parse::<ChainId>().unwrap(), ChainId::Etc);
        assert!("sol".parse::<ChainId>().is_err());
    }
}
