//! Read model: per-chain balances and supply for UI consumption
//!
//! Updated only in reaction to confirmed on-chain events, never from a
//! dispatch attempt, so observers never see state that could roll back with
//! a failed settlement. Single writer (the updater task); readers take
//! cloned snapshots.

use crate::chain::{ChainId, ChainManager};
use crate::error::RelayResult;
use crate::events::ChainEvent;

use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

/// Snapshot of one chain's token state
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    /// Balances of accounts seen in transfer events; entries are created
    /// lazily on first observation
    pub balances: HashMap<Address, U256>,
    pub total_supply: U256,
    pub last_processed_block: u64,
}

/// Event-driven cache of chain state
pub struct StateCache {
    chains: Arc<ChainManager>,
    states: RwLock<HashMap<ChainId, ChainState>>,
    /// Version counter for UI push notification
    version_tx: watch::Sender<u64>,
    shutdown: Arc<RwLock<bool>>,
}

impl StateCache {
    pub fn new(chains: Arc<ChainManager>) -> Arc<Self> {
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            chains,
            states: RwLock::new(HashMap::new()),
            version_tx,
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    /// Updater loop: the cache's only write path
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        // Prime supply figures so the read model is not empty before the
        // first event
        for chain in self.chains.connected_chains() {
            self.refresh(chain, None).await;
        }

        let mut event_rx = self.chains.subscribe_events();
        info!("State cache updater started");

        loop {
            tokio::select! {
                result = event_rx.recv() => match result {
                    Ok(event) => self.apply(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("State cache lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if *self.shutdown.read().await {
                        break;
                    }
                }
            }
        }

        info!("State cache updater stopped");
        Ok(())
    }

    /// Apply one confirmed event
    pub async fn apply(&self, event: ChainEvent) {
        match event {
            ChainEvent::Send {
                chain,
                source_address,
                destination_chain,
                destination_address,
                block_number,
                ..
            } => {
                self.track(chain, source_address).await;
                self.track(destination_chain, destination_address).await;
                self.refresh(chain, Some(block_number)).await;
            }
            ChainEvent::Settled {
                chain,
                block_number,
                ..
            } => {
                self.refresh(chain, Some(block_number)).await;
            }
        }
    }

    /// Register an account for balance tracking
    async fn track(&self, chain: ChainId, account: Address) {
        let mut states = self.states.write().await;
        states
            .entry(chain)
            .or_default()
            .balances
            .entry(account)
            .or_default();
    }

    /// Re-read supply and all tracked balances for a chain from its ledger
    async fn refresh(&self, chain: ChainId, block_number: Option<u64>) {
        let client = match self.chains.get_client(chain) {
            Ok(c) => c,
            Err(e) => {
                warn!("State cache refresh skipped: {}", e);
                return;
            }
        };

        let accounts: Vec<Address> = {
            let states = self.states.read().await;
            states
                .get(&chain)
                .map(|s| s.balances.keys().copied().collect())
                .unwrap_or_default()
        };

        // Ledger reads happen outside the lock; a failed read keeps the
        // previous figure rather than publishing a partial update
        let mut fresh_balances = Vec::with_capacity(accounts.len());
        for account in accounts {
            match client.get_balance(account).await {
                Ok(balance) => fresh_balances.push((account, balance)),
                Err(e) => warn!("Balance read failed for {:?} on {}: {}", account, chain, e),
            }
        }

        let supply = match client.get_total_supply().await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Supply read failed on {}: {}", chain, e);
                None
            }
        };

        {
            let mut states = self.states.write().await;
            let state = states.entry(chain).or_default();
            for (account, balance) in fresh_balances {
                state.balances.insert(account, balance);
            }
            if let Some(supply) = supply {
                state.total_supply = supply;
            }
            if let Some(block) = block_number {
                if block > state.last_processed_block {
                    state.last_processed_block = block;
                }
            }
        }

        self.version_tx.send_modify(|v| *v += 1);
        debug!("State cache refreshed for {}", chain);
    }

    /// Point-in-time snapshot of one chain's state
    pub async fn snapshot(&self, chain: ChainId) -> ChainState {
        self.states
            .read()
            .await
            .get(&chain)
            .cloned()
            .unwrap_or_default()
    }

    /// Cached balance, if the account has been observed
    pub async fn balance(&self, chain: ChainId, account: Address) -> Option<U256> {
        self.states
            .read()
            .await
            .get(&chain)
            .and_then(|s| s.balances.get(&account).copied())
    }

    /// Change notification for UI binding; the value is a version counter
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
