//! Per-(chain, event kind) watcher with dedup and backoff resubscription
//!
//! Raw logs come in over a restartable subscription that is allowed to
//! redeliver history; the watcher turns them into canonical events and
//! guarantees at-most-one emission per (origin tx hash, kind) within the
//! recency window. A stalled subscription on one chain never delays the
//! watchers of the other chain.

use crate::chain::LedgerClient;
use crate::config::RelayerConfig;
use crate::error::RelayResult;
use crate::events::{ChainEvent, EventKind, EventParser};
use crate::state::TransferStore;

use ethers::types::{Log, H256};
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Bounded recency set over dedup keys. Oldest keys fall out first, so a
/// replay further back than the window is caught by the dispatcher's
/// idempotency store instead.
pub struct DedupWindow {
    seen: HashSet<(H256, EventKind)>,
    order: VecDeque<(H256, EventKind)>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a key. Returns `false` when the key was already present.
    pub fn insert(&mut self, key: (H256, EventKind)) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Watches one event kind on one chain
pub struct EventWatcher {
    client: Arc<dyn LedgerClient>,
    kind: EventKind,
    event_tx: broadcast::Sender<ChainEvent>,
    store: Arc<dyn TransferStore>,
    config: RelayerConfig,
    shutdown: Arc<RwLock<bool>>,
    parser: EventParser,
}

impl EventWatcher {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        kind: EventKind,
        event_tx: broadcast::Sender<ChainEvent>,
        store: Arc<dyn TransferStore>,
        config: RelayerConfig,
        shutdown: Arc<RwLock<bool>>,
    ) -> Self {
        let parser = EventParser::new(client.chain());
        Self {
            client,
            kind,
            event_tx,
            store,
            config,
            shutdown,
            parser,
        }
    }

    /// Subscribe, consume, resubscribe with exponential backoff. Runs until
    /// shutdown. Redelivery after a resubscription race is harmless: the
    /// dedup window absorbs it.
    pub async fn run(&self) -> RelayResult<()> {
        let chain = self.client.chain();
        let mut dedup = DedupWindow::new(self.config.dedup_window);
        let mut backoff_exp: u32 = 0;

        info!("Watcher started for {} {:?}", chain, self.kind);

        loop {
            if *self.shutdown.read().await {
                break;
            }

            let checkpoint = self.store.get_checkpoint(chain, self.kind).await?;
            let from_block = if checkpoint > 0 { checkpoint + 1 } else { 0 };

            let mut stream = match self.client.subscribe(self.kind, from_block).await {
                Ok(s) => s,
                Err(e) => {
                    crate::metrics::record_subscription_error(chain);
                    warn!("Subscription failed for {} {:?}: {}", chain, self.kind, e);
                    self.sleep_backoff(&mut backoff_exp).await;
                    continue;
                }
            };

            // Healthy subscription; subsequent failures back off from scratch
            backoff_exp = 0;

            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(log)) => {
                            if let Err(e) = self.process_log(log, &mut dedup).await {
                                warn!("Failed to process log on {}: {}", chain, e);
                            }
                        }
                        Some(Err(e)) => {
                            crate::metrics::record_subscription_error(chain);
                            warn!("Subscription error on {} {:?}: {}", chain, self.kind, e);
                            break;
                        }
                        None => {
                            debug!("Subscription ended on {} {:?}", chain, self.kind);
                            break;
                        }
                    },
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {
                        if *self.shutdown.read().await {
                            return Ok(());
                        }
                    }
                }
            }

            self.sleep_backoff(&mut backoff_exp).await;
        }

        info!("Watcher stopped for {} {:?}", chain, self.kind);
        Ok(())
    }

    async fn process_log(&self, log: Log, dedup: &mut DedupWindow) -> RelayResult<()> {
        let chain = self.client.chain();

        let event = match self.parser.parse_log(&log)? {
            Some(event) if event.kind() == self.kind => event,
            // Unrelated topic or the other watcher's kind
            _ => return Ok(()),
        };

        if !dedup.insert((event.tx_hash(), event.kind())) {
            crate::metrics::record_duplicate_event(chain, self.kind);
            debug!(
                "Dropped duplicate {} event {:?} on {}",
                self.kind.name(),
                event.tx_hash(),
                chain
            );
            return Ok(());
        }

        crate::metrics::record_event(event.chain(), event.kind());
        debug!("{} event on {}: {:?}", self.kind.name(), chain, event.tx_hash());

        // No receivers is fine (startup ordering)
        let _ = self.event_tx.send(event.clone());

        self.store
            .save_checkpoint(chain, self.kind, event.block_number())
            .await?;

        Ok(())
    }

    async fn sleep_backoff(&self, exp: &mut u32) {
        let delay = self
            .config
            .retry_delay_ms
            .saturating_mul(1u64 << (*exp).min(16))
            .min(self.config.max_retry_delay_ms);
        *exp = exp.saturating_add(1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainId, EventStream};
    use crate::events::testing::send_log;
    use crate::relay::Transfer;
    use crate::state::MemoryTransferStore;

    use async_trait::async_trait;
    use ethers::types::{Address, U256};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    fn test_config() -> RelayerConfig {
        RelayerConfig {
            poll_interval_ms: 10,
            max_concurrent_submissions: 4,
            max_retries: 3,
            retry_delay_ms: 10,
            max_retry_delay_ms: 50,
            dedup_window: 64,
            shutdown_grace_secs: 1,
            health_check_interval_secs: 60,
        }
    }

    /// Client whose subscriptions replay scripted batches, one per
    /// subscribe call; the last batch is followed by a pending stream.
    struct ScriptedClient {
        chain: ChainId,
        batches: Mutex<VecDeque<Vec<RelayResult<Log>>>>,
    }

    impl ScriptedClient {
        fn new(chain: ChainId, batches: Vec<Vec<RelayResult<Log>>>) -> Self {
            Self {
                chain,
                batches: Mutex::new(batches.into()),
            }
        }
    }

    #[async_trait]
    impl LedgerClient for ScriptedClient {
        fn chain(&self) -> ChainId {
            self.chain
        }

        async fn subscribe(&self, _kind: EventKind, _from_block: u64) -> RelayResult<EventStream> {
            let batch = self.batches.lock().await.pop_front();
            match batch {
                Some(items) => Ok(Box::pin(futures::stream::iter(items)) as EventStream),
                // Script exhausted: stay silent instead of spinning
                None => Ok(Box::pin(futures::stream::pending::<RelayResult<Log>>())),
            }
        }

        async fn submit_settlement(&self, _transfer: &Transfer) -> RelayResult<H256> {
            unimplemented!("not used by watcher tests")
        }

        async fn is_settled(&self, _chain: ChainId, _tx: H256) -> RelayResult<bool> {
            unimplemented!("not used by watcher tests")
        }

        async fn initiate_send(
            &self,
            _destination_chain: ChainId,
            _destination_address: Address,
            _amount: U256,
        ) -> RelayResult<H256> {
            unimplemented!("not used by watcher tests")
        }

        async fn get_balance(&self, _account: Address) -> RelayResult<U256> {
            Ok(U256::zero())
        }

        async fn get_total_supply(&self) -> RelayResult<U256> {
            Ok(U256::zero())
        }

        async fn get_block_number(&self) -> RelayResult<u64> {
            Ok(0)
        }
    }

    fn spawn_watcher(
        client: Arc<dyn LedgerClient>,
        kind: EventKind,
        event_tx: broadcast::Sender<ChainEvent>,
        shutdown: Arc<RwLock<bool>>,
    ) {
        let watcher = EventWatcher::new(
            client,
            kind,
            event_tx,
            Arc::new(MemoryTransferStore::new()),
            test_config(),
            shutdown,
        );
        tokio::spawn(async move {
            let _ = watcher.run().await;
        });
    }

    #[test]
    fn dedup_window_drops_repeats_and_evicts() {
        let mut window = DedupWindow::new(2);
        let k1 = (H256::from_low_u64_be(1), EventKind::Send);
        let k2 = (H256::from_low_u64_be(2), EventKind::Send);
        let k3 = (H256::from_low_u64_be(3), EventKind::Send);

        assert!(window.insert(k1));
        assert!(!window.insert(k1));
        assert!(window.insert(k2));
        assert!(window.insert(k3));
        // k1 evicted by capacity; a very late replay would be re-admitted
        assert!(window.insert(k1));
    }

    #[test]
    fn dedup_distinguishes_kinds() {
        let mut window = DedupWindow::new(8);
        let hash = H256::from_low_u64_be(1);
        assert!(window.insert((hash, EventKind::Send)));
        assert!(window.insert((hash, EventKind::Settled)));
        assert!(!window.insert((hash, EventKind::Send)));
    }

    #[tokio::test]
    async fn redelivered_events_emit_once() {
        let source = Address::from_low_u64_be(0xA);
        let dest = Address::from_low_u64_be(0xC);
        let tx = H256::from_low_u64_be(0x1);
        let log = send_log(source, ChainId::Etc, dest, U256::from(100u64), tx, 5);

        // Same event delivered on two subscriptions (simulated reconnect)
        let client = Arc::new(ScriptedClient::new(
            ChainId::Eth,
            vec![vec![Ok(log.clone())], vec![Ok(log)]],
        ));

        let (event_tx, mut event_rx) = broadcast::channel(16);
        let shutdown = Arc::new(RwLock::new(false));
        spawn_watcher(client, EventKind::Send, event_tx, shutdown.clone());

        let first = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .expect("first delivery")
            .unwrap();
        assert_eq!(first.tx_hash(), tx);

        // The replayed copy must be absorbed
        let second = tokio::time::timeout(Duration::from_millis(300), event_rx.recv()).await;
        assert!(second.is_err(), "duplicate event leaked: {:?}", second);

        *shutdown.write().await = true;
    }

    #[tokio::test]
    async fn stalled_chain_does_not_delay_the_other() {
        // Chain A: subscription that never yields
        let stalled: Arc<dyn LedgerClient> =
            Arc::new(ScriptedClient::new(ChainId::Eth, vec![]));

        // Chain B: one send event
        let tx = H256::from_low_u64_be(0x2);
        let log = send_log(
            Address::from_low_u64_be(0xB),
            ChainId::Eth,
            Address::from_low_u64_be(0xD),
            U256::from(7u64),
            tx,
            3,
        );
        let live: Arc<dyn LedgerClient> =
            Arc::new(ScriptedClient::new(ChainId::Etc, vec![vec![Ok(log)]]));

        let (event_tx, mut event_rx) = broadcast::channel(16);
        let shutdown = Arc::new(RwLock::new(false));
        spawn_watcher(stalled, EventKind::Send, event_tx.clone(), shutdown.clone());
        spawn_watcher(live, EventKind::Send, event_tx, shutdown.clone());

        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .expect("live chain delivery despite stalled peer")
            .unwrap();
        assert_eq!(event.chain(), ChainId::Etc);
        assert_eq!(event.tx_hash(), tx);

        *shutdown.write().await = true;
    }
}
