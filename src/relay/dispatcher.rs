//! Relay dispatcher: exactly-once settlement per origin transaction hash

use super::transfer::{Transfer, TransferStatus};
use crate::chain::ChainManager;
use crate::config::RelayerConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::ChainEvent;
use crate::state::TransferStore;

use dashmap::DashMap;
use ethers::types::H256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// Submits settlement calls for observed transfers, exactly once per origin
/// transaction hash.
///
/// Idempotency is layered: the watcher dedup window absorbs short-range
/// replays, the in-flight key set serializes concurrent work on one key,
/// and the store is the durable source of truth across restarts.
pub struct RelayDispatcher {
    chains: Arc<ChainManager>,
    store: Arc<dyn TransferStore>,
    config: RelayerConfig,
    /// Keys currently owned by a submission task
    in_flight: Arc<DashMap<H256, ()>>,
    /// Bounded worker pool so a surge of sends cannot starve event intake
    submission_permits: Arc<Semaphore>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl RelayDispatcher {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn TransferStore>,
        config: RelayerConfig,
    ) -> Arc<Self> {
        let submission_permits = Arc::new(Semaphore::new(config.max_concurrent_submissions));
        Arc::new(Self {
            chains,
            store,
            config,
            in_flight: Arc::new(DashMap::new()),
            submission_permits,
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    /// Main dispatch loop
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        // Resume transfers interrupted by the previous shutdown or crash
        self.clone().resume_pending().await?;

        let mut event_rx = self.chains.subscribe_events();
        info!("Relay dispatcher started");

        loop {
            tokio::select! {
                result = event_rx.recv() => match result {
                    Ok(event) => self.clone().handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped events resurface through store recovery or
                        // a later replay; log loudly anyway
                        warn!("Dispatcher lagged {} events behind the watchers", n);
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

        info!("Relay dispatcher stopped");
        Ok(())
    }

    /// Reload all non-terminal transfers and dispatch them again. The
    /// already-settled pre-check makes this safe for transfers whose
    /// settlement landed while the relayer was down.
    pub async fn resume_pending(self: Arc<Self>) -> RelayResult<()> {
        let pending = self.store.non_terminal().await?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("Resuming {} non-terminal transfers", pending.len());
        for transfer in pending {
            self.clone().spawn_submission(transfer);
        }
        Ok(())
    }

    /// React to one deduplicated chain event
    async fn handle_event(self: Arc<Self>, event: ChainEvent) {
        if *self.shutdown.read().await {
            // Shutting down: no new dispatches; the event is either already
            // stored or will be replayed after restart
            return;
        }

        match &event {
            ChainEvent::Send { .. } => {
                let transfer = match Transfer::from_send_event(&event) {
                    Some(t) => t,
                    None => return,
                };
                self.accept(transfer).await;
            }
            ChainEvent::Settled { chain, amount, .. } => {
                // Settlement confirmations drive the read model, not us
                debug!("Settlement of {} confirmed on {}", amount, chain);
            }
        }
    }

    /// Admit a freshly observed transfer: idempotency store first, then the
    /// in-flight guard, then a worker slot.
    async fn accept(self: Arc<Self>, transfer: Transfer) {
        let key = transfer.origin_tx_hash;

        // Duplicate delivery past the watcher window or across restarts
        match self.store.get(key).await {
            Ok(Some(existing)) if existing.status.is_terminal() => {
                debug!("Ignoring replay of terminal transfer {:?}", key);
                return;
            }
            Ok(Some(existing)) => {
                // Known but unfinished (recovered record): drive the stored
                // version, not the replayed one
                self.spawn_submission(existing);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Store lookup failed for {:?}: {}", key, e);
                return;
            }
        }

        match self.store.insert_new(&transfer).await {
            Ok(true) => {
                crate::metrics::record_transfer_observed(transfer.source_chain);
                info!(
                    "Observed transfer {:?}: {} {} -> {} ({})",
                    key,
                    transfer.amount,
                    transfer.source_chain,
                    transfer.destination_chain,
                    transfer.destination_address,
                );
                self.spawn_submission(transfer);
            }
            // Lost the insert race to a concurrent observation
            Ok(false) => debug!("Transfer {:?} already recorded", key),
            Err(e) => error!("Failed to record transfer {:?}: {}", key, e),
        }
    }

    /// Run the settlement state machine on its own task, serialized per key
    fn spawn_submission(self: Arc<Self>, transfer: Transfer) {
        let key = transfer.origin_tx_hash;
        if self.in_flight.insert(key, ()).is_some() {
            // Another task already owns this key
            debug!("Transfer {:?} already in flight", key);
            return;
        }

        tokio::spawn(async move {
            let _permit = match self.submission_permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            if let Err(e) = self.process_transfer(transfer).await {
                error!("Settlement processing failed for {:?}: {}", key, e);
            }

            self.in_flight.remove(&key);
        });
    }

    /// Drive one transfer to a terminal status (or park it non-terminal on
    /// shutdown). Exactly-once is enforced here: every retry consults the
    /// counterpart ledger before resubmitting.
    async fn process_transfer(&self, transfer: Transfer) -> RelayResult<()> {
        let key = transfer.origin_tx_hash;

        // This task owns the key now; re-read the authoritative record so a
        // snapshot replayed across the ownership boundary cannot roll back
        // a transfer that just settled
        let mut transfer = match self.store.get(key).await? {
            Some(current) => current,
            None => transfer,
        };
        if transfer.status.is_terminal() {
            return Ok(());
        }

        let destination = self.chains.destination_client(transfer.destination_chain)?;
        let started = Instant::now();

        if transfer.status == TransferStatus::Observed {
            transfer.advance(TransferStatus::Dispatched)?;
            self.store.update(&transfer).await?;
        }

        let mut last_error: Option<RelayError> = None;

        while transfer.attempts < self.config.max_retries {
            transfer.attempts += 1;
            // Persist the attempt before submitting: at-least-once on the
            // wire, exactly-once through the already-settled check
            self.store.update(&transfer).await?;

            // A previous attempt (or a previous process) may have succeeded
            // despite a client-side timeout
            if transfer.attempts > 1 {
                match destination.is_settled(transfer.source_chain, key).await {
                    Ok(true) => {
                        info!("Transfer {:?} found settled on re-check", key);
                        return self.finish_settled(transfer, started).await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Settled re-check failed for {:?}: {}", key, e),
                }
            }

            match destination.submit_settlement(&transfer).await {
                Ok(tx_hash) => {
                    info!(
                        "Settlement submitted for {:?} on {}: {:?} (attempt {})",
                        key, transfer.destination_chain, tx_hash, transfer.attempts
                    );
                    return self.finish_settled(transfer, started).await;
                }
                Err(e) if e.is_already_settled() => {
                    info!("Transfer {:?} already settled on {}", key, transfer.destination_chain);
                    return self.finish_settled(transfer, started).await;
                }
                Err(RelayError::Validation { reason, .. }) => {
                    return self.finish_failed(transfer, reason).await;
                }
                Err(e) if e.is_retryable() => {
                    crate::metrics::record_submission_retry(transfer.destination_chain);
                    warn!(
                        "Settlement attempt {} for {:?} failed: {}",
                        transfer.attempts, key, e
                    );
                    last_error = Some(e);

                    if *self.shutdown.read().await {
                        // Park non-terminal; restart recovery resumes it
                        info!("Shutdown during retries, parking transfer {:?}", key);
                        return Ok(());
                    }

                    if transfer.attempts < self.config.max_retries {
                        tokio::time::sleep(self.backoff_delay(transfer.attempts)).await;
                    }
                }
                Err(e) => {
                    // Non-retryable infrastructure error
                    return self.finish_failed(transfer, e.to_string()).await;
                }
            }
        }

        // One last consultation before declaring failure: the final wire
        // attempt may have landed despite its error
        if let Ok(true) = destination.is_settled(transfer.source_chain, key).await {
            info!("Transfer {:?} found settled after retry ceiling", key);
            return self.finish_settled(transfer, started).await;
        }

        let reason = match last_error {
            Some(e) => format!("retry ceiling exhausted: {}", e),
            None => "retry ceiling exhausted".to_string(),
        };
        self.finish_failed(transfer, reason).await
    }

    async fn finish_settled(&self, mut transfer: Transfer, started: Instant) -> RelayResult<()> {
        transfer.advance(TransferStatus::Settled)?;
        self.store.update(&transfer).await?;

        crate::metrics::record_transfer_settled(transfer.destination_chain);
        crate::metrics::record_dispatch_latency(
            transfer.destination_chain,
            started.elapsed().as_secs_f64(),
        );
        Ok(())
    }

    async fn finish_failed(&self, mut transfer: Transfer, reason: String) -> RelayResult<()> {
        error!(
            "Transfer {:?} failed after {} attempts, operator intervention required: {}",
            transfer.origin_tx_hash, transfer.attempts, reason
        );

        transfer.advance(TransferStatus::Failed)?;
        transfer.failure_reason = Some(reason);
        self.store.update(&transfer).await?;

        crate::metrics::record_transfer_failed(transfer.destination_chain);
        Ok(())
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .retry_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_retry_delay_ms);
        Duration::from_millis(delay)
    }

    /// Stop accepting new dispatches
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Relay dispatcher shutdown initiated");
    }

    /// Wait for in-flight submissions to reach a terminal status, up to the
    /// configured grace period. Anything still pending is already persisted
    /// and resumes on restart.
    pub async fn drain(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_grace_secs);
        while !self.in_flight.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    "Shutdown grace expired with {} submissions in flight",
                    self.in_flight.len()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainId, EventStream, LedgerClient};
    use crate::events::EventKind;
    use crate::state::MemoryTransferStore;

    use async_trait::async_trait;
    use ethers::types::{Address, U256};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    fn test_config(max_retries: u32) -> RelayerConfig {
        RelayerConfig {
            poll_interval_ms: 10,
            max_concurrent_submissions: 4,
            max_retries,
            retry_delay_ms: 5,
            max_retry_delay_ms: 20,
            dedup_window: 64,
            shutdown_grace_secs: 1,
            health_check_interval_secs: 60,
        }
    }

    /// What the fake ledger answers on each consecutive submission
    enum SubmitOutcome {
        Accept,
        Transient,
        AlreadySettled,
        Reject(&'static str),
    }

    /// Ledger double that scripts submission outcomes and the settled flag,
    /// and records every real submission it receives.
    struct FakeLedger {
        chain: ChainId,
        submit_script: Mutex<VecDeque<SubmitOutcome>>,
        settled_script: Mutex<VecDeque<bool>>,
        submissions: Mutex<Vec<Transfer>>,
    }

    impl FakeLedger {
        fn new(chain: ChainId, script: Vec<SubmitOutcome>, settled: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                chain,
                submit_script: Mutex::new(script.into()),
                settled_script: Mutex::new(settled.into()),
                submissions: Mutex::new(Vec::new()),
            })
        }

        async fn submission_count(&self) -> usize {
            self.submissions.lock().await.len()
        }
    }

    #[async_trait]
    impl LedgerClient for FakeLedger {
        fn chain(&self) -> ChainId {
            self.chain
        }

        async fn subscribe(&self, _kind: EventKind, _from: u64) -> RelayResult<EventStream> {
            Ok(Box::pin(futures::stream::pending::<
                RelayResult<ethers::types::Log>,
            >()))
        }

        async fn submit_settlement(&self, transfer: &Transfer) -> RelayResult<H256> {
            self.submissions.lock().await.push(transfer.clone());
            let outcome = self
                .submit_script
                .lock()
                .await
                .pop_front()
                .unwrap_or(SubmitOutcome::Accept);
            match outcome {
                SubmitOutcome::Accept => Ok(H256::from_low_u64_be(0xFEED)),
                SubmitOutcome::Transient => Err(RelayError::Submission {
                    chain: self.chain,
                    message: "connection reset".to_string(),
                }),
                SubmitOutcome::AlreadySettled => Err(RelayError::AlreadySettled {
                    origin_tx: transfer.origin_tx_hash,
                }),
                SubmitOutcome::Reject(reason) => Err(RelayError::Validation {
                    origin_tx: transfer.origin_tx_hash,
                    reason: reason.to_string(),
                }),
            }
        }

        async fn is_settled(&self, _chain: ChainId, _tx: H256) -> RelayResult<bool> {
            Ok(self
                .settled_script
                .lock()
                .await
                .pop_front()
                .unwrap_or(false))
        }

        async fn initiate_send(
            &self,
            _destination_chain: ChainId,
            _destination_address: Address,
            _amount: U256,
        ) -> RelayResult<H256> {
            Ok(H256::from_low_u64_be(0xBEEF))
        }

        async fn get_balance(&self, _account: Address) -> RelayResult<U256> {
            Ok(U256::zero())
        }

        async fn get_total_supply(&self) -> RelayResult<U256> {
            Ok(U256::zero())
        }

        async fn get_block_number(&self) -> RelayResult<u64> {
            Ok(1)
        }
    }

    struct Harness {
        dispatcher: Arc<RelayDispatcher>,
        store: Arc<MemoryTransferStore>,
        eth: Arc<FakeLedger>,
        etc: Arc<FakeLedger>,
    }

    fn harness(max_retries: u32, etc_script: Vec<SubmitOutcome>, etc_settled: Vec<bool>) -> Harness {
        let store = Arc::new(MemoryTransferStore::new());
        let eth = FakeLedger::new(ChainId::Eth, vec![], vec![]);
        let etc = FakeLedger::new(ChainId::Etc, etc_script, etc_settled);

        let clients = DashMap::new();
        clients.insert(ChainId::Eth, eth.clone() as Arc<dyn LedgerClient>);
        clients.insert(ChainId::Etc, etc.clone() as Arc<dyn LedgerClient>);

        let chains = Arc::new(ChainManager::with_clients(
            clients,
            test_config(max_retries),
            store.clone() as Arc<dyn TransferStore>,
        ));

        let dispatcher = RelayDispatcher::new(
            chains,
            store.clone() as Arc<dyn TransferStore>,
            test_config(max_retries),
        );

        Harness {
            dispatcher,
            store,
            eth,
            etc,
        }
    }

    fn send_event(key: u64, amount: u64) -> ChainEvent {
        ChainEvent::Send {
            chain: ChainId::Eth,
            source_address: Address::from_low_u64_be(0xA),
            destination_chain: ChainId::Etc,
            destination_address: Address::from_low_u64_be(0xC),
            amount: U256::from(amount),
            tx_hash: H256::from_low_u64_be(key),
            block_number: 1,
        }
    }

    async fn wait_for_terminal(store: &MemoryTransferStore, key: H256) -> Transfer {
        for _ in 0..200 {
            if let Some(t) = store.get(key).await.unwrap() {
                if t.status.is_terminal() {
                    return t;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {:?} never reached a terminal status", key);
    }

    #[tokio::test]
    async fn duplicate_deliveries_settle_exactly_once() {
        let h = harness(3, vec![SubmitOutcome::Accept], vec![]);

        // Same send observed twice (watcher window expired / reconnection)
        h.dispatcher.clone().handle_event(send_event(0x1, 100)).await;
        h.dispatcher.clone().handle_event(send_event(0x1, 100)).await;

        let t = wait_for_terminal(&h.store, H256::from_low_u64_be(0x1)).await;
        assert_eq!(t.status, TransferStatus::Settled);
        assert_eq!(t.attempts, 1);
        assert_eq!(h.etc.submission_count().await, 1);
        assert_eq!(h.eth.submission_count().await, 0);

        // Replay after settlement stays settled and submits nothing
        h.dispatcher.clone().handle_event(send_event(0x1, 100)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.etc.submission_count().await, 1);
    }

    #[tokio::test]
    async fn out_of_band_settlement_is_not_resubmitted() {
        // First submission times out on the wire but actually lands; the
        // retry sees the settled flag and stops
        let h = harness(3, vec![SubmitOutcome::Transient], vec![true]);

        h.dispatcher.clone().handle_event(send_event(0x2, 50)).await;

        let t = wait_for_terminal(&h.store, H256::from_low_u64_be(0x2)).await;
        assert_eq!(t.status, TransferStatus::Settled);
        assert_eq!(t.attempts, 2);
        assert_eq!(h.etc.submission_count().await, 1, "no second real submission");
    }

    #[tokio::test]
    async fn amounts_and_addresses_pass_through_unmodified() {
        let h = harness(3, vec![SubmitOutcome::Accept], vec![]);

        h.dispatcher.clone().handle_event(send_event(0x3, 12345)).await;
        wait_for_terminal(&h.store, H256::from_low_u64_be(0x3)).await;

        let submitted = h.etc.submissions.lock().await[0].clone();
        assert_eq!(submitted.amount, U256::from(12345u64));
        assert_eq!(submitted.source_address, Address::from_low_u64_be(0xA));
        assert_eq!(submitted.destination_address, Address::from_low_u64_be(0xC));
        assert_eq!(submitted.origin_tx_hash, H256::from_low_u64_be(0x3));
        assert_eq!(submitted.source_chain, ChainId::Eth);
        assert_eq!(submitted.destination_chain, ChainId::Etc);
    }

    #[tokio::test]
    async fn transient_failures_retry_to_success() {
        let h = harness(
            5,
            vec![
                SubmitOutcome::Transient,
                SubmitOutcome::Transient,
                SubmitOutcome::Accept,
            ],
            vec![false, false],
        );

        h.dispatcher.clone().handle_event(send_event(0x4, 100)).await;

        let t = wait_for_terminal(&h.store, H256::from_low_u64_be(0x4)).await;
        assert_eq!(t.status, TransferStatus::Settled);
        assert_eq!(t.attempts, 3);
        assert_eq!(h.etc.submission_count().await, 3);
    }

    #[tokio::test]
    async fn already_settled_response_is_success() {
        let h = harness(3, vec![SubmitOutcome::AlreadySettled], vec![]);

        h.dispatcher.clone().handle_event(send_event(0x5, 9)).await;

        let t = wait_for_terminal(&h.store, H256::from_low_u64_be(0x5)).await;
        assert_eq!(t.status, TransferStatus::Settled);
        assert_eq!(t.attempts, 1);
    }

    #[tokio::test]
    async fn validation_rejection_fails_without_retry() {
        let h = harness(5, vec![SubmitOutcome::Reject("bad amount")], vec![]);

        h.dispatcher.clone().handle_event(send_event(0x6, 0)).await;

        let t = wait_for_terminal(&h.store, H256::from_low_u64_be(0x6)).await;
        assert_eq!(t.status, TransferStatus::Failed);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.failure_reason.as_deref(), Some("bad amount"));
        assert_eq!(h.etc.submission_count().await, 1);
    }

    #[tokio::test]
    async fn retry_ceiling_surfaces_failure() {
        let h = harness(
            3,
            vec![
                SubmitOutcome::Transient,
                SubmitOutcome::Transient,
                SubmitOutcome::Transient,
            ],
            vec![false, false, false],
        );

        h.dispatcher.clone().handle_event(send_event(0x7, 100)).await;

        let t = wait_for_terminal(&h.store, H256::from_low_u64_be(0x7)).await;
        assert_eq!(t.status, TransferStatus::Failed);
        assert_eq!(t.attempts, 3);
        assert!(t
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("retry ceiling exhausted"));
        assert_eq!(h.etc.submission_count().await, 3);
    }

    #[tokio::test]
    async fn restart_recovery_resumes_dispatched_transfers() {
        // A transfer left Dispatched by a crashed run whose submission
        // actually landed: recovery must resolve it via the settled check
        let h = harness(3, vec![], vec![true]);

        let event = send_event(0x8, 77);
        let mut parked = Transfer::from_send_event(&event).unwrap();
        parked.advance(TransferStatus::Dispatched).unwrap();
        parked.attempts = 1;
        h.store.insert_new(&parked).await.unwrap();
        h.store.update(&parked).await.unwrap();

        h.dispatcher.clone().resume_pending().await.unwrap();

        let t = wait_for_terminal(&h.store, H256::from_low_u64_be(0x8)).await;
        assert_eq!(t.status, TransferStatus::Settled);
        assert_eq!(h.etc.submission_count().await, 0, "settled out of band");
    }

    #[tokio::test]
    async fn concurrent_transfers_settle_independently() {
        let h = harness(3, vec![SubmitOutcome::Accept, SubmitOutcome::Accept], vec![]);

        h.dispatcher.clone().handle_event(send_event(0xA1, 10)).await;
        h.dispatcher.clone().handle_event(send_event(0xA2, 20)).await;

        let t1 = wait_for_terminal(&h.store, H256::from_low_u64_be(0xA1)).await;
        let t2 = wait_for_terminal(&h.store, H256::from_low_u64_be(0xA2)).await;
        assert_eq!(t1.status, TransferStatus::Settled);
        assert_eq!(t2.status, TransferStatus::Settled);
        assert_eq!(h.etc.submission_count().await, 2);
    }

    #[tokio::test]
    async fn shutdown_stops_new_dispatches() {
        let h = harness(3, vec![SubmitOutcome::Accept], vec![]);

        h.dispatcher.stop().await;
        h.dispatcher.clone().handle_event(send_event(0xB1, 10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h
            .store
            .get(H256::from_low_u64_be(0xB1))
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.etc.submission_count().await, 0);
    }
}
