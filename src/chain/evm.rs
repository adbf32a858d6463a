//! EVM ledger gateway with multi-RPC failover
//!
//! Talks to one chain's token contract over JSON-RPC: polls logs for the
//! subscription streams, signs and submits settlement transactions, and
//! serves the view calls behind the read model. Holds no relay-level state
//! beyond a locally tracked nonce.

use crate::chain::{ChainId, EventStream, LedgerClient};
use crate::config::{ChainConfig, RelayerConfig, WalletConfig};
use crate::error::{RelayError, RelayResult};
use crate::events::{self, EventKind};
use crate::relay::Transfer;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::id;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const VALIDATE_TRANSFER_SIG: &str =
    "validateCrosschainTransfer(uint256,bytes32,address,uint256,address,uint256)";
const INITIATE_SEND_SIG: &str = "initiateCrosschainSend(uint256,address,uint256)";
const IS_PROCESSED_SIG: &str = "isTransferProcessed(uint256,bytes32)";
const BALANCE_OF_SIG: &str = "balanceOf(address)";
const TOKENS_ON_CHAIN_SIG: &str = "getTokensOnChain()";

/// Block range ceiling per log query, to keep RPC responses bounded
const MAX_BLOCK_RANGE: u64 = 1000;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway to one EVM chain's token contract. Cheap to clone; clones share
/// providers, wallet, and the nonce guard.
#[derive(Clone)]
pub struct EvmLedgerClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Relayer signing key, bound to this chain's network id
    wallet: LocalWallet,
    token_address: Address,
    /// Locally tracked next nonce; `None` forces a resync from the chain
    next_nonce: Mutex<Option<u64>>,
    poll_interval: Duration,
}

impl EvmLedgerClient {
    pub async fn new(
        config: ChainConfig,
        wallet_config: &WalletConfig,
        relayer_config: &RelayerConfig,
    ) -> RelayResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", config.chain, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayError::Subscription {
                chain: config.chain,
                message: "No valid RPC providers".to_string(),
            });
        }

        let token_address: Address = config.token_address.parse().map_err(|e| {
            RelayError::Config(format!("Invalid token address for {}: {}", config.chain, e))
        })?;

        let key = std::env::var(&wallet_config.private_key_env).map_err(|_| {
            RelayError::Config(format!(
                "Signing key env var {} not set",
                wallet_config.private_key_env
            ))
        })?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| RelayError::Config(format!("Invalid signing key: {}", e)))?
            .with_chain_id(config.network_id);

        info!(
            "Ledger client for {} ({}) ready, submitting as {:?}",
            config.chain,
            config.name,
            wallet.address()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                poll_interval: Duration::from_millis(relayer_config.poll_interval_ms),
                config,
                http_providers,
                current_provider: AtomicUsize::new(0),
                wallet,
                token_address,
                next_nonce: Mutex::new(None),
            }),
        })
    }

    /// Build and submit a contract call transaction, returning its hash
    async fn send_contract_call(&self, calldata: Vec<u8>) -> RelayResult<H256> {
        let inner = &self.inner;
        let chain = inner.config.chain;

        let mut nonce_guard = inner.next_nonce.lock().await;
        let nonce = match *nonce_guard {
            Some(n) => n,
            None => self.fetch_pending_nonce().await?,
        };

        let gas_price = self.gas_price().await?;
        let mut tx = TransactionRequest::new()
            .to(inner.token_address)
            .data(calldata)
            .from(inner.wallet.address())
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(inner.config.network_id);

        // Preflight gas estimation; deterministic reverts surface here
        let typed: TypedTransaction = tx.clone().into();
        match inner.http().estimate_gas(&typed, None).await {
            Ok(gas) => {
                // 20% headroom over the estimate
                tx = tx.gas(gas + gas / 5);
            }
            Err(e) => {
                *nonce_guard = None;
                return Err(triage_submit_error(chain, &e.to_string()));
            }
        }

        let typed: TypedTransaction = tx.into();
        let signature = inner
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| RelayError::Submission {
                chain,
                message: format!("signing failed: {}", e),
            })?;
        let raw = typed.rlp_signed(&signature);

        let result = timeout(SUBMIT_TIMEOUT, inner.http().send_raw_transaction(raw)).await;

        match result {
            Ok(Ok(pending)) => {
                let tx_hash = pending.tx_hash();
                *nonce_guard = Some(nonce + 1);
                debug!("Submitted tx {:?} on {} (nonce {})", tx_hash, chain, nonce);
                Ok(tx_hash)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                // A stale nonce means another submission landed; resync
                *nonce_guard = None;
                Err(triage_submit_error(chain, &message))
            }
            Err(_) => {
                *nonce_guard = None;
                Err(RelayError::Timeout {
                    operation: format!("transaction submission on {}", chain),
                })
            }
        }
    }

    async fn fetch_pending_nonce(&self) -> RelayResult<u64> {
        let inner = &self.inner;
        let nonce = inner
            .http()
            .get_transaction_count(inner.wallet.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| RelayError::Submission {
                chain: inner.config.chain,
                message: format!("nonce fetch failed: {}", e),
            })?;
        Ok(nonce.as_u64())
    }

    async fn gas_price(&self) -> RelayResult<U256> {
        let price = self.inner.http().get_gas_price().await.map_err(|e| {
            RelayError::Submission {
                chain: self.inner.config.chain,
                message: format!("gas price fetch failed: {}", e),
            }
        })?;
        // 10% buffer over the node's estimate
        Ok(price + price / 10)
    }

    /// Read-only contract call returning the raw output bytes
    async fn view_call(&self, calldata: Vec<u8>) -> RelayResult<Bytes> {
        let inner = &self.inner;
        let tx: TypedTransaction = TransactionRequest::new()
            .to(inner.token_address)
            .data(calldata)
            .into();

        for _ in 0..inner.http_providers.len() {
            match inner.http().call(&tx, None).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!("View call failed on {}: {}", inner.config.chain, e);
                    inner.failover();
                }
            }
        }

        Err(RelayError::Submission {
            chain: inner.config.chain,
            message: "All providers failed view call".to_string(),
        })
    }

    async fn view_uint(&self, calldata: Vec<u8>) -> RelayResult<U256> {
        let bytes = self.view_call(calldata).await?;
        let tokens = abi::decode(&[ParamType::Uint(256)], &bytes)
            .map_err(|e| RelayError::EventParsing(format!("uint view output: {}", e)))?;
        tokens[0]
            .clone()
            .into_uint()
            .ok_or_else(|| RelayError::EventParsing("uint view output".to_string()))
    }
}

impl Inner {
    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to the next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain, next);
    }

    /// Get current block number with failover
    async fn block_number(&self) -> RelayResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from {}: {}", self.config.chain, e);
                    self.failover();
                }
            }
        }

        Err(RelayError::Subscription {
            chain: self.config.chain,
            message: "All providers failed".to_string(),
        })
    }

    async fn get_logs(&self, filter: &Filter) -> RelayResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from {}: {}", self.config.chain, e);
                    self.failover();
                }
            }
        }

        Err(RelayError::Subscription {
            chain: self.config.chain,
            message: "All providers failed to get logs".to_string(),
        })
    }
}

#[async_trait]
impl LedgerClient for EvmLedgerClient {
    fn chain(&self) -> ChainId {
        self.inner.config.chain
    }

    async fn subscribe(&self, kind: EventKind, from_block: u64) -> RelayResult<EventStream> {
        let inner = self.inner.clone();
        let (tx, mut rx) = mpsc::channel::<RelayResult<Log>>(256);

        tokio::spawn(async move {
            let chain = inner.config.chain;
            let topic = events::topic_for(kind);
            // Lag the head so reorged logs never enter the pipeline
            let confirmations = inner.config.confirmation_blocks;

            let mut last = if from_block > 0 {
                from_block - 1
            } else {
                // Fresh subscription: start at the current safe head
                match inner.block_number().await {
                    Ok(head) => head.saturating_sub(confirmations),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            };

            loop {
                let head = match inner.block_number().await {
                    Ok(h) => h,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let safe_head = head.saturating_sub(confirmations);
                if safe_head <= last {
                    tokio::time::sleep(inner.poll_interval).await;
                    continue;
                }

                let from = last + 1;
                let to = std::cmp::min(safe_head, from + MAX_BLOCK_RANGE - 1);

                debug!("{} {:?}: scanning blocks {} to {}", chain, kind, from, to);

                let filter = Filter::new()
                    .address(inner.token_address)
                    .topic0(topic)
                    .from_block(from)
                    .to_block(to);

                match inner.get_logs(&filter).await {
                    Ok(logs) => {
                        for log in logs {
                            if tx.send(Ok(log)).await.is_err() {
                                // Subscriber gone; stop polling
                                return;
                            }
                        }
                        last = to;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }

                tokio::time::sleep(inner.poll_interval).await;
            }
        });

        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }

    async fn submit_settlement(&self, transfer: &Transfer) -> RelayResult<H256> {
        let calldata = [
            id(VALIDATE_TRANSFER_SIG).to_vec(),
            abi::encode(&[
                Token::Uint(U256::from(transfer.source_chain.wire_id())),
                Token::FixedBytes(transfer.origin_tx_hash.as_bytes().to_vec()),
                Token::Address(transfer.source_address),
                Token::Uint(U256::from(transfer.destination_chain.wire_id())),
                Token::Address(transfer.destination_address),
                Token::Uint(transfer.amount),
            ]),
        ]
        .concat();

        let result = self.send_contract_call(calldata).await;
        if let Err(RelayError::Validation { reason, .. }) = &result {
            // Validation errors carry a placeholder key from the triage path
            return Err(RelayError::Validation {
                origin_tx: transfer.origin_tx_hash,
                reason: reason.clone(),
            });
        }
        if let Err(RelayError::AlreadySettled { .. }) = &result {
            return Err(RelayError::AlreadySettled {
                origin_tx: transfer.origin_tx_hash,
            });
        }
        result
    }

    async fn is_settled(&self, origin_chain: ChainId, origin_tx_hash: H256) -> RelayResult<bool> {
        let calldata = [
            id(IS_PROCESSED_SIG).to_vec(),
            abi::encode(&[
                Token::Uint(U256::from(origin_chain.wire_id())),
                Token::FixedBytes(origin_tx_hash.as_bytes().to_vec()),
            ]),
        ]
        .concat();

        let bytes = self.view_call(calldata).await?;
        let tokens = abi::decode(&[ParamType::Bool], &bytes)
            .map_err(|e| RelayError::EventParsing(format!("bool view output: {}", e)))?;
        tokens[0]
            .clone()
            .into_bool()
            .ok_or_else(|| RelayError::EventParsing("bool view output".to_string()))
    }

    async fn initiate_send(
        &self,
        destination_chain: ChainId,
        destination_address: Address,
        amount: U256,
    ) -> RelayResult<H256> {
        let calldata = [
            id(INITIATE_SEND_SIG).to_vec(),
            abi::encode(&[
                Token::Uint(U256::from(destination_chain.wire_id())),
                Token::Address(destination_address),
                Token::Uint(amount),
            ]),
        ]
        .concat();

        self.send_contract_call(calldata).await
    }

    async fn get_balance(&self, account: Address) -> RelayResult<U256> {
        let calldata = [
            id(BALANCE_OF_SIG).to_vec(),
            abi::encode(&[Token::Address(account)]),
        ]
        .concat();
        self.view_uint(calldata).await
    }

    async fn get_total_supply(&self) -> RelayResult<U256> {
        self.view_uint(id(TOKENS_ON_CHAIN_SIG).to_vec()).await
    }

    async fn get_block_number(&self) -> RelayResult<u64> {
        self.inner.block_number().await
    }
}

/// Classify a submission failure from the provider error text.
///
/// "Already processed" reverts are success signals; other reverts are
/// deterministic rejections; everything else is transient.
fn triage_submit_error(chain: ChainId, message: &str) -> RelayError {
    let lower = message.to_lowercase();

    if lower.contains("already processed") || lower.contains("already settled") {
        return RelayError::AlreadySettled {
            origin_tx: H256::zero(),
        };
    }

    if lower.contains("revert") || lower.contains("invalid opcode") {
        return RelayError::Validation {
            origin_tx: H256::zero(),
            reason: message.to_string(),
        };
    }

    RelayError::Submission {
        chain,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_maps_already_processed_to_success() {
        let err = triage_submit_error(ChainId::Etc, "execution reverted: transfer already processed");
        assert!(err.is_already_settled());
    }

    #[test]
    fn triage_maps_revert_to_validation() {
        let err = triage_submit_error(ChainId::Etc, "execution reverted: bad amount");
        assert!(matches!(err, RelayError::Validation { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn triage_maps_network_errors_to_submission() {
        let err = triage_submit_error(ChainId::Eth, "connection refused");
        assert!(matches!(err, RelayError::Submission { .. }));
        assert!(err.is_retryable());
    }
}
