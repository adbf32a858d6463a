//! The per-chain ledger gateway seam
//!
//! Everything the relay core needs from a chain goes through
//! [`LedgerClient`]: event subscription, settlement submission, outbound
//! send initiation, and point-in-time reads. Implementations hold no
//! relay-level state.

use crate::chain::ChainId;
use crate::error::RelayResult;
use crate::events::EventKind;
use crate::relay::Transfer;

use async_trait::async_trait;
use ethers::types::{Address, Log, H256, U256};
use futures::stream::BoxStream;

/// Raw, unparsed event as delivered by the chain
pub type RawEvent = Log;

/// Infinite, restartable stream of raw events. The stream yields an error
/// (or simply ends) when the underlying subscription breaks; callers
/// resubscribe. Resubscription may redeliver already-seen events, which is
/// why the watcher deduplicates downstream.
pub type EventStream = BoxStream<'static, RelayResult<RawEvent>>;

/// Gateway to a single chain's token contract
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Chain this client talks to
    fn chain(&self) -> ChainId;

    /// Subscribe to contract events of `kind`, starting at `from_block`
    async fn subscribe(&self, kind: EventKind, from_block: u64) -> RelayResult<EventStream>;

    /// Submit the settlement call for an observed transfer.
    ///
    /// Errors: `Submission` for transient failures, `AlreadySettled` when
    /// the ledger reports the origin hash as processed, `Validation` when
    /// the ledger deterministically rejects the call.
    async fn submit_settlement(&self, transfer: &Transfer) -> RelayResult<H256>;

    /// Whether the ledger has already processed this origin hash
    async fn is_settled(&self, origin_chain: ChainId, origin_tx_hash: H256) -> RelayResult<bool>;

    /// Initiate an outbound transfer from the relayer's account. This is the
    /// user-facing command that becomes a `CrosschainSend` event once mined.
    async fn initiate_send(
        &self,
        destination_chain: ChainId,
        destination_address: Address,
        amount: U256,
    ) -> RelayResult<H256>;

    /// Token balance of `account` at the client's current view of the chain
    async fn get_balance(&self, account: Address) -> RelayResult<U256>;

    /// Total token supply held on this chain
    async fn get_total_supply(&self) -> RelayResult<U256>;

    /// Latest block number, also used as the health probe
    async fn get_block_number(&self) -> RelayResult<u64>;
}
