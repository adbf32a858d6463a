//! Token contract event types and parsing
//!
//! Canonical form of the two events the relayer watches on each chain:
//! an outbound send (`CrosschainSend`) and its settlement confirmation
//! (`CrosschainTransferred`).

use crate::chain::ChainId;
use crate::error::{RelayError, RelayResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use serde::{Deserialize, Serialize};

/// Kind of contract event a watcher subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Outbound transfer initiated on the watched chain
    Send,
    /// Settlement finalized on the watched chain
    Settled,
}

impl EventKind {
    /// Event name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Send => "crosschain_send",
            EventKind::Settled => "crosschain_transferred",
        }
    }
}

/// Canonical event emitted by the watched token contracts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainEvent {
    /// `CrosschainSend(address sourceAddress, uint256 destinationChain,
    /// address destinationAddress, uint256 amount)`
    Send {
        chain: ChainId,
        source_address: Address,
        destination_chain: ChainId,
        destination_address: Address,
        amount: U256,
        tx_hash: H256,
        block_number: u64,
    },

    /// `CrosschainTransferred(uint256 amount)`
    Settled {
        chain: ChainId,
        amount: U256,
        tx_hash: H256,
        block_number: u64,
    },
}

impl ChainEvent {
    /// Chain the event was observed on
    pub fn chain(&self) -> ChainId {
        match self {
            ChainEvent::Send { chain, .. } => *chain,
            ChainEvent::Settled { chain, .. } => *chain,
        }
    }

    /// Event kind, the second half of the dedup key
    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::Send { .. } => EventKind::Send,
            ChainEvent::Settled { .. } => EventKind::Settled,
        }
    }

    /// Hash of the originating transaction, the first half of the dedup key
    pub fn tx_hash(&self) -> H256 {
        match self {
            ChainEvent::Send { tx_hash, .. } => *tx_hash,
            ChainEvent::Settled { tx_hash, .. } => *tx_hash,
        }
    }

    /// Block the event was included in
    pub fn block_number(&self) -> u64 {
        match self {
            ChainEvent::Send { block_number, .. } => *block_number,
            ChainEvent::Settled { block_number, .. } => *block_number,
        }
    }
}

/// Event topic signatures (keccak256 of the event signature)
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    pub const CROSSCHAIN_SEND_SIG: &str = "CrosschainSend(address,uint256,address,uint256)";
    pub const CROSSCHAIN_TRANSFERRED_SIG: &str = "CrosschainTransferred(uint256)";

    lazy_static! {
        pub static ref CROSSCHAIN_SEND: H256 = H256::from(keccak256(CROSSCHAIN_SEND_SIG));
        pub static ref CROSSCHAIN_TRANSFERRED: H256 =
            H256::from(keccak256(CROSSCHAIN_TRANSFERRED_SIG));
    }
}

/// Parses raw token contract logs into canonical [`ChainEvent`]s
#[derive(Debug, Clone)]
pub struct EventParser {
    chain: ChainId,
}

impl EventParser {
    /// Create a parser for events observed on `chain`
    pub fn new(chain: ChainId) -> Self {
        Self { chain }
    }

    /// Parse a log entry. Returns `Ok(None)` for logs the relayer does not
    /// watch (other events on the same contract).
    pub fn parse_log(&self, log: &Log) -> RelayResult<Option<ChainEvent>> {
        let topic = match log.topics.first() {
            Some(t) => *t,
            None => return Ok(None),
        };

        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let tx_hash = log.transaction_hash.ok_or_else(|| {
            RelayError::EventParsing("log without transaction hash".to_string())
        })?;

        if topic == *topics::CROSSCHAIN_SEND {
            self.parse_send(log, tx_hash, block_number).map(Some)
        } else if topic == *topics::CROSSCHAIN_TRANSFERRED {
            self.parse_settled(log, tx_hash, block_number).map(Some)
        } else {
            Ok(None)
        }
    }

    fn parse_send(&self, log: &Log, tx_hash: H256, block_number: u64) -> RelayResult<ChainEvent> {
        let tokens = abi::decode(
            &[
                ParamType::Address,
                ParamType::Uint(256),
                ParamType::Address,
                ParamType::Uint(256),
            ],
            &log.data,
        )
        .map_err(|e| RelayError::EventParsing(format!("CrosschainSend: {}", e)))?;

        let source_address = token_address(&tokens[0])?;
        let destination_wire = token_uint(&tokens[1])?;
        let destination_address = token_address(&tokens[2])?;
        let amount = token_uint(&tokens[3])?;

        let destination_chain = ChainId::from_wire(destination_wire.as_u64()).ok_or_else(|| {
            RelayError::EventParsing(format!(
                "CrosschainSend: unknown destination chain id {}",
                destination_wire
            ))
        })?;

        Ok(ChainEvent::Send {
            chain: self.chain,
            source_address,
            destination_chain,
            destination_address,
            amount,
            tx_hash,
            block_number,
        })
    }

    fn parse_settled(
        &self,
        log: &Log,
        tx_hash: H256,
        block_number: u64,
    ) -> RelayResult<ChainEvent> {
        let tokens = abi::decode(&[ParamType::Uint(256)], &log.data)
            .map_err(|e| RelayError::EventParsing(format!("CrosschainTransferred: {}", e)))?;

        Ok(ChainEvent::Settled {
            chain: self.chain,
            amount: token_uint(&tokens[0])?,
            tx_hash,
            block_number,
        })
    }
}

fn token_address(token: &Token) -> RelayResult<Address> {
    token
        .clone()
        .into_address()
        .ok_or_else(|| RelayError::EventParsing("expected address parameter".to_string()))
}

fn token_uint(token: &Token) -> RelayResult<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| RelayError::EventParsing("expected uint parameter".to_string()))
}

/// Topic filter for a subscription of `kind`
pub fn topic_for(kind: EventKind) -> H256 {
    match kind {
        EventKind::Send => *topics::CROSSCHAIN_SEND,
        EventKind::Settled => *topics::CROSSCHAIN_TRANSFERRED,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Log builders shared by watcher and parser tests

    use super::*;

    pub fn send_log(
        source: Address,
        destination_chain: ChainId,
        destination: Address,
        amount: U256,
        tx_hash: H256,
        block_number: u64,
    ) -> Log {
        let data = abi::encode(&[
            Token::Address(source),
            Token::Uint(U256::from(destination_chain.wire_id())),
            Token::Address(destination),
            Token::Uint(amount),
        ]);
        Log {
            topics: vec![*topics::CROSSCHAIN_SEND],
            data: data.into(),
            block_number: Some(block_number.into()),
            transaction_hash: Some(tx_hash),
            ..Default::default()
        }
    }

    pub fn settled_log(amount: U256, tx_hash: H256, block_number: u64) -> Log {
        Log {
            topics: vec![*topics::CROSSCHAIN_TRANSFERRED],
            data: abi::encode(&[Token::Uint(amount)]).into(),
            block_number: Some(block_number.into()),
            transaction_hash: Some(tx_hash),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{send_log, settled_log};
    use super::*;

    #[test]
    fn parses_send_event_round() {
        let source = Address::from_low_u64_be(0xA);
        let destination = Address::from_low_u64_be(0xC);
        let tx = H256::from_low_u64_be(0x1);

        let parser = EventParser::new(ChainId::Eth);
        let log = send_log(source, ChainId::Etc, destination, U256::from(100u64), tx, 42);
        let event = parser.parse_log(&log).unwrap().unwrap();

        match event {
            ChainEvent::Send {
                chain,
                source_address,
                destination_chain,
                destination_address,
                amount,
                tx_hash,
                block_number,
            } => {
                assert_eq!(chain, ChainId::Eth);
                assert_eq!(source_address, source);
                assert_eq!(destination_chain, ChainId::Etc);
                assert_eq!(destination_address, destination);
                assert_eq!(amount, U256::from(100u64));
                assert_eq!(tx_hash, tx);
                assert_eq!(block_number, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_settled_event() {
        let parser = EventParser::new(ChainId::Etc);
        let log = settled_log(U256::from(7u64), H256::from_low_u64_be(0x2), 10);
        let event = parser.parse_log(&log).unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::Settled);
        assert_eq!(event.chain(), ChainId::Etc);
    }

    #[test]
    fn ignores_unrelated_topics() {
        let parser = EventParser::new(ChainId::Eth);
        let log = Log {
            topics: vec![H256::from_low_u64_be(0xdead)],
            transaction_hash: Some(H256::from_low_u64_be(0x3)),
            ..Default::default()
        };
        assert!(parser.parse_log(&log).unwrap().is_none());
    }

    #[test]
    fn send_with_unknown_destination_is_an_error() {
        let parser = EventParser::new(ChainId::Eth);
        let data = abi::encode(&[
            Token::Address(Address::zero()),
            Token::Uint(U256::from(99u64)),
            Token::Address(Address::zero()),
            Token::Uint(U256::one()),
        ]);
        let log = Log {
            topics: vec![*topics::CROSSCHAIN_SEND],
            data: data.into(),
            transaction_hash: Some(H256::from_low_u64_be(0x4)),
            ..Default::default()
        };
        assert!(parser.parse_log(&log).is_err());
    }
}
