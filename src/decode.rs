//! # Event Decoding
//!
//! `EventTable` is built once at startup from human-readable ABI signatures and
//! passed by reference into the pipeline; decoding never touches global state.

use crate::error::DecodeError;
use ethers::abi::{Event, RawLog, Token};
use ethers::types::{Address, Log, H256, U256};
use std::collections::HashMap;

/// ERC-20 `Transfer`. ERC-721 shares the topic but indexes the token id,
/// which makes its logs fail to decode against this signature.
pub const ERC20_TRANSFER_EVENT: &str =
    "event Transfer(address indexed from, address indexed to, uint256 value)";

/// A decoded ERC-20 transfer, tagged with its position on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub tx_hash: H256,
    pub block_number: u64,
    pub log_index: u64,
    /// Token contract that emitted the event.
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// Event ABI lookup keyed by topic0.
#[derive(Debug, Clone)]
pub struct EventTable {
    events: HashMap<H256, Event>,
    transfer_topic: H256,
}

impl EventTable {
    /// Table holding only the ERC-20 `Transfer` event.
    pub fn erc20() -> Result<Self, DecodeError> {
        Self::new(&[ERC20_TRANSFER_EVENT])
    }

    /// Parses `signatures`; one of them must be the ERC-20 `Transfer` event.
    pub fn new(signatures: &[&str]) -> Result<Self, DecodeError> {
        let abi = ethers::abi::parse_abi(signatures)
            .map_err(|e| DecodeError::Signature(e.to_string()))?;
        let events: HashMap<H256, Event> = abi
            .events()
            .map(|event| (event.signature(), event.clone()))
            .collect();
        let transfer_topic = events
            .iter()
            .find(|(_, event)| is_erc20_transfer(event))
            .map(|(topic, _)| *topic)
            .ok_or_else(|| DecodeError::Signature("ERC-20 Transfer event not present".into()))?;
        Ok(Self {
            events,
            transfer_topic,
        })
    }

    pub fn transfer_topic(&self) -> H256 {
        self.transfer_topic
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Decodes one raw log into a `TransferEvent`.
    ///
    /// Fails for logs without chain position metadata and for logs whose
    /// topic/data layout does not match the ERC-20 event.
    pub fn decode_transfer(&self, log: &Log) -> Result<TransferEvent, DecodeError> {
        let topic0 = log.topics.first().ok_or(DecodeError::MissingTopic)?;
        if *topic0 != self.transfer_topic {
            return Err(DecodeError::UnexpectedTopic(*topic0));
        }
        let event = self
            .events
            .get(topic0)
            .ok_or(DecodeError::UnexpectedTopic(*topic0))?;

        let tx_hash = log
            .transaction_hash
            .ok_or(DecodeError::MissingMetadata("transactionHash"))?;
        let block_number = log
            .block_number
            .ok_or(DecodeError::MissingMetadata("blockNumber"))?
            .as_u64();
        let log_index = log
            .log_index
            .ok_or(DecodeError::MissingMetadata("logIndex"))?
            .as_u64();

        let parsed = event.parse_log(RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        })?;

        let mut from = None;
        let mut to = None;
        let mut value = None;
        for param in parsed.params {
            match (param.name.as_str(), param.value) {
                ("from", Token::Address(a)) => from = Some(a),
                ("to", Token::Address(a)) => to = Some(a),
                ("value", Token::Uint(v)) => value = Some(v),
                _ => {}
            }
        }

        Ok(TransferEvent {
            tx_hash,
            block_number,
            log_index,
            token: log.address,
            from: from.ok_or(DecodeError::MissingField("from"))?,
            to: to.ok_or(DecodeError::MissingField("to"))?,
            value: value.ok_or(DecodeError::MissingField("value"))?,
        })
    }
}

fn is_erc20_transfer(event: &Event) -> bool {
    event.name == "Transfer"
        && event.inputs.len() == 3
        && event.inputs[0].indexed
        && event.inputs[1].indexed
        && !event.inputs[2].indexed
}
