use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::checkpoint::EventType;

/// A user-table row. Column values travel as JSON until the store binds them
/// against the compiled schema's column types.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Block header fields the engine orders and reconciles on. Everything else
/// the source attaches rides along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub log_index: u64,
    pub transaction_index: u64,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: String,
    pub transaction_index: u64,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransactionReceipt {
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub status: u64,
    pub gas_used: String,
    pub contract_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrace {
    pub transaction_index: u64,
    pub trace_index: u64,
    pub from: String,
    pub to: Option<String>,
    pub call_type: String,
    pub value: String,
    pub input: String,
}

/// One block's worth of raw chain data as handed over by the sync source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlockBundle {
    pub chain_id: u64,
    pub block: RawBlock,
    #[serde(default)]
    pub logs: Vec<RawLog>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
    #[serde(default)]
    pub transaction_receipts: Vec<RawTransactionReceipt>,
    #[serde(default)]
    pub traces: Vec<RawTrace>,
}

/// A native-value movement derived from a call trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferData {
    pub from: String,
    pub to: String,
    pub value: String,
    pub transaction_index: u64,
    pub trace_index: u64,
}

/// Variant-specific decoded payload of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Setup,
    Block {
        block: RawBlock,
    },
    Log {
        block: RawBlock,
        log: RawLog,
        transaction: Option<RawTransaction>,
    },
    Transaction {
        block: RawBlock,
        transaction: RawTransaction,
        receipt: Option<RawTransactionReceipt>,
    },
    Trace {
        block: RawBlock,
        trace: RawTrace,
        transaction: Option<RawTransaction>,
    },
    Transfer {
        block: RawBlock,
        transfer: TransferData,
    },
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::Setup => EventType::Setup,
            EventData::Block { .. } => EventType::Block,
            EventData::Transaction { .. } => EventType::Transaction,
            EventData::Trace { .. } => EventType::Trace,
            EventData::Log { .. } => EventType::Log,
            EventData::Transfer { .. } => EventType::Transfer,
        }
    }
}

/// A fully-positioned event ready for handler dispatch. `name` is the user
/// handler key (e.g. "ERC20:Transfer"); `checkpoint` is the encoded global
/// position.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub chain_id: u64,
    pub name: String,
    pub checkpoint: String,
    pub data: EventData,
}

impl Event {
    pub fn block_number(&self) -> u64 {
        match &self.data {
            EventData::Setup => 0,
            EventData::Block { block }
            | EventData::Log { block, .. }
            | EventData::Transaction { block, .. }
            | EventData::Trace { block, .. }
            | EventData::Transfer { block, .. } => block.number,
        }
    }
}

/// Which raw log addresses a contract source watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AddressFilter {
    /// Fixed set of contract addresses.
    Static { addresses: Vec<String> },
    /// Factory pattern: children are discovered at runtime from the
    /// factory's creation event and forgotten again on reorg.
    Factory {
        address: String,
        event_selector: String,
        child_topic_index: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSelector {
    /// Event name appended to the source name to form the handler key.
    pub name: String,
    /// topic0 the log must carry.
    pub topic0: String,
}

/// Declarative filter deciding which raw items become events, and under
/// which handler name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Source {
    Contract {
        name: String,
        chain_id: u64,
        address: AddressFilter,
        events: Vec<EventSelector>,
    },
    Account {
        name: String,
        chain_id: u64,
        address: String,
    },
    Block {
        name: String,
        chain_id: u64,
        interval: u64,
    },
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Source::Contract { name, .. } => name,
            Source::Account { name, .. } => name,
            Source::Block { name, .. } => name,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Source::Contract { chain_id, .. } => *chain_id,
            Source::Account { chain_id, .. } => *chain_id,
            Source::Block { chain_id, .. } => *chain_id,
        }
    }
}

/// A block removed from the canonical chain by a reorg, together with the
/// factory children first seen in it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorgedBlock {
    pub block: RawBlock,
    pub removed_child_addresses: HashSet<String>,
}

/// Control events interleaved with the ordered event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Reorg {
        chain_id: u64,
        checkpoint: String,
        reorged_blocks: Vec<ReorgedBlock>,
    },
    Finalize {
        chain_id: u64,
        checkpoint: String,
    },
}

/// What a chain adapter pushes into the merger.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainUpdate {
    /// Checkpoint-ordered events from one reconciled block (or the setup
    /// events at startup).
    Events(Vec<Event>),
    /// The chain produced a block with no matching events; its stream has
    /// still progressed through this checkpoint.
    Idle(String),
    Reorg {
        checkpoint: String,
        reorged_blocks: Vec<ReorgedBlock>,
    },
    Finalize(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainMessage {
    pub chain_id: u64,
    pub update: ChainUpdate,
}

/// What the merger yields to the indexing executor.
#[derive(Debug, Clone, PartialEq)]
pub enum MergedItem {
    Event(Event),
    Control(ControlEvent),
}
