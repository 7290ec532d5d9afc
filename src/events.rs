/// Event Builder
///
/// Turns one raw block bundle plus the chain's declared sources into the
/// checkpoint-ordered events the executor will dispatch. Matching is purely
/// declarative: every raw item that passes a source's filter becomes exactly
/// one event under that source's handler name.
///
/// Decoding failures of a single raw item are NON-FATAL: the item is logged
/// at debug level and dropped. Anything else (a checkpoint overflow, a
/// poisoned lock) is a real engine fault and propagates.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use crate::checkpoint::{self, CheckpointFields, EventType, ZERO_CHECKPOINT};
use crate::errors::{EngineError, EngineResult};
use crate::types::{
    AddressFilter, Event, EventData, RawBlockBundle, RawLog, Source, TransferData,
};

/// Factory-discovered child contracts, keyed by chain. Shared between the
/// chain adapters (which discover and match) and the executor (which forgets
/// children listed in a reorg's removed set).
#[derive(Debug, Default)]
pub struct ChildAddresses {
    inner: RwLock<HashMap<u64, HashSet<String>>>,
}

impl ChildAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, chain_id: u64, address: &str) -> bool {
        self.inner
            .read()
            .expect("child address lock poisoned")
            .get(&chain_id)
            .map(|set| set.contains(address))
            .unwrap_or(false)
    }

    pub fn insert(&self, chain_id: u64, address: String) {
        self.inner
            .write()
            .expect("child address lock poisoned")
            .entry(chain_id)
            .or_default()
            .insert(address);
    }

    pub fn remove_all(&self, chain_id: u64, addresses: &HashSet<String>) {
        if addresses.is_empty() {
            return;
        }
        let mut guard = self.inner.write().expect("child address lock poisoned");
        if let Some(set) = guard.get_mut(&chain_id) {
            for address in addresses {
                set.remove(address);
            }
        }
    }

    pub fn len(&self, chain_id: u64) -> usize {
        self.inner
            .read()
            .expect("child address lock poisoned")
            .get(&chain_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

/// Events built from one block, plus the factory children first discovered
/// in it (needed by the adapter to populate `ReorgedBlock` later).
pub struct BuiltBlock {
    pub events: Vec<Event>,
    pub discovered_children: HashSet<String>,
}

/// Synthetic setup events, one per chain x handler, positioned at
/// ZERO_CHECKPOINT so they sort before every real event of the chain.
pub fn setup_events(chain_id: u64, sources: &[Source]) -> Vec<Event> {
    let mut seen = HashSet::new();
    let mut events = Vec::new();
    for source in sources.iter().filter(|s| s.chain_id() == chain_id) {
        if seen.insert(source.name().to_string()) {
            events.push(Event {
                chain_id,
                name: format!("{}:setup", source.name()),
                checkpoint: ZERO_CHECKPOINT.to_string(),
                data: EventData::Setup,
            });
        }
    }
    events
}

/// Build the events of one raw block bundle.
pub fn build_events(
    bundle: &RawBlockBundle,
    sources: &[Source],
    children: &ChildAddresses,
) -> EngineResult<BuiltBlock> {
    let chain_id = bundle.chain_id;
    let block = &bundle.block;
    let tx_by_index: HashMap<u64, &crate::types::RawTransaction> = bundle
        .transactions
        .iter()
        .map(|tx| (tx.transaction_index, tx))
        .collect();
    let receipt_by_index: HashMap<u64, &crate::types::RawTransactionReceipt> = bundle
        .transaction_receipts
        .iter()
        .map(|r| (r.transaction_index, r))
        .collect();

    let mut discovered: HashSet<String> = HashSet::new();
    let mut events: Vec<Event> = Vec::new();

    // Factory discovery runs first so children created earlier in the block
    // already match the sources scanning the same block.
    for source in sources.iter().filter(|s| s.chain_id() == chain_id) {
        if let Source::Contract {
            address:
                AddressFilter::Factory {
                    address,
                    event_selector,
                    child_topic_index,
                },
            ..
        } = source
        {
            for log in &bundle.logs {
                if !log.address.eq_ignore_ascii_case(address) {
                    continue;
                }
                if log.topics.first().map(|t| t.as_str()) != Some(event_selector.as_str()) {
                    continue;
                }
                match child_address_from_topic(log, *child_topic_index) {
                    Some(child) => {
                        children.insert(chain_id, child.clone());
                        discovered.insert(child);
                    }
                    None => {
                        debug!(
                            chain = chain_id,
                            block = block.number,
                            log_index = log.log_index,
                            "dropping factory log: child topic missing or malformed"
                        );
                    }
                }
            }
        }
    }

    for source in sources.iter().filter(|s| s.chain_id() == chain_id) {
        match source {
            Source::Contract {
                name,
                address,
                events: selectors,
                ..
            } => {
                for log in &bundle.logs {
                    if !contract_matches(address, chain_id, &log.address, children) {
                        continue;
                    }
                    let Some(topic0) = log.topics.first() else {
                        debug!(
                            chain = chain_id,
                            block = block.number,
                            log_index = log.log_index,
                            "dropping log without topics"
                        );
                        continue;
                    };
                    let Some(selector) = selectors.iter().find(|s| &s.topic0 == topic0) else {
                        continue;
                    };
                    let fields = CheckpointFields {
                        block_timestamp: block.timestamp,
                        chain_id,
                        block_number: block.number,
                        transaction_index: log.transaction_index,
                        event_type: EventType::Log,
                        event_index: log.log_index,
                    };
                    events.push(Event {
                        chain_id,
                        name: format!("{}:{}", name, selector.name),
                        checkpoint: checkpoint::encode(&fields)?,
                        data: EventData::Log {
                            block: block.clone(),
                            log: log.clone(),
                            transaction: tx_by_index.get(&log.transaction_index).map(|tx| (*tx).clone()),
                        },
                    });
                }
            }
            Source::Account { name, address, .. } => {
                for tx in &bundle.transactions {
                    let to_matches = tx
                        .to
                        .as_deref()
                        .map(|to| to.eq_ignore_ascii_case(address))
                        .unwrap_or(false);
                    if !tx.from.eq_ignore_ascii_case(address) && !to_matches {
                        continue;
                    }
                    let fields = CheckpointFields {
                        block_timestamp: block.timestamp,
                        chain_id,
                        block_number: block.number,
                        transaction_index: tx.transaction_index,
                        event_type: EventType::Transaction,
                        event_index: 0,
                    };
                    events.push(Event {
                        chain_id,
                        name: format!("{}:transaction", name),
                        checkpoint: checkpoint::encode(&fields)?,
                        data: EventData::Transaction {
                            block: block.clone(),
                            transaction: tx.clone(),
                            receipt: receipt_by_index.get(&tx.transaction_index).map(|r| (*r).clone()),
                        },
                    });
                }
                for trace in &bundle.traces {
                    let to_matches = trace
                        .to
                        .as_deref()
                        .map(|to| to.eq_ignore_ascii_case(address))
                        .unwrap_or(false);
                    if !trace.from.eq_ignore_ascii_case(address) && !to_matches {
                        continue;
                    }
                    // A native value movement surfaces as a transfer; any
                    // other call the account touched (zero-value calls,
                    // creations with no recipient) surfaces as a raw trace.
                    match trace.to.as_deref() {
                        Some(to) if !is_zero_value(&trace.value) => {
                            let fields = CheckpointFields {
                                block_timestamp: block.timestamp,
                                chain_id,
                                block_number: block.number,
                                transaction_index: trace.transaction_index,
                                event_type: EventType::Transfer,
                                event_index: trace.trace_index,
                            };
                            events.push(Event {
                                chain_id,
                                name: format!("{}:transfer", name),
                                checkpoint: checkpoint::encode(&fields)?,
                                data: EventData::Transfer {
                                    block: block.clone(),
                                    transfer: TransferData {
                                        from: trace.from.clone(),
                                        to: to.to_string(),
                                        value: trace.value.clone(),
                                        transaction_index: trace.transaction_index,
                                        trace_index: trace.trace_index,
                                    },
                                },
                            });
                        }
                        _ => {
                            let fields = CheckpointFields {
                                block_timestamp: block.timestamp,
                                chain_id,
                                block_number: block.number,
                                transaction_index: trace.transaction_index,
                                event_type: EventType::Trace,
                                event_index: trace.trace_index,
                            };
                            events.push(Event {
                                chain_id,
                                name: format!("{}:trace", name),
                                checkpoint: checkpoint::encode(&fields)?,
                                data: EventData::Trace {
                                    block: block.clone(),
                                    trace: trace.clone(),
                                    transaction: tx_by_index
                                        .get(&trace.transaction_index)
                                        .map(|tx| (*tx).clone()),
                                },
                            });
                        }
                    }
                }
            }
            Source::Block { name, interval, .. } => {
                let interval = (*interval).max(1);
                if block.number % interval != 0 {
                    continue;
                }
                let fields = CheckpointFields {
                    block_timestamp: block.timestamp,
                    chain_id,
                    block_number: block.number,
                    transaction_index: 0,
                    event_type: EventType::Block,
                    event_index: 0,
                };
                events.push(Event {
                    chain_id,
                    name: format!("{}:block", name),
                    checkpoint: checkpoint::encode(&fields)?,
                    data: EventData::Block {
                        block: block.clone(),
                    },
                });
            }
        }
    }

    events.sort_by(|a, b| a.checkpoint.cmp(&b.checkpoint));
    Ok(BuiltBlock {
        events,
        discovered_children: discovered,
    })
}

fn contract_matches(
    filter: &AddressFilter,
    chain_id: u64,
    log_address: &str,
    children: &ChildAddresses,
) -> bool {
    match filter {
        AddressFilter::Static { addresses } => addresses
            .iter()
            .any(|a| a.eq_ignore_ascii_case(log_address)),
        AddressFilter::Factory { .. } => children.contains(chain_id, log_address),
    }
}

/// Extract a child contract address from an indexed topic. Topics are
/// 32-byte hex words; the address is the low 20 bytes.
fn child_address_from_topic(log: &RawLog, topic_index: usize) -> Option<String> {
    let topic = log.topics.get(topic_index)?;
    let hex_part = topic.strip_prefix("0x")?;
    if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex_part[24..].to_lowercase()))
}

fn is_zero_value(value: &str) -> bool {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    trimmed.is_empty() || trimmed.bytes().all(|b| b == b'0')
}

/// Validate that every handler key a source set can produce is well-formed.
/// Called once at engine start so misconfigured sources fail fast rather
/// than silently never matching.
pub fn handler_names(sources: &[Source]) -> EngineResult<Vec<String>> {
    let mut names = Vec::new();
    for source in sources {
        if source.name().is_empty() {
            return Err(EngineError::engine("source with empty name".to_string()));
        }
        names.push(format!("{}:setup", source.name()));
        match source {
            Source::Contract { name, events, .. } => {
                for selector in events {
                    names.push(format!("{}:{}", name, selector.name));
                }
            }
            Source::Account { name, .. } => {
                names.push(format!("{}:transaction", name));
                names.push(format!("{}:transfer", name));
                names.push(format!("{}:trace", name));
            }
            Source::Block { name, .. } => {
                names.push(format!("{}:block", name));
            }
        }
    }
    Ok(names)
}
