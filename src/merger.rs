/// Ordering Merger
///
/// Merges the per-chain adapter streams into the single sequence the
/// executor consumes. Two policies, fixed at start:
///
/// - Multichain: every chain keeps its own order; events of different
///   chains never constrain each other.
/// - Omnichain: one globally checkpoint-sorted sequence. An event is only
///   released once every chain has declared progress past its checkpoint
///   (by delivering a later event or an idle watermark) - the k-way merge
///   minimum-frontier rule.
///
/// Reorg and finalize control messages pass through to the executor, which
/// owns the durable consequences. After a revert the executor hands the
/// merger two corrections: `splice_orphaned` drops the reorged chain's
/// now-invalid buffered events, and `push_replay` re-queues previously
/// released events whose rows the revert removed.

use std::collections::{BTreeMap, VecDeque};

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::checkpoint::{MAX_CHECKPOINT, ZERO_CHECKPOINT};
use crate::errors::EngineResult;
use crate::types::{ChainMessage, ChainUpdate, ControlEvent, Event, MergedItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    Multichain,
    Omnichain,
}

impl OrderingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingPolicy::Multichain => "multichain",
            OrderingPolicy::Omnichain => "omnichain",
        }
    }
}

impl std::str::FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multichain" => Ok(OrderingPolicy::Multichain),
            "omnichain" => Ok(OrderingPolicy::Omnichain),
            other => Err(format!(
                "unknown ordering policy '{}' (expected multichain or omnichain)",
                other
            )),
        }
    }
}

struct ChainLane {
    pending: VecDeque<Event>,
    /// Checkpoint through which the chain's stream has progressed.
    frontier: String,
    closed: bool,
}

impl ChainLane {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            frontier: ZERO_CHECKPOINT.to_string(),
            closed: false,
        }
    }

    fn effective_frontier(&self) -> &str {
        if self.closed {
            MAX_CHECKPOINT
        } else {
            &self.frontier
        }
    }
}

pub struct EventMerger {
    policy: OrderingPolicy,
    lanes: BTreeMap<u64, ChainLane>,
    inputs: StreamMap<u64, ReceiverStream<ChainMessage>>,
    round_robin: usize,
    shutdown: CancellationToken,
}

impl EventMerger {
    pub fn new(policy: OrderingPolicy, shutdown: CancellationToken) -> Self {
        Self {
            policy,
            lanes: BTreeMap::new(),
            inputs: StreamMap::new(),
            round_robin: 0,
            shutdown,
        }
    }

    pub fn policy(&self) -> OrderingPolicy {
        self.policy
    }

    pub fn add_chain(&mut self, chain_id: u64, receiver: mpsc::Receiver<ChainMessage>) {
        self.lanes.insert(chain_id, ChainLane::new());
        self.inputs.insert(chain_id, ReceiverStream::new(receiver));
    }

    pub fn chain_count(&self) -> usize {
        self.lanes.len()
    }

    /// Whether an event could be released right now without more input.
    /// The executor uses this to flush a partial batch instead of parking
    /// on a quiet stream.
    pub fn has_ready(&self) -> bool {
        self.ready_chain().is_some()
    }

    /// Pull the next item. Returns None once the shutdown token trips or
    /// every upstream closed and drained; pending events are dropped
    /// unexecuted on cancellation by design.
    pub async fn next(&mut self) -> EngineResult<Option<MergedItem>> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(event) = self.pop_ready() {
                return Ok(Some(MergedItem::Event(event)));
            }

            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                message = self.inputs.next() => message,
            };

            match message {
                Some((chain_id, message)) => {
                    if let Some(control) = self.ingest(chain_id, message) {
                        return Ok(Some(MergedItem::Control(control)));
                    }
                }
                None => {
                    // Every upstream has closed; release what remains.
                    for lane in self.lanes.values_mut() {
                        lane.closed = true;
                    }
                    return Ok(self.pop_ready().map(MergedItem::Event));
                }
            }
        }
    }

    fn ingest(&mut self, chain_id: u64, message: ChainMessage) -> Option<ControlEvent> {
        debug_assert_eq!(chain_id, message.chain_id);
        match message.update {
            ChainUpdate::Events(events) => {
                let lane = self.lanes.get_mut(&chain_id)?;
                if let Some(last) = events.last() {
                    if last.checkpoint.as_str() > lane.frontier.as_str() {
                        lane.frontier = last.checkpoint.clone();
                    }
                }
                lane.pending.extend(events);
                None
            }
            ChainUpdate::Idle(checkpoint) => {
                let lane = self.lanes.get_mut(&chain_id)?;
                if checkpoint.as_str() > lane.frontier.as_str() {
                    lane.frontier = checkpoint;
                }
                None
            }
            ChainUpdate::Reorg {
                checkpoint,
                reorged_blocks,
            } => Some(ControlEvent::Reorg {
                chain_id,
                checkpoint,
                reorged_blocks,
            }),
            ChainUpdate::Finalize(checkpoint) => Some(ControlEvent::Finalize {
                chain_id,
                checkpoint,
            }),
        }
    }

    /// Drop the reorged chain's buffered events above the reorg point and
    /// pull its frontier back. Called by the executor while it applies the
    /// reorg control event.
    pub fn splice_orphaned(&mut self, chain_id: u64, reorg_checkpoint: &str) {
        let Some(lane) = self.lanes.get_mut(&chain_id) else {
            return;
        };
        let before = lane.pending.len();
        lane.pending
            .retain(|event| event.checkpoint.as_str() <= reorg_checkpoint);
        let spliced = before - lane.pending.len();
        if spliced > 0 {
            debug!(chain = chain_id, spliced, "dropped orphaned pending events");
        }
        if reorg_checkpoint < lane.frontier.as_str() {
            lane.frontier = reorg_checkpoint.to_string();
        }
    }

    /// Re-queue previously released events whose effects a revert removed.
    /// `events` must be in original delivery order; they are older than
    /// anything buffered, so they go to the front of their lanes.
    pub fn push_replay(&mut self, events: Vec<Event>) {
        let mut by_chain: BTreeMap<u64, Vec<Event>> = BTreeMap::new();
        for event in events {
            by_chain.entry(event.chain_id).or_default().push(event);
        }
        for (chain_id, chain_events) in by_chain {
            if let Some(lane) = self.lanes.get_mut(&chain_id) {
                for event in chain_events.into_iter().rev() {
                    lane.pending.push_front(event);
                }
            }
        }
    }

    fn ready_chain(&self) -> Option<u64> {
        match self.policy {
            OrderingPolicy::Multichain => {
                let ids: Vec<u64> = self.lanes.keys().copied().collect();
                if ids.is_empty() {
                    return None;
                }
                for offset in 0..ids.len() {
                    let id = ids[(self.round_robin + offset) % ids.len()];
                    if !self.lanes[&id].pending.is_empty() {
                        return Some(id);
                    }
                }
                None
            }
            OrderingPolicy::Omnichain => {
                let min_frontier = self
                    .lanes
                    .values()
                    .map(|lane| lane.effective_frontier())
                    .min()?;
                let (chain_id, head) = self
                    .lanes
                    .iter()
                    .filter_map(|(id, lane)| {
                        lane.pending.front().map(|event| (*id, &event.checkpoint))
                    })
                    .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(&b.0)))?;
                if head.as_str() <= min_frontier {
                    Some(chain_id)
                } else {
                    None
                }
            }
        }
    }

    fn pop_ready(&mut self) -> Option<Event> {
        let chain_id = self.ready_chain()?;
        if self.policy == OrderingPolicy::Multichain {
            self.round_robin = self.round_robin.wrapping_add(1);
        }
        self.lanes.get_mut(&chain_id)?.pending.pop_front()
    }
}
