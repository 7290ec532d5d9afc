/// Sync Source Adapter
///
/// One adapter task per chain. It consumes the pluggable sync source's
/// update stream, keeps an in-memory ring of unfinalized blocks bounded by
/// the chain's finality depth, and reconciles every incoming block against
/// the stored tip:
///
/// - a child of the current tip is appended; blocks shifted off the front
///   of the full ring are finalized
/// - anything else walks the ring backwards to the fork ancestor, emits a
///   reorg with the orphaned blocks, and truncates
/// - a reorg older than the ring is unrecoverable (DeepReorg): the engine
///   cannot reconstruct the ancestor from memory and refuses to guess
///
/// The adapter never blocks on downstream work; the bounded channel into
/// the merger provides the backpressure.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::block_boundary;
use crate::errors::{EngineError, EngineResult};
use crate::events::{self, ChildAddresses};
use crate::metrics;
use crate::telemetry::short_hash;
use crate::types::{
    ChainMessage, ChainUpdate, RawBlock, RawBlockBundle, ReorgedBlock, Source,
};

/// What a sync source yields per chain.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceUpdate {
    /// A new (or replacement) tip block with its raw payloads.
    Block(RawBlockBundle),
    /// The source itself announced a branch switch rooted below this block.
    Reorg(RawBlock),
    /// The source declared this block finalized.
    Finalize(RawBlock),
}

/// The consumed per-chain block feed. Fetch strategy, transports and
/// finality policy all live behind this seam.
#[async_trait]
pub trait SyncSource: Send + Sync + 'static {
    fn chain_id(&self) -> u64;

    fn chain_name(&self) -> String;

    async fn subscribe(&self) -> EngineResult<mpsc::Receiver<SourceUpdate>>;

    fn finality_depth(&self) -> u64 {
        default_finality_depth(self.chain_id())
    }
}

/// Finality depth defaults per chain id; 30 is the fallback for chains the
/// table does not name. Overridable through configuration.
pub fn default_finality_depth(chain_id: u64) -> u64 {
    match chain_id {
        1 | 11155111 => 65,
        137 | 80001 => 200,
        42161 => 240,
        _ => 30,
    }
}

struct UnfinalizedBlock {
    block: RawBlock,
    /// Factory children first discovered in this block; forgotten again if
    /// the block is reorged away.
    discovered_children: HashSet<String>,
}

/// The reconcile state machine, separated from the task loop so tests can
/// drive it with scripted updates and inspect the emitted messages.
pub struct ChainAdapter {
    chain_id: u64,
    finality_depth: u64,
    ring: VecDeque<UnfinalizedBlock>,
    sources: Vec<Source>,
    children: Arc<ChildAddresses>,
}

impl ChainAdapter {
    pub fn new(
        chain_id: u64,
        finality_depth: u64,
        sources: Vec<Source>,
        children: Arc<ChildAddresses>,
    ) -> Self {
        Self {
            chain_id,
            finality_depth: finality_depth.max(1),
            ring: VecDeque::new(),
            sources,
            children,
        }
    }

    /// Setup events precede every real event of the chain.
    pub fn startup_messages(&self) -> Vec<ChainMessage> {
        let setup = events::setup_events(self.chain_id, &self.sources);
        if setup.is_empty() {
            return Vec::new();
        }
        vec![ChainMessage {
            chain_id: self.chain_id,
            update: ChainUpdate::Events(setup),
        }]
    }

    pub fn apply(&mut self, update: SourceUpdate) -> EngineResult<Vec<ChainMessage>> {
        match update {
            SourceUpdate::Block(bundle) => self.reconcile(bundle),
            SourceUpdate::Reorg(block) => self.external_reorg(block),
            SourceUpdate::Finalize(block) => self.external_finalize(block),
        }
    }

    fn message(&self, update: ChainUpdate) -> ChainMessage {
        ChainMessage {
            chain_id: self.chain_id,
            update,
        }
    }

    fn reconcile(&mut self, bundle: RawBlockBundle) -> EngineResult<Vec<ChainMessage>> {
        if bundle.chain_id != self.chain_id {
            return Err(EngineError::engine(format!(
                "sync source for chain {} delivered a block of chain {}",
                self.chain_id, bundle.chain_id
            )));
        }
        let mut out = Vec::new();

        if let Some(latest) = self.ring.back() {
            let extends_tip = bundle.block.number == latest.block.number + 1
                && bundle.block.parent_hash == latest.block.hash;
            if !extends_tip {
                out.push(self.handle_reorg(&bundle.block)?);
            }
        }

        // Append the new tip and materialize its events.
        let built = events::build_events(&bundle, &self.sources, &self.children)?;
        self.ring.push_back(UnfinalizedBlock {
            block: bundle.block.clone(),
            discovered_children: built.discovered_children,
        });
        if built.events.is_empty() {
            out.push(self.message(ChainUpdate::Idle(boundary_of(self.chain_id, &bundle.block)?)));
        } else {
            out.push(self.message(ChainUpdate::Events(built.events)));
        }

        // Shift finalized blocks off the front once the ring is full.
        while self.ring.len() as u64 > self.finality_depth {
            let front = match self.ring.pop_front() {
                Some(front) => front,
                None => break,
            };
            out.push(self.message(ChainUpdate::Finalize(boundary_of(
                self.chain_id,
                &front.block,
            )?)));
        }

        Ok(out)
    }

    /// Walk the ring backwards to the block whose hash is the incoming
    /// parent. Everything above it is orphaned.
    fn handle_reorg(&mut self, incoming: &RawBlock) -> EngineResult<ChainMessage> {
        let mut reorged: Vec<ReorgedBlock> = Vec::new();
        let mut ancestor_index: Option<usize> = None;

        for (index, stored) in self.ring.iter().enumerate().rev() {
            if stored.block.hash == incoming.parent_hash {
                ancestor_index = Some(index);
                break;
            }
            reorged.push(ReorgedBlock {
                block: stored.block.clone(),
                removed_child_addresses: stored.discovered_children.clone(),
            });
        }

        let Some(ancestor_index) = ancestor_index else {
            return Err(EngineError::deep_reorg(
                self.chain_id,
                format!(
                    "no common ancestor for block {} (parent {}) within {} unfinalized blocks",
                    incoming.number,
                    short_hash(&incoming.parent_hash),
                    self.ring.len()
                ),
            ));
        };

        let ancestor = &self.ring[ancestor_index].block;
        let ancestor_number = ancestor.number;
        let ancestor_hash = ancestor.hash.clone();
        let checkpoint = boundary_of(self.chain_id, ancestor)?;
        let depth = reorged.len();

        // Forget the orphaned blocks' factory discoveries up front; the
        // executor also removes them when it applies the control event, but
        // this adapter must stop matching them immediately.
        for block in &reorged {
            self.children
                .remove_all(self.chain_id, &block.removed_child_addresses);
        }

        self.ring.truncate(ancestor_index + 1);

        metrics::SYNC_REORG_TOTAL
            .with_label_values(&[&self.chain_id.to_string()])
            .inc();
        metrics::SYNC_REORG_DEPTH
            .with_label_values(&[&self.chain_id.to_string()])
            .observe(depth as f64);
        warn!(
            chain = self.chain_id,
            depth,
            ancestor = ancestor_number,
            ancestor_hash = %short_hash(&ancestor_hash),
            "reorg detected"
        );

        Ok(self.message(ChainUpdate::Reorg {
            checkpoint,
            reorged_blocks: reorged,
        }))
    }

    /// The source announced the branch switch itself; new canonical blocks
    /// follow as regular updates.
    fn external_reorg(&mut self, block: RawBlock) -> EngineResult<Vec<ChainMessage>> {
        if self.ring.is_empty() {
            debug!(chain = self.chain_id, "ignoring reorg signal with empty ring");
            return Ok(Vec::new());
        }
        let message = self.handle_reorg(&block)?;
        Ok(vec![message])
    }

    fn external_finalize(&mut self, block: RawBlock) -> EngineResult<Vec<ChainMessage>> {
        let mut out = Vec::new();
        while let Some(front) = self.ring.front() {
            if front.block.number > block.number {
                break;
            }
            let front = match self.ring.pop_front() {
                Some(front) => front,
                None => break,
            };
            out.push(self.message(ChainUpdate::Finalize(boundary_of(
                self.chain_id,
                &front.block,
            )?)));
        }
        Ok(out)
    }

    pub fn unfinalized_len(&self) -> usize {
        self.ring.len()
    }
}

fn boundary_of(chain_id: u64, block: &RawBlock) -> EngineResult<String> {
    block_boundary(block.timestamp, chain_id, block.number)
}

/// The per-chain adapter task: subscribe, reconcile, forward into the
/// merger's bounded channel until the source ends or shutdown trips.
pub async fn run_chain_adapter(
    source: Arc<dyn SyncSource>,
    finality_depth: u64,
    sources: Vec<Source>,
    children: Arc<ChildAddresses>,
    out: mpsc::Sender<ChainMessage>,
    shutdown: CancellationToken,
) -> EngineResult<()> {
    let chain_id = source.chain_id();
    let mut adapter = ChainAdapter::new(chain_id, finality_depth, sources, children);

    for message in adapter.startup_messages() {
        if out.send(message).await.is_err() {
            return Ok(());
        }
    }

    let mut updates = source.subscribe().await?;
    info!(
        chain = chain_id,
        name = %source.chain_name(),
        finality_depth,
        "chain adapter started"
    );

    loop {
        let update = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(chain = chain_id, "chain adapter cancelled");
                return Ok(());
            }
            update = updates.recv() => match update {
                Some(update) => update,
                None => {
                    info!(chain = chain_id, "sync source stream ended");
                    return Ok(());
                }
            },
        };

        for message in adapter.apply(update)? {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                sent = out.send(message) => {
                    if sent.is_err() {
                        // Merger closed; nothing left to feed.
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ZERO_CHECKPOINT;

    fn raw_block(number: u64, hash: &str, parent: &str, timestamp: u64) -> RawBlock {
        RawBlock {
            number,
            hash: hash.to_string(),
            parent_hash: parent.to_string(),
            timestamp,
            extra: serde_json::Value::Null,
        }
    }

    fn bundle(chain_id: u64, block: RawBlock) -> RawBlockBundle {
        RawBlockBundle {
            chain_id,
            block,
            logs: vec![],
            transactions: vec![],
            transaction_receipts: vec![],
            traces: vec![],
        }
    }

    fn adapter(depth: u64) -> ChainAdapter {
        let sources = vec![Source::Block {
            name: "Sampler".to_string(),
            chain_id: 1,
            interval: 1,
        }];
        ChainAdapter::new(1, depth, sources, Arc::new(ChildAddresses::new()))
    }

    fn updates_of(messages: &[ChainMessage]) -> Vec<&ChainUpdate> {
        messages.iter().map(|m| &m.update).collect()
    }

    #[test]
    fn test_default_finality_depths() {
        assert_eq!(default_finality_depth(1), 65);
        assert_eq!(default_finality_depth(11155111), 65);
        assert_eq!(default_finality_depth(137), 200);
        assert_eq!(default_finality_depth(80001), 200);
        assert_eq!(default_finality_depth(42161), 240);
        assert_eq!(default_finality_depth(123456), 30);
    }

    #[test]
    fn test_setup_before_anything_else() {
        let adapter = adapter(10);
        let startup = adapter.startup_messages();
        assert_eq!(startup.len(), 1);
        match &startup[0].update {
            ChainUpdate::Events(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].name, "Sampler:setup");
                assert_eq!(events[0].checkpoint, ZERO_CHECKPOINT);
            }
            other => panic!("unexpected startup update: {:?}", other),
        }
    }

    #[test]
    fn test_linear_growth_emits_events_then_finalizes() {
        let mut adapter = adapter(2);
        let a = adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(1, "0xa", "0x0", 10))))
            .unwrap();
        assert!(matches!(a[0].update, ChainUpdate::Events(_)));
        assert_eq!(a.len(), 1);

        adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(2, "0xb", "0xa", 20))))
            .unwrap();
        // Third block overflows the ring: the first block finalizes.
        let c = adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(3, "0xc", "0xb", 30))))
            .unwrap();
        assert_eq!(c.len(), 2);
        match &c[1].update {
            ChainUpdate::Finalize(checkpoint) => {
                assert_eq!(checkpoint, &block_boundary(10, 1, 1).unwrap());
            }
            other => panic!("expected finalize, got {:?}", other),
        }
        assert_eq!(adapter.unfinalized_len(), 2);
    }

    #[test]
    fn test_shallow_reorg_walks_to_ancestor() {
        let mut adapter = adapter(10);
        for (n, hash, parent, ts) in [
            (1u64, "0xaa", "0x00", 10u64),
            (2, "0xbb", "0xaa", 20),
            (3, "0xcc", "0xbb", 30),
            (4, "0xdd", "0xcc", 40),
        ] {
            adapter
                .apply(SourceUpdate::Block(bundle(1, raw_block(n, hash, parent, ts))))
                .unwrap();
        }

        // New branch off block 2
        let messages = adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(3, "0xee", "0xbb", 35))))
            .unwrap();
        let updates = updates_of(&messages);
        assert_eq!(updates.len(), 2);
        match updates[0] {
            ChainUpdate::Reorg {
                checkpoint,
                reorged_blocks,
            } => {
                assert_eq!(checkpoint, &block_boundary(20, 1, 2).unwrap());
                let numbers: Vec<u64> = reorged_blocks.iter().map(|b| b.block.number).collect();
                assert_eq!(numbers, vec![4, 3]);
            }
            other => panic!("expected reorg, got {:?}", other),
        }
        assert!(matches!(updates[1], ChainUpdate::Events(_)));
        assert_eq!(adapter.unfinalized_len(), 3);
    }

    #[test]
    fn test_same_height_replacement_is_a_reorg() {
        let mut adapter = adapter(10);
        adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(1, "0xaa", "0x00", 10))))
            .unwrap();
        adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(2, "0xbb", "0xaa", 20))))
            .unwrap();
        let messages = adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(2, "0xb2", "0xaa", 21))))
            .unwrap();
        assert!(matches!(messages[0].update, ChainUpdate::Reorg { .. }));
    }

    #[test]
    fn test_deep_reorg_is_unrecoverable() {
        let mut adapter = adapter(2);
        for (n, hash, parent, ts) in [
            (1u64, "0xaa", "0x00", 10u64),
            (2, "0xbb", "0xaa", 20),
            (3, "0xcc", "0xbb", 30),
            (4, "0xdd", "0xcc", 40),
        ] {
            adapter
                .apply(SourceUpdate::Block(bundle(1, raw_block(n, hash, parent, ts))))
                .unwrap();
        }
        // Ring now holds blocks 3 and 4; a branch off block 1 is below it.
        let err = adapter
            .apply(SourceUpdate::Block(bundle(1, raw_block(2, "0xee", "0xaa", 50))))
            .unwrap_err();
        assert!(err.is_deep_reorg());
        assert_eq!(err.exit_code(), 75);
    }

    #[test]
    fn test_external_finalize_prunes_ring() {
        let mut adapter = adapter(10);
        for (n, hash, parent, ts) in [
            (1u64, "0xaa", "0x00", 10u64),
            (2, "0xbb", "0xaa", 20),
            (3, "0xcc", "0xbb", 30),
        ] {
            adapter
                .apply(SourceUpdate::Block(bundle(1, raw_block(n, hash, parent, ts))))
                .unwrap();
        }
        let messages = adapter
            .apply(SourceUpdate::Finalize(raw_block(2, "0xbb", "0xaa", 20)))
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].update, ChainUpdate::Finalize(_)));
        assert!(matches!(messages[1].update, ChainUpdate::Finalize(_)));
        assert_eq!(adapter.unfinalized_len(), 1);
    }

    #[test]
    fn test_wrong_chain_bundle_is_fatal() {
        let mut adapter = adapter(10);
        let err = adapter
            .apply(SourceUpdate::Block(bundle(2, raw_block(1, "0xaa", "0x00", 10))))
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::NonRetryableEngine);
    }
}
