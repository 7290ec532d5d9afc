/// Indexing Executor
///
/// Consumes the merged event sequence and drives user handlers against the
/// reorg-tracking store. Two modes share one store abstraction:
///
/// - Historical: events accumulate into batches (default 93) with one
///   transaction per batch. Handler writes go through the in-memory write
///   buffer and flush in bulk at batch end, then the shadow rows captured
///   at MAX_CHECKPOINT are stamped with the batch's last checkpoint.
///   Errors are fatal; a partially-run batch rolls back whole.
/// - Realtime: one transaction per event, writes straight through so the
///   capture triggers fire naturally, stamp before commit. Retryable
///   failures (deadlocks, timeouts) retry with bounded backoff; the
///   deterministic client cache makes re-dispatch safe.
///
/// Control events are never applied mid-batch: the in-flight batch commits
/// first, then the reorg revert or finalize prune runs in its own
/// transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::ZERO_CHECKPOINT;
use crate::client::ReadonlyClient;
use crate::errors::{Backoff, EngineError, EngineResult, EventContext};
use crate::events::ChildAddresses;
use crate::handlers::{ChainInfo, Context, ContractInfo, Db, EventHandler, HandlerRegistry};
use crate::merger::EventMerger;
use crate::metrics;
use crate::schema::CompiledSchema;
use crate::store::{IndexingMode, StateStore, StoreTransaction};
use crate::sync_adapter::{run_chain_adapter, SyncSource};
use crate::telemetry::{short_checkpoint, IndexingProgress};
use crate::types::{ControlEvent, Event, MergedItem, Source};
use crate::write_buffer::WriteBuffer;

pub const DEFAULT_BATCH_SIZE: usize = 93;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub batch_size: usize,
    /// Transaction ceiling for a historical batch; exceeding it is fatal.
    pub historical_tx_timeout: Duration,
    /// Transaction ceiling per realtime event; exceeding it is retryable.
    pub realtime_tx_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max_delay: Duration,
    pub retry_max_elapsed: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            historical_tx_timeout: Duration::from_secs(60),
            realtime_tx_timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            retry_max_elapsed: Duration::from_secs(30),
        }
    }
}

/// Everything the engine is assembled from. The sync sources, transport and
/// handlers are compiled-in collaborators supplied by the embedding
/// application.
pub struct EngineParts<S: StateStore> {
    pub store: S,
    pub schema: Arc<CompiledSchema>,
    pub merger: EventMerger,
    pub handlers: HandlerRegistry<dyn EventHandler<S::Tx>>,
    pub client: Arc<ReadonlyClient>,
    pub contracts: HashMap<String, ContractInfo>,
    pub chains: HashMap<u64, ChainInfo>,
    pub children: Arc<ChildAddresses>,
    pub config: ExecutorConfig,
    pub shutdown: CancellationToken,
    /// Historical unless resuming straight at the tip.
    pub initial_mode: IndexingMode,
}

pub struct Engine<S: StateStore> {
    store: S,
    schema: Arc<CompiledSchema>,
    merger: EventMerger,
    handlers: HandlerRegistry<dyn EventHandler<S::Tx>>,
    client: Arc<ReadonlyClient>,
    contracts: HashMap<String, ContractInfo>,
    chains: HashMap<u64, ChainInfo>,
    children: Arc<ChildAddresses>,
    config: ExecutorConfig,
    shutdown: CancellationToken,
    mode: IndexingMode,
    batch: Vec<Event>,
    /// Last processed checkpoint per chain, for the mode switch.
    processed: HashMap<u64, String>,
    /// Highest finalized checkpoint reported per chain.
    finalized: HashMap<u64, String>,
    /// Global safe checkpoint committed to the store.
    safe: String,
    /// High-water mark of the stored latest checkpoint; only a reorg moves
    /// it backwards. Guards against a setup-only batch (all events at the
    /// zero checkpoint) rewinding the stored cursor after a restart.
    latest: String,
    /// Checkpoints the shadow rows were stamped with (one per committed
    /// batch or realtime event since the last finalize). A reorg can only
    /// revert precisely to one of these, so the revert rounds down to the
    /// nearest point and replays the gap.
    commit_points: BTreeSet<String>,
    /// Every delivered event since the last finalize, tagged with the
    /// checkpoint its shadow rows were stamped with. A revert to some
    /// floor re-queues the entries stamped above it.
    replay_log: Vec<(String, Event)>,
    progress: IndexingProgress,
}

impl<S: StateStore> Engine<S> {
    pub fn new(parts: EngineParts<S>) -> Self {
        Self {
            store: parts.store,
            schema: parts.schema,
            merger: parts.merger,
            handlers: parts.handlers,
            client: parts.client,
            contracts: parts.contracts,
            chains: parts.chains,
            children: parts.children,
            config: parts.config,
            shutdown: parts.shutdown,
            mode: parts.initial_mode,
            batch: Vec::new(),
            processed: HashMap::new(),
            finalized: HashMap::new(),
            safe: ZERO_CHECKPOINT.to_string(),
            latest: ZERO_CHECKPOINT.to_string(),
            commit_points: BTreeSet::new(),
            replay_log: Vec::new(),
            progress: IndexingProgress::new(1_000),
        }
    }

    /// Run to stream end, cancellation or failure. On a clean end the
    /// reorg runtime is dropped; on failure it stays behind so a restart
    /// can crash-recover from the shadow tables and checkpoint row.
    pub async fn run(mut self) -> EngineResult<()> {
        self.store.migrate().await?;
        self.recover().await?;
        self.store.create_reorg_runtime().await?;
        info!(
            mode = self.mode.as_str(),
            ordering = self.merger.policy().as_str(),
            handlers = self.handlers.len(),
            "indexing engine started"
        );

        let result = self.event_loop().await;
        match result {
            Ok(()) => {
                self.store.drop_reorg_runtime().await?;
                info!("indexing engine stopped cleanly");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Crash recovery: a latest checkpoint ahead of the safe one means the
    /// previous run died between commit and finalize. Rewind before
    /// consuming anything.
    async fn recover(&mut self) -> EngineResult<()> {
        let Some(checkpoints) = self.store.checkpoints().await? else {
            return Ok(());
        };
        self.safe = checkpoints.safe_checkpoint.clone();
        if checkpoints.latest_checkpoint <= checkpoints.safe_checkpoint {
            self.latest = checkpoints.latest_checkpoint.clone();
            return Ok(());
        }
        self.latest = checkpoints.safe_checkpoint.clone();
        warn!(
            safe = %short_checkpoint(&checkpoints.safe_checkpoint),
            latest = %short_checkpoint(&checkpoints.latest_checkpoint),
            "unclean shutdown detected, reverting to safe checkpoint"
        );
        let mut tx = self.store.begin(IndexingMode::Realtime).await?;
        tx.drop_triggers().await?;
        let restored = tx.revert(&checkpoints.safe_checkpoint).await?;
        tx.recreate_triggers().await?;
        tx.set_checkpoints(None, Some(&checkpoints.safe_checkpoint))
            .await?;
        tx.commit().await?;
        info!(rows = restored, "crash recovery complete");
        Ok(())
    }

    async fn event_loop(&mut self) -> EngineResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                // Accumulated-but-uncommitted events are discarded; the
                // stream replays them on restart.
                self.batch.clear();
                return Ok(());
            }
            match self.merger.next().await? {
                None => {
                    self.flush_batch().await?;
                    return Ok(());
                }
                Some(MergedItem::Event(event)) => self.handle_event(event).await?,
                Some(MergedItem::Control(control)) => {
                    // Mid-batch control events are forbidden: commit first.
                    self.flush_batch().await?;
                    self.apply_control(control).await?;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> EngineResult<()> {
        match self.mode {
            IndexingMode::Historical => {
                self.batch.push(event);
                let full = self.batch.len() >= self.config.batch_size;
                let stream_idle = !self.merger.has_ready();
                if full || stream_idle {
                    self.flush_batch().await?;
                    // A quiet stream means we have caught up to the tip;
                    // that is the moment to leave bulk loading.
                    if stream_idle {
                        self.maybe_switch_mode();
                    }
                }
                Ok(())
            }
            IndexingMode::Realtime => self.process_realtime(event).await,
        }
    }

    async fn flush_batch(&mut self) -> EngineResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let started = Instant::now();
        let timeout = self.config.historical_tx_timeout;

        match tokio::time::timeout(timeout, self.run_batch(&batch)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                metrics::HISTORICAL_BATCHES
                    .with_label_values(&["error"])
                    .inc();
                return Err(err);
            }
            Err(_) => {
                metrics::HISTORICAL_BATCHES
                    .with_label_values(&["timeout"])
                    .inc();
                return Err(EngineError::engine(format!(
                    "historical batch of {} events exceeded the {:?} transaction ceiling",
                    batch.len(),
                    timeout
                )));
            }
        }

        metrics::HISTORICAL_BATCHES.with_label_values(&["ok"]).inc();
        metrics::BATCH_COMMIT_DURATION.observe(started.elapsed().as_secs_f64());

        if let Some(last) = batch.last() {
            let stamp = last.checkpoint.clone();
            self.commit_points.insert(stamp.clone());
            for event in &batch {
                self.note_processed(event.chain_id, &event.checkpoint);
                self.replay_log.push((stamp.clone(), event.clone()));
            }
        }
        if let Some(snapshot) = self.progress.record(batch.len() as u64) {
            if let Some(last) = batch.last() {
                info!(
                    events = snapshot.total,
                    per_second = snapshot.events_per_second as u64,
                    checkpoint = %short_checkpoint(&last.checkpoint),
                    "historical progress"
                );
            }
        }
        Ok(())
    }

    /// One historical batch: dispatch through the write buffer, bulk flush,
    /// stamp, advance the latest checkpoint, commit. Dropping the
    /// transaction on the error path rolls everything back.
    async fn run_batch(&mut self, batch: &[Event]) -> EngineResult<()> {
        let Some(last) = batch.last() else {
            return Ok(());
        };
        let last_checkpoint = last.checkpoint.clone();

        let mut tx = self.store.begin(IndexingMode::Historical).await?;
        let mut buffer = WriteBuffer::new();
        for event in batch {
            self.dispatch(event, &mut tx, Some(&mut buffer)).await?;
        }
        let plan = buffer.into_flush_plan(&self.schema);
        tx.apply(plan).await?;
        tx.stamp(&last_checkpoint).await?;
        if last_checkpoint.as_str() > self.latest.as_str() {
            tx.set_checkpoints(None, Some(&last_checkpoint)).await?;
        }
        tx.commit().await?;
        if last_checkpoint.as_str() > self.latest.as_str() {
            self.latest = last_checkpoint;
        }
        Ok(())
    }

    async fn process_realtime(&mut self, event: Event) -> EngineResult<()> {
        let mut backoff = Backoff::new(
            self.config.retry_base,
            self.config.retry_max_delay,
            self.config.retry_max_elapsed,
        );
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let attempt = tokio::time::timeout(
                self.config.realtime_tx_timeout,
                self.run_realtime_once(&event),
            )
            .await;

            let err = match attempt {
                Ok(Ok(())) => {
                    self.commit_points.insert(event.checkpoint.clone());
                    self.note_processed(event.chain_id, &event.checkpoint);
                    if event.checkpoint.as_str() > self.latest.as_str() {
                        self.latest = event.checkpoint.clone();
                    }
                    self.replay_log
                        .push((event.checkpoint.clone(), event.clone()));
                    return Ok(());
                }
                Ok(Err(err)) if err.is_retryable() => err,
                Ok(Err(err)) => return Err(err),
                Err(_) => EngineError::retryable(format!(
                    "realtime transaction exceeded the {:?} ceiling",
                    self.config.realtime_tx_timeout
                )),
            };

            match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        event = %event.name,
                        delay_ms = delay.as_millis() as u64,
                        "retrying realtime event: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            }
        }
    }

    async fn run_realtime_once(&self, event: &Event) -> EngineResult<()> {
        let mut tx = self.store.begin(IndexingMode::Realtime).await?;
        self.dispatch(event, &mut tx, None).await?;
        tx.stamp(&event.checkpoint).await?;
        if event.checkpoint.as_str() > self.latest.as_str() {
            tx.set_checkpoints(None, Some(&event.checkpoint)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        event: &Event,
        tx: &mut S::Tx,
        buffer: Option<&mut WriteBuffer>,
    ) -> EngineResult<()> {
        let Some(handler) = self.handlers.get(&event.name) else {
            debug!(event = %event.name, "no handler registered, skipping event");
            return Ok(());
        };
        let chain = self
            .chains
            .get(&event.chain_id)
            .cloned()
            .unwrap_or_else(|| ChainInfo {
                id: event.chain_id,
                name: format!("chain-{}", event.chain_id),
            });
        let db = match buffer {
            Some(buffer) => Db::Buffered {
                schema: self.schema.as_ref(),
                buffer,
                tx,
            },
            None => Db::Direct {
                schema: self.schema.as_ref(),
                tx,
            },
        };
        let mut ctx = Context {
            chain,
            client: &self.client,
            contracts: &self.contracts,
            db,
        };

        let timer = metrics::DurationTimer::start(&event.name);
        let result = handler.call(event, &mut ctx).await;
        drop(timer);
        metrics::INDEXING_EVENTS_PROCESSED
            .with_label_values(&[&event.name])
            .inc();

        result.map_err(|err| {
            err.with_context(EventContext {
                name: event.name.clone(),
                chain_id: event.chain_id,
                block_number: event.block_number(),
                checkpoint: event.checkpoint.clone(),
            })
        })
    }

    async fn apply_control(&mut self, control: ControlEvent) -> EngineResult<()> {
        match control {
            ControlEvent::Reorg {
                chain_id,
                checkpoint,
                reorged_blocks,
            } => {
                if checkpoint.as_str() <= self.safe.as_str() && self.safe != ZERO_CHECKPOINT {
                    return Err(EngineError::unrecoverable(format!(
                        "reorg at {} undercuts the finalized checkpoint {}",
                        short_checkpoint(&checkpoint),
                        short_checkpoint(&self.safe)
                    )));
                }

                // Shadow rows carry their batch's stamp, so the store can
                // only rewind to a committed stamp point. Round down and
                // let the merger replay everything in between.
                let floor = self.revert_floor(&checkpoint);
                let mut tx = self.store.begin(self.mode).await?;
                tx.drop_triggers().await?;
                let restored = tx.revert(&floor).await?;
                tx.recreate_triggers().await?;
                tx.set_checkpoints(None, Some(&floor)).await?;
                tx.commit().await?;
                self.latest = floor.clone();

                self.merger.splice_orphaned(chain_id, &checkpoint);
                let replayed = self.requeue_replays(&floor, chain_id, &checkpoint);
                self.commit_points
                    .retain(|point| point.as_str() <= floor.as_str());
                for block in &reorged_blocks {
                    self.children
                        .remove_all(chain_id, &block.removed_child_addresses);
                }
                for processed in self.processed.values_mut() {
                    if processed.as_str() > floor.as_str() {
                        *processed = floor.clone();
                    }
                }
                info!(
                    chain = chain_id,
                    blocks = reorged_blocks.len(),
                    rows = restored,
                    replayed,
                    checkpoint = %short_checkpoint(&checkpoint),
                    floor = %short_checkpoint(&floor),
                    "reorg applied"
                );
                Ok(())
            }
            ControlEvent::Finalize {
                chain_id,
                checkpoint,
            } => {
                let entry = self
                    .finalized
                    .entry(chain_id)
                    .or_insert_with(|| ZERO_CHECKPOINT.to_string());
                if checkpoint.as_str() > entry.as_str() {
                    *entry = checkpoint;
                }

                // Shadow rows are only safe to prune below the *minimum*
                // finalized checkpoint: a lagging chain may still reorg to
                // a checkpoint between the chains' finality frontiers.
                let global = self.global_finalized();
                if global.as_str() > self.safe.as_str() {
                    let mut tx = self.store.begin(self.mode).await?;
                    let pruned = tx.finalize(&global).await?;
                    tx.set_checkpoints(Some(&global), None).await?;
                    tx.commit().await?;
                    self.safe = global.clone();
                    self.commit_points
                        .retain(|point| point.as_str() > global.as_str());
                    self.replay_log
                        .retain(|(stamp, _)| stamp.as_str() > global.as_str());
                    debug!(
                        rows = pruned,
                        checkpoint = %short_checkpoint(&global),
                        "finalized"
                    );
                }

                self.maybe_switch_mode();
                Ok(())
            }
        }
    }

    /// Greatest committed stamp point at or below the reorg checkpoint,
    /// bounded below by the safe checkpoint.
    fn revert_floor(&self, checkpoint: &str) -> String {
        self.commit_points
            .range(..=checkpoint.to_string())
            .next_back()
            .cloned()
            .unwrap_or_else(|| self.safe.clone())
    }

    /// Re-queue the delivered events whose shadow stamps the revert
    /// removed. The reorged chain's events above the reorg point stay
    /// gone; everything else stamped above the floor runs again, in the
    /// original delivery order.
    fn requeue_replays(&mut self, floor: &str, reorged_chain: u64, reorg_checkpoint: &str) -> usize {
        let mut kept = Vec::with_capacity(self.replay_log.len());
        let mut replays = Vec::new();
        for (stamp, event) in self.replay_log.drain(..) {
            if stamp.as_str() <= floor {
                kept.push((stamp, event));
            } else if event.chain_id == reorged_chain
                && event.checkpoint.as_str() > reorg_checkpoint
            {
                // Orphaned with its block.
            } else {
                replays.push(event);
            }
        }
        self.replay_log = kept;
        let count = replays.len();
        self.merger.push_replay(replays);
        count
    }

    fn global_finalized(&self) -> String {
        self.chains
            .keys()
            .map(|chain_id| {
                self.finalized
                    .get(chain_id)
                    .map(String::as_str)
                    .unwrap_or(ZERO_CHECKPOINT)
            })
            .min()
            .unwrap_or(ZERO_CHECKPOINT)
            .to_string()
    }

    fn note_processed(&mut self, chain_id: u64, checkpoint: &str) {
        let entry = self
            .processed
            .entry(chain_id)
            .or_insert_with(|| ZERO_CHECKPOINT.to_string());
        if checkpoint > entry.as_str() {
            *entry = checkpoint.to_string();
        }
    }

    /// Leave historical mode once every chain's processed checkpoint has
    /// reached its finality frontier.
    fn maybe_switch_mode(&mut self) {
        if self.mode == IndexingMode::Realtime {
            return;
        }
        for chain_id in self.chains.keys() {
            let finalized = self
                .finalized
                .get(chain_id)
                .map(String::as_str)
                .unwrap_or(ZERO_CHECKPOINT);
            let processed = self
                .processed
                .get(chain_id)
                .map(String::as_str)
                .unwrap_or(ZERO_CHECKPOINT);
            if processed < finalized {
                return;
            }
        }
        self.mode = IndexingMode::Realtime;
        info!("caught up with finalized history, switching to realtime mode");
    }
}

/// Wire one adapter task per sync source into the merger. Channel capacity
/// of about twice the batch size gives backpressure without starving the
/// realtime path.
pub fn spawn_adapters(
    sync_sources: Vec<Arc<dyn SyncSource>>,
    sources: &[Source],
    children: &Arc<ChildAddresses>,
    merger: &mut EventMerger,
    batch_size: usize,
    finality_overrides: &HashMap<u64, u64>,
    shutdown: &CancellationToken,
) -> JoinSet<EngineResult<()>> {
    let capacity = (batch_size * 2).max(8);
    let mut tasks = JoinSet::new();
    for sync_source in sync_sources {
        let chain_id = sync_source.chain_id();
        let (tx, rx) = mpsc::channel(capacity);
        merger.add_chain(chain_id, rx);
        let depth = finality_overrides
            .get(&chain_id)
            .copied()
            .unwrap_or_else(|| sync_source.finality_depth());
        let chain_sources: Vec<Source> = sources
            .iter()
            .filter(|s| s.chain_id() == chain_id)
            .cloned()
            .collect();
        let children = Arc::clone(children);
        let shutdown = shutdown.clone();
        tasks.spawn(run_chain_adapter(
            sync_source,
            depth,
            chain_sources,
            children,
            tx,
            shutdown,
        ));
    }
    tasks
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
pub fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    warn!("failed to install SIGTERM handler: {}", err);
                    let _ = ctrl_c.await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

/// Engine plus its adapter tasks; the first failure anywhere cancels the
/// rest and wins.
pub struct Pipeline<S: StateStore> {
    pub engine: Engine<S>,
    pub adapters: JoinSet<EngineResult<()>>,
    pub shutdown: CancellationToken,
}

impl<S: StateStore> Pipeline<S> {
    pub async fn run(self) -> EngineResult<()> {
        let Pipeline {
            engine,
            mut adapters,
            shutdown,
        } = self;
        spawn_signal_listener(shutdown.clone());

        let engine_fut = engine.run();
        tokio::pin!(engine_fut);
        loop {
            tokio::select! {
                result = &mut engine_fut => {
                    shutdown.cancel();
                    return result;
                }
                joined = adapters.join_next(), if !adapters.is_empty() => {
                    match joined {
                        Some(Ok(Ok(()))) | None => continue,
                        Some(Ok(Err(err))) => {
                            shutdown.cancel();
                            return Err(err);
                        }
                        Some(Err(join_err)) => {
                            shutdown.cancel();
                            return Err(EngineError::engine(format!(
                                "chain adapter task failed: {}",
                                join_err
                            )));
                        }
                    }
                }
            }
        }
    }
}
