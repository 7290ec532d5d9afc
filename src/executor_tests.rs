/// End-to-end engine scenarios against an in-memory state store.
///
/// The MemStore mirrors the Postgres store's shadow semantics faithfully:
/// capture triggers (insert NEW / update OLD / delete OLD at
/// MAX_CHECKPOINT), batch stamping, the earliest-operation-wins revert and
/// checkpoint bookkeeping. Transactions clone the state and write back on
/// commit, so a dropped transaction rolls back exactly like the real one.
///
/// Dropping the reorg runtime archives the shadow rows instead of
/// discarding them, so tests can assert on shadow state after a clean
/// shutdown.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{self, MAX_CHECKPOINT, ZERO_CHECKPOINT};
use crate::client::{ClientConfig, ReadonlyClient, RpcTransport};
use crate::errors::{EngineError, EngineResult, ErrorKind};
use crate::events::ChildAddresses;
use crate::executor::{spawn_adapters, Engine, EngineParts, ExecutorConfig};
use crate::handlers::{ChainInfo, Context, EventHandler, HandlerRegistry};
use crate::merger::{EventMerger, OrderingPolicy};
use crate::schema::{self, Column, ColumnType, CompiledSchema, TableSchema};
use crate::store::{IndexingMode, StateStore, StoreTransaction, StoredCheckpoints};
use crate::sync_adapter::{SourceUpdate, SyncSource};
use crate::types::{
    AddressFilter, Event, EventData, EventSelector, RawBlock, RawBlockBundle, RawLog, Row, Source,
};
use crate::write_buffer::FlushPlan;

const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
const WATCHED_ADDRESS: &str = "0xc0ffee";

// ============================================================================
// In-memory state store
// ============================================================================

#[derive(Debug, Clone)]
struct ShadowRow {
    operation_id: u64,
    operation: i16,
    checkpoint: String,
    row: Row,
}

#[derive(Debug, Clone)]
struct MemState {
    tables: HashMap<String, BTreeMap<String, Row>>,
    shadow: HashMap<String, Vec<ShadowRow>>,
    archived_shadow: HashMap<String, Vec<ShadowRow>>,
    op_counter: u64,
    runtime_installed: bool,
    triggers_enabled: bool,
    safe: String,
    latest: String,
}

impl MemState {
    fn new() -> Self {
        Self {
            tables: HashMap::new(),
            shadow: HashMap::new(),
            archived_shadow: HashMap::new(),
            op_counter: 0,
            runtime_installed: false,
            triggers_enabled: false,
            safe: ZERO_CHECKPOINT.to_string(),
            latest: ZERO_CHECKPOINT.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct MemStore {
    state: Arc<StdMutex<MemState>>,
    schema: Arc<CompiledSchema>,
}

impl MemStore {
    pub fn new(schema: Arc<CompiledSchema>) -> Self {
        Self {
            state: Arc::new(StdMutex::new(MemState::new())),
            schema,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().expect("mem store lock poisoned")
    }

    fn rows(&self, table: &str) -> BTreeMap<String, Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    fn ids(&self, table: &str) -> Vec<String> {
        self.rows(table)
            .values()
            .filter_map(|row| row.get("id").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    /// Current plus archived shadow rows, for post-shutdown assertions.
    fn all_shadow(&self, table: &str) -> Vec<ShadowRow> {
        let state = self.lock();
        let mut rows = state.shadow.get(table).cloned().unwrap_or_default();
        rows.extend(state.archived_shadow.get(table).cloned().unwrap_or_default());
        rows
    }

    fn stored_checkpoints(&self) -> (String, String) {
        let state = self.lock();
        (state.safe.clone(), state.latest.clone())
    }
}

#[async_trait]
impl StateStore for MemStore {
    type Tx = MemTx;

    async fn migrate(&self) -> EngineResult<()> {
        let mut state = self.lock();
        for table in &self.schema.tables {
            state.tables.entry(table.name.clone()).or_default();
        }
        Ok(())
    }

    async fn create_reorg_runtime(&self) -> EngineResult<()> {
        let mut state = self.lock();
        for table in &self.schema.tables {
            state.shadow.entry(table.name.clone()).or_default();
        }
        state.runtime_installed = true;
        state.triggers_enabled = true;
        Ok(())
    }

    async fn drop_reorg_runtime(&self) -> EngineResult<()> {
        let mut state = self.lock();
        let shadow = std::mem::take(&mut state.shadow);
        for (table, rows) in shadow {
            state.archived_shadow.entry(table).or_default().extend(rows);
        }
        state.runtime_installed = false;
        state.triggers_enabled = false;
        Ok(())
    }

    async fn checkpoints(&self) -> EngineResult<Option<StoredCheckpoints>> {
        let state = self.lock();
        Ok(Some(StoredCheckpoints {
            safe_checkpoint: state.safe.clone(),
            latest_checkpoint: state.latest.clone(),
        }))
    }

    async fn begin(&self, _mode: IndexingMode) -> EngineResult<Self::Tx> {
        let working = self.lock().clone();
        Ok(MemTx {
            shared: Arc::clone(&self.state),
            working,
            schema: Arc::clone(&self.schema),
        })
    }
}

pub struct MemTx {
    shared: Arc<StdMutex<MemState>>,
    working: MemState,
    schema: Arc<CompiledSchema>,
}

impl MemTx {
    fn table_schema(&self, table: &str) -> EngineResult<TableSchema> {
        self.schema.require_table(table).cloned()
    }

    fn capture(&mut self, table: &str, operation: i16, row: Row) {
        if !(self.working.runtime_installed && self.working.triggers_enabled) {
            return;
        }
        self.working.op_counter += 1;
        let operation_id = self.working.op_counter;
        self.working
            .shadow
            .entry(table.to_string())
            .or_default()
            .push(ShadowRow {
                operation_id,
                operation,
                checkpoint: MAX_CHECKPOINT.to_string(),
                row,
            });
    }

    fn insert_row(&mut self, table: &str, row: Row) -> EngineResult<()> {
        let table_schema = self.table_schema(table)?;
        let key = schema::primary_key_string(&table_schema, &row)?;
        let rows = self.working.tables.entry(table.to_string()).or_default();
        if rows.contains_key(&key) {
            return Err(EngineError::user(format!(
                "unique violation: row already exists in '{}'",
                table
            )));
        }
        rows.insert(key, row.clone());
        self.capture(table, schema::OP_INSERT, row);
        Ok(())
    }

    fn upsert_row(&mut self, table: &str, row: Row) -> EngineResult<()> {
        let table_schema = self.table_schema(table)?;
        let key = schema::primary_key_string(&table_schema, &row)?;
        let existing = self
            .working
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key, row.clone());
        match existing {
            Some(old) => self.capture(table, schema::OP_UPDATE, old),
            None => self.capture(table, schema::OP_INSERT, row),
        }
        Ok(())
    }

    fn delete_row(&mut self, table: &str, key_row: &Row) -> EngineResult<bool> {
        let table_schema = self.table_schema(table)?;
        let key = schema::primary_key_string(&table_schema, key_row)?;
        let removed = self
            .working
            .tables
            .entry(table.to_string())
            .or_default()
            .remove(&key);
        match removed {
            Some(old) => {
                self.capture(table, schema::OP_DELETE, old);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl StoreTransaction for MemTx {
    async fn find(&mut self, table: &str, key: &Row) -> EngineResult<Option<Row>> {
        let table_schema = self.table_schema(table)?;
        let key = schema::primary_key_string(&table_schema, key)?;
        Ok(self
            .working
            .tables
            .get(table)
            .and_then(|rows| rows.get(&key))
            .cloned())
    }

    async fn insert(&mut self, table: &str, row: Row) -> EngineResult<()> {
        self.insert_row(table, row)
    }

    async fn update(&mut self, table: &str, row: Row) -> EngineResult<()> {
        self.upsert_row(table, row)
    }

    async fn delete(&mut self, table: &str, key: &Row) -> EngineResult<bool> {
        self.delete_row(table, key)
    }

    async fn apply(&mut self, plan: FlushPlan) -> EngineResult<()> {
        for flush in plan.tables {
            for row in flush.inserts {
                self.insert_row(&flush.table, row)?;
            }
            for row in flush.upserts {
                self.upsert_row(&flush.table, row)?;
            }
            for key in flush.deletes {
                self.delete_row(&flush.table, &key)?;
            }
        }
        Ok(())
    }

    async fn stamp(&mut self, checkpoint: &str) -> EngineResult<()> {
        for rows in self.working.shadow.values_mut() {
            for row in rows.iter_mut() {
                if row.checkpoint == MAX_CHECKPOINT {
                    row.checkpoint = checkpoint.to_string();
                }
            }
        }
        Ok(())
    }

    async fn revert(&mut self, checkpoint: &str) -> EngineResult<u64> {
        let mut restored = 0u64;
        let tables: Vec<String> = self.schema.tables.iter().map(|t| t.name.clone()).collect();
        for table in tables {
            let table_schema = self.table_schema(&table)?;
            let rows = self.working.shadow.entry(table.clone()).or_default();
            let mut above: Vec<ShadowRow> = Vec::new();
            rows.retain_mut(|row| {
                if row.checkpoint.as_str() > checkpoint {
                    above.push(row.clone());
                    false
                } else {
                    true
                }
            });

            // Earliest captured operation per key is the authoritative
            // pre-checkpoint image; later ones hold intermediate state.
            let mut earliest: BTreeMap<String, ShadowRow> = BTreeMap::new();
            for shadow_row in above {
                let key = schema::primary_key_string(&table_schema, &shadow_row.row)?;
                match earliest.get(&key) {
                    Some(existing) if existing.operation_id <= shadow_row.operation_id => {}
                    _ => {
                        earliest.insert(key, shadow_row);
                    }
                }
            }

            for (_, shadow_row) in earliest {
                restored += 1;
                if shadow_row.operation == schema::OP_INSERT {
                    self.delete_row(&table, &shadow_row.row)?;
                } else {
                    self.upsert_row(&table, shadow_row.row)?;
                }
            }
        }
        Ok(restored)
    }

    async fn finalize(&mut self, checkpoint: &str) -> EngineResult<u64> {
        let mut pruned = 0u64;
        for rows in self.working.shadow.values_mut() {
            let before = rows.len();
            rows.retain(|row| row.checkpoint.as_str() > checkpoint);
            pruned += (before - rows.len()) as u64;
        }
        Ok(pruned)
    }

    async fn drop_triggers(&mut self) -> EngineResult<()> {
        self.working.triggers_enabled = false;
        Ok(())
    }

    async fn recreate_triggers(&mut self) -> EngineResult<()> {
        self.working.triggers_enabled = true;
        Ok(())
    }

    async fn set_checkpoints(
        &mut self,
        safe: Option<&str>,
        latest: Option<&str>,
    ) -> EngineResult<()> {
        if let Some(safe) = safe {
            self.working.safe = safe.to_string();
        }
        if let Some(latest) = latest {
            self.working.latest = latest.to_string();
        }
        Ok(())
    }

    async fn commit(self) -> EngineResult<()> {
        *self.shared.lock().expect("mem store lock poisoned") = self.working;
        Ok(())
    }

    async fn rollback(self) -> EngineResult<()> {
        Ok(())
    }
}

// ============================================================================
// Scripted sync source, handlers, harness
// ============================================================================

struct ScriptedSource {
    chain_id: u64,
    updates: StdMutex<Vec<SourceUpdate>>,
}

impl ScriptedSource {
    fn new(chain_id: u64, updates: Vec<SourceUpdate>) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            updates: StdMutex::new(updates),
        })
    }
}

#[async_trait]
impl SyncSource for ScriptedSource {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn chain_name(&self) -> String {
        format!("test-{}", self.chain_id)
    }

    async fn subscribe(&self) -> EngineResult<mpsc::Receiver<SourceUpdate>> {
        let updates = std::mem::take(&mut *self.updates.lock().expect("script lock poisoned"));
        let (tx, rx) = mpsc::channel(updates.len().max(1));
        tokio::spawn(async move {
            for update in updates {
                if tx.send(update).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

struct NullTransport;

#[async_trait]
impl RpcTransport for NullTransport {
    async fn request(
        &self,
        _chain_id: u64,
        _method: &str,
        _params: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

/// Inserts {id: <log data>, v: 1} for every matched transfer log.
struct TransferHandler;

#[async_trait]
impl EventHandler<MemTx> for TransferHandler {
    async fn call(&self, event: &Event, ctx: &mut Context<'_, MemTx>) -> EngineResult<()> {
        if let EventData::Log { log, .. } = &event.data {
            let mut row = Row::new();
            row.insert("id".to_string(), json!(log.data.clone()));
            row.insert("v".to_string(), json!(1));
            ctx.db.insert("transfers", row).await?;
        }
        Ok(())
    }
}

/// Upserts a per-id counter, exercising read-your-writes in both modes.
struct CountingHandler;

#[async_trait]
impl EventHandler<MemTx> for CountingHandler {
    async fn call(&self, event: &Event, ctx: &mut Context<'_, MemTx>) -> EngineResult<()> {
        if let EventData::Log { log, .. } = &event.data {
            let mut key = Row::new();
            key.insert("id".to_string(), json!(log.data.clone()));
            let current = ctx
                .db
                .find("transfers", &key)
                .await?
                .and_then(|row| row.get("v").and_then(|v| v.as_i64()))
                .unwrap_or(0);
            let mut row = Row::new();
            row.insert("id".to_string(), json!(log.data.clone()));
            row.insert("v".to_string(), json!(current + 1));
            ctx.db.upsert("transfers", &key, row).await?;
        }
        Ok(())
    }
}

/// Records invocation labels in delivery order.
struct Recorder {
    log: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler<MemTx> for Recorder {
    async fn call(&self, event: &Event, _ctx: &mut Context<'_, MemTx>) -> EngineResult<()> {
        let label = match &event.data {
            EventData::Setup => format!("setup:{}", event.name),
            EventData::Block { block } => format!("chain{}@{}", event.chain_id, block.timestamp),
            _ => event.name.clone(),
        };
        self.log.lock().expect("recorder lock poisoned").push(label);
        Ok(())
    }
}

fn transfers_schema() -> Arc<CompiledSchema> {
    Arc::new(
        CompiledSchema::new(
            "test-build",
            vec![TableSchema {
                name: "transfers".to_string(),
                columns: vec![
                    Column {
                        name: "id".to_string(),
                        column_type: ColumnType::Text,
                        nullable: false,
                    },
                    Column {
                        name: "v".to_string(),
                        column_type: ColumnType::Bigint,
                        nullable: false,
                    },
                ],
                primary_key: vec!["id".to_string()],
            }],
        )
        .unwrap(),
    )
}

fn contract_source(chain_id: u64) -> Source {
    Source::Contract {
        name: "Token".to_string(),
        chain_id,
        address: AddressFilter::Static {
            addresses: vec![WATCHED_ADDRESS.to_string()],
        },
        events: vec![EventSelector {
            name: "Transfer".to_string(),
            topic0: TRANSFER_TOPIC.to_string(),
        }],
    }
}

fn block_source(chain_id: u64) -> Source {
    Source::Block {
        name: format!("Watch{}", chain_id),
        chain_id,
        interval: 1,
    }
}

fn raw_block(number: u64, hash: &str, parent: &str, timestamp: u64) -> RawBlock {
    RawBlock {
        number,
        hash: hash.to_string(),
        parent_hash: parent.to_string(),
        timestamp,
        extra: serde_json::Value::Null,
    }
}

/// A block bundle with one transfer log whose data field is the row id.
fn transfer_block(
    chain_id: u64,
    number: u64,
    hash: &str,
    parent: &str,
    timestamp: u64,
    id: &str,
) -> SourceUpdate {
    SourceUpdate::Block(RawBlockBundle {
        chain_id,
        block: raw_block(number, hash, parent, timestamp),
        logs: vec![RawLog {
            address: WATCHED_ADDRESS.to_string(),
            topics: vec![TRANSFER_TOPIC.to_string()],
            data: id.to_string(),
            log_index: 0,
            transaction_index: 0,
            transaction_hash: format!("0xtx{}", number),
        }],
        transactions: vec![],
        transaction_receipts: vec![],
        traces: vec![],
    })
}

fn empty_block(chain_id: u64, number: u64, hash: &str, parent: &str, timestamp: u64) -> SourceUpdate {
    SourceUpdate::Block(RawBlockBundle {
        chain_id,
        block: raw_block(number, hash, parent, timestamp),
        logs: vec![],
        transactions: vec![],
        transaction_receipts: vec![],
        traces: vec![],
    })
}

struct Harness {
    store: MemStore,
    engine: Engine<MemStore>,
    adapters: JoinSet<EngineResult<()>>,
    shutdown: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
fn harness(
    store: MemStore,
    policy: OrderingPolicy,
    initial_mode: IndexingMode,
    sources: Vec<Source>,
    sync_sources: Vec<Arc<dyn SyncSource>>,
    finality_depth: u64,
    handlers: HandlerRegistry<dyn EventHandler<MemTx>>,
) -> Harness {
    let schema = Arc::clone(&store.schema);
    let shutdown = CancellationToken::new();
    let mut merger = EventMerger::new(policy, shutdown.clone());
    let children = Arc::new(ChildAddresses::new());

    let chains: HashMap<u64, ChainInfo> = sync_sources
        .iter()
        .map(|source| {
            (
                source.chain_id(),
                ChainInfo {
                    id: source.chain_id(),
                    name: source.chain_name(),
                },
            )
        })
        .collect();
    let overrides: HashMap<u64, u64> = chains.keys().map(|id| (*id, finality_depth)).collect();

    let config = ExecutorConfig {
        batch_size: 4,
        ..ExecutorConfig::default()
    };
    let adapters = spawn_adapters(
        sync_sources,
        &sources,
        &children,
        &mut merger,
        config.batch_size,
        &overrides,
        &shutdown,
    );

    let client = Arc::new(
        ReadonlyClient::new(Arc::new(NullTransport), ClientConfig::default()).unwrap(),
    );
    let engine = Engine::new(EngineParts {
        store: store.clone(),
        schema,
        merger,
        handlers,
        client,
        contracts: HashMap::new(),
        chains,
        children,
        config,
        shutdown: shutdown.clone(),
        initial_mode,
    });

    Harness {
        store,
        engine,
        adapters,
        shutdown,
    }
}

fn transfer_registry() -> HandlerRegistry<dyn EventHandler<MemTx>> {
    let mut registry: HandlerRegistry<dyn EventHandler<MemTx>> = HandlerRegistry::new();
    registry.register("Token:Transfer", Arc::new(TransferHandler));
    registry
}

/// Run the engine to stream end, then surface the first adapter error.
async fn run_to_end(harness: Harness) -> (MemStore, EngineResult<()>) {
    let Harness {
        store,
        engine,
        mut adapters,
        shutdown: _shutdown,
    } = harness;

    let engine_result = engine.run().await;
    let mut adapter_result = Ok(());
    while let Some(joined) = adapters.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                adapter_result = Err(err);
                break;
            }
            Err(join_err) => {
                adapter_result = Err(EngineError::engine(format!("join: {}", join_err)));
                break;
            }
        }
    }
    (store, engine_result.and(adapter_result))
}

// ============================================================================
// Scenarios
// ============================================================================

/// Shallow reorg on a single chain: blocks A-D insert a..d, then a branch
/// X,Y off B replaces c,d with x,y. After finalizing Y the shadow tables
/// hold nothing at or below Y, and nothing was captured during the revert.
#[tokio::test]
async fn test_shallow_reorg_replaces_orphaned_rows() {
    let store = MemStore::new(transfers_schema());
    let updates = vec![
        transfer_block(1, 1, "0xaa", "0x00", 10, "a"),
        transfer_block(1, 2, "0xbb", "0xaa", 20, "b"),
        transfer_block(1, 3, "0xcc", "0xbb", 30, "c"),
        transfer_block(1, 4, "0xdd", "0xcc", 40, "d"),
        transfer_block(1, 3, "0xee", "0xbb", 50, "x"),
        transfer_block(1, 4, "0xff", "0xee", 60, "y"),
        SourceUpdate::Finalize(raw_block(4, "0xff", "0xee", 60)),
    ];
    let harness = harness(
        store,
        OrderingPolicy::Omnichain,
        IndexingMode::Historical,
        vec![contract_source(1)],
        vec![ScriptedSource::new(1, updates)],
        10,
        transfer_registry(),
    );

    let (store, result) = run_to_end(harness).await;
    result.unwrap();

    let mut ids = store.ids("transfers");
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "x", "y"]);

    let shadow = store.all_shadow("transfers");
    let b_boundary = checkpoint::block_boundary(20, 1, 2).unwrap();
    assert_eq!(
        shadow
            .iter()
            .filter(|row| row.checkpoint.as_str() <= b_boundary.as_str())
            .count(),
        0,
        "finalize left shadow rows at or below block B"
    );
    assert_eq!(
        shadow
            .iter()
            .filter(|row| row.checkpoint == MAX_CHECKPOINT)
            .count(),
        0,
        "revert ran with capture triggers live"
    );

    let (safe, latest) = store.stored_checkpoints();
    let y_boundary = checkpoint::block_boundary(60, 1, 4).unwrap();
    assert_eq!(safe, y_boundary);
    // Latest tracks the last processed event, which sits inside block Y
    // and therefore below the block's finalize boundary.
    let y_event = checkpoint::encode(&checkpoint::CheckpointFields {
        block_timestamp: 60,
        chain_id: 1,
        block_number: 4,
        transaction_index: 0,
        event_type: checkpoint::EventType::Log,
        event_index: 0,
    })
    .unwrap();
    assert_eq!(latest, y_event);
}

/// A branch rooted below the unfinalized ring cannot be reconciled: the
/// run fails unrecoverably with the deep-reorg exit code and the indexed
/// rows stay untouched.
#[tokio::test]
async fn test_deep_reorg_rejected_without_mutation() {
    let store = MemStore::new(transfers_schema());
    let updates = vec![
        transfer_block(1, 1, "0xaa", "0x00", 10, "a"),
        transfer_block(1, 2, "0xbb", "0xaa", 20, "b"),
        transfer_block(1, 3, "0xcc", "0xbb", 30, "c"),
        transfer_block(1, 4, "0xdd", "0xcc", 40, "d"),
        // Ring (depth 2) now holds blocks 3 and 4; this branches off 1.
        transfer_block(1, 2, "0xee", "0xaa", 50, "z"),
    ];
    let harness = harness(
        store,
        OrderingPolicy::Omnichain,
        IndexingMode::Historical,
        vec![contract_source(1)],
        vec![ScriptedSource::new(1, updates)],
        2,
        transfer_registry(),
    );

    let (store, result) = run_to_end(harness).await;
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unrecoverable);
    assert!(err.is_deep_reorg());
    assert_eq!(err.exit_code(), 75);

    let mut ids = store.ids("transfers");
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c", "d"], "user tables were mutated");
}

/// Omnichain delivery across two chains follows global checkpoint order,
/// and every setup handler runs exactly once before any real event of its
/// chain.
#[tokio::test]
async fn test_omnichain_ordering_and_setup() {
    let store = MemStore::new(transfers_schema());
    let log = Arc::new(StdMutex::new(Vec::new()));

    let mut registry: HandlerRegistry<dyn EventHandler<MemTx>> = HandlerRegistry::new();
    for name in ["Watch1:block", "Watch1:setup", "Watch2:block", "Watch2:setup"] {
        registry.register(
            name,
            Arc::new(Recorder {
                log: Arc::clone(&log),
            }),
        );
    }

    let chain1 = vec![
        empty_block(1, 1, "0x1a", "0x00", 10),
        empty_block(1, 2, "0x1b", "0x1a", 11),
    ];
    let chain2 = vec![
        empty_block(2, 1, "0x2a", "0x00", 9),
        // Push chain2's frontier past chain1's last event.
        empty_block(2, 2, "0x2b", "0x2a", 12),
    ];
    let harness = harness(
        store,
        OrderingPolicy::Omnichain,
        IndexingMode::Historical,
        vec![block_source(1), block_source(2)],
        vec![
            ScriptedSource::new(1, chain1),
            ScriptedSource::new(2, chain2),
        ],
        10,
        registry,
    );

    let (_store, result) = run_to_end(harness).await;
    result.unwrap();

    let recorded = log.lock().unwrap().clone();
    let setups: Vec<&String> = recorded.iter().filter(|l| l.starts_with("setup:")).collect();
    assert_eq!(setups.len(), 2, "each setup handler runs exactly once");

    let real: Vec<&String> = recorded.iter().filter(|l| !l.starts_with("setup:")).collect();
    assert_eq!(
        real,
        vec!["chain2@9", "chain1@10", "chain1@11", "chain2@12"],
        "events must follow global checkpoint order"
    );

    // Setups precede every real event.
    let first_real = recorded.iter().position(|l| !l.starts_with("setup:")).unwrap();
    assert!(recorded[..first_real].iter().all(|l| l.starts_with("setup:")));
}

/// An unclean shutdown leaves latest ahead of safe; on restart the engine
/// reverts to the safe checkpoint before consuming events, and resuming
/// the stream converges to the uninterrupted result.
#[tokio::test]
async fn test_crash_recovery_reverts_then_resumes() {
    let schema = transfers_schema();
    let store = MemStore::new(Arc::clone(&schema));
    store.migrate().await.unwrap();
    store.create_reorg_runtime().await.unwrap();

    let cp_a = checkpoint::block_boundary(10, 1, 1).unwrap();
    let cp_b = checkpoint::block_boundary(20, 1, 2).unwrap();

    // Committed and finalized: row a.
    let mut tx = store.begin(IndexingMode::Historical).await.unwrap();
    let mut row_a = Row::new();
    row_a.insert("id".to_string(), json!("a"));
    row_a.insert("v".to_string(), json!(1));
    tx.insert("transfers", row_a).await.unwrap();
    tx.stamp(&cp_a).await.unwrap();
    tx.set_checkpoints(None, Some(&cp_a)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin(IndexingMode::Historical).await.unwrap();
    tx.finalize(&cp_a).await.unwrap();
    tx.set_checkpoints(Some(&cp_a), None).await.unwrap();
    tx.commit().await.unwrap();

    // Committed but NOT finalized: row b. Then the process "dies".
    let mut tx = store.begin(IndexingMode::Historical).await.unwrap();
    let mut row_b = Row::new();
    row_b.insert("id".to_string(), json!("b"));
    row_b.insert("v".to_string(), json!(1));
    tx.insert("transfers", row_b).await.unwrap();
    tx.stamp(&cp_b).await.unwrap();
    tx.set_checkpoints(None, Some(&cp_b)).await.unwrap();
    tx.commit().await.unwrap();

    let (safe, latest) = store.stored_checkpoints();
    assert!(latest.as_str() > safe.as_str());

    // Restart with an empty stream: recovery must rewind to safe.
    let harness = harness(
        store.clone(),
        OrderingPolicy::Omnichain,
        IndexingMode::Historical,
        vec![contract_source(1)],
        vec![ScriptedSource::new(1, vec![])],
        10,
        transfer_registry(),
    );
    let (store, result) = run_to_end(harness).await;
    result.unwrap();

    assert_eq!(store.ids("transfers"), vec!["a"]);
    let (safe, latest) = store.stored_checkpoints();
    assert_eq!(safe, cp_a);
    assert_eq!(latest, cp_a);

    // Resume the stream from block 2; the final state matches the run
    // that never crashed.
    let harness = harness(
        store.clone(),
        OrderingPolicy::Omnichain,
        IndexingMode::Historical,
        vec![contract_source(1)],
        vec![ScriptedSource::new(
            1,
            vec![transfer_block(1, 2, "0xbb", "0xaa", 20, "b")],
        )],
        10,
        transfer_registry(),
    );
    let (store, result) = run_to_end(harness).await;
    result.unwrap();

    let mut ids = store.ids("transfers");
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
}

/// The write buffer is observationally equivalent to direct writes:
/// historical and realtime processing of the same stream end in
/// bit-identical user tables.
#[tokio::test]
async fn test_historical_and_realtime_modes_agree() {
    let updates = || {
        vec![
            transfer_block(1, 1, "0xaa", "0x00", 10, "acct-1"),
            // Same id twice in a row exercises read-your-writes in the
            // buffered path and sequential transactions in realtime.
            transfer_block(1, 2, "0xbb", "0xaa", 20, "acct-1"),
            transfer_block(1, 3, "0xcc", "0xbb", 30, "acct-2"),
            transfer_block(1, 4, "0xdd", "0xcc", 40, "acct-1"),
        ]
    };
    let mut results = Vec::new();
    for mode in [IndexingMode::Historical, IndexingMode::Realtime] {
        let store = MemStore::new(transfers_schema());
        let mut registry: HandlerRegistry<dyn EventHandler<MemTx>> = HandlerRegistry::new();
        registry.register("Token:Transfer", Arc::new(CountingHandler));
        let harness = harness(
            store,
            OrderingPolicy::Omnichain,
            mode,
            vec![contract_source(1)],
            vec![ScriptedSource::new(1, updates())],
            10,
            registry,
        );
        let (store, result) = run_to_end(harness).await;
        result.unwrap();
        results.push(store.rows("transfers"));
    }

    assert_eq!(results[0], results[1]);
    let acct1 = results[0].values().find(|row| row["id"] == json!("acct-1")).unwrap();
    assert_eq!(acct1["v"], json!(3));
    let acct2 = results[0].values().find(|row| row["id"] == json!("acct-2")).unwrap();
    assert_eq!(acct2["v"], json!(1));
}

/// A reorg during realtime processing reverts precisely to the reorg
/// point (realtime stamps are per event) and the replacement branch's
/// rows land.
#[tokio::test]
async fn test_realtime_reorg_revert() {
    let store = MemStore::new(transfers_schema());
    let updates = vec![
        transfer_block(1, 1, "0xaa", "0x00", 10, "a"),
        transfer_block(1, 2, "0xbb", "0xaa", 20, "b"),
        transfer_block(1, 3, "0xcc", "0xbb", 30, "c"),
        transfer_block(1, 3, "0xee", "0xbb", 35, "x"),
    ];
    let harness = harness(
        store,
        OrderingPolicy::Omnichain,
        IndexingMode::Realtime,
        vec![contract_source(1)],
        vec![ScriptedSource::new(1, updates)],
        10,
        transfer_registry(),
    );
    let (store, result) = run_to_end(harness).await;
    result.unwrap();

    let mut ids = store.ids("transfers");
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "x"]);
}

/// Factory children discovered before a reorg and removed by it stop
/// matching afterwards.
#[tokio::test]
async fn test_reorged_factory_children_are_forgotten() {
    let factory_topic = "0x0d3648bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9";
    let child = format!("0x{}", "c".repeat(40));
    let child_topic = format!("0x{}{}", "0".repeat(24), "c".repeat(40));

    let source = Source::Contract {
        name: "Token".to_string(),
        chain_id: 1,
        address: AddressFilter::Factory {
            address: "0xfac0".to_string(),
            event_selector: factory_topic.to_string(),
            child_topic_index: 1,
        },
        events: vec![EventSelector {
            name: "Transfer".to_string(),
            topic0: TRANSFER_TOPIC.to_string(),
        }],
    };

    // Block 2 creates the child and it emits a transfer; the branch block
    // 2' does neither, and block 3' emits from the (now unknown) child.
    let discovery_block = SourceUpdate::Block(RawBlockBundle {
        chain_id: 1,
        block: raw_block(2, "0xbb", "0xaa", 20),
        logs: vec![
            RawLog {
                address: "0xfac0".to_string(),
                topics: vec![factory_topic.to_string(), child_topic.clone()],
                data: String::new(),
                log_index: 0,
                transaction_index: 0,
                transaction_hash: "0xt1".to_string(),
            },
            RawLog {
                address: child.clone(),
                topics: vec![TRANSFER_TOPIC.to_string()],
                data: "from-child".to_string(),
                log_index: 1,
                transaction_index: 0,
                transaction_hash: "0xt1".to_string(),
            },
        ],
        transactions: vec![],
        transaction_receipts: vec![],
        traces: vec![],
    });
    let orphan_emission = SourceUpdate::Block(RawBlockBundle {
        chain_id: 1,
        block: raw_block(3, "0xdd", "0xcc", 40),
        logs: vec![RawLog {
            address: child.clone(),
            topics: vec![TRANSFER_TOPIC.to_string()],
            data: "after-reorg".to_string(),
            log_index: 0,
            transaction_index: 0,
            transaction_hash: "0xt2".to_string(),
        }],
        transactions: vec![],
        transaction_receipts: vec![],
        traces: vec![],
    });

    let store = MemStore::new(transfers_schema());
    let updates = vec![
        empty_block(1, 1, "0xaa", "0x00", 10),
        discovery_block,
        SourceUpdate::Block(RawBlockBundle {
            chain_id: 1,
            block: raw_block(2, "0xcc", "0xaa", 25),
            logs: vec![],
            transactions: vec![],
            transaction_receipts: vec![],
            traces: vec![],
        }),
        orphan_emission,
    ];
    let harness = harness(
        store,
        OrderingPolicy::Omnichain,
        IndexingMode::Historical,
        vec![source],
        vec![ScriptedSource::new(1, updates)],
        10,
        transfer_registry(),
    );
    let (store, result) = run_to_end(harness).await;
    result.unwrap();

    // The discovery-block transfer was reverted with its block, and the
    // forgotten child's later emission never matched.
    assert!(store.ids("transfers").is_empty());
}

/// Cancellation mid-stream is a clean shutdown: no error, shadow runtime
/// dropped, and whatever was committed stays committed.
#[tokio::test]
async fn test_cancellation_is_clean() {
    let store = MemStore::new(transfers_schema());
    let harness = harness(
        store,
        OrderingPolicy::Omnichain,
        IndexingMode::Historical,
        vec![contract_source(1)],
        vec![ScriptedSource::new(
            1,
            vec![transfer_block(1, 1, "0xaa", "0x00", 10, "a")],
        )],
        10,
        transfer_registry(),
    );
    harness.shutdown.cancel();
    let (_store, result) = run_to_end(harness).await;
    result.unwrap();
}
