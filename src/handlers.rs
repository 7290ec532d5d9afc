/// Handler Registry & User Context
///
/// User indexing functions are registered by handler key ("ERC20:Transfer")
/// and dispatched per event. Each invocation receives a context built from
/// borrows that live exactly as long as the call: the chain descriptor, the
/// readonly client, the declared contracts, and a `Db` accessor.
///
/// The `Db` accessor is the one user-visible store abstraction shared by
/// both executor modes. In historical mode it fronts the write buffer with
/// read-through to the open transaction; in realtime mode it writes straight
/// through. Handlers cannot tell the difference, which is what makes the two
/// modes produce identical final states.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::ReadonlyClient;
use crate::errors::{EngineError, EngineResult};
use crate::schema::CompiledSchema;
use crate::store::StoreTransaction;
use crate::types::{Event, Row};
use crate::write_buffer::{BufferState, WriteBuffer};

#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub id: u64,
    pub name: String,
}

/// Declared contract metadata exposed to handlers.
#[derive(Debug, Clone)]
pub struct ContractInfo {
    pub abi: Value,
    pub address: Option<String>,
    pub factory: Option<String>,
}

/// A user indexing function. Generic over the store-transaction type so the
/// registry stays object-safe; handlers are normally implemented for all
/// `T: StoreTransaction` and never notice.
#[async_trait]
pub trait EventHandler<T: StoreTransaction>: Send + Sync {
    async fn call(&self, event: &Event, ctx: &mut Context<'_, T>) -> EngineResult<()>;
}

/// Name-keyed handler registry with O(1) dispatch.
pub struct HandlerRegistry<H: ?Sized> {
    handlers: HashMap<String, Arc<H>>,
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<H>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.get(name).map(Arc::clone)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Per-event context. Constructed from non-owning handles valid for a
/// single handler invocation; nothing in here is shared mutable state.
pub struct Context<'a, T: StoreTransaction> {
    pub chain: ChainInfo,
    pub client: &'a ReadonlyClient,
    pub contracts: &'a HashMap<String, ContractInfo>,
    pub db: Db<'a, T>,
}

/// CRUD surface over the compiled schema.
pub enum Db<'a, T: StoreTransaction> {
    /// Historical mode: staged writes with read-through.
    Buffered {
        schema: &'a CompiledSchema,
        buffer: &'a mut WriteBuffer,
        tx: &'a mut T,
    },
    /// Realtime mode: direct writes, triggers fire naturally.
    Direct {
        schema: &'a CompiledSchema,
        tx: &'a mut T,
    },
}

impl<'a, T: StoreTransaction> Db<'a, T> {
    fn schema(&self) -> &CompiledSchema {
        match self {
            Db::Buffered { schema, .. } => schema,
            Db::Direct { schema, .. } => schema,
        }
    }

    pub async fn find(&mut self, table: &str, key: &Row) -> EngineResult<Option<Row>> {
        let table_schema = self.schema().require_table(table)?.clone();
        match self {
            Db::Buffered { buffer, tx, .. } => match buffer.state(&table_schema, key)? {
                BufferState::Present(row) => Ok(Some(row)),
                BufferState::Deleted => Ok(None),
                BufferState::Unknown => tx.find(table, key).await,
            },
            Db::Direct { tx, .. } => tx.find(table, key).await,
        }
    }

    pub async fn insert(&mut self, table: &str, row: Row) -> EngineResult<()> {
        let table_schema = self.schema().require_table(table)?.clone();
        match self {
            Db::Buffered { buffer, .. } => buffer.insert(&table_schema, row),
            Db::Direct { tx, .. } => tx.insert(table, row).await,
        }
    }

    /// Merge a partial patch over the current row; the row must exist.
    pub async fn update(&mut self, table: &str, key: &Row, patch: Row) -> EngineResult<()> {
        let current = self.find(table, key).await?.ok_or_else(|| {
            EngineError::user(format!("record not found: cannot update row in '{}'", table))
        })?;
        let mut merged = current;
        for (column, value) in patch {
            merged.insert(column, value);
        }
        let table_schema = self.schema().require_table(table)?.clone();
        match self {
            Db::Buffered { buffer, .. } => buffer.update(&table_schema, merged),
            Db::Direct { tx, .. } => tx.update(table, merged).await,
        }
    }

    /// Insert the row, or merge it over the existing one.
    pub async fn upsert(&mut self, table: &str, key: &Row, row: Row) -> EngineResult<()> {
        match self.find(table, key).await? {
            Some(_) => self.update(table, key, row).await,
            None => self.insert(table, row).await,
        }
    }

    /// Returns whether a row existed.
    pub async fn delete(&mut self, table: &str, key: &Row) -> EngineResult<bool> {
        let table_schema = self.schema().require_table(table)?.clone();
        match self {
            Db::Buffered { buffer, tx, .. } => {
                let existed = match buffer.state(&table_schema, key)? {
                    BufferState::Present(_) => true,
                    BufferState::Deleted => false,
                    BufferState::Unknown => tx.find(table, key).await?.is_some(),
                };
                if existed {
                    buffer.delete(&table_schema, key)?;
                }
                Ok(existed)
            }
            Db::Direct { tx, .. } => tx.delete(table, key).await,
        }
    }
}
