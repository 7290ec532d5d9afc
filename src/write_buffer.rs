/// Write Buffer
///
/// Historical mode stages user-table writes in memory keyed by (table,
/// primary key) and flushes them once per batch, so thousands of handler
/// invocations cost a handful of bulk statements instead of one round trip
/// each. The buffer must be observationally equivalent to writing through:
/// read-your-writes inside the batch, last-write-wins per key, and a flush
/// order of inserts, then upserts, then deletes per table.
///
/// Coalescing per key:
///   insert over nothing            -> insert
///   insert over delete             -> upsert (the row still exists in T)
///   insert over insert/update      -> unique violation (user error)
///   update over insert             -> insert with the merged row
///   update over update             -> update with the merged row
///   update over delete             -> record-not-found (user error)
///   delete over insert             -> entry removed entirely
///   delete over update or nothing  -> delete
///
/// Only the earliest fate of a key matters to the database; everything in
/// between stays in memory.

use std::collections::HashMap;

use crate::errors::{EngineError, EngineResult};
use crate::schema::{self, CompiledSchema, TableSchema};
use crate::types::Row;

#[derive(Debug, Clone, PartialEq)]
pub enum BufferedOp {
    Insert(Row),
    Update(Row),
    Delete(Row),
}

/// What the buffer knows about a key, for read-your-writes.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferState {
    Present(Row),
    Deleted,
    Unknown,
}

/// One table's flush work, already in dependency order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableFlush {
    pub table: String,
    pub inserts: Vec<Row>,
    pub upserts: Vec<Row>,
    pub deletes: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushPlan {
    pub tables: Vec<TableFlush>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| {
            t.inserts.is_empty() && t.upserts.is_empty() && t.deletes.is_empty()
        })
    }

    pub fn operation_count(&self) -> usize {
        self.tables
            .iter()
            .map(|t| t.inserts.len() + t.upserts.len() + t.deletes.len())
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct WriteBuffer {
    entries: HashMap<(String, String), BufferedOp>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, table: &TableSchema, key_row: &Row) -> EngineResult<BufferState> {
        let key = schema::primary_key_string(table, key_row)?;
        Ok(match self.entries.get(&(table.name.clone(), key)) {
            Some(BufferedOp::Insert(row)) | Some(BufferedOp::Update(row)) => {
                BufferState::Present(row.clone())
            }
            Some(BufferedOp::Delete(_)) => BufferState::Deleted,
            None => BufferState::Unknown,
        })
    }

    pub fn insert(&mut self, table: &TableSchema, row: Row) -> EngineResult<()> {
        let key = schema::primary_key_string(table, &row)?;
        let slot = (table.name.clone(), key);
        match self.entries.get(&slot) {
            Some(BufferedOp::Insert(_)) | Some(BufferedOp::Update(_)) => {
                Err(EngineError::user(format!(
                    "unique violation: row already exists in '{}'",
                    table.name
                )))
            }
            Some(BufferedOp::Delete(_)) => {
                // The base table still holds the old row; re-creating the key
                // inside the same batch flushes as an upsert.
                self.entries.insert(slot, BufferedOp::Update(row));
                Ok(())
            }
            None => {
                self.entries.insert(slot, BufferedOp::Insert(row));
                Ok(())
            }
        }
    }

    /// Record the full post-update row for a key known to exist (either in
    /// the buffer or, per the caller's read-through, in the base table).
    pub fn update(&mut self, table: &TableSchema, row: Row) -> EngineResult<()> {
        let key = schema::primary_key_string(table, &row)?;
        let slot = (table.name.clone(), key);
        match self.entries.get(&slot) {
            Some(BufferedOp::Insert(_)) => {
                self.entries.insert(slot, BufferedOp::Insert(row));
                Ok(())
            }
            Some(BufferedOp::Delete(_)) => Err(EngineError::user(format!(
                "record not found: cannot update deleted row in '{}'",
                table.name
            ))),
            _ => {
                self.entries.insert(slot, BufferedOp::Update(row));
                Ok(())
            }
        }
    }

    pub fn delete(&mut self, table: &TableSchema, key_row: &Row) -> EngineResult<()> {
        let key = schema::primary_key_string(table, key_row)?;
        let slot = (table.name.clone(), key);
        match self.entries.get(&slot) {
            // Insert then delete inside one batch never reaches the database.
            Some(BufferedOp::Insert(_)) => {
                self.entries.remove(&slot);
                Ok(())
            }
            _ => {
                let pk = schema::primary_key_row(table, key_row)?;
                self.entries.insert(slot, BufferedOp::Delete(pk));
                Ok(())
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drain into a flush plan. Tables come out in schema order so flushes
    /// are deterministic; per table the order is inserts, upserts, deletes.
    pub fn into_flush_plan(mut self, schema: &CompiledSchema) -> FlushPlan {
        let mut plan = FlushPlan::default();
        for table in &schema.tables {
            let mut flush = TableFlush {
                table: table.name.clone(),
                ..Default::default()
            };
            let mut keys: Vec<(String, String)> = self
                .entries
                .keys()
                .filter(|(t, _)| t == &table.name)
                .cloned()
                .collect();
            // Deterministic statement order within a table
            keys.sort();
            for slot in keys {
                match self.entries.remove(&slot) {
                    Some(BufferedOp::Insert(row)) => flush.inserts.push(row),
                    Some(BufferedOp::Update(row)) => flush.upserts.push(row),
                    Some(BufferedOp::Delete(key)) => flush.deletes.push(key),
                    None => {}
                }
            }
            if !(flush.inserts.is_empty() && flush.upserts.is_empty() && flush.deletes.is_empty()) {
                plan.tables.push(flush);
            }
        }
        plan
    }
}
