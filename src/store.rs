/// Reorg-Tracking Store
///
/// The durable half of the engine. User tables are plain Postgres tables;
/// next to each one lives a `_reorg_*` shadow table populated by row
/// triggers, which is what makes `revert(checkpoint)` a single atomic
/// statement instead of a replay.
///
/// Capture uses MAX_CHECKPOINT on purpose: a shadow row written by a trigger
/// compares greater than every real checkpoint until the batch-end stamp
/// rewrites it, so `WHERE checkpoint > $1` in the revert can never race the
/// triggers.
///
/// The store sits behind a small trait seam (`StateStore` /
/// `StoreTransaction`) shared by the Postgres implementation and the
/// in-memory one the end-to-end tests run against.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::ConnectOptions;
use sqlx::Row as _;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, info};

use crate::checkpoint::ZERO_CHECKPOINT;
use crate::errors::{EngineError, EngineResult};
use crate::metrics;
use crate::schema::{
    self, Column, ColumnType, CompiledSchema, TableSchema, CHECKPOINT_TABLE, META_TABLE,
};
use crate::types::Row;
use crate::write_buffer::FlushPlan;

/// How the executor is driving the store right now. Historical batches may
/// hold a transaction for much longer than realtime single events, so the
/// ceilings differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingMode {
    Historical,
    Realtime,
}

impl IndexingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingMode::Historical => "historical",
            IndexingMode::Realtime => "realtime",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoints {
    pub safe_checkpoint: String,
    pub latest_checkpoint: String,
}

/// The seam the executor drives. One implementation talks Postgres; the
/// test suite supplies an in-memory one with the same shadow semantics.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    type Tx: StoreTransaction;

    /// Create user tables and engine bookkeeping, enforce the build-id
    /// guard, and seed the checkpoint row.
    async fn migrate(&self) -> EngineResult<()>;

    /// Create shadow tables and capture triggers.
    async fn create_reorg_runtime(&self) -> EngineResult<()>;

    /// Drop shadow tables and capture triggers (clean shutdown only).
    async fn drop_reorg_runtime(&self) -> EngineResult<()>;

    async fn checkpoints(&self) -> EngineResult<Option<StoredCheckpoints>>;

    async fn begin(&self, mode: IndexingMode) -> EngineResult<Self::Tx>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    async fn find(&mut self, table: &str, key: &Row) -> EngineResult<Option<Row>>;

    async fn insert(&mut self, table: &str, row: Row) -> EngineResult<()>;

    /// Full-row update by primary key.
    async fn update(&mut self, table: &str, row: Row) -> EngineResult<()>;

    /// Returns whether a row was deleted.
    async fn delete(&mut self, table: &str, key: &Row) -> EngineResult<bool>;

    /// Bulk-apply a write-buffer flush plan.
    async fn apply(&mut self, plan: FlushPlan) -> EngineResult<()>;

    /// Rewrite trigger-captured shadow rows to the given checkpoint.
    async fn stamp(&mut self, checkpoint: &str) -> EngineResult<()>;

    /// Restore the user tables to their state at the checkpoint. Returns
    /// restored row count. Callers must have dropped the triggers.
    async fn revert(&mut self, checkpoint: &str) -> EngineResult<u64>;

    /// Prune shadow rows at or below the checkpoint. Returns pruned count.
    async fn finalize(&mut self, checkpoint: &str) -> EngineResult<u64>;

    async fn drop_triggers(&mut self) -> EngineResult<()>;

    async fn recreate_triggers(&mut self) -> EngineResult<()>;

    async fn set_checkpoints(
        &mut self,
        safe: Option<&str>,
        latest: Option<&str>,
    ) -> EngineResult<()>;

    async fn commit(self) -> EngineResult<()>;

    async fn rollback(self) -> EngineResult<()>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresStore {
    pool: PgPool,
    schema: Arc<CompiledSchema>,
    namespace: String,
}

impl PostgresStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        schema: Arc<CompiledSchema>,
    ) -> EngineResult<Self> {
        let opts = PgConnectOptions::from_str(database_url)
            .map_err(|e| EngineError::engine(format!("invalid database url: {}", e)))?
            .log_statements(tracing::log::LevelFilter::Trace)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_millis(200));

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        Ok(Self {
            pool,
            schema,
            namespace: "default".to_string(),
        })
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    /// Manual revert used by the CLI and crash recovery: one transaction
    /// bracketing trigger drop, per-table revert and trigger recreation.
    pub async fn revert_to(&self, checkpoint: &str) -> EngineResult<u64> {
        let mut tx = self.begin(IndexingMode::Realtime).await?;
        tx.drop_triggers().await?;
        let restored = tx.revert(checkpoint).await?;
        tx.recreate_triggers().await?;
        tx.set_checkpoints(None, Some(checkpoint)).await?;
        tx.commit().await?;
        info!(checkpoint = %checkpoint, rows = restored, "reverted user tables");
        Ok(restored)
    }

    pub async fn finalize_to(&self, checkpoint: &str) -> EngineResult<u64> {
        let mut tx = self.begin(IndexingMode::Realtime).await?;
        let pruned = tx.finalize(checkpoint).await?;
        tx.set_checkpoints(Some(checkpoint), None).await?;
        tx.commit().await?;
        info!(checkpoint = %checkpoint, rows = pruned, "finalized shadow tables");
        Ok(pruned)
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    type Tx = PgStoreTransaction;

    async fn migrate(&self) -> EngineResult<()> {
        sqlx::query(&schema::create_meta_table_sql())
            .execute(&self.pool)
            .await?;
        sqlx::query(&schema::create_checkpoint_table_sql())
            .execute(&self.pool)
            .await?;

        // Build-id guard: the engine only resumes against the exact schema
        // revision that produced the persisted state.
        let existing: Option<String> = sqlx::query_scalar(&format!(
            "SELECT build_id FROM {} WHERE namespace = $1",
            schema::quote_ident(META_TABLE)
        ))
        .bind(&self.namespace)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(build_id) if build_id != self.schema.build_id => {
                return Err(EngineError::engine(format!(
                    "build id mismatch: database has '{}', engine compiled '{}' \
                     (drop the namespace or redeploy the matching build)",
                    build_id, self.schema.build_id
                )));
            }
            Some(_) => {}
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {} (namespace, build_id) VALUES ($1, $2)",
                    schema::quote_ident(META_TABLE)
                ))
                .bind(&self.namespace)
                .bind(&self.schema.build_id)
                .execute(&self.pool)
                .await?;
            }
        }

        for table in &self.schema.tables {
            sqlx::query(&schema::create_table_sql(table))
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(&format!(
            "INSERT INTO {} (namespace, safe_checkpoint, latest_checkpoint) \
             VALUES ($1, $2, $2) ON CONFLICT (namespace) DO NOTHING",
            schema::quote_ident(CHECKPOINT_TABLE)
        ))
        .bind(&self.namespace)
        .bind(ZERO_CHECKPOINT)
        .execute(&self.pool)
        .await?;

        info!(
            tables = self.schema.tables.len(),
            build_id = %self.schema.build_id,
            "schema migration complete"
        );
        Ok(())
    }

    async fn create_reorg_runtime(&self) -> EngineResult<()> {
        for table in &self.schema.tables {
            sqlx::query(&schema::create_shadow_table_sql(table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&schema::create_shadow_index_sql(table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&schema::create_trigger_function_sql(table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&schema::drop_trigger_sql(table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&schema::create_trigger_sql(table))
                .execute(&self.pool)
                .await?;
        }
        debug!("reorg runtime created");
        Ok(())
    }

    async fn drop_reorg_runtime(&self) -> EngineResult<()> {
        for table in &self.schema.tables {
            sqlx::query(&schema::drop_trigger_sql(table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&schema::drop_trigger_function_sql(table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&schema::drop_shadow_table_sql(table))
                .execute(&self.pool)
                .await?;
        }
        debug!("reorg runtime dropped");
        Ok(())
    }

    async fn checkpoints(&self) -> EngineResult<Option<StoredCheckpoints>> {
        let row = sqlx::query(&format!(
            "SELECT safe_checkpoint, latest_checkpoint FROM {} WHERE namespace = $1",
            schema::quote_ident(CHECKPOINT_TABLE)
        ))
        .bind(&self.namespace)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(StoredCheckpoints {
                safe_checkpoint: row.try_get("safe_checkpoint")?,
                latest_checkpoint: row.try_get("latest_checkpoint")?,
            }),
            None => None,
        })
    }

    async fn begin(&self, mode: IndexingMode) -> EngineResult<Self::Tx> {
        let mut tx = self.pool.begin().await?;
        // Server-side ceiling mirroring the executor's per-mode transaction
        // budget, so a wedged statement cannot outlive the batch.
        let timeout_ms = match mode {
            IndexingMode::Historical => HISTORICAL_STATEMENT_TIMEOUT_MS,
            IndexingMode::Realtime => REALTIME_STATEMENT_TIMEOUT_MS,
        };
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout_ms))
            .execute(&mut *tx)
            .await?;
        Ok(PgStoreTransaction {
            tx,
            schema: Arc::clone(&self.schema),
            namespace: self.namespace.clone(),
        })
    }
}

const HISTORICAL_STATEMENT_TIMEOUT_MS: u64 = 60_000;
const REALTIME_STATEMENT_TIMEOUT_MS: u64 = 5_000;

pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
    schema: Arc<CompiledSchema>,
    namespace: String,
}

/// A column value converted to a concrete bindable type.
#[derive(Debug, Clone)]
enum SqlValue {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Json(Option<Value>),
}

fn to_sql_value(table: &str, column: &Column, value: Option<&Value>) -> EngineResult<SqlValue> {
    let value = match value {
        None | Some(Value::Null) => {
            return Ok(match column.column_type {
                ColumnType::Text | ColumnType::Hex => SqlValue::Text(None),
                ColumnType::Bigint => SqlValue::Int(None),
                ColumnType::Double => SqlValue::Float(None),
                ColumnType::Boolean => SqlValue::Bool(None),
                ColumnType::Json => SqlValue::Json(None),
            })
        }
        Some(v) => v,
    };
    let mismatch = || {
        EngineError::user(format!(
            "column '{}.{}' expected {:?}, got {}",
            table, column.name, column.column_type, value
        ))
    };
    Ok(match column.column_type {
        ColumnType::Text | ColumnType::Hex => {
            SqlValue::Text(Some(value.as_str().ok_or_else(mismatch)?.to_string()))
        }
        ColumnType::Bigint => SqlValue::Int(Some(value.as_i64().ok_or_else(mismatch)?)),
        ColumnType::Double => SqlValue::Float(Some(value.as_f64().ok_or_else(mismatch)?)),
        ColumnType::Boolean => SqlValue::Bool(Some(value.as_bool().ok_or_else(mismatch)?)),
        ColumnType::Json => SqlValue::Json(Some(value.clone())),
    })
}

fn row_to_sql_values(table: &TableSchema, row: &Row) -> EngineResult<Vec<SqlValue>> {
    table
        .columns
        .iter()
        .map(|col| to_sql_value(&table.name, col, row.get(&col.name)))
        .collect()
}

fn key_to_sql_values(table: &TableSchema, key: &Row) -> EngineResult<Vec<SqlValue>> {
    table
        .primary_key
        .iter()
        .map(|pk| {
            let column = table.column(pk).ok_or_else(|| {
                EngineError::engine(format!("primary key column '{}' missing from schema", pk))
            })?;
            let value = key.get(pk);
            if value.is_none() || value.map(|v| v.is_null()).unwrap_or(true) {
                return Err(EngineError::user(format!(
                    "missing primary key column '{}' for table '{}'",
                    pk, table.name
                )));
            }
            to_sql_value(&table.name, column, value)
        })
        .collect()
}

fn push_sql_value<Sep: std::fmt::Display>(
    sep: &mut sqlx::query_builder::Separated<'_, '_, Postgres, Sep>,
    value: SqlValue,
) {
    match value {
        SqlValue::Text(v) => {
            sep.push_bind(v);
        }
        SqlValue::Int(v) => {
            sep.push_bind(v);
        }
        SqlValue::Float(v) => {
            sep.push_bind(v);
        }
        SqlValue::Bool(v) => {
            sep.push_bind(v);
        }
        SqlValue::Json(v) => {
            sep.push_bind(v.map(sqlx::types::Json));
        }
    }
}

fn decode_pg_row(table: &TableSchema, pg_row: &PgRow) -> EngineResult<Row> {
    let mut row = Row::new();
    for column in &table.columns {
        let name = column.name.as_str();
        let value = match column.column_type {
            ColumnType::Text | ColumnType::Hex => pg_row
                .try_get::<Option<String>, _>(name)?
                .map(Value::String),
            ColumnType::Bigint => pg_row
                .try_get::<Option<i64>, _>(name)?
                .map(|v| Value::Number(v.into())),
            ColumnType::Double => pg_row
                .try_get::<Option<f64>, _>(name)?
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            ColumnType::Boolean => pg_row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
            ColumnType::Json => pg_row
                .try_get::<Option<sqlx::types::Json<Value>>, _>(name)?
                .map(|v| v.0),
        };
        row.insert(column.name.clone(), value.unwrap_or(Value::Null));
    }
    Ok(row)
}

impl PgStoreTransaction {
    fn table(&self, name: &str) -> EngineResult<&TableSchema> {
        self.schema.require_table(name)
    }

    fn select_columns(table: &TableSchema) -> String {
        table
            .columns
            .iter()
            .map(|c| schema::quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn insert_rows(
        &mut self,
        table: &TableSchema,
        rows: &[Row],
        upsert: bool,
    ) -> EngineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        // Bulk load in bounded chunks; 100 rows of up to ~60 columns stays
        // well inside the bind-parameter limit.
        for chunk in rows.chunks(100) {
            let converted: Vec<Vec<SqlValue>> = chunk
                .iter()
                .map(|row| row_to_sql_values(table, row))
                .collect::<EngineResult<_>>()?;

            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                schema::quote_ident(&table.name),
                Self::select_columns(table)
            ));
            qb.push_values(converted, |mut b, values| {
                for value in values {
                    push_sql_value(&mut b, value);
                }
            });
            if upsert {
                let pk = table
                    .primary_key
                    .iter()
                    .map(|c| schema::quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let updates = table
                    .columns
                    .iter()
                    .filter(|c| !table.is_primary_key(&c.name))
                    .map(|c| {
                        format!(
                            "{col} = EXCLUDED.{col}",
                            col = schema::quote_ident(&c.name)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                if updates.is_empty() {
                    qb.push(format!(" ON CONFLICT ({}) DO NOTHING", pk));
                } else {
                    qb.push(format!(" ON CONFLICT ({}) DO UPDATE SET {}", pk, updates));
                }
            }
            qb.build().execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn delete_keys(&mut self, table: &TableSchema, keys: &[Row]) -> EngineResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for chunk in keys.chunks(500) {
            let converted: Vec<Vec<SqlValue>> = chunk
                .iter()
                .map(|key| key_to_sql_values(table, key))
                .collect::<EngineResult<_>>()?;

            let pk = table
                .primary_key
                .iter()
                .map(|c| schema::quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "DELETE FROM {} WHERE ({}) IN ",
                schema::quote_ident(&table.name),
                pk
            ));
            qb.push_tuples(converted, |mut b, values| {
                for value in values {
                    push_sql_value(&mut b, value);
                }
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn find(&mut self, table: &str, key: &Row) -> EngineResult<Option<Row>> {
        let table = self.table(table)?.clone();
        let converted = key_to_sql_values(&table, key)?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE ",
            Self::select_columns(&table),
            schema::quote_ident(&table.name)
        ));
        let mut sep = qb.separated(" AND ");
        for (pk, value) in table.primary_key.iter().zip(converted) {
            sep.push(format!("{} = ", schema::quote_ident(pk)));
            match value {
                SqlValue::Text(v) => sep.push_bind_unseparated(v),
                SqlValue::Int(v) => sep.push_bind_unseparated(v),
                SqlValue::Float(v) => sep.push_bind_unseparated(v),
                SqlValue::Bool(v) => sep.push_bind_unseparated(v),
                SqlValue::Json(v) => sep.push_bind_unseparated(v.map(sqlx::types::Json)),
            };
        }
        let pg_row = qb.build().fetch_optional(&mut *self.tx).await?;
        Ok(match pg_row {
            Some(pg_row) => Some(decode_pg_row(&table, &pg_row)?),
            None => None,
        })
    }

    async fn insert(&mut self, table: &str, row: Row) -> EngineResult<()> {
        let table = self.table(table)?.clone();
        self.insert_rows(&table, std::slice::from_ref(&row), false)
            .await
    }

    async fn update(&mut self, table: &str, row: Row) -> EngineResult<()> {
        let table = self.table(table)?.clone();
        self.insert_rows(&table, std::slice::from_ref(&row), true)
            .await
    }

    async fn delete(&mut self, table: &str, key: &Row) -> EngineResult<bool> {
        let table = self.table(table)?.clone();
        let converted = key_to_sql_values(&table, key)?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "DELETE FROM {} WHERE ",
            schema::quote_ident(&table.name)
        ));
        let mut sep = qb.separated(" AND ");
        for (pk, value) in table.primary_key.iter().zip(converted) {
            sep.push(format!("{} = ", schema::quote_ident(pk)));
            match value {
                SqlValue::Text(v) => sep.push_bind_unseparated(v),
                SqlValue::Int(v) => sep.push_bind_unseparated(v),
                SqlValue::Float(v) => sep.push_bind_unseparated(v),
                SqlValue::Bool(v) => sep.push_bind_unseparated(v),
                SqlValue::Json(v) => sep.push_bind_unseparated(v.map(sqlx::types::Json)),
            };
        }
        let result = qb.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply(&mut self, plan: FlushPlan) -> EngineResult<()> {
        for flush in plan.tables {
            let table = self.table(&flush.table)?.clone();
            self.insert_rows(&table, &flush.inserts, false).await?;
            self.insert_rows(&table, &flush.upserts, true).await?;
            self.delete_keys(&table, &flush.deletes).await?;
        }
        Ok(())
    }

    async fn stamp(&mut self, checkpoint: &str) -> EngineResult<()> {
        for table in &self.schema.tables {
            sqlx::query(&schema::stamp_sql(table))
                .bind(checkpoint)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn revert(&mut self, checkpoint: &str) -> EngineResult<u64> {
        let mut total: u64 = 0;
        for table in &self.schema.tables {
            let restored: i64 = sqlx::query_scalar(&schema::revert_sql(table))
                .bind(checkpoint)
                .fetch_one(&mut *self.tx)
                .await?;
            let restored = restored.max(0) as u64;
            metrics::DATABASE_REVERT_ROWS
                .with_label_values(&[&table.name])
                .inc_by(restored);
            debug!(table = %table.name, rows = restored, "reverted table");
            total += restored;
        }
        Ok(total)
    }

    async fn finalize(&mut self, checkpoint: &str) -> EngineResult<u64> {
        let mut total: u64 = 0;
        for table in &self.schema.tables {
            let result = sqlx::query(&schema::finalize_sql(table))
                .bind(checkpoint)
                .execute(&mut *self.tx)
                .await?;
            metrics::DATABASE_FINALIZE_ROWS
                .with_label_values(&[&table.name])
                .inc_by(result.rows_affected());
            total += result.rows_affected();
        }
        Ok(total)
    }

    async fn drop_triggers(&mut self) -> EngineResult<()> {
        for table in &self.schema.tables {
            sqlx::query(&schema::drop_trigger_sql(table))
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn recreate_triggers(&mut self) -> EngineResult<()> {
        for table in &self.schema.tables {
            sqlx::query(&schema::create_trigger_sql(table))
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn set_checkpoints(
        &mut self,
        safe: Option<&str>,
        latest: Option<&str>,
    ) -> EngineResult<()> {
        if let Some(safe) = safe {
            sqlx::query(&format!(
                "UPDATE {} SET safe_checkpoint = $1 WHERE namespace = $2",
                schema::quote_ident(CHECKPOINT_TABLE)
            ))
            .bind(safe)
            .bind(&self.namespace)
            .execute(&mut *self.tx)
            .await?;
        }
        if let Some(latest) = latest {
            sqlx::query(&format!(
                "UPDATE {} SET latest_checkpoint = $1 WHERE namespace = $2",
                schema::quote_ident(CHECKPOINT_TABLE)
            ))
            .bind(latest)
            .bind(&self.namespace)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(self) -> EngineResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> EngineResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use serde_json::json;

    fn table() -> TableSchema {
        TableSchema {
            name: "accounts".to_string(),
            columns: vec![
                Column {
                    name: "id".to_string(),
                    column_type: ColumnType::Text,
                    nullable: false,
                },
                Column {
                    name: "balance".to_string(),
                    column_type: ColumnType::Bigint,
                    nullable: false,
                },
                Column {
                    name: "meta".to_string(),
                    column_type: ColumnType::Json,
                    nullable: true,
                },
            ],
            primary_key: vec!["id".to_string()],
        }
    }

    #[test]
    fn test_to_sql_value_type_checks() {
        let table = table();
        let id = table.column("id").unwrap();
        let balance = table.column("balance").unwrap();

        assert!(matches!(
            to_sql_value("accounts", id, Some(&json!("abc"))).unwrap(),
            SqlValue::Text(Some(_))
        ));
        assert!(matches!(
            to_sql_value("accounts", balance, Some(&json!(42))).unwrap(),
            SqlValue::Int(Some(42))
        ));
        // Wrong type is a user error, not an engine panic
        let err = to_sql_value("accounts", balance, Some(&json!("nope"))).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::NonRetryableUser);
        // Nulls pass through as typed NULL binds
        assert!(matches!(
            to_sql_value("accounts", balance, None).unwrap(),
            SqlValue::Int(None)
        ));
    }

    #[test]
    fn test_key_to_sql_values_requires_key_columns() {
        let table = table();
        let mut key = Row::new();
        key.insert("balance".to_string(), json!(1));
        assert!(key_to_sql_values(&table, &key).is_err());

        key.insert("id".to_string(), json!("a"));
        assert_eq!(key_to_sql_values(&table, &key).unwrap().len(), 1);
    }

    #[test]
    fn test_indexing_mode_labels() {
        assert_eq!(IndexingMode::Historical.as_str(), "historical");
        assert_eq!(IndexingMode::Realtime.as_str(), "realtime");
    }
}
