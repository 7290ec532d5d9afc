/// Compiled Schema & DDL Generation
///
/// The engine consumes an already-compiled schema descriptor: table names,
/// typed columns and primary keys. From it we derive everything the
/// reorg-tracking store needs as SQL text:
/// - the user tables themselves
/// - one shadow table `_reorg_T` per user table, carrying all of T's columns
///   plus (operation_id, operation, checkpoint)
/// - one AFTER row trigger per user table that captures pre-images into the
///   shadow table at MAX_CHECKPOINT
/// - the five-stage revert CTE and the finalize/stamp statements
///
/// All generators are pure string builders so they can be unit tested
/// without a database connection.

use serde::{Deserialize, Serialize};

use crate::checkpoint::MAX_CHECKPOINT;
use crate::errors::{EngineError, EngineResult};
use crate::types::Row;

pub const CHECKPOINT_TABLE: &str = "_chainloom_checkpoint";
pub const META_TABLE: &str = "_chainloom_meta";

/// Shadow-table operation discriminants.
pub const OP_INSERT: i16 = 0;
pub const OP_UPDATE: i16 = 1;
pub const OP_DELETE: i16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Bigint,
    Double,
    Boolean,
    Hex,
    Json,
}

impl ColumnType {
    pub fn pg_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Bigint => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Hex => "TEXT",
            ColumnType::Json => "JSONB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == name)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.name.is_empty() || self.columns.is_empty() {
            return Err(EngineError::engine(format!(
                "schema table '{}' has no columns",
                self.name
            )));
        }
        if self.primary_key.is_empty() {
            return Err(EngineError::engine(format!(
                "schema table '{}' has no primary key",
                self.name
            )));
        }
        for pk in &self.primary_key {
            if self.column(pk).is_none() {
                return Err(EngineError::engine(format!(
                    "schema table '{}' primary key column '{}' does not exist",
                    self.name, pk
                )));
            }
        }
        Ok(())
    }
}

/// The descriptor the engine runs against. `build_id` identifies the schema
/// revision; a mismatch against the persisted one aborts a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSchema {
    pub build_id: String,
    pub tables: Vec<TableSchema>,
}

impl CompiledSchema {
    pub fn new(build_id: impl Into<String>, tables: Vec<TableSchema>) -> EngineResult<Self> {
        for table in &tables {
            table.validate()?;
        }
        Ok(Self {
            build_id: build_id.into(),
            tables,
        })
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn require_table(&self, name: &str) -> EngineResult<&TableSchema> {
        self.table(name)
            .ok_or_else(|| EngineError::user(format!("unknown table '{}'", name)))
    }
}

pub fn shadow_table_name(table: &str) -> String {
    format!("_reorg_{}", table)
}

pub fn trigger_name(table: &str) -> String {
    format!("{}_reorg_capture", table)
}

pub fn trigger_function_name(table: &str) -> String {
    format!("{}_reorg_capture_fn", table)
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(table: &TableSchema) -> String {
    table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn prefixed_column_list(table: &TableSchema, prefix: &str) -> String {
    table
        .columns
        .iter()
        .map(|c| format!("{}.{}", prefix, quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_table_sql(table: &TableSchema) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable || table.is_primary_key(&c.name) {
                ""
            } else {
                " NOT NULL"
            };
            format!("{} {}{}", quote_ident(&c.name), c.column_type.pg_type(), null)
        })
        .collect::<Vec<_>>()
        .join(", ");
    let pk = table
        .primary_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
        quote_ident(&table.name),
        columns,
        pk
    )
}

/// Shadow schema: all of T's columns (nullable, since pre-images of partial
/// states are allowed), plus the capture bookkeeping columns.
pub fn create_shadow_table_sql(table: &TableSchema) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.pg_type()))
        .collect::<Vec<_>>()
        .join(", ");
    let shadow = shadow_table_name(&table.name);
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, operation_id BIGSERIAL PRIMARY KEY, \
         operation SMALLINT NOT NULL, checkpoint TEXT NOT NULL DEFAULT '{}')",
        quote_ident(&shadow),
        columns,
        MAX_CHECKPOINT
    )
}

pub fn create_shadow_index_sql(table: &TableSchema) -> String {
    let shadow = shadow_table_name(&table.name);
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (checkpoint)",
        quote_ident(&format!("{}_checkpoint_idx", shadow)),
        quote_ident(&shadow)
    )
}

/// The capture trigger function. INSERT stores NEW, UPDATE and DELETE store
/// OLD; every captured row starts at MAX_CHECKPOINT so it compares greater
/// than any real checkpoint until the batch-end stamp rewrites it.
pub fn create_trigger_function_sql(table: &TableSchema) -> String {
    let shadow = quote_ident(&shadow_table_name(&table.name));
    let cols = column_list(table);
    let new_cols = prefixed_column_list(table, "NEW");
    let old_cols = prefixed_column_list(table, "OLD");
    format!(
        "CREATE OR REPLACE FUNCTION {fn_name}() RETURNS TRIGGER AS $$\n\
         BEGIN\n\
         IF TG_OP = 'INSERT' THEN\n\
         INSERT INTO {shadow} ({cols}, operation, checkpoint) VALUES ({new_cols}, {op_insert}, '{max}');\n\
         RETURN NEW;\n\
         ELSIF TG_OP = 'UPDATE' THEN\n\
         INSERT INTO {shadow} ({cols}, operation, checkpoint) VALUES ({old_cols}, {op_update}, '{max}');\n\
         RETURN NEW;\n\
         ELSIF TG_OP = 'DELETE' THEN\n\
         INSERT INTO {shadow} ({cols}, operation, checkpoint) VALUES ({old_cols}, {op_delete}, '{max}');\n\
         RETURN OLD;\n\
         END IF;\n\
         RETURN NULL;\n\
         END;\n\
         $$ LANGUAGE plpgsql",
        fn_name = quote_ident(&trigger_function_name(&table.name)),
        shadow = shadow,
        cols = cols,
        new_cols = new_cols,
        old_cols = old_cols,
        op_insert = OP_INSERT,
        op_update = OP_UPDATE,
        op_delete = OP_DELETE,
        max = MAX_CHECKPOINT,
    )
}

pub fn create_trigger_sql(table: &TableSchema) -> String {
    format!(
        "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} \
         FOR EACH ROW EXECUTE FUNCTION {}()",
        quote_ident(&trigger_name(&table.name)),
        quote_ident(&table.name),
        quote_ident(&trigger_function_name(&table.name))
    )
}

pub fn drop_trigger_sql(table: &TableSchema) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        quote_ident(&trigger_name(&table.name)),
        quote_ident(&table.name)
    )
}

pub fn drop_trigger_function_sql(table: &TableSchema) -> String {
    format!(
        "DROP FUNCTION IF EXISTS {}()",
        quote_ident(&trigger_function_name(&table.name))
    )
}

pub fn drop_shadow_table_sql(table: &TableSchema) -> String {
    format!(
        "DROP TABLE IF EXISTS {}",
        quote_ident(&shadow_table_name(&table.name))
    )
}

/// Rewrite freshly-captured shadow rows to the event (or batch) checkpoint.
pub fn stamp_sql(table: &TableSchema) -> String {
    format!(
        "UPDATE {} SET checkpoint = $1 WHERE checkpoint = '{}'",
        quote_ident(&shadow_table_name(&table.name)),
        MAX_CHECKPOINT
    )
}

/// Prune finalized shadow rows.
pub fn finalize_sql(table: &TableSchema) -> String {
    format!(
        "DELETE FROM {} WHERE checkpoint <= $1",
        quote_ident(&shadow_table_name(&table.name))
    )
}

/// The five-stage revert. For each primary key touched after the checkpoint,
/// only the earliest captured operation matters: its stored image is the
/// authoritative pre-checkpoint state. Later shadow rows for the same key
/// hold intermediate state and are discarded.
///
///   reverted1: pull every shadow row above the checkpoint
///   reverted2: per key, keep the smallest operation_id
///   reverted3: rejoin for the full column values
///   inserted: keys whose earliest op was INSERT are deleted from T
///   updated_or_deleted: keys whose earliest op was UPDATE/DELETE get their
///     stored image upserted back into T
///
/// Must run with the capture triggers dropped, or the restorative writes
/// would re-populate the shadow table.
pub fn revert_sql(table: &TableSchema) -> String {
    let user = quote_ident(&table.name);
    let shadow = quote_ident(&shadow_table_name(&table.name));
    let cols = column_list(table);
    let pk_cols = table
        .primary_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let join_on = table
        .primary_key
        .iter()
        .map(|c| format!("r1.{col} = r2.{col}", col = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let delete_on = table
        .primary_key
        .iter()
        .map(|c| format!("t.{col} = r3.{col}", col = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let conflict_update = table
        .columns
        .iter()
        .filter(|c| !table.is_primary_key(&c.name))
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    // A table may be primary-key-only; upsert degenerates to DO NOTHING.
    let conflict_clause = if conflict_update.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", conflict_update)
    };
    let r3_cols = table
        .columns
        .iter()
        .map(|c| format!("r3.{}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "WITH reverted1 AS (\
         DELETE FROM {shadow} WHERE checkpoint > $1 RETURNING *\
         ), reverted2 AS (\
         SELECT {pk_cols}, MIN(operation_id) AS operation_id FROM reverted1 GROUP BY {pk_cols}\
         ), reverted3 AS (\
         SELECT r1.* FROM reverted2 r2 JOIN reverted1 r1 ON {join_on} AND r1.operation_id = r2.operation_id\
         ), inserted AS (\
         DELETE FROM {user} t USING reverted3 r3 WHERE {delete_on} AND r3.operation = {op_insert} RETURNING t.*\
         ), updated_or_deleted AS (\
         INSERT INTO {user} ({cols}) SELECT {r3_cols} FROM reverted3 r3 \
         WHERE r3.operation = {op_update} OR r3.operation = {op_delete} \
         ON CONFLICT ({pk_cols}) {conflict_clause} RETURNING *\
         ) SELECT (SELECT COUNT(*) FROM inserted) + (SELECT COUNT(*) FROM updated_or_deleted)",
        shadow = shadow,
        user = user,
        cols = cols,
        r3_cols = r3_cols,
        pk_cols = pk_cols,
        join_on = join_on,
        delete_on = delete_on,
        op_insert = OP_INSERT,
        op_update = OP_UPDATE,
        op_delete = OP_DELETE,
        conflict_clause = conflict_clause,
    )
}

pub fn create_checkpoint_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (namespace TEXT PRIMARY KEY, \
         safe_checkpoint TEXT NOT NULL, latest_checkpoint TEXT NOT NULL)",
        quote_ident(CHECKPOINT_TABLE)
    )
}

pub fn create_meta_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (namespace TEXT PRIMARY KEY, build_id TEXT NOT NULL)",
        quote_ident(META_TABLE)
    )
}

/// Canonical string form of a row's primary key, used as the write-buffer
/// map key and for log lines. Missing key columns are a user error.
pub fn primary_key_string(table: &TableSchema, row: &Row) -> EngineResult<String> {
    let mut parts = Vec::with_capacity(table.primary_key.len());
    for pk in &table.primary_key {
        let value = row.get(pk).ok_or_else(|| {
            EngineError::user(format!(
                "row for table '{}' is missing primary key column '{}'",
                table.name, pk
            ))
        })?;
        if value.is_null() {
            return Err(EngineError::user(format!(
                "row for table '{}' has null primary key column '{}'",
                table.name, pk
            )));
        }
        parts.push(value.to_string());
    }
    Ok(parts.join("\u{1f}"))
}

/// Project the primary key columns out of a full row.
pub fn primary_key_row(table: &TableSchema, row: &Row) -> EngineResult<Row> {
    let mut key = Row::new();
    for pk in &table.primary_key {
        let value = row.get(pk).ok_or_else(|| {
            EngineError::user(format!(
                "row for table '{}' is missing primary key column '{}'",
                table.name, pk
            ))
        })?;
        key.insert(pk.clone(), value.clone());
    }
    Ok(key)
}
