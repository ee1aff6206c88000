//! SQLite storage backend.
//!
//! Records live in one generic `_data` table keyed by `(collection, id)`:
//! the payload as a JSON blob plus denormalized metadata columns. The
//! `_collections` registry carries per-collection counts, recomputed on
//! every write. Collections listed in
//! [`SqliteConfig::extracted_fields`] also get an `_extract_{collection}`
//! side table with one indexed column per field, written in the same
//! transaction as the blob row.

pub mod pool;
pub mod translate;

use crate::config::SqliteConfig;
use crate::error::{Error, Result};
use crate::query::{
    eval, validate_field_path, QueryExplanation, QueryOutput, RelationalQuery,
};
use crate::record::{
    parse_timestamp, timestamp_string, validate_collection_name, validate_record_id,
    CollectionStats, DataRecord, RecordMetadata, StoredVector,
};
use crate::storage::traits::{
    BatchFailure, BatchOperation, BatchOutcome, BatchReport, CleanupReport, StorageAdapter,
    VectorBackend,
};
use async_trait::async_trait;
use chrono::Utc;
use pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use translate::{extract_column, extract_table, from_sql_value, to_sql_value, RowShape, RECORD_COLUMNS};

const SCHEMA: &str = r#"
    -- Collection registry
    CREATE TABLE IF NOT EXISTS _collections (
        name            TEXT PRIMARY KEY,
        schema_version  INTEGER NOT NULL DEFAULT 1,
        record_count    INTEGER NOT NULL DEFAULT 0,
        total_size      INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );

    -- Records: payload blob plus denormalized metadata
    CREATE TABLE IF NOT EXISTS _data (
        collection      TEXT NOT NULL,
        id              TEXT NOT NULL,
        data            TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        version         INTEGER NOT NULL DEFAULT 1,
        tags            TEXT,
        ttl             INTEGER,
        PRIMARY KEY (collection, id)
    );

    CREATE INDEX IF NOT EXISTS idx_data_created ON _data(collection, created_at);
    CREATE INDEX IF NOT EXISTS idx_data_updated ON _data(collection, updated_at);
    CREATE INDEX IF NOT EXISTS idx_data_ttl ON _data(ttl) WHERE ttl IS NOT NULL;

    -- Vector storage
    CREATE TABLE IF NOT EXISTS _vector_collections (
        collection      TEXT PRIMARY KEY,
        dimensions      INTEGER NOT NULL,
        created_at      TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS _vectors (
        collection      TEXT NOT NULL,
        record_id       TEXT NOT NULL,
        embedding       BLOB NOT NULL,
        dimensions      INTEGER NOT NULL,
        model           TEXT,
        generated_at    TEXT NOT NULL,
        PRIMARY KEY (collection, record_id)
    );
"#;

/// SQLite-backed storage over a connection pool.
pub struct SqliteAdapter {
    config: SqliteConfig,
    pool: RwLock<Option<ConnectionPool>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteAdapter {
    pub fn new(config: SqliteConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            health_task: Mutex::new(None),
        }
    }

    /// Private in-memory database shared by a single pooled connection.
    pub fn in_memory() -> Self {
        Self::new(SqliteConfig {
            path: format!("file:docstore-{}?mode=memory&cache=shared", uuid::Uuid::new_v4()).into(),
            pool_size: 1,
            health_check_interval_secs: None,
            ..Default::default()
        })
    }

    /// Pool occupancy, `None` before `initialize` or after `close`.
    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.read().ok()?.as_ref().map(ConnectionPool::status)
    }

    fn pool(&self) -> Result<ConnectionPool> {
        self.pool
            .read()
            .map_err(Error::poisoned)?
            .clone()
            .ok_or(Error::PoolClosed)
    }

    async fn conn(&self) -> Result<PooledConnection> {
        self.pool()?.acquire().await
    }

    fn extracted(&self, collection: &str) -> &[String] {
        self.config
            .extracted_fields
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn is_uri(&self) -> bool {
        self.config.path.to_string_lossy().starts_with("file:")
    }

    fn init_schema(&self, conn: &mut Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (collection, fields) in &self.config.extracted_fields {
            sync_extraction(&tx, collection, fields)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Create (or widen) an extraction table and resync it from `_data`.
fn sync_extraction(conn: &Connection, collection: &str, fields: &[String]) -> Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let table = extract_table(collection);
    conn.execute_batch(&format!("CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY)", table))?;

    let existing: Vec<String> = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        names.collect::<rusqlite::Result<_>>()?
    };
    for field in fields {
        let column = extract_column(field);
        if !existing.contains(&column) {
            // Untyped column: values keep the type JSON_EXTRACT gives them.
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {}", table, column))?;
        }
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_extract_{}_{}\" ON {}({})",
            collection, column, table, column
        ))?;
    }

    let columns: Vec<String> = fields.iter().map(|f| extract_column(f)).collect();
    let extracts: Vec<String> = fields
        .iter()
        .map(|f| format!("JSON_EXTRACT(data, '$.{}')", f))
        .collect();
    conn.execute(&format!("DELETE FROM {}", table), [])?;
    let synced = conn.execute(
        &format!(
            "INSERT INTO {} (id, {}) SELECT id, {} FROM _data WHERE collection = ?1",
            table,
            columns.join(", "),
            extracts.join(", ")
        ),
        params![collection],
    )?;
    debug!("Extraction table for {} synced ({} rows, {} fields)", collection, synced, fields.len());
    Ok(())
}

/// Raw `_data` row before JSON and timestamp decoding.
struct RawRecord {
    id: String,
    collection: String,
    data: String,
    created_at: String,
    updated_at: String,
    version: i64,
    tags: Option<String>,
    ttl: Option<i64>,
}

impl RawRecord {
    /// Read the [`RECORD_COLUMNS`] prefix of a row.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            collection: row.get(1)?,
            data: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            version: row.get(5)?,
            tags: row.get(6)?,
            ttl: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<DataRecord> {
        Ok(DataRecord {
            data: serde_json::from_str(&self.data)?,
            metadata: RecordMetadata {
                created_at: parse_timestamp(&self.created_at)?,
                updated_at: parse_timestamp(&self.updated_at)?,
                version: self.version.max(0) as u64,
                tags: self.tags.as_deref().map(serde_json::from_str).transpose()?,
                ttl: self.ttl.map(|t| t.max(0) as u64),
            },
            id: self.id,
            collection: self.collection,
        })
    }
}

/// Keep domain errors as they are; wrap driver and I/O failures with the
/// operation and key.
fn wrap(operation: &'static str, key: String) -> impl FnOnce(Error) -> Error {
    move |e| match e {
        Error::Database(_) | Error::Io(_) | Error::Serialization(_) => {
            Error::persistence(operation, key, e)
        }
        other => other,
    }
}

/// Every extracted field needs a valid path and a column of its own.
fn check_extracted_fields(collection: &str, fields: &[String]) -> Result<()> {
    let mut columns: HashMap<String, &str> = HashMap::new();
    for field in fields {
        validate_field_path(field).map_err(|e| Error::Config(e.to_string()))?;
        // SQLite column names are case-insensitive.
        let column = extract_column(field).to_ascii_lowercase();
        if let Some(previous) = columns.insert(column.clone(), field) {
            return Err(Error::Config(format!(
                "extracted fields '{}' and '{}' of {} both map to column {}",
                previous, field, collection, column
            )));
        }
    }
    Ok(())
}

fn key(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

fn read_in(conn: &Connection, collection: &str, id: &str) -> Result<Option<DataRecord>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM _data d WHERE d.collection = ?1 AND d.id = ?2",
                RECORD_COLUMNS
            ),
            params![collection, id],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

fn write_extraction(conn: &Connection, fields: &[String], record: &DataRecord) -> Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let columns: Vec<String> = fields.iter().map(|f| extract_column(f)).collect();
    let placeholders = vec!["?"; fields.len() + 1].join(", ");
    let mut values = vec![SqlValue::Text(record.id.clone())];
    for field in fields {
        values.push(
            eval::get_path(&record.data, field)
                .map(to_sql_value)
                .unwrap_or(SqlValue::Null),
        );
    }
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (id, {}) VALUES ({})",
            extract_table(&record.collection),
            columns.join(", "),
            placeholders
        ),
        params_from_iter(values),
    )?;
    Ok(())
}

fn refresh_stats(conn: &Connection, collection: &str) -> Result<()> {
    let now = timestamp_string(&Utc::now());
    conn.execute(
        r#"
        INSERT INTO _collections (name, record_count, total_size, created_at, updated_at)
        SELECT ?1, COUNT(*), COALESCE(SUM(LENGTH(CAST(data AS BLOB))), 0), ?2, ?2
        FROM _data WHERE collection = ?1
        ON CONFLICT(name) DO UPDATE SET
            record_count = excluded.record_count,
            total_size = excluded.total_size,
            updated_at = excluded.updated_at
        "#,
        params![collection, now],
    )?;
    Ok(())
}

fn create_in(conn: &Connection, fields: &[String], record: &DataRecord) -> Result<()> {
    validate_collection_name(&record.collection)?;
    validate_record_id(&record.id)?;
    let tags = record
        .metadata
        .tags
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let inserted = conn.execute(
        r#"
        INSERT INTO _data (collection, id, data, created_at, updated_at, version, tags, ttl)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(collection, id) DO NOTHING
        "#,
        params![
            record.collection,
            record.id,
            serde_json::to_string(&record.data)?,
            timestamp_string(&record.metadata.created_at),
            timestamp_string(&record.metadata.updated_at),
            record.metadata.version as i64,
            tags,
            record.metadata.ttl.map(|t| t as i64),
        ],
    )?;
    if inserted == 0 {
        return Err(Error::AlreadyExists {
            collection: record.collection.clone(),
            id: record.id.clone(),
        });
    }
    write_extraction(conn, fields, record)?;
    refresh_stats(conn, &record.collection)
}

fn update_in(
    conn: &Connection,
    fields: &[String],
    collection: &str,
    id: &str,
    patch: Value,
    increment_version: bool,
) -> Result<DataRecord> {
    let mut record = read_in(conn, collection, id)?.ok_or_else(|| Error::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    })?;
    record.apply_patch(patch, increment_version, Utc::now());
    conn.execute(
        "UPDATE _data SET data = ?1, updated_at = ?2, version = ?3 WHERE collection = ?4 AND id = ?5",
        params![
            serde_json::to_string(&record.data)?,
            timestamp_string(&record.metadata.updated_at),
            record.metadata.version as i64,
            collection,
            id,
        ],
    )?;
    write_extraction(conn, fields, &record)?;
    refresh_stats(conn, collection)?;
    Ok(record)
}

fn delete_in(conn: &Connection, fields: &[String], collection: &str, id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM _data WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    if !fields.is_empty() {
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", extract_table(collection)),
            params![id],
        )?;
    }
    conn.execute(
        "DELETE FROM _vectors WHERE collection = ?1 AND record_id = ?2",
        params![collection, id],
    )?;
    if removed > 0 {
        refresh_stats(conn, collection)?;
    }
    Ok(removed > 0)
}

fn apply_in(conn: &Connection, adapter: &SqliteAdapter, op: BatchOperation) -> Result<BatchOutcome> {
    Ok(match op {
        BatchOperation::Create { record } => {
            create_in(conn, adapter.extracted(&record.collection), &record)?;
            BatchOutcome::Created(record)
        }
        BatchOperation::Read { collection, id } => BatchOutcome::Read(read_in(conn, &collection, &id)?),
        BatchOperation::Update {
            collection,
            id,
            data,
            increment_version,
        } => BatchOutcome::Updated(update_in(
            conn,
            adapter.extracted(&collection),
            &collection,
            &id,
            data,
            increment_version,
        )?),
        BatchOperation::Delete { collection, id } => {
            BatchOutcome::Deleted(delete_in(conn, adapter.extracted(&collection), &collection, &id)?)
        }
    })
}

fn run_query(conn: &Connection, query: &RelationalQuery, extracted: &[String]) -> Result<QueryOutput> {
    let compiled = translate::compile(query, extracted)?;
    debug!("SQL: {} ({} params)", compiled.sql, compiled.params.len());
    let mut stmt = conn.prepare(&compiled.sql)?;
    let mut rows = stmt.query(params_from_iter(compiled.sql_params()))?;
    let mut output = QueryOutput::default();

    match &compiled.shape {
        RowShape::Records { join_aliases } => {
            while let Some(row) = rows.next()? {
                let mut record = RawRecord::from_row(row)?.into_record()?;
                for (i, alias) in join_aliases.iter().enumerate() {
                    let joined: Option<String> = row.get(8 + i)?;
                    let joined = match joined {
                        Some(raw) => serde_json::from_str(&raw)?,
                        None => Value::Null,
                    };
                    if let Value::Object(obj) = &mut record.data {
                        obj.insert(alias.clone(), joined);
                    }
                }
                if query.select.is_some() || query.exclude.is_some() {
                    eval::project(&mut record.data, query.select.as_deref(), query.exclude.as_deref());
                }
                output.records.push(record);
            }
        }
        RowShape::Groups { columns } => {
            while let Some(row) = rows.next()? {
                let mut group = Map::new();
                for (i, column) in columns.iter().enumerate() {
                    let value = if column.json {
                        match row.get::<_, Option<String>>(i)? {
                            Some(raw) => serde_json::from_str(&raw)?,
                            None => Value::Null,
                        }
                    } else {
                        from_sql_value(row.get::<_, SqlValue>(i)?)
                    };
                    group.insert(column.name.clone(), value);
                }
                output.groups.push(group);
            }
        }
    }
    Ok(output)
}

fn encode_vector(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn strategy(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize(&self) -> Result<()> {
        if self.pool.read().map_err(Error::poisoned)?.is_some() {
            return Ok(());
        }
        let path = self.config.path.clone();
        let location = path.display().to_string();
        for (collection, fields) in &self.config.extracted_fields {
            validate_collection_name(collection).map_err(|e| Error::Config(e.to_string()))?;
            check_extracted_fields(collection, fields)?;
        }
        if !self.is_uri() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::persistence("initialize", location.clone(), e.into()))?;
            }
        }

        let pool = ConnectionPool::open(
            &path,
            PoolOptions {
                size: self.config.pool_size,
                busy_timeout: Duration::from_millis(self.config.busy_timeout_ms),
                acquire_timeout: self.config.acquire_timeout_ms.map(Duration::from_millis),
            },
        )
        .map_err(|e| Error::persistence("initialize", location.clone(), e))?;
        {
            let mut conn = pool.acquire().await?;
            self.init_schema(&mut conn)
                .map_err(|e| Error::persistence("initialize", location.clone(), e))?;
        }

        if let Some(secs) = self.config.health_check_interval_secs.filter(|s| *s > 0) {
            let task = pool.spawn_health_check(Duration::from_secs(secs));
            *self.health_task.lock().map_err(Error::poisoned)? = Some(task);
        }
        *self.pool.write().map_err(Error::poisoned)? = Some(pool);
        info!("SQLite store initialized at {} ({} connections)", location, self.config.pool_size);
        Ok(())
    }

    async fn create(&self, record: DataRecord) -> Result<DataRecord> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        create_in(&tx, self.extracted(&record.collection), &record)
            .and_then(|_| tx.commit().map_err(Error::from))
            .map_err(wrap("create", key(&record.collection, &record.id)))?;
        debug!("Created {}/{}", record.collection, record.id);
        Ok(record)
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<DataRecord>> {
        let conn = self.conn().await?;
        read_in(&conn, collection, id).map_err(wrap("read", key(collection, id)))
    }

    async fn query_relational(&self, query: &RelationalQuery) -> Result<QueryOutput> {
        let mut output = {
            let conn = self.conn().await?;
            run_query(&conn, query, self.extracted(&query.collection))?
        };
        if query.explain {
            output.explanation = Some(self.explain_query(query).await?);
        }
        Ok(output)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
        increment_version: bool,
    ) -> Result<DataRecord> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = update_in(&tx, self.extracted(collection), collection, id, patch, increment_version)
            .and_then(|r| tx.commit().map(|_| r).map_err(Error::from))
            .map_err(wrap("update", key(collection, id)))?;
        Ok(record)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        delete_in(&tx, self.extracted(collection), collection, id)
            .and_then(|removed| tx.commit().map(|_| removed).map_err(Error::from))
            .map_err(wrap("delete", key(collection, id)))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn().await?;
        let mut stmt = conn.prepare("SELECT name FROM _collections ORDER BY name")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(names.collect::<rusqlite::Result<_>>()?)
    }

    async fn get_collection_stats(&self, collection: &str) -> Result<Option<CollectionStats>> {
        let conn = self.conn().await?;
        let row = conn
            .query_row(
                r#"
                SELECT c.record_count, c.total_size, c.schema_version,
                       (SELECT MAX(updated_at) FROM _data WHERE collection = c.name)
                FROM _collections c WHERE c.name = ?1
                "#,
                params![collection],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((count, size, schema_version, last)) = row else {
            return Ok(None);
        };
        Ok(Some(CollectionStats {
            name: collection.to_string(),
            record_count: count.max(0) as usize,
            total_size: size.max(0) as u64,
            last_modified: last.as_deref().map(parse_timestamp).transpose()?,
            schema: Some(serde_json::json!({ "schemaVersion": schema_version })),
        }))
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<BatchReport> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut results = Vec::with_capacity(operations.len());
        for (index, op) in operations.into_iter().enumerate() {
            let key = op.key();
            match apply_in(&tx, self, op) {
                Ok(outcome) => results.push(outcome),
                Err(e) => {
                    // Dropping the transaction rolls back every earlier step.
                    warn!("Batch step {} ({}) failed, rolling back: {}", index, key, e);
                    return Ok(BatchReport {
                        results: Vec::new(),
                        failure: Some(BatchFailure {
                            index,
                            key,
                            error: e.to_string(),
                        }),
                    });
                }
            }
        }
        tx.commit()?;
        debug!("Batch committed ({} operations)", results.len());
        Ok(BatchReport {
            results,
            failure: None,
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM _data", [])?;
        for (collection, fields) in &self.config.extracted_fields {
            if !fields.is_empty() {
                tx.execute(&format!("DELETE FROM {}", extract_table(collection)), [])?;
            }
        }
        tx.execute(
            "UPDATE _collections SET record_count = 0, total_size = 0, updated_at = ?1",
            params![timestamp_string(&Utc::now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "DELETE FROM _data; DELETE FROM _collections; DELETE FROM _vectors; DELETE FROM _vector_collections;",
        )?;
        for (collection, fields) in &self.config.extracted_fields {
            if !fields.is_empty() {
                tx.execute(&format!("DELETE FROM {}", extract_table(collection)), [])?;
            }
        }
        tx.commit()?;
        info!("Cleared all data in {}", self.config.path.display());
        Ok(())
    }

    async fn truncate(&self, collection: &str) -> Result<usize> {
        validate_collection_name(collection)?;
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM _data WHERE collection = ?1", params![collection])?;
        if !self.extracted(collection).is_empty() {
            tx.execute(&format!("DELETE FROM {}", extract_table(collection)), [])?;
        }
        if removed > 0 {
            refresh_stats(&tx, collection)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    async fn cleanup(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();
        let mut conn = self.conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidates: Vec<(String, String, String, i64)> = {
            let mut stmt =
                tx.prepare("SELECT collection, id, created_at, ttl FROM _data WHERE ttl IS NOT NULL")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (collection, id, created_at, ttl) in candidates {
            let mut metadata = RecordMetadata::new(parse_timestamp(&created_at)?);
            metadata.ttl = Some(ttl.max(0) as u64);
            if metadata.is_expired(now) && delete_in(&tx, self.extracted(&collection), &collection, &id)? {
                report.expired_records += 1;
            }
        }
        report.empty_collections_pruned =
            tx.execute("DELETE FROM _collections WHERE record_count = 0", [])?;
        tx.commit()?;
        conn.execute_batch("PRAGMA optimize;")?;
        if report.expired_records > 0 {
            info!("Cleanup removed {} expired records", report.expired_records);
        }
        Ok(report)
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.health_task.lock().map_err(Error::poisoned)?.take() {
            task.abort();
        }
        if let Some(pool) = self.pool.write().map_err(Error::poisoned)?.take() {
            pool.close();
        }
        Ok(())
    }

    async fn explain_query(&self, query: &RelationalQuery) -> Result<QueryExplanation> {
        let compiled = translate::compile(query, self.extracted(&query.collection))?;
        let conn = self.conn().await?;
        let plan: Vec<String> = {
            let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", compiled.sql))?;
            let rows = stmt.query_map(params_from_iter(compiled.sql_params()), |row| {
                row.get::<_, String>(3)
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let estimated_rows = conn
            .query_row(
                "SELECT record_count FROM _collections WHERE name = ?1",
                params![query.collection],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|n| n.max(0) as usize);
        Ok(QueryExplanation {
            backend: self.strategy().to_string(),
            query: compiled.sql,
            parameters: compiled.params,
            plan,
            estimated_rows: Some(estimated_rows.unwrap_or(0)),
        })
    }
}

#[async_trait]
impl VectorBackend for SqliteAdapter {
    async fn ensure_vector_storage(&self, collection: &str, dimensions: usize) -> Result<()> {
        validate_collection_name(collection)?;
        let conn = self.conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO _vector_collections (collection, dimensions, created_at) VALUES (?1, ?2, ?3)",
            params![collection, dimensions as i64, timestamp_string(&Utc::now())],
        )?;
        let registered: i64 = conn.query_row(
            "SELECT dimensions FROM _vector_collections WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        if registered as usize != dimensions {
            return Err(Error::Validation(format!(
                "collection '{}' stores {}-dimensional vectors, got {}",
                collection, registered, dimensions
            )));
        }
        Ok(())
    }

    async fn store_vector(&self, collection: &str, vector: &StoredVector) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO _vectors
            (collection, record_id, embedding, dimensions, model, generated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                collection,
                vector.record_id,
                encode_vector(&vector.embedding),
                vector.dimensions() as i64,
                vector.model,
                timestamp_string(&vector.generated_at),
            ],
        )
        .map_err(|e| Error::persistence("store_vector", key(collection, &vector.record_id), e.into()))?;
        Ok(())
    }

    async fn get_all_vectors(&self, collection: &str) -> Result<Vec<StoredVector>> {
        let conn = self.conn().await?;
        let mut stmt = conn.prepare(
            "SELECT record_id, embedding, model, generated_at FROM _vectors WHERE collection = ?1 ORDER BY record_id",
        )?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut vectors = Vec::new();
        for row in rows {
            let (record_id, bytes, model, generated_at) = row?;
            vectors.push(StoredVector {
                record_id,
                embedding: decode_vector(&bytes),
                model,
                generated_at: parse_timestamp(&generated_at)?,
            });
        }
        Ok(vectors)
    }

    async fn get_vector_count(&self, collection: &str) -> Result<usize> {
        let conn = self.conn().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM _vectors WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    async fn delete_vector(&self, collection: &str, record_id: &str) -> Result<bool> {
        let conn = self.conn().await?;
        let removed = conn.execute(
            "DELETE FROM _vectors WHERE collection = ?1 AND record_id = ?2",
            params![collection, record_id],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AggregateFunction, FilterOperator, QueryBuilder, SortDirection};
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteAdapter {
        store_with(dir, HashMap::new()).await
    }

    async fn store_with(dir: &TempDir, extracted: HashMap<String, Vec<String>>) -> SqliteAdapter {
        let adapter = SqliteAdapter::new(SqliteConfig {
            path: dir.path().join("store.db"),
            pool_size: 2,
            health_check_interval_secs: None,
            extracted_fields: extracted,
            ..Default::default()
        });
        adapter.initialize().await.unwrap();
        adapter
    }

    async fn seed_users(adapter: &SqliteAdapter) {
        for (id, name, age, team) in [
            ("u1", "Ada", Some(36), "core"),
            ("u2", "Grace", Some(45), "core"),
            ("u3", "Linus", Some(28), "kernel"),
            ("u4", "Barbara", None, "kernel"),
        ] {
            let mut data = json!({"name": name, "team": team});
            if let Some(age) = age {
                data["age"] = json!(age);
            }
            adapter.create(DataRecord::new("users", id, data)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_round_trip_keeps_metadata() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        let record = DataRecord::new("users", "u1", json!({"name": "Ada", "tags": [1, 2]}))
            .with_tags(vec!["vip".into()])
            .with_ttl(3600);
        adapter.create(record.clone()).await.unwrap();
        let read = adapter.read("users", "u1").await.unwrap().unwrap();
        assert_eq!(read, record);
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_original() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        adapter
            .create(DataRecord::new("users", "u1", json!({"name": "Ada"})))
            .await
            .unwrap();
        let err = adapter
            .create(DataRecord::new("users", "u1", json!({"name": "Eve"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        let read = adapter.read("users", "u1").await.unwrap().unwrap();
        assert_eq!(read.data["name"], "Ada");
        let stats = adapter.get_collection_stats("users").await.unwrap().unwrap();
        assert_eq!(stats.record_count, 1);
    }

    #[tokio::test]
    async fn test_stats_follow_writes() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        seed_users(&adapter).await;
        let stats = adapter.get_collection_stats("users").await.unwrap().unwrap();
        assert_eq!(stats.record_count, 4);
        assert!(stats.total_size > 0);

        adapter.delete("users", "u4").await.unwrap();
        let stats = adapter.get_collection_stats("users").await.unwrap().unwrap();
        assert_eq!(stats.record_count, 3);
        assert!(adapter.get_collection_stats("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filters_sort_and_paginate_in_sql() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        seed_users(&adapter).await;

        let q = QueryBuilder::new()
            .from("users")
            .where_op("age", FilterOperator::Ne, json!(36))
            .build()
            .unwrap();
        assert_eq!(adapter.query_relational(&q).await.unwrap().records.len(), 3);

        let q = QueryBuilder::new()
            .from("users")
            .order_by("age", SortDirection::Desc)
            .limit(2)
            .offset(1)
            .build()
            .unwrap();
        let ids: Vec<String> = adapter
            .query_relational(&q)
            .await
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["u1", "u3"]);

        let q = QueryBuilder::new().from("users").search("AR", ["name"]).build().unwrap();
        let out = adapter.query_relational(&q).await.unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].id, "u4");
    }

    #[tokio::test]
    async fn test_grouped_aggregates() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        seed_users(&adapter).await;
        let q = QueryBuilder::new()
            .from("users")
            .group_by(["team"])
            .count("n")
            .aggregate(AggregateFunction::Sum, Some("age"), "total_age")
            .build()
            .unwrap();
        let out = adapter.query_relational(&q).await.unwrap();
        assert_eq!(out.groups.len(), 2);
        assert_eq!(out.groups[0]["team"], json!("core"));
        assert_eq!(out.groups[0]["n"], json!(2));
        assert_eq!(out.groups[0]["total_age"], json!(81));
        assert_eq!(out.groups[1]["total_age"], json!(28));
    }

    #[tokio::test]
    async fn test_left_join_attaches_payload() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        seed_users(&adapter).await;
        adapter
            .create(DataRecord::new("orders", "o1", json!({"userId": "u1", "total": 10})))
            .await
            .unwrap();
        adapter
            .create(DataRecord::new("orders", "o2", json!({"userId": "u9", "total": 5})))
            .await
            .unwrap();
        let q = QueryBuilder::new()
            .from("orders")
            .left_join("users", "userId", "id")
            .alias("customer")
            .build()
            .unwrap();
        let out = adapter.query_relational(&q).await.unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].data["customer"]["name"], json!("Ada"));
        assert_eq!(out.records[1].data["customer"], Value::Null);
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_failure() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        adapter
            .create(DataRecord::new("users", "u1", json!({"name": "Ada"})))
            .await
            .unwrap();
        let report = adapter
            .batch(vec![
                BatchOperation::Create {
                    record: DataRecord::new("users", "u2", json!({"name": "Grace"})),
                },
                BatchOperation::Create {
                    record: DataRecord::new("users", "u1", json!({"name": "dup"})),
                },
            ])
            .await
            .unwrap();
        assert!(!report.is_success());
        assert!(report.results.is_empty());
        assert_eq!(report.failure.unwrap().index, 1);
        assert!(adapter.read("users", "u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extraction_rows_track_writes() {
        let dir = TempDir::new().unwrap();
        let mut extracted = HashMap::new();
        extracted.insert("users".to_string(), vec!["team".to_string()]);
        let adapter = store_with(&dir, extracted).await;
        seed_users(&adapter).await;
        adapter
            .update("users", "u3", json!({"team": "core"}), true)
            .await
            .unwrap();
        adapter.delete("users", "u4").await.unwrap();

        let conn = adapter.conn().await.unwrap();
        let core: i64 = conn
            .query_row("SELECT COUNT(*) FROM \"_extract_users\" WHERE f_team = 'core'", [], |r| r.get(0))
            .unwrap();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM \"_extract_users\"", [], |r| r.get(0))
            .unwrap();
        drop(conn);
        assert_eq!(core, 3);
        assert_eq!(total, 3);

        let q = QueryBuilder::new().from("users").where_eq("team", json!("core")).build().unwrap();
        assert_eq!(adapter.query_relational(&q).await.unwrap().records.len(), 3);
    }

    #[tokio::test]
    async fn test_extraction_resyncs_existing_rows() {
        let dir = TempDir::new().unwrap();
        {
            let adapter = store(&dir).await;
            seed_users(&adapter).await;
            adapter.close().await.unwrap();
        }
        let mut extracted = HashMap::new();
        extracted.insert("users".to_string(), vec!["name".to_string()]);
        let adapter = store_with(&dir, extracted).await;
        let q = QueryBuilder::new().from("users").where_eq("name", json!("Grace")).build().unwrap();
        let out = adapter.query_relational(&q).await.unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].id, "u2");
    }

    #[tokio::test]
    async fn test_colliding_extracted_fields_are_rejected() {
        for fields in [vec!["a.b", "a_b"], vec!["name", "Name"], vec!["team", "team"]] {
            let dir = TempDir::new().unwrap();
            let mut extracted = HashMap::new();
            extracted.insert(
                "users".to_string(),
                fields.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
            );
            let adapter = SqliteAdapter::new(SqliteConfig {
                path: dir.path().join("store.db"),
                health_check_interval_secs: None,
                extracted_fields: extracted,
                ..Default::default()
            });
            let err = adapter.initialize().await.unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{:?}: {}", fields, err);
            assert!(!dir.path().join("store.db").exists());
        }
    }

    #[tokio::test]
    async fn test_in_lists_keep_booleans_apart_from_numbers() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        for (id, data) in [
            ("a", json!({"active": true})),
            ("b", json!({"active": false})),
            ("c", json!({"active": 1})),
            ("d", json!({})),
        ] {
            adapter.create(DataRecord::new("flags", id, data)).await.unwrap();
        }
        let ids = |operator: FilterOperator, members: Value| {
            let adapter = &adapter;
            async move {
                let q = QueryBuilder::new()
                    .from("flags")
                    .where_op("active", operator, members)
                    .order_by("id", SortDirection::Asc)
                    .build()
                    .unwrap();
                let out = adapter.query_relational(&q).await.unwrap();
                out.records.into_iter().map(|r| r.id).collect::<Vec<_>>()
            }
        };
        assert_eq!(ids(FilterOperator::In, json!([true])).await, vec!["a"]);
        assert_eq!(ids(FilterOperator::In, json!([1])).await, vec!["c"]);
        assert_eq!(ids(FilterOperator::In, json!([false, 1])).await, vec!["b", "c"]);
        assert_eq!(ids(FilterOperator::NotIn, json!([true])).await, vec!["b", "c", "d"]);
        assert_eq!(ids(FilterOperator::NotIn, json!([0])).await, vec!["a", "b", "c", "d"]);
        assert_eq!(ids(FilterOperator::Eq, json!(1)).await, vec!["c"]);
        assert_eq!(ids(FilterOperator::Ne, json!(1)).await, vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn test_explain_reports_plan() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        seed_users(&adapter).await;
        let q = QueryBuilder::new().from("users").where_eq("team", json!("core")).build().unwrap();
        let explanation = adapter.explain_query(&q).await.unwrap();
        assert_eq!(explanation.backend, "sqlite");
        assert!(explanation.query.starts_with("SELECT"));
        assert!(!explanation.plan.is_empty());
        assert_eq!(explanation.estimated_rows, Some(4));
    }

    #[tokio::test]
    async fn test_cleanup_expires_and_prunes() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        let mut old = DataRecord::new("cache", "old", json!({})).with_ttl(1);
        old.metadata.created_at = Utc::now() - chrono::Duration::seconds(10);
        adapter.create(old).await.unwrap();
        adapter
            .create(DataRecord::new("sessions", "s1", json!({})).with_ttl(3600))
            .await
            .unwrap();
        let report = adapter.cleanup().await.unwrap();
        assert_eq!(report.expired_records, 1);
        assert_eq!(report.empty_collections_pruned, 1);
        assert_eq!(adapter.list_collections().await.unwrap(), vec!["sessions"]);
    }

    #[tokio::test]
    async fn test_vectors_round_trip_and_cascade() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        adapter
            .create(DataRecord::new("docs", "d1", json!({"text": "hi"})))
            .await
            .unwrap();
        adapter.ensure_vector_storage("docs", 3).await.unwrap();
        assert!(adapter.ensure_vector_storage("docs", 4).await.is_err());
        adapter
            .store_vector("docs", &StoredVector::new("d1", vec![0.5, -1.0, 2.0], Some("m".into())))
            .await
            .unwrap();
        let vectors = adapter.get_all_vectors("docs").await.unwrap();
        assert_eq!(vectors[0].embedding, vec![0.5, -1.0, 2.0]);
        adapter.delete("docs", "d1").await.unwrap();
        assert_eq!(adapter.get_vector_count("docs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let adapter = store(&dir).await;
            adapter
                .create(DataRecord::new("users", "u1", json!({"name": "Ada"})))
                .await
                .unwrap();
            adapter.close().await.unwrap();
            assert!(matches!(adapter.read("users", "u1").await, Err(Error::PoolClosed)));
        }
        let adapter = store(&dir).await;
        assert!(adapter.read("users", "u1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_all_commit() {
        let dir = TempDir::new().unwrap();
        let adapter = std::sync::Arc::new(SqliteAdapter::new(SqliteConfig {
            path: dir.path().join("store.db"),
            pool_size: 8,
            health_check_interval_secs: None,
            ..Default::default()
        }));
        adapter.initialize().await.unwrap();
        adapter
            .create(DataRecord::new("counters", "c1", json!({"n": 0})))
            .await
            .unwrap();

        let tasks: Vec<_> = (1..=64)
            .map(|i| {
                let adapter = std::sync::Arc::clone(&adapter);
                tokio::spawn(async move {
                    adapter.update("counters", "c1", json!({"n": i}), true).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let record = adapter.read("counters", "c1").await.unwrap().unwrap();
        assert_eq!(record.metadata.version, 65);
    }

    #[tokio::test]
    async fn test_create_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let adapter = store(&dir).await;
        for id in ["", "../x", "a/b"] {
            let result = adapter.create(DataRecord::new("users", id, json!({}))).await;
            assert!(matches!(result, Err(Error::Validation(_))), "id {:?}", id);
        }
        assert!(adapter.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let adapter = SqliteAdapter::in_memory();
        adapter.initialize().await.unwrap();
        adapter
            .create(DataRecord::new("users", "u1", json!({"name": "Ada"})))
            .await
            .unwrap();
        assert_eq!(adapter.list_collections().await.unwrap(), vec!["users"]);
        assert_eq!(adapter.pool_status().unwrap().size, 1);
    }
}
