use super::{
    check_collection_path, split_doc_path, BatchOp, Direction, Document, DocumentStore, Query,
    SetOptions, SnapshotStream, StoreResult, WriteFields,
};
use crate::error::StoreError;
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

const MIGRATION_DOCUMENTS_SQL: &str = "
  CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (collection, id)
  );
  CREATE INDEX IF NOT EXISTS documents_collection_idx ON documents (collection);
";

/// Local document store on SQLite.
///
/// Documents are JSON blobs keyed by (collection path, id). Every committed
/// write broadcasts the touched collection paths; live subscribers re-read
/// their collection and receive a full snapshot.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<String>,
    last_timestamp: AtomicI64,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
              id TEXT PRIMARY KEY NOT NULL,
              applied_at INTEGER NOT NULL
            );",
        )?;
        apply_migration(&conn, "0000_documents", MIGRATION_DOCUMENTS_SQL)?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                changes,
                last_timestamp: AtomicI64::new(0),
            }),
        })
    }
}

fn apply_migration(conn: &Connection, id: &str, sql: &str) -> StoreResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM schema_migrations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(());
    }
    conn.execute_batch(sql)?;
    conn.execute(
        "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
        params![id, chrono::Utc::now().timestamp_millis()],
    )?;
    log::info!("applied store migration {}", id);
    Ok(())
}

impl Inner {
    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("store connection lock poisoned".to_string()))
    }

    /// Strictly increasing epoch millis, so server timestamps totally order writes.
    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn notify(&self, collection: &str) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.changes.send(collection.to_string());
    }

    fn run_query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Document>> {
        check_collection_path(collection)?;
        let mut sql = String::from("SELECT id, data FROM documents WHERE collection = ?1");
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(collection.to_string())];

        let has_range = query.start_at.is_some() || query.end_at.is_some();
        match &query.order_by {
            Some(order) => {
                values.push(SqlValue::Text(format!("$.{}", order.field)));
                sql.push_str(" AND json_extract(data, ?2) IS NOT NULL");
                if let Some(start) = &query.start_at {
                    values.push(SqlValue::Text(start.clone()));
                    sql.push_str(&format!(" AND json_extract(data, ?2) >= ?{}", values.len()));
                }
                if let Some(end) = &query.end_at {
                    values.push(SqlValue::Text(end.clone()));
                    sql.push_str(&format!(" AND json_extract(data, ?2) <= ?{}", values.len()));
                }
                let direction = match order.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                sql.push_str(&format!(
                    " ORDER BY json_extract(data, ?2) {dir}, rowid {dir}",
                    dir = direction
                ));
            }
            None if has_range => {
                return Err(StoreError::Backend(
                    "range query requires an order_by field".to_string(),
                ))
            }
            None => sql.push_str(" ORDER BY rowid ASC"),
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, data) = row?;
            let data: Map<String, Value> =
                serde_json::from_str(&data).map_err(|err| StoreError::Malformed {
                    path: format!("{}/{}", collection, id),
                    reason: err.to_string(),
                })?;
            documents.push(Document { id, data });
        }
        Ok(documents)
    }
}

fn read_doc(conn: &Connection, collection: &str, id: &str) -> StoreResult<Option<Map<String, Value>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => {
            let data = serde_json::from_str(&raw).map_err(|err| StoreError::Malformed {
                path: format!("{}/{}", collection, id),
                reason: err.to_string(),
            })?;
            Ok(Some(data))
        }
        None => Ok(None),
    }
}

fn write_doc(conn: &Connection, collection: &str, id: &str, data: &Map<String, Value>) -> StoreResult<()> {
    let raw = serde_json::to_string(data)?;
    conn.execute(
        "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data",
        params![collection, id, raw],
    )?;
    Ok(())
}

/// Applies one write against `conn`, returning the touched collection.
fn apply_op<'a>(conn: &Connection, op: &'a BatchOp, now: i64) -> StoreResult<&'a str> {
    let (collection, id) = split_doc_path(op.path())?;
    match op {
        BatchOp::Set { fields, options, .. } => {
            let resolved = fields.resolve(now);
            let data = if options.merge {
                let mut existing = read_doc(conn, collection, id)?.unwrap_or_default();
                existing.extend(resolved);
                existing
            } else {
                resolved
            };
            write_doc(conn, collection, id, &data)?;
        }
        BatchOp::Update { path, fields } => {
            let mut existing =
                read_doc(conn, collection, id)?.ok_or_else(|| StoreError::NotFound(path.clone()))?;
            existing.extend(fields.resolve(now));
            write_doc(conn, collection, id, &existing)?;
        }
        BatchOp::Delete { .. } => {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )?;
        }
    }
    Ok(collection)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn subscribe(&self, collection: &str, query: Query) -> StoreResult<SnapshotStream> {
        check_collection_path(collection)?;
        let inner = self.inner.clone();
        let collection = collection.to_string();
        // Subscribe to changes before the first read so no write slips between.
        let mut changes = inner.changes.subscribe();
        let (sender, receiver) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);

        log::debug!("store listener start collection={}", collection);
        let listener = tokio::spawn(async move {
            if sender.send(inner.run_query(&collection, &query)).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == collection => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        log::debug!("store listener lagged by {} changes on {}", count, collection);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
                if sender.send(inner.run_query(&collection, &query)).await.is_err() {
                    log::debug!("store listener stop collection={}", collection);
                    return;
                }
            }
        });

        Ok(SnapshotStream::new(receiver, Some(listener)))
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Document>> {
        let (collection, id) = split_doc_path(path)?;
        let conn = self.inner.lock()?;
        Ok(read_doc(&conn, collection, id)?.map(|data| Document {
            id: id.to_string(),
            data,
        }))
    }

    async fn query(&self, collection: &str, query: Query) -> StoreResult<Vec<Document>> {
        self.inner.run_query(collection, &query)
    }

    async fn set(&self, path: &str, fields: WriteFields, options: SetOptions) -> StoreResult<()> {
        self.batch(vec![BatchOp::Set {
            path: path.to_string(),
            fields,
            options,
        }])
        .await
    }

    async fn add(&self, collection: &str, fields: WriteFields) -> StoreResult<String> {
        check_collection_path(collection)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.set(&format!("{}/{}", collection, id), fields, SetOptions::default())
            .await?;
        Ok(id)
    }

    async fn update(&self, path: &str, fields: WriteFields) -> StoreResult<()> {
        self.batch(vec![BatchOp::Update {
            path: path.to_string(),
            fields,
        }])
        .await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.batch(vec![BatchOp::Delete {
            path: path.to_string(),
        }])
        .await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let now = self.inner.next_timestamp();
        let mut touched: Vec<String> = Vec::new();
        {
            let mut conn = self.inner.lock()?;
            let tx = conn.transaction()?;
            for op in &ops {
                let collection = apply_op(&tx, op, now)?;
                if !touched.iter().any(|seen| seen == collection) {
                    touched.push(collection.to_string());
                }
            }
            tx.commit()?;
        }
        for collection in &touched {
            self.inner.notify(collection);
        }
        Ok(())
    }
}
