//! Document-store seam.
//!
//! Everything durable lives behind [`DocumentStore`]: per-user collections of
//! JSON documents addressed by slash-separated paths (`users/{uid}/books/{id}`).
//! The core never talks to a concrete backend directly, so the shipped
//! [`SqliteStore`] can be swapped for a hosted service adapter.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored document: its id (last path segment) and its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|err| {
            StoreError::Malformed {
                path: self.id.clone(),
                reason: err.to_string(),
            }
        })
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|value| value.as_str())
    }
}

/// A single field in a write. `ServerTimestamp` is resolved by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Json(Value),
    ServerTimestamp,
}

/// Field set for a write, in stable key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteFields(BTreeMap<String, FieldValue>);

impl WriteFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), FieldValue::Json(value.into()));
        self
    }

    /// Skips the field entirely when `value` is `None`, so an absent input
    /// never overwrites a stored value.
    pub fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn with_server_timestamp(mut self, key: &str) -> Self {
        self.0.insert(key.to_string(), FieldValue::ServerTimestamp);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Materializes the fields, resolving timestamp sentinels with `now`.
    pub fn resolve(&self, now: i64) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(key, value)| {
                let resolved = match value {
                    FieldValue::Json(value) => value.clone(),
                    FieldValue::ServerTimestamp => Value::from(now),
                };
                (key.clone(), resolved)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub merge: bool,
}

impl SetOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Ordering, inclusive string range and cap for collection reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub order_by: Option<OrderBy>,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn order_by(field: &str, direction: Direction) -> Self {
        Self {
            order_by: Some(OrderBy {
                field: field.to_string(),
                direction,
            }),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Prefix range over the ordered field. Requires `order_by`.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.start_at = Some(prefix.to_string());
        self.end_at = Some(format!("{}\u{f8ff}", prefix));
        self
    }
}

/// One operation inside an all-or-none batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set {
        path: String,
        fields: WriteFields,
        options: SetOptions,
    },
    Update {
        path: String,
        fields: WriteFields,
    },
    Delete {
        path: String,
    },
}

impl BatchOp {
    pub fn path(&self) -> &str {
        match self {
            BatchOp::Set { path, .. } | BatchOp::Update { path, .. } | BatchOp::Delete { path } => {
                path
            }
        }
    }
}

/// Live stream of full-collection snapshots.
///
/// Each item replaces the previous one entirely. Dropping the stream or
/// calling [`SnapshotStream::cancel`] stops the listener.
pub struct SnapshotStream {
    receiver: mpsc::Receiver<StoreResult<Vec<Document>>>,
    listener: Option<JoinHandle<()>>,
}

impl SnapshotStream {
    pub fn new(
        receiver: mpsc::Receiver<StoreResult<Vec<Document>>>,
        listener: Option<JoinHandle<()>>,
    ) -> Self {
        Self { receiver, listener }
    }

    pub async fn next(&mut self) -> Option<StoreResult<Vec<Document>>> {
        self.receiver.recv().await
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.receiver.close();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Contract of the hosted document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn subscribe(&self, collection: &str, query: Query) -> StoreResult<SnapshotStream>;

    async fn get(&self, path: &str) -> StoreResult<Option<Document>>;

    async fn query(&self, collection: &str, query: Query) -> StoreResult<Vec<Document>>;

    async fn set(&self, path: &str, fields: WriteFields, options: SetOptions) -> StoreResult<()>;

    /// Creates a document with a store-generated id and returns the id.
    async fn add(&self, collection: &str, fields: WriteFields) -> StoreResult<String>;

    /// Overlays `fields` onto an existing document; fails if it is missing.
    async fn update(&self, path: &str, fields: WriteFields) -> StoreResult<()>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Applies every op or none of them.
    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()>;
}

pub mod paths {
    pub fn user(uid: &str) -> String {
        format!("users/{}", uid)
    }

    pub fn users() -> String {
        "users".to_string()
    }

    pub fn books(uid: &str) -> String {
        format!("users/{}/books", uid)
    }

    pub fn book(uid: &str, book_id: &str) -> String {
        format!("users/{}/books/{}", uid, book_id)
    }

    pub fn logs(uid: &str) -> String {
        format!("users/{}/logs", uid)
    }

    pub fn log(uid: &str, log_id: &str) -> String {
        format!("users/{}/logs/{}", uid, log_id)
    }

    pub fn following(uid: &str) -> String {
        format!("users/{}/following", uid)
    }

    pub fn followers(uid: &str) -> String {
        format!("users/{}/followers", uid)
    }

    pub fn following_edge(uid: &str, target: &str) -> String {
        format!("users/{}/following/{}", uid, target)
    }

    pub fn follower_edge(uid: &str, follower: &str) -> String {
        format!("users/{}/followers/{}", uid, follower)
    }
}

/// Splits a document path into (collection path, document id).
pub(crate) fn split_doc_path(path: &str) -> StoreResult<(&str, &str)> {
    let segments = path.split('/').collect::<Vec<_>>();
    if segments.len() < 2 || segments.len() % 2 != 0 || segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let split = path
        .rfind('/')
        .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
    Ok((&path[..split], &path[split + 1..]))
}

pub(crate) fn check_collection_path(path: &str) -> StoreResult<()> {
    let segments = path.split('/').collect::<Vec<_>>();
    if segments.len() % 2 != 1 || segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_paths_split_into_collection_and_id() {
        let (collection, id) = split_doc_path("users/u1/books/b1").expect("valid path");
        assert_eq!(collection, "users/u1/books");
        assert_eq!(id, "b1");
        assert!(split_doc_path("users/u1/books").is_err());
        assert!(split_doc_path("users//books/b1").is_err());
        assert!(check_collection_path("users/u1/logs").is_ok());
        assert!(check_collection_path("users/u1").is_err());
    }

    #[test]
    fn optional_fields_are_skipped_and_timestamps_resolved() {
        let fields = WriteFields::new()
            .with("title", "T")
            .with_opt::<String>("memo", None)
            .with_server_timestamp("updatedAt");
        assert!(!fields.contains("memo"));

        let resolved = fields.resolve(42);
        assert_eq!(resolved.get("title"), Some(&Value::from("T")));
        assert_eq!(resolved.get("updatedAt"), Some(&Value::from(42)));
    }

    #[test]
    fn prefix_query_closes_range_with_high_sentinel() {
        let query = Query::order_by("handleLower", Direction::Asc).prefix("ab").limit(3);
        assert_eq!(query.start_at.as_deref(), Some("ab"));
        assert_eq!(query.end_at.as_deref(), Some("ab\u{f8ff}"));
        assert_eq!(query.limit, Some(3));
    }
}
