//! Best-effort side channel for activity log entries.
//!
//! A book write is the primary operation; the log entry that trails it is
//! delivered here. Failures are retried once and then logged and dropped,
//! never surfaced to the caller of the primary write.

use crate::models::{BookStatusKey, LogAction};
use crate::remote::RemotePolicy;
use crate::store::{paths, DocumentStore, SetOptions, WriteFields};
use async_trait::async_trait;
use std::sync::Arc;

const RECORD_ATTEMPTS: u32 = 2;

/// Snapshot of a book change at event time.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub action: LogAction,
    pub title: String,
    pub status_key: BookStatusKey,
}

impl LogEvent {
    pub fn new(action: LogAction, title: &str, status_key: BookStatusKey) -> Self {
        Self {
            action,
            title: title.to_string(),
            status_key,
        }
    }

    pub(crate) fn fields(&self, user_id: &str) -> WriteFields {
        let label = self.status_key.label();
        WriteFields::new()
            .with("title", self.title.as_str())
            .with("status", label)
            .with("statusLabel", label)
            .with("statusKey", self.status_key.as_str())
            .with("action", self.action.as_str())
            .with("message", self.action.message(&self.title, label))
            .with("likeCount", 0)
            .with("userId", user_id)
            .with_server_timestamp("createdAt")
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Returns whether the entry was stored. Never fails the caller.
    async fn record_event(&self, user_id: &str, event: LogEvent) -> bool;
}

/// Appends entries to `users/{uid}/logs` with a client-chosen id, so a retry
/// after an ambiguous failure overwrites instead of duplicating.
pub struct StoreEventRecorder {
    store: Arc<dyn DocumentStore>,
    remote: RemotePolicy,
}

impl StoreEventRecorder {
    pub fn new(store: Arc<dyn DocumentStore>, remote: RemotePolicy) -> Self {
        Self { store, remote }
    }
}

#[async_trait]
impl EventRecorder for StoreEventRecorder {
    async fn record_event(&self, user_id: &str, event: LogEvent) -> bool {
        let log_id = uuid::Uuid::new_v4().simple().to_string();
        let path = paths::log(user_id, &log_id);
        for attempt in 1..=RECORD_ATTEMPTS {
            let result = self
                .remote
                .write(self.store.set(&path, event.fields(user_id), SetOptions::default()))
                .await;
            match result {
                Ok(()) => return true,
                Err(err) => {
                    log::warn!(
                        "log append failed uid={} action={} attempt={}: {}",
                        user_id,
                        event.action.as_str(),
                        attempt,
                        err
                    );
                }
            }
        }
        log::error!(
            "dropping {} log entry for \"{}\" (uid={})",
            event.action.as_str(),
            event.title,
            user_id
        );
        false
    }
}
