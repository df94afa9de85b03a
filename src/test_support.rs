//! Store wrappers and polling helpers shared by the async tests.

use crate::error::StoreError;
use crate::store::{
    BatchOp, Document, DocumentStore, Query, SetOptions, SnapshotStream, SqliteStore, StoreResult,
    WriteFields,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Delegates to an in-memory [`SqliteStore`] but fails reads or writes whose
/// path contains one of the configured fragments.
pub(crate) struct FaultyStore {
    inner: SqliteStore,
    failing_writes: Mutex<Vec<String>>,
    failing_reads: Mutex<Vec<String>>,
    read_delay: Mutex<Option<(String, Duration)>>,
    batch_delay: Mutex<Option<Duration>>,
    write_failures: AtomicUsize,
    writes: AtomicUsize,
}

impl FaultyStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::open_in_memory().expect("in-memory store"),
            failing_writes: Mutex::new(Vec::new()),
            failing_reads: Mutex::new(Vec::new()),
            read_delay: Mutex::new(None),
            batch_delay: Mutex::new(None),
            write_failures: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub(crate) fn fail_writes_matching(&self, fragment: &str) {
        self.failing_writes.lock().expect("lock").push(fragment.to_string());
    }

    pub(crate) fn fail_reads_matching(&self, fragment: &str) {
        self.failing_reads.lock().expect("lock").push(fragment.to_string());
    }

    pub(crate) fn delay_reads_matching(&self, fragment: &str, delay: Duration) {
        *self.read_delay.lock().expect("lock") = Some((fragment.to_string(), delay));
    }

    /// Fails the next `count` writes whatever their path.
    pub(crate) fn fail_next_writes(&self, count: usize) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    /// Holds every batch for `delay` before it is checked and applied.
    pub(crate) fn delay_batches(&self, delay: Duration) {
        *self.batch_delay.lock().expect("lock") = Some(delay);
    }

    pub(crate) fn heal(&self) {
        self.failing_writes.lock().expect("lock").clear();
        self.failing_reads.lock().expect("lock").clear();
        *self.read_delay.lock().expect("lock") = None;
        *self.batch_delay.lock().expect("lock") = None;
        self.write_failures.store(0, Ordering::SeqCst);
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self, path: &str) -> StoreResult<()> {
        let budgeted = self
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if budgeted {
            return Err(StoreError::Backend(format!("injected failure: {}", path)));
        }
        let failing = self.failing_writes.lock().expect("lock");
        if failing.iter().any(|fragment| path.contains(fragment.as_str())) {
            return Err(StoreError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    async fn check_read(&self, path: &str) -> StoreResult<()> {
        let delay = self
            .read_delay
            .lock()
            .expect("lock")
            .clone()
            .filter(|(fragment, _)| path.contains(fragment.as_str()))
            .map(|(_, delay)| delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing_reads.lock().expect("lock");
        if failing.iter().any(|fragment| path.contains(fragment.as_str())) {
            return Err(StoreError::Backend(format!("unreachable: {}", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn subscribe(&self, collection: &str, query: Query) -> StoreResult<SnapshotStream> {
        self.check_read(collection).await?;
        self.inner.subscribe(collection, query).await
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Document>> {
        self.check_read(path).await?;
        self.inner.get(path).await
    }

    async fn query(&self, collection: &str, query: Query) -> StoreResult<Vec<Document>> {
        self.check_read(collection).await?;
        self.inner.query(collection, query).await
    }

    async fn set(&self, path: &str, fields: WriteFields, options: SetOptions) -> StoreResult<()> {
        self.check_write(path)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(path, fields, options).await
    }

    async fn add(&self, collection: &str, fields: WriteFields) -> StoreResult<String> {
        self.check_write(collection)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.add(collection, fields).await
    }

    async fn update(&self, path: &str, fields: WriteFields) -> StoreResult<()> {
        self.check_write(path)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(path, fields).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.check_write(path)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(path).await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        let delay = *self.batch_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        for op in &ops {
            self.check_write(op.path())?;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.batch(ops).await
    }
}

/// Polls `condition` until it holds or a second passes.
pub(crate) async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
