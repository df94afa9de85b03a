//! Live mirror of the signed-in user's shelf and activity log.
//!
//! `subscribe` opens two listeners (books by `updatedAt` desc, logs by
//! `createdAt` desc). Every snapshot fully replaces the cached list, so the
//! cache converges on the store's order at the next delivery no matter what
//! optimistic edits were applied in between.

use crate::config::sync_debug_enabled;
use crate::cover::generate_text_cover;
use crate::error::{ShelfError, ShelfResult, ValidationError};
use crate::events::{EventRecorder, LogEvent};
use crate::models::{date_string, Book, BookInput, BookPatch, LogAction, LogEntry};
use crate::remote::RemotePolicy;
use crate::store::{paths, Direction, Document, DocumentStore, Query, SnapshotStream, WriteFields};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct LibrarySnapshot {
    pub user_id: Option<String>,
    pub books: Vec<Book>,
    pub logs: Vec<LogEntry>,
    pub books_loaded: bool,
    pub logs_loaded: bool,
}

#[derive(Default)]
struct LibraryState {
    snapshot: LibrarySnapshot,
    removing: HashSet<String>,
}

/// Live listeners for one user. Torn down exactly once via `Option::take`.
struct Listener {
    user_id: String,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    fn teardown(self) {
        self.alive.store(false, Ordering::SeqCst);
        for task in self.tasks {
            task.abort();
        }
        log::info!("library listeners stopped uid={}", self.user_id);
    }
}

pub struct Library {
    store: Arc<dyn DocumentStore>,
    recorder: Arc<dyn EventRecorder>,
    remote: RemotePolicy,
    state: Arc<RwLock<LibraryState>>,
    listener: Mutex<Option<Listener>>,
    version: watch::Sender<u64>,
}

impl Library {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        recorder: Arc<dyn EventRecorder>,
        remote: RemotePolicy,
    ) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            store,
            recorder,
            remote,
            state: Arc::new(RwLock::new(LibraryState::default())),
            listener: Mutex::new(None),
            version,
        }
    }

    /// Starts mirroring `user_id`'s collections. A repeat call for the active
    /// user is a no-op; a different user tears the old listeners down first
    /// and starts from an empty cache.
    pub async fn subscribe(&self, user_id: &str) -> ShelfResult<()> {
        {
            let mut listener = self.lock_listener();
            if listener.as_ref().map(|l| l.user_id.as_str()) == Some(user_id) {
                return Ok(());
            }
            if let Some(previous) = listener.take() {
                previous.teardown();
            }
        }
        self.replace_snapshot(LibrarySnapshot {
            user_id: Some(user_id.to_string()),
            ..LibrarySnapshot::default()
        });

        let (books, logs) = match self.open_streams(user_id).await {
            Ok(streams) => streams,
            Err(err) => {
                log::warn!("library subscribe failed uid={}: {}", user_id, err);
                self.replace_snapshot(LibrarySnapshot::default());
                return Err(err);
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let tasks = vec![
            self.spawn_pump(books, user_id, alive.clone(), apply_books),
            self.spawn_pump(logs, user_id, alive.clone(), apply_logs),
        ];

        let mut listener = self.lock_listener();
        if let Some(raced) = listener.take() {
            raced.teardown();
        }
        *listener = Some(Listener {
            user_id: user_id.to_string(),
            alive,
            tasks,
        });
        log::info!("library listeners started uid={}", user_id);
        Ok(())
    }

    async fn open_streams(&self, user_id: &str) -> ShelfResult<(SnapshotStream, SnapshotStream)> {
        let books = self
            .remote
            .write(self.store.subscribe(
                &paths::books(user_id),
                Query::order_by("updatedAt", Direction::Desc),
            ))
            .await?;
        let logs = self
            .remote
            .write(self.store.subscribe(
                &paths::logs(user_id),
                Query::order_by("createdAt", Direction::Desc),
            ))
            .await?;
        Ok((books, logs))
    }

    /// Stops the listeners (if any) and clears the cache.
    pub fn unsubscribe(&self) {
        if let Some(listener) = self.lock_listener().take() {
            listener.teardown();
        }
        self.replace_snapshot(LibrarySnapshot::default());
    }

    fn spawn_pump(
        &self,
        mut stream: SnapshotStream,
        user_id: &str,
        alive: Arc<AtomicBool>,
        apply: fn(&mut LibrarySnapshot, &[Document]),
    ) -> JoinHandle<()> {
        let state = self.state.clone();
        let version = self.version.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let docs = match result {
                    Ok(docs) => docs,
                    Err(err) => {
                        log::warn!("library snapshot error uid={}: {}", user_id, err);
                        continue;
                    }
                };
                {
                    let Ok(mut state) = state.write() else {
                        break;
                    };
                    if state.snapshot.user_id.as_deref() != Some(user_id.as_str()) {
                        break;
                    }
                    apply(&mut state.snapshot, &docs);
                }
                version.send_modify(|v| *v += 1);
                if sync_debug_enabled() {
                    log::debug!("[sync-debug] library snapshot uid={} docs={}", user_id, docs.len());
                }
            }
            stream.cancel();
        })
    }

    pub fn snapshot(&self) -> LibrarySnapshot {
        self.read_state(|state| state.snapshot.clone())
    }

    pub fn books(&self) -> Vec<Book> {
        self.read_state(|state| state.snapshot.books.clone())
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.read_state(|state| state.snapshot.logs.clone())
    }

    pub fn book(&self, id: &str) -> Option<Book> {
        self.read_state(|state| state.snapshot.books.iter().find(|b| b.id == id).cloned())
    }

    pub fn user_id(&self) -> Option<String> {
        self.read_state(|state| state.snapshot.user_id.clone())
    }

    /// Bumped after every cache change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub async fn add_book(&self, input: BookInput) -> ShelfResult<String> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(ValidationError::EmptyTitle.into());
        }
        let uid = self.require_user()?;
        let author = input.author.trim().to_string();
        let status_key = input.status_key.unwrap_or_default();
        let image_url = non_empty(input.image_url);
        let fallback_cover_svg = match image_url {
            Some(_) => None,
            None => Some(generate_text_cover(&title, &author)),
        };
        let category = non_empty(input.category);
        let publisher = non_empty(input.publisher);
        let year = non_empty(input.year);
        let volume = non_empty(input.volume);
        let tags = non_empty(input.tags);
        let memo = non_empty(input.memo);

        let fields = WriteFields::new()
            .with("title", title.as_str())
            .with("author", author.as_str())
            .with("statusKey", status_key.as_str())
            .with("status", status_key.label())
            .with_server_timestamp("updatedAt")
            .with_opt("imageUrl", image_url.clone())
            .with_opt("fallbackCoverSvg", fallback_cover_svg.clone())
            .with_opt("category", category.clone())
            .with_opt("publisher", publisher.clone())
            .with_opt("year", year.clone())
            .with_opt("volume", volume.clone())
            .with_opt("tags", tags.clone())
            .with_opt("memo", memo.clone());

        let id = self
            .remote
            .write(self.store.add(&paths::books(&uid), fields))
            .await?;
        log::info!("book added uid={} id={} title=\"{}\"", uid, id, title);

        let book = Book {
            id: id.clone(),
            title: title.clone(),
            author,
            status: status_key.label().to_string(),
            status_key,
            updated_at: date_string(None),
            image_url,
            fallback_cover_svg,
            category,
            publisher,
            year,
            volume,
            tags,
            memo,
        };
        self.mutate_cache(&uid, |snapshot| {
            if !snapshot.books.iter().any(|b| b.id == book.id) {
                snapshot.books.insert(0, book);
            }
        });

        self.recorder
            .record_event(&uid, LogEvent::new(LogAction::Add, &title, status_key))
            .await;
        Ok(id)
    }

    pub async fn update_book(&self, id: &str, patch: BookPatch) -> ShelfResult<()> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(ValidationError::EmptyTitle.into());
            }
        }
        let uid = self.require_user()?;
        let cached = self.book(id);

        let mut fields = WriteFields::new()
            .with_opt("title", patch.title.as_deref().map(str::trim))
            .with_opt("author", patch.author.clone())
            .with_opt("imageUrl", patch.image_url.clone())
            .with_opt("category", patch.category.clone())
            .with_opt("publisher", patch.publisher.clone())
            .with_opt("year", patch.year.clone())
            .with_opt("volume", patch.volume.clone())
            .with_opt("tags", patch.tags.clone())
            .with_opt("memo", patch.memo.clone())
            .with_server_timestamp("updatedAt");
        if let Some(status_key) = patch.status_key {
            fields = fields
                .with("statusKey", status_key.as_str())
                .with("status", status_key.label());
        }

        self.remote
            .write(self.store.update(&paths::book(&uid, id), fields))
            .await?;
        log::info!("book updated uid={} id={}", uid, id);

        self.mutate_cache(&uid, |snapshot| {
            if let Some(book) = snapshot.books.iter_mut().find(|b| b.id == id) {
                apply_patch(book, &patch);
            }
        });

        let title = patch
            .title
            .as_deref()
            .map(|t| t.trim().to_string())
            .or_else(|| cached.as_ref().map(|b| b.title.clone()))
            .unwrap_or_default();
        let status_key = patch
            .status_key
            .or_else(|| cached.as_ref().map(|b| b.status_key))
            .unwrap_or_default();
        self.recorder
            .record_event(&uid, LogEvent::new(LogAction::Update, &title, status_key))
            .await;
        Ok(())
    }

    /// Deletes unconditionally. A `remove` entry is appended only when this
    /// call is the one that takes the book out of the cache.
    pub async fn remove_book(&self, id: &str) -> ShelfResult<()> {
        let uid = self.require_user()?;
        let claimed = {
            let mut state = self.write_state()?;
            let book = state.snapshot.books.iter().find(|b| b.id == id).cloned();
            match book {
                Some(book) if state.removing.insert(id.to_string()) => Some(book),
                _ => None,
            }
        };

        let result = self
            .remote
            .write(self.store.delete(&paths::book(&uid, id)))
            .await;

        if let Ok(mut state) = self.state.write() {
            state.removing.remove(id);
        }
        result?;
        log::info!("book removed uid={} id={}", uid, id);

        self.mutate_cache(&uid, |snapshot| snapshot.books.retain(|b| b.id != id));

        match claimed {
            Some(book) => {
                self.recorder
                    .record_event(
                        &uid,
                        LogEvent::new(LogAction::Remove, &book.title, book.status_key),
                    )
                    .await;
            }
            None => log::debug!("book {} was not cached, skipping remove log", id),
        }
        Ok(())
    }

    fn require_user(&self) -> ShelfResult<String> {
        self.user_id().ok_or(ShelfError::NotSignedIn)
    }

    fn mutate_cache<F>(&self, uid: &str, mutate: F)
    where
        F: FnOnce(&mut LibrarySnapshot),
    {
        let changed = match self.state.write() {
            Ok(mut state) if state.snapshot.user_id.as_deref() == Some(uid) => {
                mutate(&mut state.snapshot);
                true
            }
            _ => false,
        };
        if changed {
            self.version.send_modify(|v| *v += 1);
        }
    }

    fn replace_snapshot(&self, snapshot: LibrarySnapshot) {
        if let Ok(mut state) = self.state.write() {
            state.snapshot = snapshot;
            state.removing.clear();
        }
        self.version.send_modify(|v| *v += 1);
    }

    fn read_state<T>(&self, read: impl FnOnce(&LibraryState) -> T) -> T
    where
        T: Default,
    {
        match self.state.read() {
            Ok(state) => read(&state),
            Err(_) => T::default(),
        }
    }

    fn write_state(&self) -> ShelfResult<std::sync::RwLockWriteGuard<'_, LibraryState>> {
        self.state.write().map_err(|_| {
            ShelfError::Store(crate::error::StoreError::Backend(
                "library state lock poisoned".to_string(),
            ))
        })
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if let Some(listener) = self.lock_listener().take() {
            listener.teardown();
        }
    }
}

fn apply_books(snapshot: &mut LibrarySnapshot, docs: &[Document]) {
    snapshot.books = docs
        .iter()
        .filter_map(|doc| match Book::from_document(doc) {
            Ok(book) => Some(book),
            Err(err) => {
                log::warn!("skipping malformed book {}: {}", doc.id, err);
                None
            }
        })
        .collect();
    snapshot.books_loaded = true;
}

fn apply_logs(snapshot: &mut LibrarySnapshot, docs: &[Document]) {
    snapshot.logs = docs
        .iter()
        .filter_map(|doc| match LogEntry::from_document(doc) {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::warn!("skipping malformed log {}: {}", doc.id, err);
                None
            }
        })
        .collect();
    snapshot.logs_loaded = true;
}

fn apply_patch(book: &mut Book, patch: &BookPatch) {
    if let Some(title) = &patch.title {
        book.title = title.trim().to_string();
    }
    if let Some(author) = &patch.author {
        book.author = author.clone();
    }
    if let Some(status_key) = patch.status_key {
        book.status_key = status_key;
        book.status = status_key.label().to_string();
    }
    let optional = [
        (&patch.image_url, &mut book.image_url),
        (&patch.category, &mut book.category),
        (&patch.publisher, &mut book.publisher),
        (&patch.year, &mut book.year),
        (&patch.volume, &mut book.volume),
        (&patch.tags, &mut book.tags),
        (&patch.memo, &mut book.memo),
    ];
    for (value, slot) in optional {
        if let Some(value) = value {
            *slot = Some(value.clone());
        }
    }
    book.updated_at = date_string(None);
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
