//! Feed of the followed accounts' reading activity.
//!
//! Each followed user contributes at most `per_user_limit` recent entries;
//! the union is sorted newest first and cut to `window`. This is a merge of
//! independently capped streams, so one very active account can push a
//! quieter one out of the window.

use crate::config::{sync_debug_enabled, ShelfConfig};
use crate::error::ShelfResult;
use crate::models::{BookStatusKey, LogEntry, ProfileSummary};
use crate::remote::RemotePolicy;
use crate::store::{paths, Direction, DocumentStore, Query};
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimelineFilter {
    #[default]
    All,
    Reading,
    Done,
}

impl TimelineFilter {
    pub fn matches(self, entry: &LogEntry) -> bool {
        match self {
            TimelineFilter::All => true,
            TimelineFilter::Reading => entry.status_key == Some(BookStatusKey::Reading),
            TimelineFilter::Done => entry.status_key == Some(BookStatusKey::Done),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimelineSnapshot {
    pub viewer: Option<String>,
    pub follow_ids: Vec<String>,
    pub entries: Vec<LogEntry>,
    pub profiles: HashMap<String, ProfileSummary>,
    pub loading: bool,
    liked: HashSet<String>,
}

impl TimelineSnapshot {
    pub fn is_liked(&self, entry_id: &str) -> bool {
        self.liked.contains(entry_id)
    }

    /// Entries passing `filter`, with local likes folded into `like_count`.
    pub fn visible(&self, filter: TimelineFilter) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .map(|entry| {
                let mut entry = entry.clone();
                if self.liked.contains(&entry.id) {
                    entry.like_count += 1;
                }
                entry
            })
            .collect()
    }

    pub fn author(&self, entry: &LogEntry) -> Option<&ProfileSummary> {
        entry
            .user_id
            .as_deref()
            .and_then(|user_id| self.profiles.get(user_id))
    }
}

pub struct TimelineFeed {
    store: Arc<dyn DocumentStore>,
    remote: RemotePolicy,
    per_user_limit: usize,
    window: usize,
    state: RwLock<TimelineSnapshot>,
    generation: AtomicU64,
    version: watch::Sender<u64>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl TimelineFeed {
    pub fn new(store: Arc<dyn DocumentStore>, remote: RemotePolicy, config: &ShelfConfig) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            store,
            remote,
            per_user_limit: config.timeline_per_user_limit,
            window: config.timeline_window,
            state: RwLock::new(TimelineSnapshot::default()),
            generation: AtomicU64::new(0),
            version,
            watcher: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn entries(&self, filter: TimelineFilter) -> Vec<LogEntry> {
        self.snapshot().visible(filter)
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Recomputes the whole feed for `viewer` and `follow_ids`. A run that
    /// has been overtaken by a later call leaves the state untouched.
    pub async fn refresh(&self, viewer: Option<&str>, follow_ids: Vec<String>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update(|state| {
            state.viewer = viewer.map(str::to_string);
            state.follow_ids = follow_ids.clone();
            state.loading = viewer.is_some() && !follow_ids.is_empty();
        });

        if viewer.is_none() || follow_ids.is_empty() {
            self.update(|state| {
                state.entries.clear();
                state.profiles.clear();
            });
            return;
        }

        let (entries, profiles) = futures::join!(
            self.fetch_merged(&follow_ids),
            self.load_profiles(&follow_ids)
        );

        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("discarding superseded timeline run generation={}", generation);
            return;
        }

        let entries = entries.unwrap_or_else(|err| {
            log::warn!(
                "timeline fan-out failed for {} users, showing empty feed: {}",
                follow_ids.len(),
                err
            );
            Vec::new()
        });
        if sync_debug_enabled() {
            log::info!(
                "[sync-debug] timeline generation={} users={} entries={} profiles={}",
                generation,
                follow_ids.len(),
                entries.len(),
                profiles.len()
            );
        }
        self.update(|state| {
            state.entries = entries;
            state.profiles = profiles;
            state.loading = false;
        });
    }

    /// Fan-out over every followed user's log, then merge newest first.
    /// Any single failure fails the whole merge.
    pub async fn fetch_merged(&self, follow_ids: &[String]) -> ShelfResult<Vec<LogEntry>> {
        let per_user = try_join_all(follow_ids.iter().map(|user_id| {
            let collection = paths::logs(user_id);
            let query = Query::order_by("createdAt", Direction::Desc).limit(self.per_user_limit);
            async move {
                let docs = self
                    .remote
                    .read(|| self.store.query(&collection, query.clone()))
                    .await?;
                Ok::<_, crate::error::ShelfError>(
                    docs.iter()
                        .filter_map(|doc| match LogEntry::from_document(doc) {
                            Ok(mut entry) => {
                                if entry.user_id.is_none() {
                                    entry.user_id = Some(user_id.clone());
                                }
                                Some(entry)
                            }
                            Err(err) => {
                                log::warn!("skipping unreadable log {}: {}", doc.id, err);
                                None
                            }
                        })
                        .collect::<Vec<_>>(),
                )
            }
        }))
        .await?;

        let mut merged: Vec<LogEntry> = per_user.into_iter().flatten().collect();
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        merged.truncate(self.window);
        Ok(merged)
    }

    /// Author profiles by user id. Missing profiles are skipped; any failed
    /// read leaves the map empty.
    async fn load_profiles(&self, follow_ids: &[String]) -> HashMap<String, ProfileSummary> {
        let fetched = try_join_all(follow_ids.iter().map(|user_id| {
            let path = paths::user(user_id);
            async move { self.remote.read(|| self.store.get(&path)).await }
        }))
        .await;
        match fetched {
            Ok(docs) => docs
                .into_iter()
                .flatten()
                .map(|doc| (doc.id.clone(), ProfileSummary::from_document(&doc)))
                .collect(),
            Err(err) => {
                log::warn!("timeline profile load failed: {}", err);
                HashMap::new()
            }
        }
    }

    /// Flips the local like on an entry. Likes are never persisted.
    pub fn toggle_like(&self, entry_id: &str) -> bool {
        let mut liked = false;
        self.update(|state| {
            if !state.liked.remove(entry_id) {
                state.liked.insert(entry_id.to_string());
                liked = true;
            }
        });
        liked
    }

    /// Re-runs the feed every time the follow set changes, until `detach`
    /// or the next `attach`.
    pub fn attach(self: &Arc<Self>, viewer: &str, mut follow_ids: watch::Receiver<Vec<String>>) {
        let feed = Arc::clone(self);
        let viewer = viewer.to_string();
        let task = tokio::spawn(async move {
            loop {
                let ids = follow_ids.borrow_and_update().clone();
                feed.refresh(Some(&viewer), ids).await;
                if follow_ids.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.lock_watcher().replace(task) {
            previous.abort();
        }
    }

    pub fn detach(&self) {
        if let Some(task) = self.lock_watcher().take() {
            task.abort();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.update(|state| *state = TimelineSnapshot::default());
    }

    fn update<F: FnOnce(&mut TimelineSnapshot)>(&self, apply: F) {
        if let Ok(mut state) = self.state.write() {
            apply(&mut state);
        }
        self.version.send_modify(|v| *v += 1);
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TimelineFeed {
    fn drop(&mut self) {
        if let Some(task) = self.lock_watcher().take() {
            task.abort();
        }
    }
}

/// Compact elapsed time shown beside feed entries.
pub fn format_relative_time(created_at: i64, now: i64) -> String {
    if created_at <= 0 {
        return "たった今".to_string();
    }
    let minutes = (now - created_at).div_euclid(60_000);
    if minutes < 1 {
        return "たった今".to_string();
    }
    if minutes < 60 {
        return format!("{}分", minutes);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{}時間", hours);
    }
    format!("{}日", hours / 24)
}
