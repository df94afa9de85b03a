//! Debounced, case-insensitive handle prefix search.
//!
//! Every call bumps a generation counter. Only the newest generation may
//! issue its query after the debounce, and only the newest may publish
//! results; older calls return without touching the state.

use crate::config::ShelfConfig;
use crate::models::ProfileSummary;
use crate::remote::RemotePolicy;
use crate::store::{paths, Direction, DocumentStore, Query};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchState {
    pub query: String,
    pub results: Vec<ProfileSummary>,
    pub loading: bool,
}

pub struct HandleSearch {
    store: Arc<dyn DocumentStore>,
    remote: RemotePolicy,
    debounce: Duration,
    min_chars: usize,
    max_results: usize,
    generation: AtomicU64,
    state: RwLock<SearchState>,
    version: watch::Sender<u64>,
}

pub fn normalize_query(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl HandleSearch {
    pub fn new(store: Arc<dyn DocumentStore>, remote: RemotePolicy, config: &ShelfConfig) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            store,
            remote,
            debounce: config.search_debounce(),
            min_chars: config.search_min_chars,
            max_results: config.search_max_results,
            generation: AtomicU64::new(0),
            state: RwLock::new(SearchState::default()),
            version,
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Runs one keystroke's worth of search. Returns the published results,
    /// or `None` when a later call superseded this one.
    pub async fn search(&self, viewer_id: &str, raw: &str) -> Option<Vec<ProfileSummary>> {
        let normalized = normalize_query(raw);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if normalized.chars().count() < self.min_chars {
            self.publish(SearchState {
                query: normalized,
                results: Vec::new(),
                loading: false,
            });
            return Some(Vec::new());
        }

        self.publish(SearchState {
            query: normalized.clone(),
            results: self.state().results,
            loading: true,
        });

        tokio::time::sleep(self.debounce).await;
        if !self.is_current(generation) {
            log::debug!("search \"{}\" superseded before query", normalized);
            return None;
        }

        let results = match self.fetch(viewer_id, &normalized).await {
            Ok(results) => results,
            Err(err) => {
                log::warn!("handle search \"{}\" failed: {}", normalized, err);
                Vec::new()
            }
        };

        if !self.is_current(generation) {
            log::debug!("discarding results of superseded search \"{}\"", normalized);
            return None;
        }
        self.publish(SearchState {
            query: normalized,
            results: results.clone(),
            loading: false,
        });
        Some(results)
    }

    /// Empties the result list and invalidates any search in flight.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.publish(SearchState::default());
    }

    async fn fetch(
        &self,
        viewer_id: &str,
        normalized: &str,
    ) -> crate::error::ShelfResult<Vec<ProfileSummary>> {
        let users = paths::users();
        // one spare row so excluding the viewer still fills the list
        let query = Query::order_by("handleLower", Direction::Asc)
            .prefix(normalized)
            .limit(self.max_results + 1);
        let docs = self
            .remote
            .read(|| self.store.query(&users, query.clone()))
            .await?;
        Ok(docs
            .iter()
            .map(ProfileSummary::from_document)
            .filter(|profile| profile.handle.to_lowercase().contains(normalized))
            .filter(|profile| profile.id != viewer_id)
            .take(self.max_results)
            .collect())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish(&self, next: SearchState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
        self.version.send_modify(|v| *v += 1);
    }
}
