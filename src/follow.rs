//! Bidirectional follow relation.
//!
//! `following[A→B]` and `followers[B→A]` are always written in one batch.
//! Local membership is updated optimistically; each edge carries a
//! committed/pending/failed status and a failed write restores the previous
//! membership.

use crate::error::{ShelfError, ShelfResult};
use crate::models::ProfileSummary;
use crate::remote::RemotePolicy;
use crate::store::{paths, BatchOp, DocumentStore, Query, SetOptions, SnapshotStream, WriteFields};
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStatus {
    Committed,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeState {
    pub following: bool,
    pub status: EdgeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowTab {
    Following,
    Followers,
}

#[derive(Debug, Clone, Default)]
pub struct FollowSnapshot {
    pub user_id: Option<String>,
    pub following_ids: Vec<String>,
    pub follower_ids: Vec<String>,
    edges: HashMap<String, (EdgeState, u64)>,
}

impl FollowSnapshot {
    pub fn following_count(&self) -> usize {
        self.following_ids.len()
    }

    pub fn follower_count(&self) -> usize {
        self.follower_ids.len()
    }

    /// Membership as the user should see it: local overlay first, then store.
    pub fn is_following(&self, target: &str) -> bool {
        match self.edges.get(target) {
            Some((edge, _)) => edge.following,
            None => self.following_ids.iter().any(|id| id == target),
        }
    }

    pub fn edge(&self, target: &str) -> EdgeState {
        match self.edges.get(target) {
            Some((edge, _)) => *edge,
            None => EdgeState {
                following: self.following_ids.iter().any(|id| id == target),
                status: EdgeStatus::Committed,
            },
        }
    }
}

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
        log::info!("follow listeners stopped uid={}", self.user_id);
    }
}

pub struct FollowGraph {
    store: Arc<dyn DocumentStore>,
    remote: RemotePolicy,
    state: Arc<RwLock<FollowSnapshot>>,
    listener: Mutex<Option<Listener>>,
    follow_ids: watch::Sender<Vec<String>>,
    version: watch::Sender<u64>,
    toggles: std::sync::atomic::AtomicU64,
}

impl FollowGraph {
    pub fn new(store: Arc<dyn DocumentStore>, remote: RemotePolicy) -> Self {
        let (follow_ids, _) = watch::channel(Vec::new());
        let (version, _) = watch::channel(0);
        Self {
            store,
            remote,
            state: Arc::new(RwLock::new(FollowSnapshot::default())),
            listener: Mutex::new(None),
            follow_ids,
            version,
            toggles: std::sync::atomic::AtomicU64::new(0),
        }
    }

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
        self.reset(Some(user_id));

        let (following, followers) = match self.open_streams(user_id).await {
            Ok(streams) => streams,
            Err(err) => {
                log::warn!("follow subscribe failed uid={}: {}", user_id, err);
                self.reset(None);
                return Err(err);
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let tasks = vec![
            self.spawn_pump(following, user_id, alive.clone(), FollowTab::Following),
            self.spawn_pump(followers, user_id, alive.clone(), FollowTab::Followers),
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
        log::info!("follow listeners started uid={}", user_id);
        Ok(())
    }

    async fn open_streams(&self, user_id: &str) -> ShelfResult<(SnapshotStream, SnapshotStream)> {
        let following = self
            .remote
            .write(self.store.subscribe(&paths::following(user_id), Query::all()))
            .await?;
        let followers = self
            .remote
            .write(self.store.subscribe(&paths::followers(user_id), Query::all()))
            .await?;
        Ok((following, followers))
    }

    pub fn unsubscribe(&self) {
        if let Some(listener) = self.lock_listener().take() {
            listener.teardown();
        }
        self.reset(None);
    }

    fn reset(&self, user_id: Option<&str>) {
        if let Ok(mut state) = self.state.write() {
            *state = FollowSnapshot {
                user_id: user_id.map(str::to_string),
                ..FollowSnapshot::default()
            };
        }
        self.follow_ids.send_if_modified(|ids| {
            let changed = !ids.is_empty();
            ids.clear();
            changed
        });
        self.version.send_modify(|v| *v += 1);
    }

    fn spawn_pump(
        &self,
        mut stream: SnapshotStream,
        user_id: &str,
        alive: Arc<AtomicBool>,
        tab: FollowTab,
    ) -> JoinHandle<()> {
        let state = self.state.clone();
        let follow_ids = self.follow_ids.clone();
        let version = self.version.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let ids = match result {
                    Ok(docs) => docs.into_iter().map(|doc| doc.id).collect::<Vec<_>>(),
                    Err(err) => {
                        log::warn!("follow snapshot error uid={}: {}", user_id, err);
                        continue;
                    }
                };
                {
                    let Ok(mut state) = state.write() else {
                        break;
                    };
                    if state.user_id.as_deref() != Some(user_id.as_str()) {
                        break;
                    }
                    match tab {
                        FollowTab::Following => {
                            state.following_ids = ids.clone();
                            // the store is authoritative for every settled edge
                            state
                                .edges
                                .retain(|_, (edge, _)| edge.status == EdgeStatus::Pending);
                        }
                        FollowTab::Followers => state.follower_ids = ids.clone(),
                    }
                }
                if tab == FollowTab::Following {
                    follow_ids.send_if_modified(|current| {
                        if *current == ids {
                            return false;
                        }
                        *current = ids;
                        true
                    });
                }
                version.send_modify(|v| *v += 1);
            }
            stream.cancel();
        })
    }

    pub fn snapshot(&self) -> FollowSnapshot {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn is_following(&self, target: &str) -> bool {
        self.snapshot().is_following(target)
    }

    /// Committed follow set, updated on every `following` snapshot.
    pub fn follow_ids(&self) -> watch::Receiver<Vec<String>> {
        self.follow_ids.subscribe()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub async fn toggle_follow(&self, target_id: &str, should_follow: bool) -> ShelfResult<()> {
        let uid = self
            .snapshot()
            .user_id
            .ok_or(ShelfError::NotSignedIn)?;
        if target_id == uid {
            log::warn!("rejected self-follow uid={}", uid);
            return Err(ShelfError::SelfFollow);
        }

        let seq = self.toggles.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.set_edge(&uid, target_id, should_follow, EdgeStatus::Pending, seq, None);

        let following_path = paths::following_edge(&uid, target_id);
        let follower_path = paths::follower_edge(target_id, &uid);
        let ops = if should_follow {
            vec![
                BatchOp::Set {
                    path: following_path,
                    fields: WriteFields::new().with_server_timestamp("createdAt"),
                    options: SetOptions::default(),
                },
                BatchOp::Set {
                    path: follower_path,
                    fields: WriteFields::new().with_server_timestamp("createdAt"),
                    options: SetOptions::default(),
                },
            ]
        } else {
            vec![
                BatchOp::Delete {
                    path: following_path,
                },
                BatchOp::Delete {
                    path: follower_path,
                },
            ]
        };

        match self.remote.write(self.store.batch(ops)).await {
            Ok(()) => {
                self.set_edge(&uid, target_id, should_follow, EdgeStatus::Committed, seq, Some(seq));
                log::info!(
                    "{} uid={} target={}",
                    if should_follow { "followed" } else { "unfollowed" },
                    uid,
                    target_id
                );
                Ok(())
            }
            Err(err) => {
                let restored = previous.unwrap_or(!should_follow);
                self.set_edge(&uid, target_id, restored, EdgeStatus::Failed, seq, Some(seq));
                log::warn!(
                    "follow write failed uid={} target={}, reverted to {}: {}",
                    uid,
                    target_id,
                    restored,
                    err
                );
                Err(err)
            }
        }
    }

    /// Writes the overlay edge and returns the membership it replaced.
    /// With `only_if`, the write is skipped when a newer toggle owns the edge.
    fn set_edge(
        &self,
        uid: &str,
        target: &str,
        following: bool,
        status: EdgeStatus,
        seq: u64,
        only_if: Option<u64>,
    ) -> Option<bool> {
        let previous = {
            let Ok(mut state) = self.state.write() else {
                return None;
            };
            if state.user_id.as_deref() != Some(uid) {
                return None;
            }
            if let Some(expected) = only_if {
                let owner = state.edges.get(target).map(|(_, owner)| *owner);
                if owner.is_some_and(|owner| owner != expected) {
                    return None;
                }
            }
            let previous = state.is_following(target);
            state
                .edges
                .insert(target.to_string(), (EdgeState { following, status }, seq));
            previous
        };
        self.version.send_modify(|v| *v += 1);
        Some(previous)
    }

    /// Profiles behind the viewer's following/followers list, fetched
    /// concurrently. Users without a profile document are left out.
    pub async fn load_follow_list(&self, tab: FollowTab) -> ShelfResult<Vec<ProfileSummary>> {
        let uid = self
            .snapshot()
            .user_id
            .ok_or(ShelfError::NotSignedIn)?;
        let collection = match tab {
            FollowTab::Following => paths::following(&uid),
            FollowTab::Followers => paths::followers(&uid),
        };
        let ids = self
            .remote
            .read(|| self.store.query(&collection, Query::all()))
            .await?
            .into_iter()
            .map(|doc| doc.id)
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let docs = try_join_all(ids.iter().map(|id| {
            let path = paths::user(id);
            async move { self.remote.read(|| self.store.get(&path)).await }
        }))
        .await?;

        Ok(docs
            .into_iter()
            .flatten()
            .map(|doc| ProfileSummary::from_document(&doc))
            .collect())
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for FollowGraph {
    fn drop(&mut self) {
        if let Some(listener) = self.lock_listener().take() {
            listener.teardown();
        }
    }
}
