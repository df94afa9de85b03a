//! Shelfie core: the reading-library state container, the followed-users
//! timeline and the follow graph, over a pluggable document store.

use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

pub mod auth;
pub mod config;
pub mod cover;
pub mod error;
pub mod events;
pub mod follow;
pub mod library;
pub mod models;
pub mod profile;
pub mod remote;
pub mod search;
pub mod store;
pub mod suggest;
pub mod summary;
pub mod timeline;

#[cfg(test)]
mod test_support;

pub use auth::{AuthUser, IdentityProvider, LocalIdentity};
pub use config::ShelfConfig;
pub use error::{ShelfError, ShelfResult, StoreError, ValidationError};
pub use events::{EventRecorder, LogEvent, StoreEventRecorder};
pub use follow::{EdgeState, EdgeStatus, FollowGraph, FollowTab};
pub use library::{Library, LibrarySnapshot};
pub use models::{Book, BookInput, BookPatch, BookStatusKey, LogAction, LogEntry, Profile, ProfileSummary};
pub use profile::{ProfileEdit, ProfileService};
pub use remote::RemotePolicy;
pub use search::HandleSearch;
pub use store::{DocumentStore, SqliteStore};
pub use suggest::{BookSuggestion, SuggestionClient};
pub use timeline::{TimelineFeed, TimelineFilter};

/// The service graph of one signed-in app instance. Built once at startup
/// and shared by handle; nothing here is a global.
pub struct Shelfie {
    config: ShelfConfig,
    identity: Arc<dyn IdentityProvider>,
    library: Arc<Library>,
    follow: Arc<FollowGraph>,
    timeline: Arc<TimelineFeed>,
    search: Arc<HandleSearch>,
    profiles: Arc<ProfileService>,
    suggestions: Arc<SuggestionClient>,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl Shelfie {
    pub fn new(
        config: ShelfConfig,
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> ShelfResult<Self> {
        let remote = RemotePolicy::from_config(&config);
        let recorder: Arc<dyn EventRecorder> =
            Arc::new(StoreEventRecorder::new(store.clone(), remote));
        Ok(Self {
            library: Arc::new(Library::new(store.clone(), recorder, remote)),
            follow: Arc::new(FollowGraph::new(store.clone(), remote)),
            timeline: Arc::new(TimelineFeed::new(store.clone(), remote, &config)),
            search: Arc::new(HandleSearch::new(store.clone(), remote, &config)),
            profiles: Arc::new(ProfileService::new(store, remote)),
            suggestions: Arc::new(SuggestionClient::new(&config)?),
            identity,
            config,
            session: Mutex::new(None),
        })
    }

    /// Backs the services with the SQLite store at `database_path`, or an
    /// in-memory one when no path is configured.
    pub fn open(config: ShelfConfig, identity: Arc<dyn IdentityProvider>) -> ShelfResult<Self> {
        let store = match config.database_path.as_deref() {
            Some(path) => {
                log::info!("opening shelf store at {}", path.display());
                SqliteStore::open(path)?
            }
            None => {
                log::warn!("no database path configured, using an in-memory store");
                SqliteStore::open_in_memory()?
            }
        };
        Self::new(config, Arc::new(store), identity)
    }

    pub fn config(&self) -> &ShelfConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub fn follow_graph(&self) -> &Arc<FollowGraph> {
        &self.follow
    }

    pub fn timeline(&self) -> &Arc<TimelineFeed> {
        &self.timeline
    }

    pub fn search(&self) -> &Arc<HandleSearch> {
        &self.search
    }

    pub fn profiles(&self) -> &Arc<ProfileService> {
        &self.profiles
    }

    pub fn suggestions(&self) -> &Arc<SuggestionClient> {
        &self.suggestions
    }

    /// Points every per-user service at `user`, or tears them all down.
    pub async fn apply_user(&self, user: Option<&AuthUser>) -> ShelfResult<()> {
        match user {
            Some(user) => {
                self.library.subscribe(&user.uid).await?;
                self.follow.subscribe(&user.uid).await?;
                self.timeline.attach(&user.uid, self.follow.follow_ids());
                self.search.clear();
            }
            None => {
                self.timeline.detach();
                self.follow.unsubscribe();
                self.library.unsubscribe();
                self.search.clear();
            }
        }
        Ok(())
    }

    /// Follows the identity provider for the lifetime of `self`, re-keying
    /// the services on every user-id transition.
    pub fn bind_session(self: &Arc<Self>) {
        let this: Weak<Self> = Arc::downgrade(self);
        let mut changes = self.identity.on_auth_change();
        let task = tokio::spawn(async move {
            let mut bound: Option<String> = None;
            loop {
                let user = changes.borrow_and_update().clone();
                let uid = user.as_ref().map(|user| user.uid.clone());
                if uid != bound {
                    let Some(shelfie) = this.upgrade() else {
                        break;
                    };
                    if uid.is_some() && bound.is_some() {
                        // a direct account switch still drops the old user first
                        let _ = shelfie.apply_user(None).await;
                    }
                    match shelfie.apply_user(user.as_ref()).await {
                        Ok(()) => {
                            log::info!(
                                "session bound to {}",
                                uid.as_deref().unwrap_or("<signed out>")
                            );
                            bound = uid;
                        }
                        Err(err) => {
                            log::error!("failed to bind session: {}", err);
                            let _ = shelfie.apply_user(None).await;
                            bound = None;
                        }
                    }
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.lock_session().replace(task) {
            previous.abort();
        }
    }

    pub async fn sign_out(&self) {
        self.identity.sign_out().await;
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Shelfie {
    fn drop(&mut self) {
        if let Some(task) = self.lock_session().take() {
            task.abort();
        }
        self.timeline.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::eventually;

    fn shelfie_with(identity: Arc<LocalIdentity>) -> Arc<Shelfie> {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        Arc::new(Shelfie::new(ShelfConfig::default(), store, identity).expect("shelfie"))
    }

    #[tokio::test]
    async fn session_follows_sign_in_and_out() {
        let identity = Arc::new(LocalIdentity::new());
        let shelfie = shelfie_with(identity.clone());
        shelfie.bind_session();

        identity.sign_in(AuthUser::new("u1"));
        assert!(eventually(|| shelfie.library().user_id().as_deref() == Some("u1")).await);
        shelfie
            .library()
            .add_book(BookInput::new("T", "A"))
            .await
            .expect("add");
        assert!(eventually(|| shelfie.library().books().len() == 1).await);

        identity.sign_in(AuthUser::new("u2"));
        assert!(eventually(|| shelfie.library().user_id().as_deref() == Some("u2")).await);
        assert!(eventually(|| shelfie.library().books().is_empty()).await);
        assert!(eventually(|| {
            shelfie.follow_graph().snapshot().user_id.as_deref() == Some("u2")
        })
        .await);

        shelfie.sign_out().await;
        assert!(eventually(|| shelfie.library().user_id().is_none()).await);
        assert!(shelfie.follow_graph().snapshot().user_id.is_none());
    }

    #[tokio::test]
    async fn follows_feed_the_timeline() {
        let identity = Arc::new(LocalIdentity::signed_in(AuthUser::new("reader")));
        let shelfie = shelfie_with(identity.clone());

        // another account writes some activity first
        shelfie
            .apply_user(Some(&AuthUser::new("writer")))
            .await
            .expect("bind writer");
        shelfie
            .library()
            .add_book(BookInput::new("夜と霧", "フランクル"))
            .await
            .expect("add");

        shelfie.bind_session();
        assert!(eventually(|| {
            shelfie.follow_graph().snapshot().user_id.as_deref() == Some("reader")
        })
        .await);
        shelfie
            .follow_graph()
            .toggle_follow("writer", true)
            .await
            .expect("follow");

        assert!(eventually(|| shelfie.timeline().entries(TimelineFilter::All).len() == 1).await);
        let entry = &shelfie.timeline().entries(TimelineFilter::All)[0];
        assert_eq!(entry.describe(), "夜と霧を本棚に登録しました。");
    }

    #[tokio::test]
    async fn open_without_path_uses_memory() {
        let shelfie = Shelfie::open(ShelfConfig::default(), Arc::new(LocalIdentity::new()))
            .expect("open");
        assert!(shelfie.library().user_id().is_none());
        assert!(!shelfie.suggestions().is_configured());
    }
}
