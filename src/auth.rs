use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identity issued by the auth provider. Opaque apart from these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
}

impl AuthUser {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            display_name: None,
            email: None,
            photo_url: None,
        }
    }

    /// Name prefilled on onboarding: provider name, else the email local part.
    pub fn suggested_display_name(&self) -> String {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.email
                    .as_deref()
                    .and_then(|email| email.split('@').next())
                    .map(str::to_string)
            })
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current user or `None`; the receiver holds the current state immediately
    /// and is updated on every sign-in/out transition.
    fn on_auth_change(&self) -> watch::Receiver<Option<AuthUser>>;

    fn current_user(&self) -> Option<AuthUser> {
        self.on_auth_change().borrow().clone()
    }

    /// Idempotent.
    async fn sign_out(&self);
}

/// Identity held in process; the host shell feeds it sign-in results.
pub struct LocalIdentity {
    state: watch::Sender<Option<AuthUser>>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn signed_in(user: AuthUser) -> Self {
        let identity = Self::new();
        identity.sign_in(user);
        identity
    }

    pub fn sign_in(&self, user: AuthUser) {
        log::info!("signed in uid={}", user.uid);
        self.state.send_replace(Some(user));
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentity {
    fn on_auth_change(&self) -> watch::Receiver<Option<AuthUser>> {
        self.state.subscribe()
    }

    async fn sign_out(&self) {
        let previous = self.state.send_replace(None);
        if let Some(user) = previous {
            log::info!("signed out uid={}", user.uid);
        }
    }
}
