use crate::auth::AuthUser;
use crate::error::{ShelfResult, ValidationError};
use crate::models::Profile;
use crate::remote::RemotePolicy;
use crate::store::{paths, DocumentStore, SetOptions, WriteFields};
use regex::Regex;
use std::sync::{Arc, OnceLock};

pub const NAME_MAX: usize = 40;
pub const HANDLE_MIN: usize = 4;
pub const HANDLE_MAX: usize = 16;
pub const PROFILE_MAX: usize = 200;

const FALLBACK_DISPLAY_NAME: &str = "shelfie user";

static HANDLE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn handle_pattern() -> &'static Regex {
    HANDLE_PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static handle pattern"))
}

/// Keeps only `[A-Za-z0-9_]` and caps the result, as the handle field does
/// while the user types.
pub fn sanitize_handle(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(HANDLE_MAX)
        .collect()
}

pub fn validate_handle(handle: &str) -> Result<(), ValidationError> {
    let len = handle.chars().count();
    if !(HANDLE_MIN..=HANDLE_MAX).contains(&len) {
        return Err(ValidationError::HandleLength);
    }
    if !handle_pattern().is_match(handle) {
        return Err(ValidationError::HandleCharset);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileEdit {
    pub display_name: String,
    pub profile_text: String,
    /// Ignored once a handle is saved, unless it tries to change it.
    pub handle: Option<String>,
    pub photo_url: String,
    pub header_url: String,
}

pub struct ProfileService {
    store: Arc<dyn DocumentStore>,
    remote: RemotePolicy,
}

impl ProfileService {
    pub fn new(store: Arc<dyn DocumentStore>, remote: RemotePolicy) -> Self {
        Self { store, remote }
    }

    /// Stored profile, or `None` before onboarding wrote anything.
    pub async fn stored_profile(&self, uid: &str) -> ShelfResult<Option<Profile>> {
        let path = paths::user(uid);
        let doc = self.remote.read(|| self.store.get(&path)).await?;
        Ok(doc.map(|doc| Profile::from_document(&doc)).transpose()?)
    }

    /// Profile for display, with identity-derived fallbacks for blank fields.
    pub async fn load_profile(&self, user: &AuthUser) -> ShelfResult<Profile> {
        let stored = self.stored_profile(&user.uid).await?.unwrap_or_default();
        let fallback_name = Some(user.suggested_display_name())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string());
        let fallback_photo = user.photo_url.clone().unwrap_or_default();
        Ok(Profile {
            display_name: if stored.display_name.trim().is_empty() {
                fallback_name
            } else {
                stored.display_name
            },
            photo_url: if stored.photo_url.trim().is_empty() {
                fallback_photo
            } else {
                stored.photo_url
            },
            email: if stored.email.is_empty() {
                user.email.clone().unwrap_or_default()
            } else {
                stored.email
            },
            ..stored
        })
    }

    /// Whether the user may leave onboarding.
    pub async fn profile_ready(&self, uid: &str) -> ShelfResult<bool> {
        Ok(self
            .stored_profile(uid)
            .await?
            .is_some_and(|profile| profile.is_ready()))
    }

    pub async fn save_onboarding(
        &self,
        user: &AuthUser,
        display_name: &str,
        handle: &str,
    ) -> ShelfResult<()> {
        let display_name = display_name.trim();
        let handle = handle.trim();
        let name_len = display_name.chars().count();
        if name_len == 0 || name_len > NAME_MAX {
            return Err(ValidationError::DisplayNameLength.into());
        }
        validate_handle(handle)?;

        let fields = WriteFields::new()
            .with("displayName", display_name)
            .with("handle", handle)
            .with("handleLower", handle.to_lowercase())
            .with("profileText", "")
            .with("photoUrl", user.photo_url.clone().unwrap_or_default())
            .with("headerUrl", "")
            .with("email", user.email.clone().unwrap_or_default())
            .with_server_timestamp("createdAt")
            .with_server_timestamp("updatedAt");
        self.remote
            .write(self.store.set(&paths::user(&user.uid), fields, SetOptions::merge()))
            .await?;
        log::info!("onboarding saved uid={} handle={}", user.uid, handle);
        Ok(())
    }

    /// Saves an edit. A handle, once stored, is locked.
    pub async fn update_profile(&self, user: &AuthUser, edit: ProfileEdit) -> ShelfResult<Profile> {
        let display_name = Some(edit.display_name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or(FALLBACK_DISPLAY_NAME)
            .to_string();
        let profile_text = edit.profile_text.trim().to_string();
        if display_name.chars().count() > NAME_MAX {
            return Err(ValidationError::DisplayNameTooLong.into());
        }
        if profile_text.chars().count() > PROFILE_MAX {
            return Err(ValidationError::ProfileTextTooLong.into());
        }

        let saved = self.stored_profile(&user.uid).await?.unwrap_or_default();
        let requested = edit.handle.as_deref().map(str::trim);
        let handle = if saved.handle_locked() {
            if requested.is_some_and(|handle| handle != saved.handle) {
                log::warn!("rejected handle change uid={}", user.uid);
                return Err(ValidationError::HandleLocked.into());
            }
            saved.handle.clone()
        } else {
            requested.unwrap_or_default().to_string()
        };
        validate_handle(&handle)?;

        let profile = Profile {
            display_name,
            handle,
            profile_text,
            photo_url: edit.photo_url.trim().to_string(),
            header_url: edit.header_url.trim().to_string(),
            email: user.email.clone().unwrap_or_default(),
        };
        let fields = WriteFields::new()
            .with("displayName", profile.display_name.as_str())
            .with("profileText", profile.profile_text.as_str())
            .with("handle", profile.handle.as_str())
            .with("handleLower", profile.handle.to_lowercase())
            .with("photoUrl", profile.photo_url.as_str())
            .with("headerUrl", profile.header_url.as_str())
            .with("email", profile.email.as_str())
            .with_server_timestamp("updatedAt");
        self.remote
            .write(self.store.set(&paths::user(&user.uid), fields, SetOptions::merge()))
            .await?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShelfError;
    use crate::test_support::FaultyStore;

    fn user() -> AuthUser {
        AuthUser {
            uid: "u1".to_string(),
            display_name: Some("Aki".to_string()),
            email: Some("aki@example.com".to_string()),
            photo_url: Some("https://img.example/a.png".to_string()),
        }
    }

    fn service(store: Arc<FaultyStore>) -> ProfileService {
        ProfileService::new(store, RemotePolicy::default())
    }

    #[test]
    fn sanitize_strips_and_caps() {
        assert_eq!(sanitize_handle("a-b c_d!"), "abc_d");
        assert_eq!(sanitize_handle("読書abc"), "abc");
        assert_eq!(sanitize_handle(&"x".repeat(20)).len(), HANDLE_MAX);
    }

    #[test]
    fn handle_rules() {
        assert_eq!(validate_handle("abc"), Err(ValidationError::HandleLength));
        assert_eq!(validate_handle(&"a".repeat(17)), Err(ValidationError::HandleLength));
        assert_eq!(validate_handle("ab-cd"), Err(ValidationError::HandleCharset));
        assert_eq!(validate_handle("Ab_12"), Ok(()));
    }

    #[tokio::test]
    async fn onboarding_writes_profile_and_index() {
        let store = FaultyStore::new();
        let profiles = service(store.clone());

        assert!(!profiles.profile_ready("u1").await.expect("ready"));
        profiles
            .save_onboarding(&user(), "  Aki ", "Aki_Reads")
            .await
            .expect("save");

        let doc = store.get("users/u1").await.expect("get").expect("exists");
        assert_eq!(doc.str_field("handleLower"), Some("aki_reads"));
        assert_eq!(doc.str_field("profileText"), Some(""));
        assert!(doc.data.get("createdAt").and_then(|v| v.as_i64()).is_some());
        assert!(profiles.profile_ready("u1").await.expect("ready"));
    }

    #[tokio::test]
    async fn invalid_onboarding_never_writes() {
        let store = FaultyStore::new();
        let profiles = service(store.clone());

        let err = profiles
            .save_onboarding(&user(), " ", "abcd")
            .await
            .expect_err("empty name");
        assert_eq!(err.user_message(), "名前は1〜40文字で入力してください。");
        let err = profiles
            .save_onboarding(&user(), "Aki", "ab")
            .await
            .expect_err("short handle");
        assert_eq!(err, ShelfError::Validation(ValidationError::HandleLength));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn saved_handle_is_locked() {
        let store = FaultyStore::new();
        let profiles = service(store.clone());
        profiles
            .save_onboarding(&user(), "Aki", "aki_1")
            .await
            .expect("save");

        let err = profiles
            .update_profile(
                &user(),
                ProfileEdit {
                    display_name: "Aki".to_string(),
                    handle: Some("other".to_string()),
                    ..ProfileEdit::default()
                },
            )
            .await
            .expect_err("locked");
        assert_eq!(err, ShelfError::Validation(ValidationError::HandleLocked));

        let saved = profiles
            .update_profile(
                &user(),
                ProfileEdit {
                    display_name: "".to_string(),
                    profile_text: " hello ".to_string(),
                    ..ProfileEdit::default()
                },
            )
            .await
            .expect("edit");
        assert_eq!(saved.handle, "aki_1");
        assert_eq!(saved.display_name, "shelfie user");
        assert_eq!(saved.profile_text, "hello");
    }

    #[tokio::test]
    async fn long_profile_text_is_rejected() {
        let store = FaultyStore::new();
        let profiles = service(store);
        let err = profiles
            .update_profile(
                &user(),
                ProfileEdit {
                    display_name: "Aki".to_string(),
                    profile_text: "あ".repeat(201),
                    handle: Some("aki_1".to_string()),
                    ..ProfileEdit::default()
                },
            )
            .await
            .expect_err("too long");
        assert_eq!(err, ShelfError::Validation(ValidationError::ProfileTextTooLong));
    }

    #[tokio::test]
    async fn load_falls_back_to_identity() {
        let store = FaultyStore::new();
        let profiles = service(store);
        let profile = profiles.load_profile(&user()).await.expect("load");
        assert_eq!(profile.display_name, "Aki");
        assert_eq!(profile.photo_url, "https://img.example/a.png");
        assert!(!profile.handle_locked());
    }
}
