use thiserror::Error;

/// Generic message shown for any remote failure, whatever the cause.
pub const REMOTE_FAILURE_MESSAGE: &str = "保存に失敗しました。";

pub type ShelfResult<T> = Result<T, ShelfError>;

/// Input rejected before any remote call is attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("名前は1〜40文字で入力してください。")]
    DisplayNameLength,
    #[error("名前は40文字以内で入力してください。")]
    DisplayNameTooLong,
    #[error("IDは4〜16文字で入力してください。")]
    HandleLength,
    #[error("IDは半角英数字とアンダーバーのみ使用できます。")]
    HandleCharset,
    #[error("IDは変更できません。")]
    HandleLocked,
    #[error("プロフィール文は200文字以内で入力してください。")]
    ProfileTextTooLong,
    #[error("タイトルを入力してください。")]
    EmptyTitle,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("malformed document {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShelfError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote call timed out after {0} ms")]
    Timeout(u64),
    #[error("no signed-in user")]
    NotSignedIn,
    #[error("cannot follow yourself")]
    SelfFollow,
    #[error("book suggestion lookup failed: {0}")]
    Suggestion(String),
}

impl ShelfError {
    /// Text for the inline error next to the failing control.
    pub fn user_message(&self) -> String {
        match self {
            ShelfError::Validation(err) => err.to_string(),
            _ => REMOTE_FAILURE_MESSAGE.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ShelfError::Validation(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("JSON serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failures_share_one_message() {
        let errors = [
            ShelfError::Store(StoreError::Backend("disk full".to_string())),
            ShelfError::Store(StoreError::PermissionDenied("users/a".to_string())),
            ShelfError::Timeout(8000),
        ];
        for err in errors {
            assert_eq!(err.user_message(), REMOTE_FAILURE_MESSAGE);
        }
    }

    #[test]
    fn validation_errors_keep_their_text() {
        let err = ShelfError::from(ValidationError::HandleCharset);
        assert!(err.is_validation());
        assert_eq!(
            err.user_message(),
            "IDは半角英数字とアンダーバーのみ使用できます。"
        );
    }
}
