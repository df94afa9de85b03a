use crate::error::StoreError;
use crate::store::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DISPLAY_NAME: &str = "ユーザー";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookStatusKey {
    #[default]
    Unread,
    Stack,
    Reading,
    Done,
}

impl BookStatusKey {
    pub const ALL: [BookStatusKey; 4] = [
        BookStatusKey::Unread,
        BookStatusKey::Stack,
        BookStatusKey::Reading,
        BookStatusKey::Done,
    ];

    /// Canonical display label. The stored `status` is always this value.
    pub fn label(self) -> &'static str {
        match self {
            BookStatusKey::Unread => "未読",
            BookStatusKey::Stack => "積読",
            BookStatusKey::Reading => "読書中",
            BookStatusKey::Done => "読了",
        }
    }

    pub fn from_key(key: &str) -> Option<BookStatusKey> {
        BookStatusKey::ALL.into_iter().find(|status| status.as_str() == key)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookStatusKey::Unread => "unread",
            BookStatusKey::Stack => "stack",
            BookStatusKey::Reading => "reading",
            BookStatusKey::Done => "done",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: String,
    pub status: String,
    pub status_key: BookStatusKey,
    pub updated_at: String, // YYYY-MM-DD
    pub image_url: Option<String>,
    pub fallback_cover_svg: Option<String>,
    pub category: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub volume: Option<String>,
    pub tags: Option<String>,
    pub memo: Option<String>,
}

/// Book document as persisted; `updatedAt` is a store timestamp in millis.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredBook {
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    status_key: BookStatusKey,
    updated_at: Option<i64>,
    image_url: Option<String>,
    fallback_cover_svg: Option<String>,
    category: Option<String>,
    publisher: Option<String>,
    year: Option<String>,
    volume: Option<String>,
    tags: Option<String>,
    memo: Option<String>,
}

impl Book {
    pub fn from_document(doc: &Document) -> Result<Book, StoreError> {
        let stored: StoredBook = doc.decode()?;
        Ok(Book {
            id: doc.id.clone(),
            title: stored.title,
            author: stored.author,
            // derived on read as well, so a hand-edited label never leaks out
            status: stored.status_key.label().to_string(),
            status_key: stored.status_key,
            updated_at: date_string(stored.updated_at),
            image_url: stored.image_url.filter(|url| !url.trim().is_empty()),
            fallback_cover_svg: stored.fallback_cover_svg,
            category: stored.category,
            publisher: stored.publisher,
            year: stored.year,
            volume: stored.volume,
            tags: stored.tags,
            memo: stored.memo,
        })
    }
}

/// Registration input. Only `title` is required.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookInput {
    pub title: String,
    pub author: String,
    pub status_key: Option<BookStatusKey>,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub volume: Option<String>,
    pub tags: Option<String>,
    pub memo: Option<String>,
}

impl BookInput {
    pub fn new(title: &str, author: &str) -> Self {
        Self {
            title: title.to_string(),
            author: author.to_string(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status_key: BookStatusKey) -> Self {
        self.status_key = Some(status_key);
        self
    }
}

/// Edit-in-place input. `None` fields are left untouched in the store.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookPatch {
    pub title: Option<String>,
    pub author: Option<String>,
    pub status_key: Option<BookStatusKey>,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub volume: Option<String>,
    pub tags: Option<String>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    Add,
    Update,
    Remove,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LogAction::Add => "add",
            LogAction::Update => "update",
            LogAction::Remove => "remove",
        }
    }

    pub fn message(self, title: &str, status_label: &str) -> String {
        match self {
            LogAction::Add => format!("{}を本棚に登録しました。", title),
            LogAction::Update => format!("{}を「{}」に変更しました。", title, status_label),
            LogAction::Remove => format!("{}を本棚から「削除」しました。", title),
        }
    }
}

/// An activity record. Title and status are snapshots taken at event time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    pub status_key: Option<BookStatusKey>,
    pub action: Option<LogAction>,
    pub status_label: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub like_count: u32,
    pub user_id: Option<String>,
}

impl LogEntry {
    pub fn from_document(doc: &Document) -> Result<LogEntry, StoreError> {
        let mut entry: LogEntry = doc.decode()?;
        entry.id = doc.id.clone();
        Ok(entry)
    }

    pub fn created_date(&self) -> String {
        date_string(Some(self.created_at))
    }

    /// Human sentence for the feed, falling back to the stored message.
    pub fn describe(&self) -> String {
        match self.action {
            Some(LogAction::Update) => {
                let label = self
                    .status_label
                    .as_deref()
                    .or(Some(self.status.as_str()).filter(|s| !s.is_empty()))
                    .unwrap_or(BookStatusKey::Reading.label());
                LogAction::Update.message(&self.title, label)
            }
            Some(action) => action.message(&self.title, &self.status),
            None => self.message.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub display_name: String,
    pub handle: String,
    pub profile_text: String,
    pub photo_url: String,
    pub header_url: String,
    pub email: String,
}

impl Profile {
    pub fn from_document(doc: &Document) -> Result<Profile, StoreError> {
        doc.decode()
    }

    /// The gate between onboarding and the main tabs.
    pub fn is_ready(&self) -> bool {
        self.handle.trim().chars().count() >= 4 && !self.display_name.trim().is_empty()
    }

    pub fn handle_locked(&self) -> bool {
        !self.handle.is_empty()
    }
}

/// Author info shown next to feed entries and search results.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub id: String,
    pub display_name: String,
    pub handle: String,
    pub profile_text: String,
    pub photo_url: Option<String>,
}

impl ProfileSummary {
    pub fn from_document(doc: &Document) -> ProfileSummary {
        let text = |key: &str| doc.str_field(key).map(|value| value.to_string());
        ProfileSummary {
            id: doc.id.clone(),
            display_name: text("displayName").unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
            handle: text("handle").unwrap_or_default(),
            profile_text: text("profileText").unwrap_or_default(),
            photo_url: text("photoUrl").filter(|url| !url.trim().is_empty()),
        }
    }
}

pub(crate) fn date_string(millis: Option<i64>) -> String {
    let at = millis
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    at.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, value: serde_json::Value) -> Document {
        Document {
            id: id.to_string(),
            data: value.as_object().cloned().expect("object"),
        }
    }

    #[test]
    fn labels_cover_every_status() {
        let labels = BookStatusKey::ALL.map(BookStatusKey::label);
        assert_eq!(labels, ["未読", "積読", "読書中", "読了"]);
    }

    #[test]
    fn book_status_label_is_derived_from_key() {
        let book = Book::from_document(&doc(
            "b1",
            json!({"title": "T", "author": "A", "status": "bogus", "statusKey": "done", "updatedAt": 0}),
        ))
        .expect("decodes");
        assert_eq!(book.status, "読了");
        assert_eq!(book.updated_at, "1970-01-01");
    }

    #[test]
    fn log_entry_defaults_missing_fields() {
        let entry = LogEntry::from_document(&doc("l1", json!({"title": "T"}))).expect("decodes");
        assert_eq!(entry.id, "l1");
        assert_eq!(entry.like_count, 0);
        assert_eq!(entry.created_at, 0);
        assert!(entry.user_id.is_none());
    }

    #[test]
    fn describe_uses_action_specific_sentences() {
        let mut entry = LogEntry::from_document(&doc(
            "l1",
            json!({"title": "FACTFULNESS", "status": "読了", "action": "update", "message": "x"}),
        ))
        .expect("decodes");
        assert_eq!(entry.describe(), "FACTFULNESSを「読了」に変更しました。");

        entry.action = Some(LogAction::Remove);
        assert_eq!(entry.describe(), "FACTFULNESSを本棚から「削除」しました。");

        entry.action = None;
        assert_eq!(entry.describe(), "x");
    }

    #[test]
    fn profile_summary_falls_back_to_default_name() {
        let summary = ProfileSummary::from_document(&doc("u1", json!({"handle": "aki", "photoUrl": ""})));
        assert_eq!(summary.display_name, DEFAULT_DISPLAY_NAME);
        assert!(summary.photo_url.is_none());
    }

    #[test]
    fn profile_ready_needs_handle_and_name() {
        let mut profile = Profile {
            display_name: "Aki".to_string(),
            handle: "abc".to_string(),
            ..Profile::default()
        };
        assert!(!profile.is_ready());
        profile.handle = "abcd".to_string();
        assert!(profile.is_ready());
    }
}
