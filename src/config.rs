use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

static SYNC_DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

/// Runtime settings for the shelf core.
///
/// Built from defaults, optionally overlaid by a JSON file, then by the
/// `SHELFIE_*` environment variables.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ShelfConfig {
    pub database_path: Option<PathBuf>,
    pub google_books_api_key: Option<String>,
    pub remote_timeout_ms: u64,
    pub read_retries: u32,
    pub timeline_per_user_limit: usize,
    pub timeline_window: usize,
    pub search_debounce_ms: u64,
    pub search_min_chars: usize,
    pub search_max_results: usize,
    pub suggestion_max_results: usize,
}

impl Default for ShelfConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            google_books_api_key: None,
            remote_timeout_ms: 8_000,
            read_retries: 1,
            timeline_per_user_limit: 10,
            timeline_window: 30,
            search_debounce_ms: 250,
            search_min_chars: 2,
            search_max_results: 3,
            suggestion_max_results: 3,
        }
    }
}

impl ShelfConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("failed to read {}: {}", path.display(), err))?;
        let mut config: ShelfConfig = serde_json::from_str(&raw)
            .map_err(|err| format!("failed to parse {}: {}", path.display(), err))?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(path) = env_value("SHELFIE_DB_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(key) = env_value("SHELFIE_GOOGLE_BOOKS_API_KEY")
            .or_else(|| env_value("EXPO_PUBLIC_GOOGLE_BOOKS_API_KEY"))
        {
            self.google_books_api_key = Some(key);
        }
        if let Some(timeout) = env_value("SHELFIE_REMOTE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.remote_timeout_ms = timeout;
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn sync_debug_enabled() -> bool {
    *SYNC_DEBUG_ENABLED.get_or_init(|| {
        std::env::var("SHELFIE_DEBUG")
            .map(|value| {
                let lowered = value.trim().to_ascii_lowercase();
                lowered == "1" || lowered == "true" || lowered == "yes" || lowered == "on"
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::ShelfConfig;
    use std::io::Write;

    #[test]
    fn defaults_match_feed_and_search_policy() {
        let config = ShelfConfig::default();
        assert_eq!(config.timeline_per_user_limit, 10);
        assert_eq!(config.timeline_window, 30);
        assert_eq!(config.search_debounce_ms, 250);
        assert_eq!(config.search_min_chars, 2);
        assert_eq!(config.search_max_results, 3);
    }

    #[test]
    fn json_file_overrides_only_given_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"timelineWindow": 50, "readRetries": 0}}"#).expect("write config");

        let config = ShelfConfig::from_json_file(file.path()).expect("config parses");
        assert_eq!(config.timeline_window, 50);
        assert_eq!(config.read_retries, 0);
        assert_eq!(config.timeline_per_user_limit, 10);
    }

    #[test]
    fn malformed_json_is_reported() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "{{not json").expect("write config");
        assert!(ShelfConfig::from_json_file(file.path()).is_err());
    }
}
