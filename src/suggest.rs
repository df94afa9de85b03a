//! Google Books lookups used to prefill the registration form.

use crate::config::{sync_debug_enabled, ShelfConfig};
use crate::error::{ShelfError, ShelfResult};
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

const VOLUMES_ENDPOINT: &str = "https://www.googleapis.com/books/v1/volumes";
const HTTP_USER_AGENT: &str = "Shelfie/0.1 (reading log)";
const HTTP_MAX_RETRIES: u64 = 1;
const UNKNOWN_TITLE: &str = "不明なタイトル";
const UNKNOWN_AUTHOR: &str = "不明な著者";

static YEAR_PATTERN: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSuggestion {
    pub id: String,
    pub title: String,
    pub author: String,
    pub thumbnail: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub category: Option<String>,
    pub tags: Option<String>,
    pub description: Option<String>,
}

pub struct SuggestionClient {
    client: Client,
    api_key: Option<String>,
    max_results: usize,
}

impl SuggestionClient {
    pub fn new(config: &ShelfConfig) -> ShelfResult<Self> {
        let client = Client::builder()
            .timeout(config.remote_timeout())
            .user_agent(HTTP_USER_AGENT)
            .build()
            .map_err(|err| ShelfError::Suggestion(err.to_string()))?;
        Ok(Self {
            client,
            api_key: config
                .google_books_api_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            max_results: config.suggestion_max_results,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Volumes matching `title` and/or `author`. Empty when unconfigured or
    /// when both inputs are blank.
    pub async fn search(&self, title: &str, author: &str) -> ShelfResult<Vec<BookSuggestion>> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(url) = volumes_url(title, author, self.max_results, api_key) else {
            return Ok(Vec::new());
        };
        let Some(body) = self.fetch_json_with_retry(&url).await? else {
            return Ok(Vec::new());
        };
        Ok(parse_volumes(&body))
    }

    /// `Ok(None)` for a non-success status that is not worth retrying.
    async fn fetch_json_with_retry(&self, url: &str) -> ShelfResult<Option<Value>> {
        let debug_enabled = sync_debug_enabled();
        for attempt in 0..=HTTP_MAX_RETRIES {
            let response = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await;

            let response = match response {
                Ok(value) => value,
                Err(err) => {
                    log::warn!("books lookup transport error attempt={}: {}", attempt + 1, err);
                    if attempt < HTTP_MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(350 * (attempt + 1))).await;
                        continue;
                    }
                    return Err(ShelfError::Suggestion(err.to_string()));
                }
            };

            let status = response.status();
            if status.is_success() {
                if debug_enabled {
                    log::info!("[sync-debug] books lookup success status={}", status);
                }
                let body = response
                    .json::<Value>()
                    .await
                    .map_err(|err| ShelfError::Suggestion(err.to_string()))?;
                return Ok(Some(body));
            }

            log::warn!("books lookup status={} attempt={}", status, attempt + 1);
            if (status.as_u16() == 429 || status.is_server_error()) && attempt < HTTP_MAX_RETRIES {
                let retry_after_ms = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(|value| value * 1000)
                    .unwrap_or(350 * (attempt + 1));
                tokio::time::sleep(Duration::from_millis(retry_after_ms.min(4_000))).await;
                continue;
            }
            return Ok(None);
        }
        Ok(None)
    }
}

pub(crate) fn volumes_url(title: &str, author: &str, max_results: usize, api_key: &str) -> Option<String> {
    let title = title.trim();
    let author = author.trim();
    let mut parts = Vec::new();
    if !title.is_empty() {
        parts.push(format!("intitle:{}", title));
    }
    if !author.is_empty() {
        parts.push(format!("inauthor:{}", author));
    }
    if parts.is_empty() {
        return None;
    }
    Some(format!(
        "{}?q={}&maxResults={}&printType=books&key={}",
        VOLUMES_ENDPOINT,
        urlencoding::encode(&parts.join(" ")),
        max_results,
        urlencoding::encode(api_key)
    ))
}

/// Maps a `volumes` response body to suggestions.
pub fn parse_volumes(body: &Value) -> Vec<BookSuggestion> {
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| {
            let info = item.get("volumeInfo").cloned().unwrap_or(Value::Null);
            let text = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);

            let title = text("title").unwrap_or_else(|| UNKNOWN_TITLE.to_string());
            let author = match info.get("authors") {
                Some(Value::Array(authors)) => authors
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("・"),
                Some(Value::String(author)) => author.clone(),
                _ => UNKNOWN_AUTHOR.to_string(),
            };
            let categories: Vec<&str> = info
                .get("categories")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|value| !value.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            BookSuggestion {
                id: item
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}-{}", title, author)),
                thumbnail: info
                    .get("imageLinks")
                    .and_then(|links| links.get("thumbnail"))
                    .and_then(Value::as_str)
                    .map(|url| url.replacen("http://", "https://", 1)),
                publisher: text("publisher"),
                year: text("publishedDate").and_then(|date| normalize_year(&date)),
                category: categories.first().map(|value| value.to_string()),
                tags: (!categories.is_empty()).then(|| categories.join("・")),
                description: text("description").map(|value| value.trim().to_string()),
                title,
                author,
            }
        })
        .collect()
}

fn normalize_year(value: &str) -> Option<String> {
    let pattern = YEAR_PATTERN.get_or_init(|| Regex::new(r"\d{4}").expect("static year pattern"));
    pattern.find(value).map(|found| found.as_str().to_string())
}

/// Scanner output reduced to what an ISBN can contain.
pub fn sanitize_barcode(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_volume_fields() {
        let body = json!({
            "items": [{
                "id": "vol1",
                "volumeInfo": {
                    "title": "FACTFULNESS",
                    "authors": ["Hans Rosling", "Ola Rosling"],
                    "publisher": "日経BP",
                    "publishedDate": "2019-01-11",
                    "categories": ["Social Science", "Statistics"],
                    "imageLinks": {"thumbnail": "http://books.google.com/x.jpg"},
                    "description": "  data  "
                }
            }]
        });
        let parsed = parse_volumes(&body);
        assert_eq!(parsed.len(), 1);
        let book = &parsed[0];
        assert_eq!(book.author, "Hans Rosling・Ola Rosling");
        assert_eq!(book.year.as_deref(), Some("2019"));
        assert_eq!(book.category.as_deref(), Some("Social Science"));
        assert_eq!(book.tags.as_deref(), Some("Social Science・Statistics"));
        assert_eq!(book.thumbnail.as_deref(), Some("https://books.google.com/x.jpg"));
        assert_eq!(book.description.as_deref(), Some("data"));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let parsed = parse_volumes(&json!({"items": [{"volumeInfo": {"publishedDate": "n.d."}}]}));
        let book = &parsed[0];
        assert_eq!(book.title, "不明なタイトル");
        assert_eq!(book.author, "不明な著者");
        assert_eq!(book.id, "不明なタイトル-不明な著者");
        assert!(book.year.is_none());
        assert!(book.tags.is_none());
        assert!(parse_volumes(&json!({})).is_empty());
    }

    #[test]
    fn url_needs_some_input() {
        assert!(volumes_url(" ", "", 3, "k").is_none());
        let url = volumes_url("夜と霧", "", 3, "k").expect("url");
        assert!(url.starts_with("https://www.googleapis.com/books/v1/volumes?q=intitle%3A"));
        assert!(url.ends_with("&maxResults=3&printType=books&key=k"));
    }

    #[tokio::test]
    async fn unconfigured_client_returns_nothing() {
        let client = SuggestionClient::new(&ShelfConfig::default()).expect("client");
        assert!(!client.is_configured());
        let results = client.search("title", "author").await.expect("search");
        assert!(results.is_empty());
    }

    #[test]
    fn barcode_keeps_digits_and_check_letter() {
        assert_eq!(sanitize_barcode("978-4-10-x\n"), "978410X");
        assert_eq!(sanitize_barcode(" 9784 "), "9784");
    }
}
