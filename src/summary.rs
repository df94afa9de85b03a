//! Pure shaping of the cached shelf for the shelf and summary tabs.

use crate::models::{Book, BookStatusKey, LogAction, LogEntry};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShelfSort {
    #[default]
    Recent,
    Title,
    Author,
}

/// Books passing the optional status filter, in the requested order.
pub fn shape_shelf(books: &[Book], status: Option<BookStatusKey>, sort: ShelfSort) -> Vec<Book> {
    let mut shaped: Vec<Book> = books
        .iter()
        .filter(|book| status.map_or(true, |key| book.status_key == key))
        .cloned()
        .collect();
    match sort {
        ShelfSort::Recent => shaped.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
        ShelfSort::Title => shaped.sort_by(|a, b| collate(&a.title, &b.title)),
        ShelfSort::Author => shaped.sort_by(|a, b| collate(&a.author, &b.author)),
    }
    shaped
}

/// Case-insensitive order, with the raw text breaking ties.
fn collate(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub unread: usize,
    pub stack: usize,
    pub reading: usize,
    pub done: usize,
}

impl StatusCounts {
    pub fn get(&self, key: BookStatusKey) -> usize {
        match key {
            BookStatusKey::Unread => self.unread,
            BookStatusKey::Stack => self.stack,
            BookStatusKey::Reading => self.reading,
            BookStatusKey::Done => self.done,
        }
    }
}

pub fn status_counts(books: &[Book]) -> StatusCounts {
    books.iter().fold(StatusCounts::default(), |mut counts, book| {
        match book.status_key {
            BookStatusKey::Unread => counts.unread += 1,
            BookStatusKey::Stack => counts.stack += 1,
            BookStatusKey::Reading => counts.reading += 1,
            BookStatusKey::Done => counts.done += 1,
        }
        counts
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesRange {
    Week,
    Month,
    Year,
}

impl SeriesRange {
    pub fn title(self) -> &'static str {
        match self {
            SeriesRange::Week => "1週間の読書と追加",
            SeriesRange::Month => "1か月の読書と追加",
            SeriesRange::Year => "1年の読書と追加",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesPoint {
    pub label: String,
    pub read: u32,
    pub add: u32,
}

const WEEKDAY_LABELS: [&str; 7] = ["月", "火", "水", "木", "金", "土", "日"];

/// Finished-reading and added counts per bucket of the period containing
/// `today` (Monday-first week, calendar month, calendar year).
pub fn activity_series(logs: &[LogEntry], range: SeriesRange, today: NaiveDate) -> Vec<SeriesPoint> {
    let (start, labels): (NaiveDate, Vec<String>) = match range {
        SeriesRange::Week => {
            let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            (monday, WEEKDAY_LABELS.iter().map(|l| l.to_string()).collect())
        }
        SeriesRange::Month => {
            let first = today.with_day(1).unwrap_or(today);
            let days = days_in_month(first);
            (first, (1..=days).map(|day| day.to_string()).collect())
        }
        SeriesRange::Year => {
            let first = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
            (first, (1..=12).map(|month| format!("{}月", month)).collect())
        }
    };

    let mut series: Vec<SeriesPoint> = labels
        .into_iter()
        .map(|label| SeriesPoint { label, read: 0, add: 0 })
        .collect();

    for entry in logs {
        let Some(at) = DateTime::<Utc>::from_timestamp_millis(entry.created_at) else {
            continue;
        };
        let date = at.date_naive();
        if date < start {
            continue;
        }
        let index = match range {
            SeriesRange::Week => (date - start).num_days() as usize,
            SeriesRange::Month if date.year() == start.year() && date.month() == start.month() => {
                date.day0() as usize
            }
            SeriesRange::Year if date.year() == start.year() => date.month0() as usize,
            _ => continue,
        };
        let Some(point) = series.get_mut(index) else {
            continue;
        };
        match entry.action {
            Some(LogAction::Add) => point.add += 1,
            Some(LogAction::Update) if entry.status_key == Some(BookStatusKey::Done) => {
                point.read += 1
            }
            _ => {}
        }
    }
    series
}

fn days_in_month(first: NaiveDate) -> u32 {
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    };
    next.map(|next| (next - first).num_days() as u32).unwrap_or(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(id: &str, title: &str, author: &str, key: BookStatusKey, updated: &str) -> Book {
        Book {
            id: id.to_string(),
            title: title.to_string(),
            author: author.to_string(),
            status: key.label().to_string(),
            status_key: key,
            updated_at: updated.to_string(),
            image_url: None,
            fallback_cover_svg: None,
            category: None,
            publisher: None,
            year: None,
            volume: None,
            tags: None,
            memo: None,
        }
    }

    fn log(action: LogAction, key: BookStatusKey, date: NaiveDate) -> LogEntry {
        LogEntry {
            id: String::new(),
            title: "T".to_string(),
            status: key.label().to_string(),
            status_key: Some(key),
            action: Some(action),
            status_label: None,
            message: String::new(),
            created_at: date
                .and_hms_opt(12, 0, 0)
                .expect("time")
                .and_utc()
                .timestamp_millis(),
            like_count: 0,
            user_id: None,
        }
    }

    fn shelf() -> Vec<Book> {
        vec![
            book("1", "b", "z", BookStatusKey::Done, "2024-03-01"),
            book("2", "a", "y", BookStatusKey::Reading, "2024-03-05"),
            book("3", "c", "x", BookStatusKey::Done, "2024-02-10"),
        ]
    }

    #[test]
    fn filter_then_sort() {
        let ids = |books: Vec<Book>| books.into_iter().map(|b| b.id).collect::<Vec<_>>();
        assert_eq!(ids(shape_shelf(&shelf(), None, ShelfSort::Recent)), ["2", "1", "3"]);
        assert_eq!(ids(shape_shelf(&shelf(), None, ShelfSort::Title)), ["2", "1", "3"]);
        assert_eq!(ids(shape_shelf(&shelf(), None, ShelfSort::Author)), ["3", "2", "1"]);
        assert_eq!(
            ids(shape_shelf(&shelf(), Some(BookStatusKey::Done), ShelfSort::Recent)),
            ["1", "3"]
        );
    }

    #[test]
    fn title_sort_ignores_case() {
        let books = vec![
            book("1", "Banana", "b", BookStatusKey::Unread, "2024-01-01"),
            book("2", "apple", "a", BookStatusKey::Unread, "2024-01-01"),
            book("3", "Apple", "a", BookStatusKey::Unread, "2024-01-01"),
        ];
        let titles: Vec<String> = shape_shelf(&books, None, ShelfSort::Title)
            .into_iter()
            .map(|b| b.title)
            .collect();
        assert_eq!(titles, ["Apple", "apple", "Banana"]);
    }

    #[test]
    fn counts_every_status() {
        let counts = status_counts(&shelf());
        assert_eq!(counts.done, 2);
        assert_eq!(counts.get(BookStatusKey::Reading), 1);
        assert_eq!(counts.unread + counts.stack, 0);
    }

    #[test]
    fn weekly_series_buckets_by_weekday() {
        // 2024-03-06 is a Wednesday
        let today = NaiveDate::from_ymd_opt(2024, 3, 6).expect("date");
        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).expect("date");
        let logs = vec![
            log(LogAction::Add, BookStatusKey::Unread, monday),
            log(LogAction::Update, BookStatusKey::Done, today),
            log(LogAction::Update, BookStatusKey::Reading, today),
            log(LogAction::Add, BookStatusKey::Unread, monday - Duration::days(1)),
        ];
        let series = activity_series(&logs, SeriesRange::Week, today);
        assert_eq!(series.len(), 7);
        assert_eq!(series[0], SeriesPoint { label: "月".to_string(), read: 0, add: 1 });
        assert_eq!(series[2], SeriesPoint { label: "水".to_string(), read: 1, add: 0 });
        assert_eq!(series.iter().map(|p| p.add + p.read).sum::<u32>(), 2);
    }

    #[test]
    fn monthly_and_yearly_ranges() {
        let today = NaiveDate::from_ymd_opt(2024, 2, 20).expect("date");
        let logs = vec![
            log(LogAction::Add, BookStatusKey::Unread, NaiveDate::from_ymd_opt(2024, 2, 29).expect("date")),
            log(LogAction::Update, BookStatusKey::Done, NaiveDate::from_ymd_opt(2024, 1, 3).expect("date")),
            log(LogAction::Remove, BookStatusKey::Done, NaiveDate::from_ymd_opt(2024, 2, 1).expect("date")),
        ];
        let monthly = activity_series(&logs, SeriesRange::Month, today);
        assert_eq!(monthly.len(), 29);
        assert_eq!(monthly[28].add, 1);
        assert_eq!(monthly[0].read + monthly[0].add, 0);

        let yearly = activity_series(&logs, SeriesRange::Year, today);
        assert_eq!(yearly.len(), 12);
        assert_eq!(yearly[0], SeriesPoint { label: "1月".to_string(), read: 1, add: 0 });
        assert_eq!(yearly[1].add, 1);
        assert_eq!(SeriesRange::Year.title(), "1年の読書と追加");
    }
}
