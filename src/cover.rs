use sha2::{Digest, Sha256};

const COVER_WIDTH: u32 = 360;
const COVER_HEIGHT: u32 = 480;
const MAX_CHARS_PER_LINE: usize = 12;
const MAX_TITLE_LINES: usize = 5;
const MAX_AUTHOR_CHARS: usize = 24;

/// Dark, muted backgrounds that keep white text readable.
const PALETTE: [&str; 6] = [
    "#222222", "#2f3e46", "#3d405b", "#5e3023", "#264653", "#4a4e69",
];

/// Generate a placeholder cover from title and author text.
/// Returns SVG markup; the same (title, author) always yields the same bytes.
pub fn generate_text_cover(title: &str, author: &str) -> String {
    let color = cover_color(title, author);
    let lines = wrap_title(title);

    let line_height = 36u32;
    let mut title_markup = String::new();
    for (i, line) in lines.iter().enumerate() {
        let y = 90 + (i as u32) * line_height;
        title_markup.push_str(&format!(
            "<text x=\"40\" y=\"{}\" fill=\"#ffffff\" font-size=\"28\" font-family=\"ui-sans-serif, system-ui\" font-weight=\"700\">{}</text>",
            y,
            escape_xml(line)
        ));
    }
    let author_y = 90 + (lines.len().max(1) as u32) * line_height + 4;

    format!(
        concat!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">",
            "<rect width=\"{w}\" height=\"{h}\" fill=\"{color}\"/>",
            "<rect x=\"28\" y=\"28\" width=\"304\" height=\"424\" fill=\"none\" stroke=\"rgba(255,255,255,0.35)\" stroke-width=\"2\"/>",
            "{title}",
            "<text x=\"40\" y=\"{author_y}\" fill=\"rgba(255,255,255,0.8)\" font-size=\"16\" font-family=\"ui-sans-serif, system-ui\">{author}</text>",
            "<text x=\"40\" y=\"430\" fill=\"rgba(255,255,255,0.6)\" font-size=\"12\" font-family=\"ui-sans-serif, system-ui\" letter-spacing=\"2\">SHELFIE</text>",
            "</svg>"
        ),
        w = COVER_WIDTH,
        h = COVER_HEIGHT,
        color = color,
        title = title_markup,
        author_y = author_y,
        author = escape_xml(&truncate_chars(author.trim(), MAX_AUTHOR_CHARS)),
    )
}

fn cover_color(title: &str, author: &str) -> &'static str {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(author.as_bytes());
    let digest = hasher.finalize();
    PALETTE[digest[0] as usize % PALETTE.len()]
}

/// Wraps on whitespace; titles without spaces (common in Japanese) are split
/// every `MAX_CHARS_PER_LINE` characters.
fn wrap_title(title: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in title.split_whitespace() {
        for chunk in chunk_chars(word, MAX_CHARS_PER_LINE) {
            let current_len = current.chars().count();
            let chunk_len = chunk.chars().count();
            if current.is_empty() {
                current = chunk;
            } else if current_len + 1 + chunk_len <= MAX_CHARS_PER_LINE {
                current.push(' ');
                current.push_str(&chunk);
            } else {
                lines.push(std::mem::replace(&mut current, chunk));
            }
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    if lines.len() > MAX_TITLE_LINES {
        lines.truncate(MAX_TITLE_LINES);
        if let Some(last) = lines.last_mut() {
            let kept = last.chars().count().saturating_sub(1);
            *last = format!("{}…", last.chars().take(kept).collect::<String>());
        }
    }
    lines
}

fn chunk_chars(word: &str, size: usize) -> Vec<String> {
    let chars = word.chars().collect::<Vec<_>>();
    chars.chunks(size).map(|chunk| chunk.iter().collect()).collect()
}

fn truncate_chars(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        format!("{}...", value.chars().take(max - 3).collect::<String>())
    } else {
        value.to_string()
    }
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
