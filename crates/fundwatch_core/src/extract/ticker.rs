use regex::RegexBuilder;

use super::{CachedRegex, TickerSource, cached_regex};

const STOPWORDS: &[&str] = &["THE", "AND", "FOR", "WITH", "ETF", "FUND", "RISK", "USD", "MEMBER"];
const LABEL_WINDOW_CHARS: usize = 600;

static LABEL_RE: CachedRegex = CachedRegex::new();
const LABEL_PATTERN: &str = r"(?i)(?:Ticker|Trading\s*Symbol)\s*[:\-–]\s*([A-Z0-9]{1,6})";

/// A ticker is 1-6 characters, contains a letter, and is not a stopword.
pub fn is_valid_ticker(token: &str) -> bool {
    let upper = token.trim().to_ascii_uppercase();
    let length = upper.chars().count();
    if !(1..=6).contains(&length) {
        return false;
    }
    if STOPWORDS.contains(&upper.as_str()) {
        return false;
    }
    upper.chars().any(|ch| ch.is_ascii_alphabetic())
        && upper.chars().all(|ch| ch.is_ascii_alphanumeric())
}

/// Resolve a ticker for `name` from the candidate body texts.
///
/// Every text is tried for the parenthetical form before any label window is
/// searched.
pub fn ticker_for_name(name: &str, texts: &[&str]) -> Option<(String, TickerSource)> {
    let normalized = super::collapse_whitespace(name);
    if normalized.is_empty() {
        return None;
    }
    let escaped = regex::escape(&normalized);

    let paren = RegexBuilder::new(&format!(r"{escaped}\s*\(\s*([A-Z0-9]{{1,6}})\s*\)"))
        .case_insensitive(true)
        .build()
        .ok()?;
    for text in texts {
        if let Some(candidate) = paren.captures(text).and_then(|caps| caps.get(1)) {
            let ticker = candidate.as_str().to_ascii_uppercase();
            if is_valid_ticker(&ticker) {
                return Some((ticker, TickerSource::TitleParen));
            }
        }
    }

    let label = cached_regex(&LABEL_RE, LABEL_PATTERN)?;
    let anchor = RegexBuilder::new(&escaped)
        .case_insensitive(true)
        .build()
        .ok()?;
    for text in texts {
        for found in anchor.find_iter(text) {
            let window = char_window(text, found.start(), found.end(), LABEL_WINDOW_CHARS);
            if let Some(candidate) = label.captures(window).and_then(|caps| caps.get(1)) {
                let ticker = candidate.as_str().to_ascii_uppercase();
                if is_valid_ticker(&ticker) {
                    return Some((ticker, TickerSource::LabelWindow));
                }
            }
        }
    }
    None
}

/// `text[start..end]` widened by `radius` characters on each side, clamped
/// to char boundaries.
fn char_window(text: &str, start: usize, end: usize, radius: usize) -> &str {
    let before = text[..start]
        .char_indices()
        .rev()
        .nth(radius.saturating_sub(1))
        .map(|(index, _)| index)
        .unwrap_or(0);
    let after = text[end..]
        .char_indices()
        .nth(radius)
        .map(|(index, _)| end + index)
        .unwrap_or(text.len());
    &text[before..after]
}
