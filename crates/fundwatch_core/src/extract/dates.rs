use chrono::NaiveDate;

use super::{CachedRegex, cached_regex, collapse_whitespace};

const HEADER_PATTERN: &str = r"(?i)EFFECTIVENESS\s+DATE:\s*(\d{8})";

const PHRASE_PATTERNS: [&str; 3] = [
    r"(?i)(?:become|becomes|shall become|will become|will be)\s+effective\s+(?:on|as of)\s+([A-Z][a-z]+\s+\d{1,2},\s+\d{4})",
    r"(?i)effective\s+(?:on|as of)\s+(\d{1,2}/\d{1,2}/\d{2,4})",
    r"(?i)effective\s+on\s+or\s+about\s+([A-Z][a-z]+\s+\d{1,2},\s+\d{4})",
];

const DELAYING_PHRASES: &[&str] = &[
    "delaying amendment",
    "delay its effective date",
    "delay the effective date",
    "rule 485(a)",
    "rule 473",
    "designates a new effective date",
];

static HEADER_RE: CachedRegex = CachedRegex::new();
static PHRASE_RES: [CachedRegex; 3] = [CachedRegex::new(), CachedRegex::new(), CachedRegex::new()];

/// Effective date and delaying flag found in one body text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyDates {
    pub effective: Option<NaiveDate>,
    pub delaying: bool,
}

/// `EFFECTIVENESS DATE: YYYYMMDD` from a submission header.
pub fn header_effective_date(text: &str) -> Option<NaiveDate> {
    let regex = cached_regex(&HEADER_RE, HEADER_PATTERN)?;
    let raw = regex.captures(text)?.get(1)?.as_str();
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

/// Scan body text for an effectiveness phrase and delaying-amendment language.
///
/// Patterns are tried in order over whitespace-collapsed text; the first
/// pattern whose first match parses as a date wins.
pub fn scan_body(text: &str) -> BodyDates {
    if text.trim().is_empty() {
        return BodyDates::default();
    }
    let lower = text.to_lowercase();
    let delaying = DELAYING_PHRASES.iter().any(|phrase| lower.contains(phrase));

    let collapsed = collapse_whitespace(text);
    let mut effective = None;
    for (cell, pattern) in PHRASE_RES.iter().zip(PHRASE_PATTERNS) {
        let Some(regex) = cached_regex(cell, pattern) else {
            continue;
        };
        let Some(raw) = regex
            .captures(&collapsed)
            .and_then(|caps| caps.get(1))
            .map(|found| found.as_str().to_string())
        else {
            continue;
        };
        if let Some(date) = parse_phrase_date(&raw) {
            effective = Some(date);
            break;
        }
    }
    BodyDates { effective, delaying }
}

fn parse_phrase_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in ["%B %d, %Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    let parts = raw.split('/').collect::<Vec<_>>();
    if parts.len() == 3 && parts[2].len() == 2 {
        return NaiveDate::parse_from_str(raw, "%m/%d/%y").ok();
    }
    NaiveDate::parse_from_str(raw, "%m/%d/%Y").ok()
}
