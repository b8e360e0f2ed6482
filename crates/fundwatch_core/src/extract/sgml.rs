//! Series and class declarations from a submission header.
//!
//! Headers come in two shapes and both are accepted:
//! `<SERIES-ID>S000012345` (tagged) and `SERIES ID:\tS000012345` (indented).
//! Only the text before the first `<DOCUMENT>` is considered.

use super::html::find_ci;

/// One class (or a class-less series) declared in the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedClass {
    pub series_id: String,
    pub series_name: String,
    pub class_id: String,
    pub class_name: String,
    pub ticker: String,
}

#[derive(Debug, Default)]
struct SeriesBlock {
    id: String,
    name: String,
    classes: Vec<ClassBlock>,
}

#[derive(Debug, Default)]
struct ClassBlock {
    id: String,
    name: String,
    ticker: String,
}

pub fn parse_series_classes(text: &str) -> Vec<TaggedClass> {
    let header = match find_ci(text, "<DOCUMENT>", 0) {
        Some(end) => &text[..end],
        None => text,
    };
    let mut rows = Vec::new();
    let mut current: Option<SeriesBlock> = None;

    for line in header.lines() {
        let Some(field) = HeaderField::parse(line) else {
            continue;
        };
        match (field.key.as_str(), field.closing) {
            ("SERIES", false) => {
                flush(current.take(), &mut rows);
                current = Some(SeriesBlock::default());
            }
            ("SERIES", true) => flush(current.take(), &mut rows),
            (_, true) => {}
            ("SERIES_ID", false) => {
                if let Some(series) = current.as_mut() {
                    series.id = field.value;
                }
            }
            ("SERIES_NAME", false) => {
                if let Some(series) = current.as_mut() {
                    series.name = field.value;
                }
            }
            ("CLASS_CONTRACT", false) => {
                if let Some(series) = current.as_mut() {
                    series.classes.push(ClassBlock::default());
                }
            }
            ("CLASS_CONTRACT_ID", false) => {
                if let Some(class) = current_class(&mut current) {
                    class.id = field.value;
                }
            }
            ("CLASS_CONTRACT_NAME", false) => {
                if let Some(class) = current_class(&mut current) {
                    class.name = field.value;
                }
            }
            ("CLASS_CONTRACT_TICKER_SYMBOL", false) => {
                if let Some(class) = current_class(&mut current) {
                    class.ticker = field.value.to_ascii_uppercase();
                }
            }
            _ => {}
        }
    }
    flush(current, &mut rows);
    rows
}

struct HeaderField {
    key: String,
    value: String,
    closing: bool,
}

impl HeaderField {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('<') {
            let close = rest.find('>')?;
            let tag = &rest[..close];
            let (tag, closing) = match tag.strip_prefix('/') {
                Some(inner) => (inner, true),
                None => (tag, false),
            };
            return Some(Self {
                key: normalize_key(tag),
                value: rest[close + 1..].trim().to_string(),
                closing,
            });
        }
        let colon = line.find(':')?;
        Some(Self {
            key: normalize_key(&line[..colon]),
            value: line[colon + 1..].trim().to_string(),
            closing: false,
        })
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|ch| match ch {
            '-' | ' ' | '\t' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

fn current_class(current: &mut Option<SeriesBlock>) -> Option<&mut ClassBlock> {
    current.as_mut()?.classes.last_mut()
}

fn flush(block: Option<SeriesBlock>, rows: &mut Vec<TaggedClass>) {
    let Some(series) = block else {
        return;
    };
    if series.id.is_empty() && series.name.is_empty() {
        return;
    }
    if series.classes.is_empty() {
        rows.push(TaggedClass {
            series_id: series.id,
            series_name: series.name,
            ..TaggedClass::default()
        });
        return;
    }
    for class in series.classes {
        rows.push(TaggedClass {
            series_id: series.id.clone(),
            series_name: series.name.clone(),
            class_id: class.id,
            class_name: class.name,
            ticker: class.ticker,
        });
    }
}
