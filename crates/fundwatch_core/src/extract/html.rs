//! Minimal HTML handling for filing documents: case-insensitive tag scanning,
//! text extraction that keeps table columns apart, and ticker tables.

use super::ticker::is_valid_ticker;

/// Embedded `<DOCUMENT>` from a full submission text whose body looks like markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedDocument<'a> {
    pub doc_type: String,
    pub file_name: String,
    pub body: &'a str,
}

/// `(name, ticker)` pair read from one table row or one columnar line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTicker {
    pub name: String,
    pub ticker: String,
}

const BLOCK_TAGS: &[&str] = &[
    "br", "p", "div", "tr", "table", "li", "h1", "h2", "h3", "h4", "h5", "h6", "title", "pre",
];
const CELL_TAGS: &[&str] = &["td", "th"];

/// ASCII-case-insensitive search for `needle` in `haystack[from..]`.
pub fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || from > hay.len() || hay.len() - from < needle.len() {
        return None;
    }
    (from..=hay.len() - needle.len())
        .find(|&start| hay[start..start + needle.len()].eq_ignore_ascii_case(needle))
}

/// Byte range of the next `<open ...>...</close>` block at or after `from`.
pub fn next_tag_block_ci(text: &str, open: &str, close: &str, from: usize) -> Option<(usize, usize)> {
    let start = find_ci(text, open, from)?;
    let open_end = text[start..].find('>')? + start + 1;
    let close_start = find_ci(text, close, open_end)?;
    Some((start, close_start + close.len()))
}

/// Content between the end of the opening tag and the start of the closing tag.
pub fn inner_after_open_tag(block: &str) -> &str {
    match (block.find('>'), block.rfind('<')) {
        (Some(open_end), Some(close_start)) if close_start > open_end => {
            &block[open_end + 1..close_start]
        }
        _ => "",
    }
}

/// Every markup-bearing `<DOCUMENT>` block of a full submission text.
pub fn embedded_documents(submission: &str) -> Vec<EmbeddedDocument<'_>> {
    let mut documents = Vec::new();
    let mut cursor = 0;
    while let Some((start, end)) = next_tag_block_ci(submission, "<DOCUMENT>", "</DOCUMENT>", cursor) {
        cursor = end;
        let block = &submission[start..end];
        let Some((text_start, text_end)) = next_tag_block_ci(block, "<TEXT>", "</TEXT>", 0) else {
            continue;
        };
        let body = inner_after_open_tag(&block[text_start..text_end]);
        let lower = body.to_ascii_lowercase();
        if !(lower.contains("<html") || lower.contains("<table") || lower.contains("<div")) {
            continue;
        }
        documents.push(EmbeddedDocument {
            doc_type: header_value(block, "<TYPE>").to_ascii_uppercase(),
            file_name: header_value(block, "<FILENAME>"),
            body,
        });
    }
    documents
}

/// Value of an unclosed SGML header tag such as `<TYPE>485BPOS`.
fn header_value(block: &str, tag: &str) -> String {
    let Some(start) = find_ci(block, tag, 0) else {
        return String::new();
    };
    let rest = &block[start + tag.len()..];
    let end = rest.find(['\n', '<']).unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

/// Plain text of an HTML fragment.
///
/// Block-level tags become line breaks and table cells are separated by two
/// spaces, so columnar parsing still works on the result. Whitespace inside
/// `<pre>` is kept as written. Script and style bodies are dropped.
pub fn text_content(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut in_pre = false;
    while let Some(open) = rest.find('<') {
        push_text(&mut out, &rest[..open], in_pre);
        let tag_source = &rest[open..];
        let Some(close) = tag_source.find('>') else {
            rest = "";
            break;
        };
        let inner = &tag_source[1..close];
        let name = tag_name(inner);
        rest = &tag_source[close + 1..];
        if name == "pre" {
            in_pre = !inner.starts_with('/');
        }
        if name == "script" || name == "style" {
            let closing = format!("</{name}");
            rest = match find_ci(rest, &closing, 0) {
                Some(end) => match rest[end..].find('>') {
                    Some(gt) => &rest[end + gt + 1..],
                    None => "",
                },
                None => "",
            };
            continue;
        }
        if BLOCK_TAGS.contains(&name.as_str()) {
            out.push('\n');
        } else if CELL_TAGS.contains(&name.as_str()) {
            out.push_str("  ");
        }
    }
    push_text(&mut out, rest, in_pre);

    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rows of every table whose header row names a fund and a ticker column.
///
/// The last non-empty cell of each body row must validate as a ticker; the
/// remaining cells form the display name.
pub fn ticker_table_rows(html: &str) -> Vec<NamedTicker> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some((start, end)) = next_tag_block_ci(html, "<table", "</table", cursor) {
        cursor = end;
        let table = &html[start..end];
        let rows = table_rows(table);
        let Some(header_index) = rows.iter().position(|cells| !cells.is_empty()) else {
            continue;
        };
        let header = rows[header_index].join(" ").to_lowercase();
        let names_fund = ["fund", "series", "name"]
            .iter()
            .any(|term| header.contains(term));
        if !(names_fund && header.contains("ticker")) {
            continue;
        }
        for cells in rows.iter().skip(header_index + 1) {
            if cells.len() < 2 {
                continue;
            }
            let ticker = cells[cells.len() - 1].to_ascii_uppercase();
            if !is_valid_ticker(&ticker) {
                continue;
            }
            let name = cells[..cells.len() - 1].join(" ");
            found.push(NamedTicker { name, ticker });
        }
    }
    found
}

/// Split each line on runs of two or more spaces and keep lines whose last
/// column validates as a ticker.
pub fn columnar_rows(text: &str) -> Vec<NamedTicker> {
    let mut found = Vec::new();
    for line in text.lines() {
        let parts = split_columns(line.trim());
        if parts.len() < 2 {
            continue;
        }
        let ticker = parts[parts.len() - 1].to_ascii_uppercase();
        if !is_valid_ticker(&ticker) {
            continue;
        }
        found.push(NamedTicker {
            name: parts[..parts.len() - 1].join(" "),
            ticker,
        });
    }
    found
}

fn split_columns(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        if !ch.is_whitespace() {
            continue;
        }
        let mut run_end = index + ch.len_utf8();
        let mut run = 1;
        while let Some(&(next_index, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            run += 1;
            run_end = next_index + next.len_utf8();
            chars.next();
        }
        if run >= 2 {
            let part = line[start..index].trim();
            if !part.is_empty() {
                parts.push(part);
            }
            start = run_end;
        }
    }
    let tail = line[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

fn table_rows(table: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut cursor = 0;
    while let Some((start, end)) = next_tag_block_ci(table, "<tr", "</tr", cursor) {
        cursor = end;
        let row = &table[start..end];
        let mut cells = Vec::new();
        let mut cell_cursor = 0;
        while let Some((cell_start, cell_end)) = next_cell(row, cell_cursor) {
            cell_cursor = cell_end;
            let text = collapse(&decode_entities(&strip_tags(inner_after_open_tag(
                &row[cell_start..cell_end],
            ))));
            if !text.is_empty() {
                cells.push(text);
            }
        }
        rows.push(cells);
    }
    rows
}

fn next_cell(row: &str, from: usize) -> Option<(usize, usize)> {
    let td = next_tag_block_ci(row, "<td", "</td", from);
    let th = next_tag_block_ci(row, "<th", "</th", from);
    match (td, th) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn tag_name(inner: &str) -> String {
    inner
        .trim_start_matches('/')
        .split(|ch: char| ch.is_whitespace() || ch == '/')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn strip_tags(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn push_text(out: &mut String, raw: &str, preserve: bool) {
    if raw.is_empty() {
        return;
    }
    let decoded = decode_entities(raw);
    if preserve {
        out.push_str(&decoded.replace('\t', "    "));
        return;
    }
    let mut last_space = out.ends_with(' ');
    for ch in decoded.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        let Some(semi) = candidate.find(';').filter(|semi| *semi <= 10) else {
            out.push('&');
            rest = &candidate[1..];
            continue;
        };
        let entity = &candidate[1..semi];
        match decode_entity(entity) {
            Some(ch) => out.push(ch),
            None => out.push_str(&candidate[..=semi]),
        }
        rest = &candidate[semi + 1..];
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        "rsquo" | "lsquo" => Some('\''),
        "ndash" => Some('–'),
        "mdash" => Some('—'),
        "trade" => Some('™'),
        _ => {
            let numeric = entity.strip_prefix('#')?;
            let code = match numeric.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => numeric.parse::<u32>().ok()?,
            };
            let ch = char::from_u32(code)?;
            Some(if ch == '\u{a0}' { ' ' } else { ch })
        }
    }
}
