use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{DEFAULT_ARCHIVES_BASE, normalize_registrant_id, parse_iso_date};

/// Administrative notice confirming effectiveness; carries no fund metadata.
pub const EFFECTIVENESS_NOTICE_FORM: &str = "EFFECT";

/// One filed submission as listed in a registrant's index document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingRef {
    pub registrant_id: String,
    pub registrant_name: String,
    pub accession: String,
    pub form: String,
    pub filing_date: NaiveDate,
    pub primary_document: String,
    pub primary_url: String,
    pub submission_text_url: String,
}

impl FilingRef {
    pub fn is_effectiveness_notice(&self) -> bool {
        self.form.trim().eq_ignore_ascii_case(EFFECTIVENESS_NOTICE_FORM)
    }

    pub fn primary_is_html(&self) -> bool {
        let lower = strip_query(&self.primary_url).to_ascii_lowercase();
        lower.ends_with(".htm") || lower.ends_with(".html")
    }

    pub fn primary_is_pdf(&self) -> bool {
        strip_query(&self.primary_url)
            .to_ascii_lowercase()
            .ends_with(".pdf")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrantIndex {
    pub registrant_id: String,
    pub name: String,
    pub filings: Vec<FilingRef>,
    pub overflow_files: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct IndexDocument {
    #[serde(default)]
    cik: Option<serde_json::Value>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    filings: FilingsPayload,
}

#[derive(Debug, Deserialize, Default)]
struct FilingsPayload {
    #[serde(default)]
    recent: FilingColumns,
    #[serde(default)]
    files: Vec<OverflowReference>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FilingColumns {
    #[serde(default)]
    accession_number: Vec<String>,
    #[serde(default)]
    filing_date: Vec<String>,
    #[serde(default)]
    form: Vec<String>,
    #[serde(default)]
    primary_document: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OverflowReference {
    name: String,
}

/// Parse a per-registrant index document. `fallback_id` is used when the
/// document omits its own identifier.
pub fn parse_index(json: &str, fallback_id: &str) -> Result<RegistrantIndex> {
    let document: IndexDocument =
        serde_json::from_str(json).context("failed to decode registrant index document")?;
    let registrant_id = document
        .cik
        .as_ref()
        .and_then(json_scalar)
        .map(|value| normalize_registrant_id(&value))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| normalize_registrant_id(fallback_id));
    let filings = expand_columns(&document.filings.recent, &registrant_id, &document.name);
    Ok(RegistrantIndex {
        registrant_id,
        name: document.name,
        filings,
        overflow_files: document
            .filings
            .files
            .into_iter()
            .map(|file| file.name)
            .collect(),
    })
}

/// Overflow continuation documents carry the same parallel arrays at top level.
pub fn parse_overflow(json: &str, registrant_id: &str, registrant_name: &str) -> Result<Vec<FilingRef>> {
    let columns: FilingColumns =
        serde_json::from_str(json).context("failed to decode overflow index document")?;
    Ok(expand_columns(&columns, registrant_id, registrant_name))
}

/// Forms every parsed filing list keeps: the effectiveness notice plus configured prefixes.
pub fn is_prospectus_form(form: &str, prefixes: &[String]) -> bool {
    let upper = form.trim().to_ascii_uppercase();
    upper == EFFECTIVENESS_NOTICE_FORM
        || prefixes
            .iter()
            .any(|prefix| upper.starts_with(&prefix.to_ascii_uppercase()))
}

/// Inclusive filing-date window plus an optional form-prefix filter.
#[derive(Debug, Clone, Default)]
pub struct FilingFilter {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub form_prefixes: Vec<String>,
}

impl FilingFilter {
    pub fn accepts(&self, filing: &FilingRef) -> bool {
        if self.since.is_some_and(|since| filing.filing_date < since) {
            return false;
        }
        if self.until.is_some_and(|until| filing.filing_date > until) {
            return false;
        }
        if self.form_prefixes.is_empty() {
            return true;
        }
        let form = filing.form.trim().to_ascii_uppercase();
        self.form_prefixes
            .iter()
            .any(|prefix| form.starts_with(&prefix.to_ascii_uppercase()))
    }
}

pub fn primary_document_url(registrant_id: &str, accession: &str, document: &str) -> String {
    format!(
        "{DEFAULT_ARCHIVES_BASE}/{}/{}/{}",
        normalize_registrant_id(registrant_id),
        accession.replace('-', ""),
        document
    )
}

pub fn submission_text_url(registrant_id: &str, accession: &str) -> String {
    format!(
        "{DEFAULT_ARCHIVES_BASE}/{}/{}/{}.txt",
        normalize_registrant_id(registrant_id),
        accession.replace('-', ""),
        accession
    )
}

fn expand_columns(columns: &FilingColumns, registrant_id: &str, registrant_name: &str) -> Vec<FilingRef> {
    let mut filings = Vec::with_capacity(columns.accession_number.len());
    for (index, accession) in columns.accession_number.iter().enumerate() {
        let accession = accession.trim();
        if accession.is_empty() {
            continue;
        }
        let raw_date = columns.filing_date.get(index).map(String::as_str).unwrap_or("");
        let Some(filing_date) = parse_iso_date(raw_date) else {
            warn!(registrant_id, accession, raw_date, "skipping filing with unparseable date");
            continue;
        };
        let form = columns.form.get(index).cloned().unwrap_or_default();
        let primary_document = columns
            .primary_document
            .get(index)
            .cloned()
            .unwrap_or_default();
        let primary_url = if primary_document.is_empty() {
            String::new()
        } else {
            primary_document_url(registrant_id, accession, &primary_document)
        };
        filings.push(FilingRef {
            registrant_id: registrant_id.to_string(),
            registrant_name: registrant_name.to_string(),
            accession: accession.to_string(),
            form: form.trim().to_string(),
            filing_date,
            primary_document,
            primary_url,
            submission_text_url: submission_text_url(registrant_id, accession),
        });
    }
    filings
}

fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url).trim()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const INDEX: &str = r#"{
        "cik": "1174610",
        "name": "ProShares Trust II",
        "filings": {
            "recent": {
                "accessionNumber": ["0001174610-25-000012", "0001174610-25-000007", "0001174610-24-000099"],
                "filingDate": ["2025-02-14", "not-a-date", "2024-11-01"],
                "form": ["485BPOS", "497", "EFFECT"],
                "primaryDocument": ["d12345d485bpos.htm", "d1.htm", "xslFormEFFECT/primary_doc.xml"]
            },
            "files": [{"name": "CIK0001174610-submissions-001.json", "filingCount": 2000}]
        }
    }"#;

    #[test]
    fn parse_index_expands_parallel_arrays() {
        let index = parse_index(INDEX, "0").expect("parse");
        assert_eq!(index.registrant_id, "1174610");
        assert_eq!(index.name, "ProShares Trust II");
        assert_eq!(index.filings.len(), 2, "bad date row is skipped");
        assert_eq!(index.overflow_files, vec!["CIK0001174610-submissions-001.json"]);

        let first = &index.filings[0];
        assert_eq!(first.form, "485BPOS");
        assert_eq!(first.filing_date, NaiveDate::from_ymd_opt(2025, 2, 14).expect("date"));
        assert_eq!(
            first.primary_url,
            "https://www.sec.gov/Archives/edgar/data/1174610/000117461025000012/d12345d485bpos.htm"
        );
        assert_eq!(
            first.submission_text_url,
            "https://www.sec.gov/Archives/edgar/data/1174610/000117461025000012/0001174610-25-000012.txt"
        );
        assert!(first.primary_is_html());
        assert!(index.filings[1].is_effectiveness_notice());
    }

    #[test]
    fn parse_index_falls_back_to_given_id() {
        let index = parse_index(r#"{"name": "Anon Trust"}"#, "0000826732").expect("parse");
        assert_eq!(index.registrant_id, "826732");
        assert!(index.filings.is_empty());
        let numeric = parse_index(r#"{"cik": 826732}"#, "1").expect("parse");
        assert_eq!(numeric.registrant_id, "826732");
    }

    #[test]
    fn parse_overflow_reads_top_level_columns() {
        let json = r#"{
            "accessionNumber": ["0000826732-10-000001"],
            "filingDate": ["2010-05-03"],
            "form": ["485APOS"],
            "primaryDocument": ["prospectus.pdf"]
        }"#;
        let filings = parse_overflow(json, "826732", "Old Trust").expect("parse");
        assert_eq!(filings.len(), 1);
        assert!(filings[0].primary_is_pdf());
        assert_eq!(filings[0].registrant_name, "Old Trust");
    }

    #[test]
    fn prospectus_forms_and_filter_window() {
        let prefixes = vec!["485A".to_string(), "485B".to_string(), "497".to_string()];
        assert!(is_prospectus_form("485BPOS", &prefixes));
        assert!(is_prospectus_form("effect", &prefixes));
        assert!(is_prospectus_form("497K", &prefixes));
        assert!(!is_prospectus_form("N-CSR", &prefixes));

        let index = parse_index(INDEX, "0").expect("parse");
        let filter = FilingFilter {
            since: NaiveDate::from_ymd_opt(2025, 1, 1),
            until: None,
            form_prefixes: Vec::new(),
        };
        let kept = index
            .filings
            .iter()
            .filter(|filing| filter.accepts(filing))
            .count();
        assert_eq!(kept, 1);

        let by_form = FilingFilter {
            form_prefixes: vec!["effect".to_string()],
            ..FilingFilter::default()
        };
        assert!(by_form.accepts(&index.filings[1]));
        assert!(!by_form.accepts(&index.filings[0]));
    }

    #[test]
    fn malformed_index_is_an_error() {
        assert!(parse_index("<html>", "1").is_err());
    }
}
