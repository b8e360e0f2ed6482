//! Record extraction: filing documents in, fund/series/class rows out.
//!
//! Strategies run in a fixed order and the first one that yields anything
//! wins. Tagged header rows are only ever enriched by later sources, never
//! replaced.

pub mod dates;
pub mod html;
pub mod pdf;
pub mod sgml;
pub mod ticker;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::submissions::FilingRef;

use self::html::NamedTicker;
use self::sgml::TaggedClass;

pub(crate) type CachedRegex = OnceCell<Result<Regex, String>>;

pub(crate) fn cached_regex<'a>(cell: &'a CachedRegex, pattern: &str) -> Option<&'a Regex> {
    match cell.get_or_init(|| Regex::new(pattern).map_err(|err| err.to_string())) {
        Ok(regex) => Some(regex),
        Err(message) => {
            error!(pattern, error = %message, "regex init failed");
            None
        }
    }
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Display-name normalization shared by rollup and name history.
pub fn clean_fund_name(raw: &str) -> String {
    let replaced = raw
        .replace('™', "TM")
        .replace("- Osprey", "-Osprey")
        .replace("+Staking", "+ Staking")
        .replace(['(', ')'], "");
    collapse_whitespace(&replaced)
}

/// Which stage of the cascade produced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExtractSource {
    TaggedText,
    HtmlTable,
    PlainText,
    PdfText,
}

impl ExtractSource {
    pub const CASCADE: [ExtractSource; 4] = [
        ExtractSource::TaggedText,
        ExtractSource::HtmlTable,
        ExtractSource::PlainText,
        ExtractSource::PdfText,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaggedText => "SGML-TXT",
            Self::HtmlTable => "PRIMARY-HTML",
            Self::PlainText => "PRIMARY-TEXT",
            Self::PdfText => "PRIMARY-PDF",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        Self::CASCADE
            .into_iter()
            .find(|source| source.as_str() == value)
    }
}

/// How a tagged row's ticker was recovered from body text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickerSource {
    TitleParen,
    LabelWindow,
}

impl TickerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TitleParen => "TITLE-PAREN",
            Self::LabelWindow => "LABEL-WINDOW",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "TITLE-PAREN" => Some(Self::TitleParen),
            "LABEL-WINDOW" => Some(Self::LabelWindow),
            _ => None,
        }
    }
}

/// Provenance tag, rendered as `SGML-TXT` or `SGML-TXT|TITLE-PAREN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Provenance {
    pub strategy: ExtractSource,
    pub ticker: Option<TickerSource>,
}

impl Provenance {
    pub fn new(strategy: ExtractSource) -> Self {
        Self {
            strategy,
            ticker: None,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ticker {
            Some(ticker) => write!(f, "{}|{}", self.strategy.as_str(), ticker.as_str()),
            None => f.write_str(self.strategy.as_str()),
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (strategy, ticker) = match value.split_once('|') {
            Some((strategy, ticker)) => (strategy, Some(ticker)),
            None => (value, None),
        };
        let strategy =
            ExtractSource::parse(strategy).ok_or_else(|| format!("unknown extraction source {value}"))?;
        let ticker = match ticker {
            Some(raw) => {
                Some(TickerSource::parse(raw).ok_or_else(|| format!("unknown ticker source {value}"))?)
            }
            None => None,
        };
        Ok(Self { strategy, ticker })
    }
}

impl From<Provenance> for String {
    fn from(value: Provenance) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Provenance {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One fund/series/class mention inside one filing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRow {
    pub registrant_id: String,
    pub registrant_name: String,
    pub accession: String,
    pub form: String,
    pub filing_date: NaiveDate,
    pub series_id: Option<String>,
    pub series_name: String,
    pub class_id: Option<String>,
    pub class_name: String,
    pub ticker: Option<String>,
    pub prospectus_name: Option<String>,
    pub effective_date: Option<NaiveDate>,
    pub delaying_amendment: bool,
    pub primary_url: String,
    pub submission_text_url: String,
    pub provenance: Provenance,
}

/// Uniqueness key of a row within a registrant's accumulated rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub accession: String,
    pub class_id: String,
    pub class_name: String,
    pub ticker: String,
}

impl ExtractionRow {
    /// Class name when present, otherwise the series name.
    pub fn display_name(&self) -> &str {
        if self.class_name.trim().is_empty() {
            &self.series_name
        } else {
            &self.class_name
        }
    }

    pub fn key(&self) -> RowKey {
        RowKey {
            accession: self.accession.clone(),
            class_id: self.class_id.clone().unwrap_or_default(),
            class_name: self.class_name.clone(),
            ticker: self.ticker.clone().unwrap_or_default(),
        }
    }
}

/// Fetched content available for one filing. Absent documents are `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilingDocuments<'a> {
    pub submission_text: Option<&'a str>,
    pub primary_html: Option<&'a str>,
    pub primary_pdf_text: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilingExtraction {
    pub rows: Vec<ExtractionRow>,
    pub effective_date: Option<NaiveDate>,
    pub delaying_amendment: bool,
    pub strategy: Option<ExtractSource>,
}

#[derive(Debug, Clone, Default)]
struct Candidate {
    series_id: String,
    series_name: String,
    class_id: String,
    class_name: String,
    ticker: String,
    ticker_source: Option<TickerSource>,
    prospectus_name: Option<String>,
}

/// Everything the strategies read, derived once per filing.
struct ExtractionContext<'a> {
    tagged: Vec<TaggedClass>,
    html_bodies: Vec<&'a str>,
    html_texts: &'a [String],
    pdf_text: Option<&'a str>,
    search_texts: Vec<&'a str>,
}

const EMBEDDED_PROSPECTUS_TYPES: [&str; 3] = ["485A", "485B", "497"];

pub fn extract_filing(filing: &FilingRef, documents: &FilingDocuments<'_>) -> FilingExtraction {
    if filing.is_effectiveness_notice() {
        debug!(accession = %filing.accession, "skipping effectiveness notice");
        return FilingExtraction::default();
    }

    let submission = documents.submission_text.unwrap_or("");
    let mut html_bodies = Vec::new();
    for document in html::embedded_documents(submission) {
        if EMBEDDED_PROSPECTUS_TYPES
            .iter()
            .any(|prefix| document.doc_type.starts_with(prefix))
        {
            html_bodies.push(document.body);
        }
    }
    if let Some(primary) = documents.primary_html {
        html_bodies.push(primary);
    }
    let html_texts = html_bodies
        .iter()
        .map(|body| html::text_content(body))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();

    let (effective_date, delaying_amendment) =
        resolve_effective_date(submission, &html_texts, documents.primary_pdf_text);

    let context = ExtractionContext {
        tagged: sgml::parse_series_classes(submission),
        html_bodies,
        html_texts: &html_texts,
        pdf_text: documents.primary_pdf_text,
        search_texts: search_texts(submission, &html_texts, documents.primary_pdf_text),
    };

    let Some((strategy, candidates)) = ExtractSource::CASCADE.into_iter().find_map(|strategy| {
        let found = attempt(strategy, &context);
        (!found.is_empty()).then_some((strategy, found))
    }) else {
        debug!(accession = %filing.accession, "no strategy produced rows");
        return FilingExtraction {
            rows: Vec::new(),
            effective_date,
            delaying_amendment,
            strategy: None,
        };
    };
    debug!(
        accession = %filing.accession,
        strategy = strategy.as_str(),
        rows = candidates.len(),
        "extracted filing"
    );

    let rows = candidates
        .into_iter()
        .map(|candidate| ExtractionRow {
            registrant_id: filing.registrant_id.clone(),
            registrant_name: filing.registrant_name.clone(),
            accession: filing.accession.clone(),
            form: filing.form.clone(),
            filing_date: filing.filing_date,
            series_id: non_empty(candidate.series_id),
            series_name: candidate.series_name,
            class_id: non_empty(candidate.class_id),
            class_name: candidate.class_name,
            ticker: non_empty(candidate.ticker),
            prospectus_name: candidate.prospectus_name,
            effective_date,
            delaying_amendment,
            primary_url: filing.primary_url.clone(),
            submission_text_url: filing.submission_text_url.clone(),
            provenance: Provenance {
                strategy,
                ticker: candidate.ticker_source,
            },
        })
        .collect::<Vec<_>>();

    FilingExtraction {
        rows: dedup_last_wins(rows),
        effective_date,
        delaying_amendment,
        strategy: Some(strategy),
    }
}

fn search_texts<'a>(
    submission: &'a str,
    html_texts: &'a [String],
    pdf_text: Option<&'a str>,
) -> Vec<&'a str> {
    let mut texts = Vec::with_capacity(html_texts.len() + 2);
    if !submission.is_empty() {
        texts.push(submission);
    }
    texts.extend(html_texts.iter().map(String::as_str));
    if let Some(pdf) = pdf_text {
        texts.push(pdf);
    }
    texts
}

fn attempt(strategy: ExtractSource, context: &ExtractionContext<'_>) -> Vec<Candidate> {
    match strategy {
        ExtractSource::TaggedText => tagged_candidates(context),
        ExtractSource::HtmlTable => context
            .html_bodies
            .iter()
            .flat_map(|body| html::ticker_table_rows(body))
            .map(named_candidate)
            .collect(),
        ExtractSource::PlainText => context
            .html_texts
            .iter()
            .flat_map(|text| html::columnar_rows(text))
            .map(named_candidate)
            .collect(),
        ExtractSource::PdfText => context
            .pdf_text
            .map(html::columnar_rows)
            .unwrap_or_default()
            .into_iter()
            .map(named_candidate)
            .collect(),
    }
}

fn tagged_candidates(context: &ExtractionContext<'_>) -> Vec<Candidate> {
    if context.tagged.is_empty() {
        return Vec::new();
    }
    let table_names = context
        .html_bodies
        .iter()
        .flat_map(|body| html::ticker_table_rows(body))
        .fold(HashMap::new(), |mut names, row| {
            names.entry(row.ticker).or_insert(row.name);
            names
        });

    context
        .tagged
        .iter()
        .map(|tagged| {
            let name = if tagged.class_name.is_empty() {
                &tagged.series_name
            } else {
                &tagged.class_name
            };
            let mut candidate = Candidate {
                series_id: tagged.series_id.clone(),
                series_name: tagged.series_name.clone(),
                class_id: tagged.class_id.clone(),
                class_name: tagged.class_name.clone(),
                ticker: tagged.ticker.clone(),
                ..Candidate::default()
            };
            if candidate.ticker.is_empty()
                && let Some((ticker, source)) = ticker::ticker_for_name(name, &context.search_texts)
            {
                candidate.ticker = ticker;
                candidate.ticker_source = Some(source);
            }
            if let Some(table_name) = table_names.get(&candidate.ticker) {
                let differs = clean_fund_name(table_name).to_lowercase()
                    != clean_fund_name(name).to_lowercase();
                if differs && !table_name.trim().is_empty() {
                    candidate.prospectus_name = Some(table_name.clone());
                }
            }
            candidate
        })
        .collect()
}

fn named_candidate(row: NamedTicker) -> Candidate {
    Candidate {
        class_name: row.name,
        ticker: row.ticker,
        ..Candidate::default()
    }
}

/// Header date first; otherwise the first body text that yields a phrase
/// date. The delaying flag is the union over every text.
fn resolve_effective_date(
    submission: &str,
    html_texts: &[String],
    pdf_text: Option<&str>,
) -> (Option<NaiveDate>, bool) {
    let mut effective = dates::header_effective_date(submission);
    let mut delaying = false;
    let bodies = std::iter::once(submission)
        .chain(html_texts.iter().map(String::as_str))
        .chain(pdf_text);
    for body in bodies {
        let found = dates::scan_body(body);
        delaying |= found.delaying;
        if effective.is_none() {
            effective = found.effective;
        }
    }
    (effective, delaying)
}

fn dedup_last_wins(rows: Vec<ExtractionRow>) -> Vec<ExtractionRow> {
    let mut seen = HashSet::new();
    let mut kept = rows
        .into_iter()
        .rev()
        .filter(|row| seen.insert(row.key()))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
