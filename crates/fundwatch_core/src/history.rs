//! Per-series name timelines rebuilt from extraction rows.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::extract::{ExtractionRow, clean_fund_name};
use crate::rollup::chronological;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameSource {
    #[serde(rename = "SGML")]
    Sgml,
    #[serde(rename = "PROSPECTUS")]
    Prospectus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameHistoryEntry {
    pub series_id: String,
    pub name: String,
    pub name_clean: String,
    pub first_seen: NaiveDate,
    /// `None` for the current name.
    pub last_seen: Option<NaiveDate>,
    pub is_current: bool,
    pub source_form: String,
    pub source_accession: String,
    pub source: NameSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMatch {
    pub series_id: String,
    pub current_name: String,
    pub all_names: Vec<String>,
}

struct Sighting {
    entry: NameHistoryEntry,
    last_seen: NaiveDate,
}

pub fn history(rows: &[ExtractionRow]) -> Vec<NameHistoryEntry> {
    let mut by_series: BTreeMap<&str, Vec<&ExtractionRow>> = BTreeMap::new();
    for row in rows {
        if let Some(series_id) = row.series_id.as_deref().filter(|id| !id.trim().is_empty()) {
            by_series.entry(series_id).or_default().push(row);
        }
    }

    let mut out = Vec::new();
    for (series_id, mut series_rows) in by_series {
        series_rows.sort_by(|a, b| chronological(a, b));
        out.extend(series_history(series_id, &series_rows));
    }
    out
}

fn series_history(series_id: &str, rows: &[&ExtractionRow]) -> Vec<NameHistoryEntry> {
    let mut sightings: Vec<Sighting> = Vec::new();
    let mut index_by_key: BTreeMap<String, usize> = BTreeMap::new();

    let mut observe = |name: &str, row: &ExtractionRow, source: NameSource| {
        let name_clean = clean_fund_name(name);
        if name_clean.is_empty() {
            return;
        }
        let key = name_clean.to_lowercase();
        match index_by_key.get(&key) {
            Some(&index) => sightings[index].last_seen = row.filing_date,
            None => {
                index_by_key.insert(key, sightings.len());
                sightings.push(Sighting {
                    entry: NameHistoryEntry {
                        series_id: series_id.to_string(),
                        name: name.trim().to_string(),
                        name_clean,
                        first_seen: row.filing_date,
                        last_seen: None,
                        is_current: false,
                        source_form: row.form.clone(),
                        source_accession: row.accession.clone(),
                        source,
                    },
                    last_seen: row.filing_date,
                });
            }
        }
    };

    for row in rows {
        observe(row.display_name(), row, NameSource::Sgml);
        if let Some(prospectus_name) = row.prospectus_name.as_deref() {
            observe(prospectus_name, row, NameSource::Prospectus);
        }
    }

    // Latest last-seen wins; among ties the name sighted first stays current.
    let current = sightings
        .iter()
        .enumerate()
        .max_by(|(left_index, left), (right_index, right)| {
            left.last_seen
                .cmp(&right.last_seen)
                .then_with(|| right_index.cmp(left_index))
        })
        .map(|(index, _)| index);

    let mut entries = sightings
        .into_iter()
        .enumerate()
        .map(|(index, sighting)| {
            let mut entry = sighting.entry;
            if Some(index) == current {
                entry.is_current = true;
            } else {
                entry.last_seen = Some(sighting.last_seen);
            }
            entry
        })
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
    entries
}

pub fn changes_for_series<'a>(
    entries: &'a [NameHistoryEntry],
    series_id: &str,
) -> Vec<&'a NameHistoryEntry> {
    let series_id = series_id.trim();
    entries
        .iter()
        .filter(|entry| entry.series_id.eq_ignore_ascii_case(series_id))
        .collect()
}

/// Series whose raw or cleaned names contain `query`, case-insensitively.
pub fn find_series_by_name(entries: &[NameHistoryEntry], query: &str) -> Vec<SeriesMatch> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let mut by_series: BTreeMap<&str, Vec<&NameHistoryEntry>> = BTreeMap::new();
    for entry in entries {
        by_series.entry(entry.series_id.as_str()).or_default().push(entry);
    }

    by_series
        .into_iter()
        .filter(|(_, series_entries)| {
            series_entries.iter().any(|entry| {
                entry.name.to_lowercase().contains(&needle)
                    || entry.name_clean.to_lowercase().contains(&needle)
            })
        })
        .map(|(series_id, series_entries)| SeriesMatch {
            series_id: series_id.to_string(),
            current_name: series_entries
                .iter()
                .find(|entry| entry.is_current)
                .map(|entry| entry.name.clone())
                .unwrap_or_default(),
            all_names: series_entries.iter().map(|entry| entry.name.clone()).collect(),
        })
        .collect()
}
