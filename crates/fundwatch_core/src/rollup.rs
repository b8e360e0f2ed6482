//! One authoritative status row per fund, rebuilt from extraction rows.
//!
//! `rollup` is pure: it sorts its input by a total order before grouping, so
//! the result does not depend on the order rows were stored in.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::extract::{ExtractionRow, clean_fund_name};

/// Days added to an initial registration's filing date when its text gives
/// no effective date.
pub const INITIAL_REVIEW_DAYS: u64 = 75;

const POST_EFFECTIVE_PREFIX: &str = "485B";
const INITIAL_PREFIX: &str = "485A";
const SUPPLEMENT_PREFIX: &str = "497";

/// Which form family supplied the latest prospectus, and how its date was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    #[serde(rename = "BPOS chosen")]
    PostEffective,
    #[serde(rename = "APOS chosen (eff=parsed)")]
    InitialParsed,
    #[serde(rename = "APOS chosen (eff=+75d)")]
    InitialReviewWindow,
    #[serde(rename = "Supplements only")]
    SupplementsOnly,
    #[serde(rename = "No prospectus form found")]
    NoProspectusForm,
}

impl Selection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostEffective => "BPOS chosen",
            Self::InitialParsed => "APOS chosen (eff=parsed)",
            Self::InitialReviewWindow => "APOS chosen (eff=+75d)",
            Self::SupplementsOnly => "Supplements only",
            Self::NoProspectusForm => "No prospectus form found",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    #[serde(rename = "EFFECTIVE")]
    Effective,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "DELAYED")]
    Delayed,
    #[serde(rename = "SUPPLEMENTS ONLY")]
    SupplementsOnly,
    #[serde(rename = "NO PROSPECTUS FORM FOUND")]
    NoProspectusForm,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Effective => "EFFECTIVE",
            Self::Pending => "PENDING",
            Self::Delayed => "DELAYED",
            Self::SupplementsOnly => "SUPPLEMENTS ONLY",
            Self::NoProspectusForm => "NO PROSPECTUS FORM FOUND",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyFiling {
    pub form: String,
    pub filing_date: NaiveDate,
    pub accession: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChosenProspectus {
    pub form: String,
    pub filing_date: NaiveDate,
    pub effective_date: NaiveDate,
    pub link: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundStatus {
    pub fund_key: String,
    pub registrant_id: String,
    pub registrant_name: String,
    pub canonical_name: String,
    pub ticker: Option<String>,
    pub series_id: Option<String>,
    pub class_id: Option<String>,
    pub first_seen_date: NaiveDate,
    pub first_seen_form: String,
    pub first_seen_link: String,
    pub latest_initial: Option<FamilyFiling>,
    pub latest_post_effective: Option<FamilyFiling>,
    pub latest_supplement: Option<FamilyFiling>,
    pub latest_prospectus: Option<ChosenProspectus>,
    pub selection: Selection,
    pub lifecycle: Lifecycle,
}

impl FundStatus {
    /// Lifecycle as seen on `date`: a pending registration whose derived
    /// effective date has passed counts as effective.
    pub fn lifecycle_as_of(&self, date: NaiveDate) -> Lifecycle {
        match (self.lifecycle, &self.latest_prospectus) {
            (Lifecycle::Pending, Some(chosen)) if chosen.effective_date <= date => Lifecycle::Effective,
            (lifecycle, _) => lifecycle,
        }
    }
}

/// Grouping key: class id, else series id, else cleaned name plus ticker.
pub fn fund_key(row: &ExtractionRow) -> String {
    if let Some(class_id) = row.class_id.as_deref().filter(|id| !id.is_empty()) {
        return format!("C:{class_id}");
    }
    if let Some(series_id) = row.series_id.as_deref().filter(|id| !id.is_empty()) {
        return format!("S:{series_id}");
    }
    format!(
        "{}|T:{}",
        clean_fund_name(row.display_name()).to_lowercase(),
        row.ticker.as_deref().unwrap_or("").to_ascii_uppercase()
    )
}

/// Total order used before any grouping: filing date first, then stable identifiers.
pub(crate) fn chronological(a: &ExtractionRow, b: &ExtractionRow) -> Ordering {
    a.filing_date
        .cmp(&b.filing_date)
        .then_with(|| a.accession.cmp(&b.accession))
        .then_with(|| a.class_id.cmp(&b.class_id))
        .then_with(|| a.series_id.cmp(&b.series_id))
        .then_with(|| a.class_name.cmp(&b.class_name))
        .then_with(|| a.series_name.cmp(&b.series_name))
        .then_with(|| a.ticker.cmp(&b.ticker))
        .then_with(|| a.form.cmp(&b.form))
        .then_with(|| a.provenance.to_string().cmp(&b.provenance.to_string()))
}

/// Python-style title casing: a letter is upper-cased when it follows a non-letter.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_is_letter = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if previous_is_letter {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_is_letter = true;
        } else {
            out.push(ch);
            previous_is_letter = false;
        }
    }
    out
}

pub fn rollup(rows: &[ExtractionRow]) -> Vec<FundStatus> {
    let mut ordered = rows.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| chronological(a, b));

    let mut groups: BTreeMap<String, Vec<&ExtractionRow>> = BTreeMap::new();
    for row in ordered {
        groups.entry(fund_key(row)).or_default().push(row);
    }

    let statuses = groups
        .into_iter()
        .filter_map(|(key, group)| summarize_group(key, &group))
        .collect::<Vec<_>>();
    let mut statuses = dedup_by_name_and_ticker(statuses);
    statuses.sort_by(|a, b| {
        a.registrant_id
            .cmp(&b.registrant_id)
            .then_with(|| a.canonical_name.cmp(&b.canonical_name))
            .then_with(|| a.fund_key.cmp(&b.fund_key))
    });
    statuses
}

fn summarize_group(fund_key: String, group: &[&ExtractionRow]) -> Option<FundStatus> {
    let first = group.first()?;
    let latest_of = |prefix: &str| {
        group
            .iter()
            .rev()
            .find(|row| row.form.trim().to_ascii_uppercase().starts_with(prefix))
            .copied()
    };
    let post_effective = latest_of(POST_EFFECTIVE_PREFIX);
    let initial = latest_of(INITIAL_PREFIX);
    let supplement = latest_of(SUPPLEMENT_PREFIX);

    let (latest_prospectus, selection, lifecycle) = if let Some(row) = post_effective {
        let chosen = ChosenProspectus {
            form: row.form.clone(),
            filing_date: row.filing_date,
            effective_date: row.effective_date.unwrap_or(row.filing_date),
            link: row.primary_url.clone(),
            source: POST_EFFECTIVE_PREFIX.to_string(),
        };
        (Some(chosen), Selection::PostEffective, Lifecycle::Effective)
    } else if let Some(row) = initial {
        let (effective_date, selection) = match row.effective_date {
            Some(parsed) => (parsed, Selection::InitialParsed),
            None => (
                row.filing_date
                    .checked_add_days(Days::new(INITIAL_REVIEW_DAYS))
                    .unwrap_or(row.filing_date),
                Selection::InitialReviewWindow,
            ),
        };
        let lifecycle = if row.delaying_amendment {
            Lifecycle::Delayed
        } else {
            Lifecycle::Pending
        };
        let chosen = ChosenProspectus {
            form: row.form.clone(),
            filing_date: row.filing_date,
            effective_date,
            link: row.primary_url.clone(),
            source: INITIAL_PREFIX.to_string(),
        };
        (Some(chosen), selection, lifecycle)
    } else if supplement.is_some() {
        (None, Selection::SupplementsOnly, Lifecycle::SupplementsOnly)
    } else {
        (None, Selection::NoProspectusForm, Lifecycle::NoProspectusForm)
    };

    let canonical_name = latest_non_empty(group, |row| clean_fund_name(row.display_name()))
        .map(|name| title_case(&name))
        .unwrap_or_default();

    Some(FundStatus {
        fund_key,
        registrant_id: latest_non_empty(group, |row| row.registrant_id.clone()).unwrap_or_default(),
        registrant_name: latest_non_empty(group, |row| row.registrant_name.clone())
            .unwrap_or_default(),
        canonical_name,
        ticker: latest_non_empty(group, |row| {
            row.ticker.as_deref().unwrap_or("").to_ascii_uppercase()
        }),
        series_id: latest_non_empty(group, |row| row.series_id.clone().unwrap_or_default()),
        class_id: latest_non_empty(group, |row| row.class_id.clone().unwrap_or_default()),
        first_seen_date: first.filing_date,
        first_seen_form: first.form.clone(),
        first_seen_link: first.primary_url.clone(),
        latest_initial: initial.map(family_filing),
        latest_post_effective: post_effective.map(family_filing),
        latest_supplement: supplement.map(family_filing),
        latest_prospectus,
        selection,
        lifecycle,
    })
}

fn family_filing(row: &ExtractionRow) -> FamilyFiling {
    FamilyFiling {
        form: row.form.clone(),
        filing_date: row.filing_date,
        accession: row.accession.clone(),
        link: row.primary_url.clone(),
    }
}

fn latest_non_empty<F>(group: &[&ExtractionRow], value: F) -> Option<String>
where
    F: Fn(&ExtractionRow) -> String,
{
    group
        .iter()
        .rev()
        .map(|row| value(row))
        .find(|candidate| !candidate.trim().is_empty())
}

/// Collapse funds that resolved to the same name and ticker through different
/// keys. The survivor is the one with the earliest chosen prospectus filing,
/// a fund with no chosen prospectus counting as earliest. Best effort only:
/// unnamed funds are never merged.
fn dedup_by_name_and_ticker(statuses: Vec<FundStatus>) -> Vec<FundStatus> {
    let mut kept: Vec<FundStatus> = Vec::with_capacity(statuses.len());
    let mut index_by_pair: HashMap<(String, String, String), usize> = HashMap::new();
    for status in statuses {
        if status.canonical_name.is_empty() {
            kept.push(status);
            continue;
        }
        let pair = (
            status.registrant_id.clone(),
            status.canonical_name.to_lowercase(),
            status.ticker.clone().unwrap_or_default(),
        );
        match index_by_pair.get(&pair) {
            Some(&index) => {
                if supersedes(&status, &kept[index]) {
                    kept[index] = status;
                }
            }
            None => {
                index_by_pair.insert(pair, kept.len());
                kept.push(status);
            }
        }
    }
    kept
}

fn supersedes(candidate: &FundStatus, current: &FundStatus) -> bool {
    let date = |status: &FundStatus| status.latest_prospectus.as_ref().map(|chosen| chosen.filing_date);
    date(candidate)
        .cmp(&date(current))
        .then_with(|| candidate.fund_key.cmp(&current.fund_key))
        == Ordering::Less
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::extract::{ExtractSource, Provenance};

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn row(form: &str, filed: &str, accession: &str) -> ExtractionRow {
        ExtractionRow {
            registrant_id: "1174610".to_string(),
            registrant_name: "ProShares Trust II".to_string(),
            accession: accession.to_string(),
            form: form.to_string(),
            filing_date: date(filed),
            series_id: Some("S000071234".to_string()),
            series_name: "ProShares Ultra Bitcoin ETF".to_string(),
            class_id: Some("C000226001".to_string()),
            class_name: "proshares ultra bitcoin etf".to_string(),
            ticker: Some("BITU".to_string()),
            prospectus_name: None,
            effective_date: None,
            delaying_amendment: false,
            primary_url: format!("https://example.org/{accession}.htm"),
            submission_text_url: format!("https://example.org/{accession}.txt"),
            provenance: Provenance::new(ExtractSource::TaggedText),
        }
    }

    #[test]
    fn post_effective_beats_later_initial_registration() {
        let mut bpos = row("485BPOS", "2024-03-01", "a-1");
        bpos.effective_date = Some(date("2024-03-05"));
        let apos = row("485APOS", "2024-09-01", "a-2");
        let statuses = rollup(&[apos, bpos]);

        assert_eq!(statuses.len(), 1);
        let status = &statuses[0];
        assert_eq!(status.fund_key, "C:C000226001");
        assert_eq!(status.selection, Selection::PostEffective);
        assert_eq!(status.lifecycle, Lifecycle::Effective);
        let chosen = status.latest_prospectus.as_ref().expect("chosen");
        assert_eq!(chosen.form, "485BPOS");
        assert_eq!(chosen.effective_date, date("2024-03-05"));
        assert_eq!(
            status.latest_initial.as_ref().map(|filing| filing.filing_date),
            Some(date("2024-09-01"))
        );
        assert_eq!(status.first_seen_date, date("2024-03-01"));
        assert_eq!(status.canonical_name, "Proshares Ultra Bitcoin Etf");
    }

    #[test]
    fn post_effective_without_parsed_date_uses_filing_date() {
        let statuses = rollup(&[row("485BPOS", "2024-03-01", "a-1")]);
        let chosen = statuses[0].latest_prospectus.as_ref().expect("chosen");
        assert_eq!(chosen.effective_date, date("2024-03-01"));
    }

    #[test]
    fn initial_registration_falls_back_to_review_window() {
        let statuses = rollup(&[row("485APOS", "2025-01-01", "a-1")]);
        let status = &statuses[0];
        assert_eq!(status.selection, Selection::InitialReviewWindow);
        assert_eq!(status.lifecycle, Lifecycle::Pending);
        let chosen = status.latest_prospectus.as_ref().expect("chosen");
        assert_eq!(chosen.effective_date, date("2025-03-17"));
        assert_eq!(status.lifecycle_as_of(date("2025-03-16")), Lifecycle::Pending);
        assert_eq!(status.lifecycle_as_of(date("2025-03-17")), Lifecycle::Effective);
    }

    #[test]
    fn delaying_amendment_marks_delayed() {
        let mut apos = row("485APOS", "2025-01-01", "a-1");
        apos.delaying_amendment = true;
        apos.effective_date = Some(date("2025-02-01"));
        let status = &rollup(&[apos])[0];
        assert_eq!(status.selection, Selection::InitialParsed);
        assert_eq!(status.lifecycle, Lifecycle::Delayed);
        assert_eq!(status.lifecycle_as_of(date("2030-01-01")), Lifecycle::Delayed);
    }

    #[test]
    fn supplements_and_missing_prospectus() {
        let status = &rollup(&[row("497K", "2025-01-01", "a-1")])[0];
        assert_eq!(status.selection, Selection::SupplementsOnly);
        assert!(status.latest_prospectus.is_none());
        assert!(status.latest_supplement.is_some());

        let status = &rollup(&[row("N-1A", "2025-01-01", "a-1")])[0];
        assert_eq!(status.lifecycle, Lifecycle::NoProspectusForm);
    }

    #[test]
    fn output_does_not_depend_on_input_order() {
        let mut rows = vec![
            row("485APOS", "2024-01-10", "a-1"),
            row("497", "2024-02-10", "a-2"),
            row("485BPOS", "2024-02-10", "a-3"),
        ];
        let mut other = row("485APOS", "2024-02-10", "b-1");
        other.class_id = None;
        other.series_id = None;
        other.class_name = "Osprey Solana Trust".to_string();
        other.ticker = Some("osol".to_string());
        rows.push(other);

        let forward = rollup(&rows);
        rows.reverse();
        let backward = rollup(&rows);
        rows.swap(0, 2);
        let shuffled = rollup(&rows);
        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);
        assert_eq!(forward.len(), 2);
        assert!(forward.iter().any(|status| status.fund_key == "osprey solana trust|T:OSOL"));
    }

    #[test]
    fn name_and_ticker_collisions_keep_the_earliest_prospectus() {
        let by_class = row("485BPOS", "2024-06-01", "a-1");
        let mut by_name = row("485BPOS", "2024-01-01", "a-2");
        by_name.class_id = None;
        by_name.series_id = None;
        let statuses = rollup(&[by_class.clone(), by_name]);
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].fund_key.ends_with("|T:BITU"));
        assert_eq!(
            statuses[0]
                .latest_prospectus
                .as_ref()
                .map(|chosen| chosen.filing_date),
            Some(date("2024-01-01"))
        );

        let mut later_by_name = row("485BPOS", "2024-09-01", "a-3");
        later_by_name.class_id = None;
        later_by_name.series_id = None;
        let statuses = rollup(&[by_class, later_by_name]);
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].fund_key.starts_with("C:"));
    }

    #[test]
    fn name_and_ticker_collision_prefers_the_fund_without_a_prospectus() {
        let by_class = row("485BPOS", "2024-06-01", "a-1");
        let mut supplement = row("497", "2024-08-01", "a-2");
        supplement.class_id = None;
        supplement.series_id = None;
        let statuses = rollup(&[by_class, supplement]);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].selection, Selection::SupplementsOnly);
    }

    #[test]
    fn title_case_matches_word_boundaries() {
        assert_eq!(title_case("2x bitcoin strategy etf"), "2X Bitcoin Strategy Etf");
        assert_eq!(title_case("REX-OSPREY SOL + STAKING"), "Rex-Osprey Sol + Staking");
    }
}
