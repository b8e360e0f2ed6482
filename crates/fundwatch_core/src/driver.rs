//! Incremental extraction run over the registrant registry.
//!
//! Each worker thread owns its own document source and store connection and
//! takes registrants from a shared cursor until none remain. The only shared
//! mutable state is the aggregate [`RunSummary`] behind one mutex.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{FetchSettings, PipelineSettings, normalize_registrant_id, per_worker_pause};
use crate::extract::{ExtractionRow, FilingDocuments, extract_filing, pdf};
use crate::fetch::{BlockingFetchClient, DocumentSource, FetchClient};
use crate::history::{NameHistoryEntry, history};
use crate::rate_limit::Pacer;
use crate::registry::{Registry, RegistryEntry, write_atomic};
use crate::rollup::{FundStatus, rollup};
use crate::runtime::ResolvedPaths;
use crate::store::Store;
use crate::submissions::{FilingFilter, FilingRef, is_prospectus_form, parse_index, parse_overflow};

pub const FUND_STATUS_FILENAME: &str = "fund_status.json";
pub const NAME_HISTORY_FILENAME: &str = "name_history.json";
const NO_ROWS_BUCKET: &str = "NONE";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to these registrants; empty means the whole registry.
    pub registrant_ids: Vec<String>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub form_prefixes: Vec<String>,
    pub workers: Option<usize>,
    /// Clear each registrant's manifest first so every filing is reprocessed.
    pub force: bool,
    /// Warm the index cache through the async batch client before the workers start.
    pub prefetch: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrantReport {
    pub registrant_id: String,
    pub name: String,
    pub filings_considered: usize,
    pub new_filings: usize,
    pub skipped_filings: usize,
    pub errored_filings: usize,
    pub rows_extracted: usize,
    pub strategy_usage: BTreeMap<String, usize>,
    pub funds: usize,
    pub name_history_entries: usize,
    pub request_count: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub registrants: usize,
    pub new_filings: usize,
    pub skipped_filings: usize,
    pub errored_filings: usize,
    pub rows_extracted: usize,
    pub strategy_usage: BTreeMap<String, usize>,
    pub request_count: usize,
    pub errors: Vec<String>,
    pub reports: Vec<RegistrantReport>,
}

impl RunSummary {
    fn absorb(&mut self, report: RegistrantReport) {
        self.registrants += 1;
        self.new_filings += report.new_filings;
        self.skipped_filings += report.skipped_filings;
        self.errored_filings += report.errored_filings;
        self.rows_extracted += report.rows_extracted;
        self.request_count += report.request_count;
        for (strategy, count) in &report.strategy_usage {
            *self.strategy_usage.entry(strategy.clone()).or_default() += count;
        }
        self.errors.extend(
            report
                .errors
                .iter()
                .map(|error| format!("{}: {error}", report.registrant_id)),
        );
        self.reports.push(report);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputReport {
    pub fund_status_path: PathBuf,
    pub name_history_path: PathBuf,
    pub funds: usize,
    pub name_history_entries: usize,
}

/// Run against the live archive. Fails fast when no identification string is set.
pub fn run(
    paths: &ResolvedPaths,
    registry: &Registry,
    fetch: &FetchSettings,
    pipeline: &PipelineSettings,
    options: &RunOptions,
) -> Result<RunSummary> {
    fetch.require_user_agent()?;
    let entries = selected_entries(registry, options);
    let workers = options.workers.unwrap_or(pipeline.workers).max(1);

    if options.prefetch {
        prefetch_indexes(paths, fetch, &entries)?;
    }

    let pause = per_worker_pause(workers, fetch.rate_limit);
    info!(
        registrants = entries.len(),
        workers,
        pause_ms = pause.as_millis() as u64,
        "starting extraction run"
    );
    run_with_sources(paths, &entries, pipeline, options, workers, || {
        Ok(BlockingFetchClient::with_pacer(
            fetch.clone(),
            &paths.cache_dir,
            Pacer::new(pause),
        )?)
    })
}

/// Worker pool over any document source. `make_source` is called once per worker.
pub fn run_with_sources<S, F>(
    paths: &ResolvedPaths,
    entries: &[RegistryEntry],
    pipeline: &PipelineSettings,
    options: &RunOptions,
    workers: usize,
    make_source: F,
) -> Result<RunSummary>
where
    S: DocumentSource,
    F: Fn() -> Result<S> + Sync,
{
    let cursor = AtomicUsize::new(0);
    let summary = Mutex::new(RunSummary::default());
    let filter = FilingFilter {
        since: options.since.or(pipeline.since),
        until: options.until.or(pipeline.until),
        form_prefixes: options.form_prefixes.clone(),
    };
    let workers = workers.clamp(1, entries.len().max(1));

    let outcomes = thread::scope(|scope| {
        let handles = (0..workers)
            .map(|worker| {
                let cursor = &cursor;
                let summary = &summary;
                let filter = &filter;
                let make_source = &make_source;
                scope.spawn(move || -> Result<()> {
                    let mut source = make_source()?;
                    let mut store = Store::open(&paths.db_path)?;
                    loop {
                        let next = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(entry) = entries.get(next) else {
                            break;
                        };
                        let before = source.request_count();
                        let mut report = process_registrant(
                            &mut source,
                            &mut store,
                            paths,
                            entry,
                            pipeline,
                            filter,
                            options.force,
                        );
                        report.request_count = source.request_count().saturating_sub(before);
                        debug!(worker, registrant_id = %entry.id, "registrant finished");
                        lock(summary).absorb(report);
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("extraction worker panicked")))
            })
            .collect::<Vec<_>>()
    });
    for outcome in outcomes {
        outcome?;
    }

    let mut summary = summary
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    summary.reports.sort_by(|a, b| a.registrant_id.cmp(&b.registrant_id));
    summary.success = summary.errors.is_empty();
    info!(
        registrants = summary.registrants,
        new = summary.new_filings,
        skipped = summary.skipped_filings,
        errored = summary.errored_filings,
        rows = summary.rows_extracted,
        "extraction run finished"
    );
    Ok(summary)
}

/// Recompute and write both artifacts for one registrant from stored rows.
pub fn write_outputs(
    paths: &ResolvedPaths,
    registrant_id: &str,
    rows: &[ExtractionRow],
) -> Result<OutputReport> {
    let statuses: Vec<FundStatus> = rollup(rows);
    let names: Vec<NameHistoryEntry> = history(rows);
    let dir = paths.registrant_output_dir(registrant_id);
    let fund_status_path = dir.join(FUND_STATUS_FILENAME);
    let name_history_path = dir.join(NAME_HISTORY_FILENAME);

    let body = serde_json::to_vec_pretty(&statuses).context("failed to serialize fund status")?;
    write_atomic(&fund_status_path, &body)?;
    let body = serde_json::to_vec_pretty(&names).context("failed to serialize name history")?;
    write_atomic(&name_history_path, &body)?;

    Ok(OutputReport {
        fund_status_path,
        name_history_path,
        funds: statuses.len(),
        name_history_entries: names.len(),
    })
}

fn selected_entries(registry: &Registry, options: &RunOptions) -> Vec<RegistryEntry> {
    if options.registrant_ids.is_empty() {
        return registry.entries().to_vec();
    }
    options
        .registrant_ids
        .iter()
        .map(|id| match registry.get(id) {
            Some(entry) => entry.clone(),
            None => RegistryEntry {
                id: normalize_registrant_id(id),
                name: String::new(),
            },
        })
        .collect()
}

fn prefetch_indexes(
    paths: &ResolvedPaths,
    fetch: &FetchSettings,
    entries: &[RegistryEntry],
) -> Result<()> {
    let ids = entries.iter().map(|entry| entry.id.clone()).collect::<Vec<_>>();
    let client = FetchClient::new(fetch.clone(), &paths.cache_dir)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start prefetch runtime")?;
    let results = runtime.block_on(client.fetch_submissions_batch(&ids));
    let failed = results.values().filter(|result| result.is_err()).count();
    info!(
        requested = ids.len(),
        failed,
        requests = client.request_count(),
        "prefetched index documents"
    );
    Ok(())
}

fn process_registrant<S: DocumentSource>(
    source: &mut S,
    store: &mut Store,
    paths: &ResolvedPaths,
    entry: &RegistryEntry,
    pipeline: &PipelineSettings,
    filter: &FilingFilter,
    force: bool,
) -> RegistrantReport {
    let mut report = RegistrantReport {
        registrant_id: entry.id.clone(),
        name: entry.name.clone(),
        ..RegistrantReport::default()
    };
    if let Err(error) = extract_registrant(source, store, entry, pipeline, filter, force, &mut report)
    {
        warn!(registrant_id = %entry.id, error = %format!("{error:#}"), "registrant failed");
        report.errors.push(format!("{error:#}"));
    }

    match store
        .load_rows(&entry.id)
        .and_then(|rows| write_outputs(paths, &entry.id, &rows))
    {
        Ok(outputs) => {
            report.funds = outputs.funds;
            report.name_history_entries = outputs.name_history_entries;
        }
        Err(error) => {
            warn!(registrant_id = %entry.id, error = %format!("{error:#}"), "writing outputs failed");
            report.errors.push(format!("outputs: {error:#}"));
        }
    }
    report
}

fn extract_registrant<S: DocumentSource>(
    source: &mut S,
    store: &mut Store,
    entry: &RegistryEntry,
    pipeline: &PipelineSettings,
    filter: &FilingFilter,
    force: bool,
    report: &mut RegistrantReport,
) -> Result<()> {
    let index_json = source.submissions_index(&entry.id)?;
    let index = parse_index(&index_json, &entry.id)?;
    if report.name.is_empty() {
        report.name = index.name.clone();
    }

    let mut filings = index.filings;
    for file_name in &index.overflow_files {
        let page = source
            .overflow_index(file_name)
            .and_then(|json| parse_overflow(&json, &entry.id, &index.name));
        match page {
            Ok(more) => filings.extend(more),
            Err(error) => {
                warn!(registrant_id = %entry.id, file_name = %file_name, error = %format!("{error:#}"), "overflow index unavailable");
                report.errors.push(format!("{file_name}: {error:#}"));
            }
        }
    }
    let filings = select_filings(filings, pipeline, filter);
    report.filings_considered = filings.len();

    if force {
        let cleared = store.clear_manifest(&entry.id)?;
        debug!(registrant_id = %entry.id, cleared, "manifest cleared");
    }
    let processed = store.processed_accessions(&entry.id)?;

    for filing in &filings {
        if processed.contains(&filing.accession) {
            report.skipped_filings += 1;
            continue;
        }
        match extract_one(source, store, filing) {
            Ok((rows, strategy)) => {
                report.new_filings += 1;
                report.rows_extracted += rows;
                *report.strategy_usage.entry(strategy).or_default() += 1;
            }
            Err(error) => {
                warn!(
                    registrant_id = %entry.id,
                    accession = %filing.accession,
                    error = %format!("{error:#}"),
                    "filing failed"
                );
                report.errored_filings += 1;
                report.errors.push(format!("{}: {error:#}", filing.accession));
            }
        }
    }
    info!(
        registrant_id = %entry.id,
        considered = report.filings_considered,
        new = report.new_filings,
        skipped = report.skipped_filings,
        errored = report.errored_filings,
        "registrant extracted"
    );
    Ok(())
}

/// Prospectus-family filings inside the window, oldest first, one per accession.
fn select_filings(
    filings: Vec<FilingRef>,
    pipeline: &PipelineSettings,
    filter: &FilingFilter,
) -> Vec<FilingRef> {
    let mut seen = BTreeSet::new();
    let mut selected = filings
        .into_iter()
        .filter(|filing| is_prospectus_form(&filing.form, &pipeline.prospectus_prefixes))
        .filter(|filing| filter.accepts(filing))
        .filter(|filing| seen.insert(filing.accession.clone()))
        .collect::<Vec<_>>();
    selected.sort_by(|a, b| {
        a.filing_date
            .cmp(&b.filing_date)
            .then_with(|| a.accession.cmp(&b.accession))
    });
    selected
}

/// Fetch, extract and persist one filing. The manifest entry is written last,
/// so a failure anywhere leaves the filing to be retried on the next run.
fn extract_one<S: DocumentSource>(
    source: &mut S,
    store: &mut Store,
    filing: &FilingRef,
) -> Result<(usize, String)> {
    if filing.is_effectiveness_notice() {
        store.mark_processed(
            &filing.registrant_id,
            &filing.accession,
            &filing.form,
            filing.filing_date,
            0,
        )?;
        return Ok((0, NO_ROWS_BUCKET.to_string()));
    }

    let submission_text = source.fetch_text(&filing.submission_text_url)?;
    // A missing primary document only removes its strategies from the cascade.
    let primary_html = if filing.primary_is_html() {
        primary_document(source.fetch_text(&filing.primary_url), filing)
    } else {
        None
    };
    let primary_pdf_text = if filing.primary_is_pdf() {
        primary_document(source.fetch_bytes(&filing.primary_url), filing)
            .and_then(|bytes| pdf::pdf_text(&bytes))
    } else {
        None
    };

    let extraction = extract_filing(
        filing,
        &FilingDocuments {
            submission_text: Some(&submission_text),
            primary_html: primary_html.as_deref(),
            primary_pdf_text: primary_pdf_text.as_deref(),
        },
    );
    let rows = store.upsert_rows(&filing.registrant_id, &extraction.rows)?;
    store.mark_processed(
        &filing.registrant_id,
        &filing.accession,
        &filing.form,
        filing.filing_date,
        rows,
    )?;
    let strategy = extraction
        .strategy
        .map(|strategy| strategy.as_str().to_string())
        .unwrap_or_else(|| NO_ROWS_BUCKET.to_string());
    Ok((rows, strategy))
}

fn primary_document<T>(fetched: Result<T>, filing: &FilingRef) -> Option<T> {
    match fetched {
        Ok(document) => Some(document),
        Err(error) => {
            warn!(
                accession = %filing.accession,
                url = %filing.primary_url,
                error = %format!("{error:#}"),
                "primary document unavailable"
            );
            None
        }
    }
}

fn lock(summary: &Mutex<RunSummary>) -> MutexGuard<'_, RunSummary> {
    summary
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
