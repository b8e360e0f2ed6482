//! Bulk index archive: download, scan for fund registrants, and prime the cache.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::cache::DiskCache;
use crate::config::{FetchSettings, normalize_registrant_id, pad_registrant_id};

pub const BULK_ARCHIVE_URL: &str =
    "https://www.sec.gov/Archives/edgar/daily-index/bulkdata/submissions.zip";

const CHUNK_SIZE: usize = 64 * 1024;
const PROGRESS_EVERY_BYTES: u64 = 10 * 1024 * 1024;
const PROGRESS_EVERY_ENTRIES: usize = 10_000;
const OVERFLOW_MARKER: &str = "-submissions-";
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkMatch {
    pub registrant_id: String,
    pub name: String,
    pub forms: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub registrants_scanned: usize,
    pub overflow_entries: usize,
    pub skipped_entries: usize,
    pub matches: Vec<BulkMatch>,
}

#[derive(Debug, Deserialize, Default)]
struct ArchiveEntry {
    #[serde(default)]
    cik: Option<serde_json::Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    filings: ArchiveFilings,
}

#[derive(Debug, Deserialize, Default)]
struct ArchiveFilings {
    #[serde(default)]
    recent: ArchiveRecent,
}

#[derive(Debug, Deserialize, Default)]
struct ArchiveRecent {
    #[serde(default)]
    form: Vec<String>,
}

/// Stream the bulk archive to `dest`, writing to a sibling `.part` file first.
pub fn download_archive(url: &str, dest: &Path, settings: &FetchSettings) -> Result<u64> {
    let user_agent = settings.require_user_agent()?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(settings.timeout)
        .timeout(None)
        .build()
        .context("failed to build download client")?;
    info!(url, dest = %dest.display(), "downloading bulk archive");
    let mut response = client
        .get(url)
        .header(USER_AGENT, user_agent)
        .send()
        .with_context(|| format!("failed to request {url}"))?;
    if !response.status().is_success() {
        bail!("{url} returned HTTP {}", response.status());
    }
    let total = response.content_length();

    let part_path = dest.with_extension("part");
    let file = File::create(&part_path)
        .with_context(|| format!("failed to create {}", part_path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut downloaded = 0u64;
    let mut last_report = 0u64;
    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("failed while streaming {url}"))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .with_context(|| format!("failed to write {}", part_path.display()))?;
        downloaded += read as u64;
        if downloaded - last_report >= PROGRESS_EVERY_BYTES {
            info!(downloaded, total, "bulk archive download progress");
            last_report = downloaded;
        }
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", part_path.display()))?;
    drop(writer);
    fs::rename(&part_path, dest)
        .with_context(|| format!("failed to move archive into {}", dest.display()))?;
    info!(downloaded, "bulk archive download complete");
    Ok(downloaded)
}

/// Find registrants whose filing history contains any target form prefix.
///
/// Entries are decompressed one at a time; an entry that fails to read or
/// decode is counted and skipped.
pub fn scan(archive_path: &Path, target_prefixes: &[String]) -> Result<ScanReport> {
    let mut archive = open_archive(archive_path)?;
    let prefixes = target_prefixes
        .iter()
        .map(|prefix| prefix.trim().to_ascii_uppercase())
        .filter(|prefix| !prefix.is_empty())
        .collect::<Vec<_>>();
    let mut report = ScanReport::default();
    info!(
        archive = %archive_path.display(),
        entries = archive.len(),
        ?prefixes,
        "scanning bulk archive"
    );

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(index, %error, "skipping unreadable archive entry");
                report.skipped_entries += 1;
                continue;
            }
        };
        let name = entry.name().to_string();
        if !is_index_entry(&name) {
            continue;
        }
        if name.contains(OVERFLOW_MARKER) {
            report.overflow_entries += 1;
            continue;
        }
        report.registrants_scanned += 1;

        let mut bytes = Vec::with_capacity(capacity_hint(entry.size()));
        if let Err(error) = entry.read_to_end(&mut bytes) {
            warn!(entry = %name, %error, "skipping corrupt archive entry");
            report.skipped_entries += 1;
            continue;
        }
        let parsed: ArchiveEntry = match serde_json::from_slice(&bytes) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(entry = %name, %error, "skipping undecodable archive entry");
                report.skipped_entries += 1;
                continue;
            }
        };

        let forms = parsed
            .filings
            .recent
            .form
            .iter()
            .map(|form| form.trim().to_ascii_uppercase())
            .filter(|form| prefixes.iter().any(|prefix| form.starts_with(prefix)))
            .collect::<BTreeSet<_>>();
        if !forms.is_empty() {
            report.matches.push(BulkMatch {
                registrant_id: entry_registrant_id(parsed.cik.as_ref(), &name),
                name: parsed.name.unwrap_or_else(|| "Unknown".to_string()),
                forms: forms.into_iter().collect(),
            });
        }

        if report.registrants_scanned % PROGRESS_EVERY_ENTRIES == 0 {
            info!(
                scanned = report.registrants_scanned,
                matches = report.matches.len(),
                "bulk scan progress"
            );
        }
    }

    info!(
        scanned = report.registrants_scanned,
        matches = report.matches.len(),
        overflow = report.overflow_entries,
        skipped = report.skipped_entries,
        "bulk scan complete"
    );
    Ok(report)
}

/// Copy the main and overflow index documents of every match into the cache.
pub fn prime_cache(archive_path: &Path, matches: &[BulkMatch], cache: &DiskCache) -> Result<usize> {
    let mut archive = open_archive(archive_path)?;
    let wanted = matches
        .iter()
        .map(|entry| pad_registrant_id(&entry.registrant_id))
        .collect::<HashSet<_>>();
    let mut cached = 0usize;
    info!(registrants = wanted.len(), cache = %cache.root().display(), "priming cache");

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(index, %error, "skipping unreadable archive entry");
                continue;
            }
        };
        let name = entry.name().to_string();
        if !is_index_entry(&name) {
            continue;
        }
        let stem = name.trim_end_matches(".json").trim_start_matches("CIK");
        let padded = stem.split(OVERFLOW_MARKER).next().unwrap_or(stem);
        if !wanted.contains(padded) {
            continue;
        }

        let mut bytes = Vec::with_capacity(capacity_hint(entry.size()));
        if let Err(error) = entry.read_to_end(&mut bytes) {
            warn!(entry = %name, %error, "skipping corrupt archive entry");
            continue;
        }
        let written = if name.contains(OVERFLOW_MARKER) {
            cache.write_overflow(&name, &bytes)
        } else {
            cache.write_index(padded, &String::from_utf8_lossy(&bytes))
        };
        written.with_context(|| format!("failed to cache {name}"))?;
        cached += 1;
    }

    info!(cached, "cache primed from bulk archive");
    Ok(cached)
}

fn open_archive(archive_path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open bulk archive {}", archive_path.display()))?;
    ZipArchive::new(file)
        .with_context(|| format!("failed to read bulk archive {}", archive_path.display()))
}

fn is_index_entry(name: &str) -> bool {
    name.starts_with("CIK") && name.ends_with(".json")
}

fn entry_registrant_id(cik: Option<&serde_json::Value>, entry_name: &str) -> String {
    let from_json = match cik {
        Some(serde_json::Value::String(text)) => normalize_registrant_id(text),
        Some(serde_json::Value::Number(number)) => normalize_registrant_id(&number.to_string()),
        _ => String::new(),
    };
    if !from_json.is_empty() {
        return from_json;
    }
    normalize_registrant_id(entry_name.trim_end_matches(".json"))
}

/// Header sizes are untrusted; corrupt entries may declare anything.
fn capacity_hint(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_PREALLOCATION)).unwrap_or(0)
}
