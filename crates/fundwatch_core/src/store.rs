use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::extract::{ExtractionRow, Provenance};

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS processed_filings (
    registrant_id TEXT NOT NULL,
    accession TEXT NOT NULL,
    form TEXT NOT NULL,
    filing_date TEXT NOT NULL,
    rows_extracted INTEGER NOT NULL,
    processed_at_unix INTEGER NOT NULL,
    PRIMARY KEY (registrant_id, accession)
);

CREATE TABLE IF NOT EXISTS extraction_rows (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    registrant_id TEXT NOT NULL,
    registrant_name TEXT NOT NULL,
    accession TEXT NOT NULL,
    form TEXT NOT NULL,
    filing_date TEXT NOT NULL,
    series_id TEXT NOT NULL DEFAULT '',
    series_name TEXT NOT NULL DEFAULT '',
    class_id TEXT NOT NULL DEFAULT '',
    class_name TEXT NOT NULL DEFAULT '',
    ticker TEXT NOT NULL DEFAULT '',
    prospectus_name TEXT,
    effective_date TEXT,
    delaying_amendment INTEGER NOT NULL DEFAULT 0,
    primary_url TEXT NOT NULL,
    submission_text_url TEXT NOT NULL,
    provenance TEXT NOT NULL,
    UNIQUE (registrant_id, accession, class_id, class_name, ticker)
);

CREATE INDEX IF NOT EXISTS idx_extraction_rows_registrant
    ON extraction_rows(registrant_id, seq);
"#;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One processed filing as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub accession: String,
    pub form: String,
    pub filing_date: NaiveDate,
    pub rows_extracted: usize,
}

/// Manifest and extraction rows in one SQLite file. One instance per worker.
pub struct Store {
    connection: Connection,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        ensure_db_parent(db_path)?;
        let connection = open_connection(db_path)?;
        connection
            .execute_batch(STORE_SCHEMA_SQL)
            .context("failed to initialize store schema")?;
        Ok(Self { connection })
    }

    pub fn processed_accessions(&self, registrant_id: &str) -> Result<BTreeSet<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT accession FROM processed_filings WHERE registrant_id = ?1")
            .context("failed to prepare manifest query")?;
        let rows = statement
            .query_map([registrant_id], |row| row.get::<_, String>(0))
            .context("failed to run manifest query")?;

        let mut out = BTreeSet::new();
        for row in rows {
            out.insert(row.context("failed to decode manifest row")?);
        }
        Ok(out)
    }

    pub fn manifest_entry(
        &self,
        registrant_id: &str,
        accession: &str,
    ) -> Result<Option<ManifestEntry>> {
        let raw = self
            .connection
            .query_row(
                "SELECT accession, form, filing_date, rows_extracted
                 FROM processed_filings
                 WHERE registrant_id = ?1 AND accession = ?2",
                params![registrant_id, accession],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load manifest entry {accession}"))?;
        let Some((accession, form, filing_date, rows_extracted)) = raw else {
            return Ok(None);
        };
        Ok(Some(ManifestEntry {
            accession,
            form,
            filing_date: parse_date(&filing_date)?,
            rows_extracted: usize::try_from(rows_extracted)
                .context("rows_extracted is negative")?,
        }))
    }

    pub fn mark_processed(
        &mut self,
        registrant_id: &str,
        accession: &str,
        form: &str,
        filing_date: NaiveDate,
        rows_extracted: usize,
    ) -> Result<()> {
        let processed_at_unix = unix_timestamp()?;
        self.connection
            .execute(
                "INSERT INTO processed_filings (
                    registrant_id,
                    accession,
                    form,
                    filing_date,
                    rows_extracted,
                    processed_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(registrant_id, accession) DO UPDATE SET
                    form = excluded.form,
                    filing_date = excluded.filing_date,
                    rows_extracted = excluded.rows_extracted,
                    processed_at_unix = excluded.processed_at_unix",
                params![
                    registrant_id,
                    accession,
                    form,
                    filing_date.format(DATE_FORMAT).to_string(),
                    i64::try_from(rows_extracted).context("row count does not fit into i64")?,
                    i64::try_from(processed_at_unix).context("timestamp does not fit into i64")?,
                ],
            )
            .with_context(|| format!("failed to record {accession} in manifest"))?;
        Ok(())
    }

    /// Forget every processed filing for a registrant. Extraction rows stay;
    /// reprocessing overwrites them by key.
    pub fn clear_manifest(&mut self, registrant_id: &str) -> Result<usize> {
        self.connection
            .execute(
                "DELETE FROM processed_filings WHERE registrant_id = ?1",
                [registrant_id],
            )
            .with_context(|| format!("failed to clear manifest for {registrant_id}"))
    }

    /// Insert rows, replacing any stored row with the same key. A replaced
    /// row moves to the end of the registrant's sequence.
    pub fn upsert_rows(&mut self, registrant_id: &str, rows: &[ExtractionRow]) -> Result<usize> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start extraction row transaction")?;
        {
            let mut delete_statement = transaction
                .prepare(
                    "DELETE FROM extraction_rows
                     WHERE registrant_id = ?1
                       AND accession = ?2
                       AND class_id = ?3
                       AND class_name = ?4
                       AND ticker = ?5",
                )
                .context("failed to prepare extraction row delete")?;
            let mut insert_statement = transaction
                .prepare(
                    "INSERT INTO extraction_rows (
                        registrant_id,
                        registrant_name,
                        accession,
                        form,
                        filing_date,
                        series_id,
                        series_name,
                        class_id,
                        class_name,
                        ticker,
                        prospectus_name,
                        effective_date,
                        delaying_amendment,
                        primary_url,
                        submission_text_url,
                        provenance
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                )
                .context("failed to prepare extraction row insert")?;

            for row in rows {
                let key = row.key();
                delete_statement
                    .execute(params![
                        registrant_id,
                        key.accession,
                        key.class_id,
                        key.class_name,
                        key.ticker
                    ])
                    .with_context(|| format!("failed to replace rows for {}", row.accession))?;
                insert_statement
                    .execute(params![
                        registrant_id,
                        row.registrant_name,
                        key.accession,
                        row.form,
                        row.filing_date.format(DATE_FORMAT).to_string(),
                        row.series_id.as_deref().unwrap_or(""),
                        row.series_name,
                        key.class_id,
                        key.class_name,
                        key.ticker,
                        row.prospectus_name,
                        row.effective_date
                            .map(|date| date.format(DATE_FORMAT).to_string()),
                        if row.delaying_amendment { 1i64 } else { 0i64 },
                        row.primary_url,
                        row.submission_text_url,
                        row.provenance.to_string(),
                    ])
                    .with_context(|| format!("failed to insert row for {}", row.accession))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit extraction row transaction")?;
        Ok(rows.len())
    }

    /// All rows for a registrant in write order.
    pub fn load_rows(&self, registrant_id: &str) -> Result<Vec<ExtractionRow>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT
                    registrant_id,
                    registrant_name,
                    accession,
                    form,
                    filing_date,
                    series_id,
                    series_name,
                    class_id,
                    class_name,
                    ticker,
                    prospectus_name,
                    effective_date,
                    delaying_amendment,
                    primary_url,
                    submission_text_url,
                    provenance
                 FROM extraction_rows
                 WHERE registrant_id = ?1
                 ORDER BY seq ASC",
            )
            .context("failed to prepare extraction rows query")?;
        let mut rows = statement
            .query([registrant_id])
            .context("failed to run extraction rows query")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().context("failed to read extraction row")? {
            out.push(decode_row(row)?);
        }
        Ok(out)
    }

    pub fn row_count(&self, registrant_id: &str) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM extraction_rows WHERE registrant_id = ?1",
                [registrant_id],
                |row| row.get(0),
            )
            .context("failed to count extraction rows")?;
        usize::try_from(count).context("row count does not fit into usize")
    }

    /// Registrants with stored rows or manifest entries.
    pub fn registrant_ids(&self) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT registrant_id FROM extraction_rows
                 UNION
                 SELECT registrant_id FROM processed_filings
                 ORDER BY registrant_id ASC",
            )
            .context("failed to prepare registrant query")?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to run registrant query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode registrant row")?);
        }
        Ok(out)
    }
}

fn decode_row(row: &Row<'_>) -> Result<ExtractionRow> {
    let accession: String = row.get(2).context("failed to decode accession")?;
    let filing_date: String = row.get(4).context("failed to decode filing date")?;
    let effective_date: Option<String> = row.get(11).context("failed to decode effective date")?;
    let provenance: String = row.get(15).context("failed to decode provenance")?;
    let provenance = provenance
        .parse::<Provenance>()
        .map_err(|message| anyhow::anyhow!(message))
        .with_context(|| format!("bad provenance on row for {accession}"))?;

    Ok(ExtractionRow {
        registrant_id: row.get(0).context("failed to decode registrant id")?,
        registrant_name: row.get(1).context("failed to decode registrant name")?,
        form: row.get(3).context("failed to decode form")?,
        filing_date: parse_date(&filing_date)?,
        series_id: non_empty(row.get(5).context("failed to decode series id")?),
        series_name: row.get(6).context("failed to decode series name")?,
        class_id: non_empty(row.get(7).context("failed to decode class id")?),
        class_name: row.get(8).context("failed to decode class name")?,
        ticker: non_empty(row.get(9).context("failed to decode ticker")?),
        prospectus_name: row.get(10).context("failed to decode prospectus name")?,
        effective_date: effective_date.as_deref().map(parse_date).transpose()?,
        delaying_amendment: row
            .get::<_, i64>(12)
            .context("failed to decode delaying flag")?
            == 1,
        primary_url: row.get(13).context("failed to decode primary url")?,
        submission_text_url: row.get(14).context("failed to decode submission url")?,
        provenance,
        accession,
    })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .with_context(|| format!("stored date is malformed: {value}"))
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}
