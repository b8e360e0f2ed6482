use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::FetchError;

pub const DEFAULT_RATE_LIMIT: u32 = 8;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REFRESH_MAX_AGE_HOURS: f64 = 6.0;
pub const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 1;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_SUBMISSIONS_URL: &str = "https://data.sec.gov/submissions/CIK{id}.json";
pub const DEFAULT_ARCHIVES_BASE: &str = "https://www.sec.gov/Archives/edgar/data";
pub const DEFAULT_TARGET_PREFIXES: &[&str] = &["485", "N-1A"];
pub const DEFAULT_PROSPECTUS_PREFIXES: &[&str] = &["485A", "485B", "497", "N-1A", "S-1", "S-3"];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct FundwatchConfig {
    #[serde(default)]
    pub edgar: EdgarSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct EdgarSection {
    pub user_agent: Option<String>,
    pub rate_limit: Option<u32>,
    pub max_in_flight: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub refresh_max_age_hours: Option<f64>,
    pub max_rate_limit_retries: Option<u32>,
    pub submissions_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct PipelineSection {
    pub workers: Option<usize>,
    #[serde(default)]
    pub target_prefixes: Vec<String>,
    #[serde(default)]
    pub prospectus_prefixes: Vec<String>,
    pub since: Option<String>,
    pub until: Option<String>,
}

/// Fully resolved HTTP settings shared by the async and blocking fetch clients.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub user_agent: Option<String>,
    pub rate_limit: u32,
    pub max_in_flight: usize,
    pub timeout: Duration,
    pub refresh_max_age: Duration,
    pub max_rate_limit_retries: u32,
    pub submissions_url: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            user_agent: None,
            rate_limit: DEFAULT_RATE_LIMIT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            refresh_max_age: refresh_window(DEFAULT_REFRESH_MAX_AGE_HOURS),
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            submissions_url: DEFAULT_SUBMISSIONS_URL.to_string(),
        }
    }
}

impl FetchSettings {
    /// The identification header is mandatory; its absence is a configuration error.
    pub fn require_user_agent(&self) -> Result<&str, FetchError> {
        match self.user_agent.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(FetchError::MissingIdentity),
        }
    }

    pub fn submissions_url_for(&self, registrant_id: &str) -> String {
        self.submissions_url.replace("{id}", &pad_registrant_id(registrant_id))
    }

    /// Overflow continuation documents live next to the main index document.
    pub fn overflow_url_for(&self, file_name: &str) -> String {
        match self.submissions_url.rfind('/') {
            Some(slash) => format!("{}/{}", &self.submissions_url[..slash], file_name),
            None => file_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub workers: usize,
    pub target_prefixes: Vec<String>,
    pub prospectus_prefixes: Vec<String>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            target_prefixes: to_owned_list(DEFAULT_TARGET_PREFIXES),
            prospectus_prefixes: to_owned_list(DEFAULT_PROSPECTUS_PREFIXES),
            since: None,
            until: None,
        }
    }
}

impl FundwatchConfig {
    pub fn fetch_settings(&self) -> FetchSettings {
        self.fetch_settings_with_lookup(|key| env::var(key).ok())
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        self.pipeline_settings_with_lookup(|key| env::var(key).ok())
    }

    fn fetch_settings_with_lookup<F>(&self, lookup_env: F) -> FetchSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let edgar = &self.edgar;
        let defaults = FetchSettings::default();
        let user_agent = non_empty(lookup_env("EDGAR_USER_AGENT"))
            .or_else(|| non_empty(edgar.user_agent.clone()));
        let rate_limit = parse_env(&lookup_env, "EDGAR_RATE_LIMIT")
            .or(edgar.rate_limit)
            .unwrap_or(defaults.rate_limit)
            .max(1);
        let max_in_flight = parse_env(&lookup_env, "EDGAR_MAX_IN_FLIGHT")
            .or(edgar.max_in_flight)
            .unwrap_or(defaults.max_in_flight)
            .max(1);
        let timeout_ms = parse_env(&lookup_env, "EDGAR_TIMEOUT_MS")
            .or(edgar.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let refresh_hours = parse_env(&lookup_env, "EDGAR_REFRESH_MAX_AGE_HOURS")
            .or(edgar.refresh_max_age_hours)
            .unwrap_or(DEFAULT_REFRESH_MAX_AGE_HOURS);

        FetchSettings {
            user_agent,
            rate_limit,
            max_in_flight,
            timeout: Duration::from_millis(timeout_ms),
            refresh_max_age: refresh_window(refresh_hours),
            max_rate_limit_retries: edgar
                .max_rate_limit_retries
                .unwrap_or(defaults.max_rate_limit_retries),
            submissions_url: non_empty(lookup_env("EDGAR_SUBMISSIONS_URL"))
                .or_else(|| non_empty(edgar.submissions_url.clone()))
                .unwrap_or(defaults.submissions_url),
        }
    }

    fn pipeline_settings_with_lookup<F>(&self, lookup_env: F) -> Result<PipelineSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pipeline = &self.pipeline;
        let defaults = PipelineSettings::default();
        Ok(PipelineSettings {
            workers: parse_env(&lookup_env, "FUNDWATCH_WORKERS")
                .or(pipeline.workers)
                .unwrap_or(defaults.workers)
                .max(1),
            target_prefixes: if pipeline.target_prefixes.is_empty() {
                defaults.target_prefixes
            } else {
                pipeline.target_prefixes.clone()
            },
            prospectus_prefixes: if pipeline.prospectus_prefixes.is_empty() {
                defaults.prospectus_prefixes
            } else {
                pipeline.prospectus_prefixes.clone()
            },
            since: parse_config_date(pipeline.since.as_deref(), "pipeline.since")?,
            until: parse_config_date(pipeline.until.as_deref(), "pipeline.until")?,
        })
    }
}

/// Load and parse a FundwatchConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<FundwatchConfig> {
    if !config_path.exists() {
        return Ok(FundwatchConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FundwatchConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Pause each worker takes between requests so that `workers` paced workers
/// together stay at `rate_limit` requests per second.
pub fn per_worker_pause(workers: usize, rate_limit: u32) -> Duration {
    let workers = workers.max(1) as f64;
    let rate = f64::from(rate_limit.max(1));
    Duration::from_secs_f64(workers / rate)
}

/// Ten-digit zero-padded registrant identifier used in index document names.
pub fn pad_registrant_id(registrant_id: &str) -> String {
    let trimmed = registrant_id.trim();
    let digits = trimmed.trim_start_matches('0');
    format!("{digits:0>10}")
}

/// Canonical registrant identifier: leading zeros stripped.
pub fn normalize_registrant_id(registrant_id: &str) -> String {
    let trimmed = registrant_id.trim().trim_start_matches("CIK");
    let digits = trimmed.trim_start_matches('0');
    if digits.is_empty() && !trimmed.is_empty() {
        "0".to_string()
    } else {
        digits.to_string()
    }
}

pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

fn parse_config_date(value: Option<&str>, key: &str) -> Result<Option<NaiveDate>> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => parse_iso_date(value)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("{key} must be YYYY-MM-DD, got {value}")),
        None => Ok(None),
    }
}

fn parse_env<T, F>(lookup_env: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key).and_then(|value| value.trim().parse::<T>().ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Unrepresentable windows (infinite, NaN, negative, overflowing) fall back to the default.
fn refresh_window(hours: f64) -> Duration {
    match Duration::try_from_secs_f64(hours * 3600.0) {
        Ok(window) => window,
        Err(error) => {
            warn!(hours, %error, "invalid refresh window, using default");
            Duration::from_secs(DEFAULT_REFRESH_MAX_AGE_HOURS as u64 * 3600)
        }
    }
}

fn to_owned_list(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_resolves_documented_defaults() {
        let config = FundwatchConfig::default();
        let fetch = config.fetch_settings_with_lookup(|_| None);
        assert_eq!(fetch.rate_limit, 8);
        assert_eq!(fetch.max_in_flight, 8);
        assert_eq!(fetch.refresh_max_age, Duration::from_secs(6 * 3600));
        assert_eq!(fetch.max_rate_limit_retries, 1);
        assert!(fetch.user_agent.is_none());

        let pipeline = config.pipeline_settings_with_lookup(|_| None).expect("pipeline");
        assert_eq!(pipeline.workers, 4);
        assert_eq!(pipeline.target_prefixes, vec!["485", "N-1A"]);
    }

    #[test]
    fn missing_user_agent_is_a_configuration_error() {
        let settings = FetchSettings {
            user_agent: Some("   ".to_string()),
            ..FetchSettings::default()
        };
        assert!(matches!(
            settings.require_user_agent(),
            Err(FetchError::MissingIdentity)
        ));
    }

    #[test]
    fn env_overrides_config_values() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[edgar]
user_agent = "Config Agent ops@example.org"
rate_limit = 5

[pipeline]
workers = 2
since = "2024-01-01"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        let env = HashMap::from([
            ("EDGAR_USER_AGENT".to_string(), "Env Agent env@example.org".to_string()),
            ("FUNDWATCH_WORKERS".to_string(), "6".to_string()),
        ]);
        let fetch = config.fetch_settings_with_lookup(|key| env.get(key).cloned());
        assert_eq!(fetch.user_agent.as_deref(), Some("Env Agent env@example.org"));
        assert_eq!(fetch.rate_limit, 5);

        let pipeline = config
            .pipeline_settings_with_lookup(|key| env.get(key).cloned())
            .expect("pipeline");
        assert_eq!(pipeline.workers, 6);
        assert_eq!(pipeline.since, NaiveDate::from_ymd_opt(2024, 1, 1));
    }

    #[test]
    fn unrepresentable_refresh_window_falls_back_to_default() {
        let config = FundwatchConfig::default();
        let default_window = Duration::from_secs(6 * 3600);
        for value in ["inf", "NaN", "-3", "1e300"] {
            let fetch = config.fetch_settings_with_lookup(|key| {
                (key == "EDGAR_REFRESH_MAX_AGE_HOURS").then(|| value.to_string())
            });
            assert_eq!(fetch.refresh_max_age, default_window, "{value}");
        }
        let fetch = config.fetch_settings_with_lookup(|key| {
            (key == "EDGAR_REFRESH_MAX_AGE_HOURS").then(|| "0.5".to_string())
        });
        assert_eq!(fetch.refresh_max_age, Duration::from_secs(1800));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[edgar\nuser_agent = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn invalid_since_date_is_rejected() {
        let config = FundwatchConfig {
            pipeline: PipelineSection {
                since: Some("01/02/2024".to_string()),
                ..PipelineSection::default()
            },
            ..FundwatchConfig::default()
        };
        let error = config
            .pipeline_settings_with_lookup(|_| None)
            .expect_err("must fail");
        assert!(error.to_string().contains("pipeline.since"));
    }

    #[test]
    fn worker_pause_matches_aggregate_ceiling() {
        assert_eq!(per_worker_pause(4, 8), Duration::from_millis(500));
        assert_eq!(per_worker_pause(8, 8), Duration::from_secs(1));
    }

    #[test]
    fn registrant_ids_pad_and_normalize() {
        assert_eq!(pad_registrant_id("1174610"), "0001174610");
        assert_eq!(pad_registrant_id("0001174610"), "0001174610");
        assert_eq!(normalize_registrant_id("0001174610"), "1174610");
        assert_eq!(normalize_registrant_id("CIK0000826732"), "826732");
    }

    #[test]
    fn submissions_urls_use_padded_id() {
        let settings = FetchSettings::default();
        assert_eq!(
            settings.submissions_url_for("826732"),
            "https://data.sec.gov/submissions/CIK0000826732.json"
        );
        assert_eq!(
            settings.overflow_url_for("CIK0000826732-submissions-001.json"),
            "https://data.sec.gov/submissions/CIK0000826732-submissions-001.json"
        );
    }
}
