use thiserror::Error;

/// Failures surfaced by the fetch layer.
///
/// `MissingIdentity` is a configuration error and is never retried; everything
/// else is reported per key by the batch APIs.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("no identification user agent configured (set EDGAR_USER_AGENT or [edgar].user_agent)")]
    MissingIdentity,
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} still rate limited after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("index document for {registrant_id} is not valid JSON: {source}")]
    InvalidJson {
        registrant_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("background fetch task failed: {0}")]
    Join(String),
    #[error("fetch client is shut down and admits no new requests")]
    Closed,
}

impl FetchError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingIdentity)
    }
}
