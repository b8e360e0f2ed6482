//! Cache-backed document fetching.
//!
//! [`FetchClient`] is the cooperative batch client: every outstanding request
//! is its own tokio task gated by a shared admission semaphore and a shared
//! [`TokenBucket`]. [`BlockingFetchClient`] issues one request at a time and
//! paces itself; both read and write the same [`DiskCache`] layout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER, USER_AGENT};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::DiskCache;
use crate::config::{FetchSettings, normalize_registrant_id};
use crate::error::FetchError;
use crate::rate_limit::{Pacer, TokenBucket};

const DEFAULT_RETRY_AFTER_SECS: u64 = 10;

pub type FetchResults = BTreeMap<String, Result<String, FetchError>>;

/// Read access to filing documents, as consumed by the extraction driver.
pub trait DocumentSource {
    fn submissions_index(&mut self, registrant_id: &str) -> Result<String>;
    fn overflow_index(&mut self, file_name: &str) -> Result<String>;
    fn fetch_text(&mut self, url: &str) -> Result<String>;
    fn fetch_bytes(&mut self, url: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    settings: FetchSettings,
    user_agent: String,
    cache: DiskCache,
    semaphore: Arc<Semaphore>,
    limiter: Arc<TokenBucket>,
    request_count: Arc<AtomicUsize>,
}

impl FetchClient {
    pub fn new(settings: FetchSettings, cache_root: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let user_agent = settings.require_user_agent()?.to_string();
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            cache: DiskCache::new(cache_root, settings.refresh_max_age),
            semaphore: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            limiter: Arc::new(TokenBucket::new(settings.rate_limit)),
            request_count: Arc::new(AtomicUsize::new(0)),
            user_agent,
            settings,
        })
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let bytes = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(cached) = self.cache.read_web_bytes(url) {
            debug!(url, "web cache hit");
            return Ok(cached);
        }
        let body = self.get(url).await?;
        self.cache.write_web(url, &body)?;
        Ok(body)
    }

    pub async fn fetch_submissions_index(&self, registrant_id: &str) -> Result<String, FetchError> {
        if let Some(cached) = self.cache.read_index(registrant_id) {
            debug!(registrant_id, "index cache hit");
            return Ok(cached);
        }
        let url = self.settings.submissions_url_for(registrant_id);
        let body = self.get(&url).await?;
        let text = validated_index_text(registrant_id, &body)?;
        self.cache.write_index(registrant_id, &text)?;
        Ok(text)
    }

    /// Fetch every URL concurrently; one failure never aborts the batch.
    pub async fn fetch_many(&self, urls: &[String]) -> FetchResults {
        let handles = urls
            .iter()
            .map(|url| {
                let client = self.clone();
                let url = url.clone();
                tokio::spawn(async move { client.fetch(&url).await })
            })
            .collect::<Vec<_>>();
        let outcomes = join_all(handles).await;

        let mut results = BTreeMap::new();
        for (url, outcome) in urls.iter().zip(outcomes) {
            let result = flatten_join(outcome);
            if let Err(error) = &result {
                warn!(url = %url, %error, "fetch failed");
            }
            results.insert(url.clone(), result);
        }
        results
    }

    /// Index documents for many registrants, keyed by the id as given.
    pub async fn fetch_submissions_batch(&self, registrant_ids: &[String]) -> FetchResults {
        let mut results = BTreeMap::new();
        let mut to_fetch = Vec::new();
        for id in registrant_ids {
            match self.cache.read_index(id) {
                Some(cached) => {
                    results.insert(id.clone(), Ok(cached));
                }
                None => to_fetch.push(id.clone()),
            }
        }
        if to_fetch.is_empty() {
            info!(count = registrant_ids.len(), "all index documents served from cache");
            return results;
        }
        info!(
            fetching = to_fetch.len(),
            cached = results.len(),
            "fetching index documents"
        );

        let handles = to_fetch
            .iter()
            .map(|id| {
                let client = self.clone();
                let id = id.clone();
                tokio::spawn(async move { client.fetch_submissions_index(&id).await })
            })
            .collect::<Vec<_>>();
        let outcomes = join_all(handles).await;
        for (id, outcome) in to_fetch.into_iter().zip(outcomes) {
            let result = flatten_join(outcome);
            if let Err(error) = &result {
                warn!(registrant_id = %id, %error, "index fetch failed");
            }
            results.insert(id, result);
        }
        results
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let max_attempts = self.settings.max_rate_limit_retries + 1;
        for attempt in 1..=max_attempts {
            let permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| FetchError::Closed)?;
            self.limiter.acquire().await;
            self.request_count.fetch_add(1, Ordering::Relaxed);
            let response = self
                .http
                .get(url)
                .header(USER_AGENT, self.user_agent.as_str())
                .send()
                .await?;
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(response.headers());
                drop(permit);
                if attempt == max_attempts {
                    break;
                }
                warn!(url, wait_secs = wait.as_secs(), "rate limited, backing off");
                tokio::time::sleep(wait).await;
                continue;
            }
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            let body = response.bytes().await?;
            return Ok(body.to_vec());
        }
        Err(FetchError::RateLimited {
            url: url.to_string(),
            attempts: max_attempts,
        })
    }
}

/// Single-request client; same cache layout as [`FetchClient`].
pub struct BlockingFetchClient {
    http: reqwest::blocking::Client,
    settings: FetchSettings,
    user_agent: String,
    cache: DiskCache,
    pacer: Pacer,
    request_count: usize,
}

impl BlockingFetchClient {
    pub fn new(settings: FetchSettings, cache_root: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let pacer = Pacer::per_second(settings.rate_limit);
        Self::with_pacer(settings, cache_root, pacer)
    }

    pub fn with_pacer(
        settings: FetchSettings,
        cache_root: impl Into<PathBuf>,
        pacer: Pacer,
    ) -> Result<Self, FetchError> {
        let user_agent = settings.require_user_agent()?.to_string();
        let http = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            cache: DiskCache::new(cache_root, settings.refresh_max_age),
            user_agent,
            settings,
            pacer,
            request_count: 0,
        })
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn fetch(&mut self, url: &str) -> Result<String, FetchError> {
        let bytes = self.fetch_bytes_cached(url)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn fetch_bytes_cached(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(cached) = self.cache.read_web_bytes(url) {
            debug!(url, "web cache hit");
            return Ok(cached);
        }
        let body = self.get(url)?;
        self.cache.write_web(url, &body)?;
        Ok(body)
    }

    pub fn fetch_submissions_index(&mut self, registrant_id: &str) -> Result<String, FetchError> {
        if let Some(cached) = self.cache.read_index(registrant_id) {
            debug!(registrant_id, "index cache hit");
            return Ok(cached);
        }
        let url = self.settings.submissions_url_for(registrant_id);
        let body = self.get(&url)?;
        let text = validated_index_text(registrant_id, &body)?;
        self.cache.write_index(registrant_id, &text)?;
        Ok(text)
    }

    /// Overflow history pages never change once published, so any cached copy is used.
    pub fn fetch_overflow_index(&mut self, file_name: &str) -> Result<String, FetchError> {
        if let Some(cached) = self.cache.read_overflow(file_name) {
            return Ok(cached);
        }
        let url = self.settings.overflow_url_for(file_name);
        let body = self.get(&url)?;
        let text = validated_index_text(file_name, &body)?;
        self.cache.write_overflow(file_name, text.as_bytes())?;
        Ok(text)
    }

    fn get(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
        let max_attempts = self.settings.max_rate_limit_retries + 1;
        for attempt in 1..=max_attempts {
            self.pacer.wait();
            self.request_count += 1;
            let response = self
                .http
                .get(url)
                .header(USER_AGENT, self.user_agent.as_str())
                .send()?;
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt == max_attempts {
                    break;
                }
                let wait = retry_after(response.headers());
                warn!(url, wait_secs = wait.as_secs(), "rate limited, backing off");
                sleep(wait);
                continue;
            }
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(response.bytes()?.to_vec());
        }
        Err(FetchError::RateLimited {
            url: url.to_string(),
            attempts: max_attempts,
        })
    }
}

impl DocumentSource for BlockingFetchClient {
    fn submissions_index(&mut self, registrant_id: &str) -> Result<String> {
        Ok(self.fetch_submissions_index(&normalize_registrant_id(registrant_id))?)
    }

    fn overflow_index(&mut self, file_name: &str) -> Result<String> {
        Ok(self.fetch_overflow_index(file_name)?)
    }

    fn fetch_text(&mut self, url: &str) -> Result<String> {
        Ok(self.fetch(url)?)
    }

    fn fetch_bytes(&mut self, url: &str) -> Result<Vec<u8>> {
        Ok(self.fetch_bytes_cached(url)?)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn retry_after(headers: &HeaderMap) -> Duration {
    let seconds = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(seconds)
}

fn validated_index_text(registrant_id: &str, body: &[u8]) -> Result<String, FetchError> {
    let text = String::from_utf8_lossy(body).into_owned();
    serde_json::from_str::<serde_json::Value>(&text).map_err(|source| {
        FetchError::InvalidJson {
            registrant_id: registrant_id.to_string(),
            source,
        }
    })?;
    Ok(text)
}

fn flatten_join(
    outcome: Result<Result<String, FetchError>, tokio::task::JoinError>,
) -> Result<String, FetchError> {
    match outcome {
        Ok(result) => result,
        Err(error) => Err(FetchError::Join(error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{BlockingFetchClient, DocumentSource, FetchClient};
    use crate::config::FetchSettings;
    use crate::error::FetchError;
    use crate::rate_limit::Pacer;

    struct TestServer {
        base_url: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    /// Serves scripted responses per path; each path pops its queue front to back.
    fn serve(routes: Vec<(&str, Vec<String>)>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base_url = format!("http://{}", listener.local_addr().expect("addr"));
        let total: usize = routes.iter().map(|(_, queue)| queue.len()).sum();
        let mut queues: HashMap<String, Vec<String>> = routes
            .into_iter()
            .map(|(path, mut queue)| {
                queue.reverse();
                (path.to_string(), queue)
            })
            .collect();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        thread::spawn(move || {
            for _ in 0..total {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&raw).into_owned();
                let path = request
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                seen.lock().expect("lock").push(request);
                let response = queues
                    .get_mut(&path)
                    .and_then(Vec::pop)
                    .unwrap_or_else(|| reply(404, "", "missing"));
                let _ = stream.write_all(response.as_bytes());
            }
        });

        TestServer { base_url, requests }
    }

    fn reply(status: u16, extra_headers: &str, body: &str) -> String {
        let reason = match status {
            200 => "OK",
            404 => "Not Found",
            429 => "Too Many Requests",
            _ => "Error",
        };
        format!(
            "HTTP/1.1 {status} {reason}\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn too_many() -> String {
        reply(429, "Retry-After: 0\r\n", "")
    }

    fn settings(base_url: &str) -> FetchSettings {
        FetchSettings {
            user_agent: Some("Fundwatch Tests ops@example.org".to_string()),
            rate_limit: 50,
            timeout: Duration::from_secs(5),
            submissions_url: format!("{base_url}/submissions/CIK{{id}}.json"),
            ..FetchSettings::default()
        }
    }

    #[test]
    fn clients_refuse_to_start_without_identity() {
        let temp = tempdir().expect("tempdir");
        let error = BlockingFetchClient::new(FetchSettings::default(), temp.path())
            .err()
            .expect("must fail");
        assert!(error.is_configuration());
        let error = FetchClient::new(FetchSettings::default(), temp.path())
            .err()
            .expect("must fail");
        assert!(matches!(error, FetchError::MissingIdentity));
    }

    #[tokio::test]
    async fn closed_admission_gate_is_reported_as_shutdown() {
        let temp = tempdir().expect("tempdir");
        let client = FetchClient::new(settings("http://127.0.0.1:9"), temp.path()).expect("client");
        client.semaphore.close();
        let error = client
            .fetch("http://127.0.0.1:9/never.txt")
            .await
            .expect_err("gate is closed");
        assert!(matches!(error, FetchError::Closed));
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn blocking_client_retries_once_after_429_and_caches() {
        let server = serve(vec![("/doc.txt", vec![too_many(), reply(200, "", "filing body")])]);
        let temp = tempdir().expect("tempdir");
        let mut client = BlockingFetchClient::with_pacer(
            settings(&server.base_url),
            temp.path(),
            Pacer::new(Duration::ZERO),
        )
        .expect("client");
        let url = format!("{}/doc.txt", server.base_url);

        assert_eq!(client.fetch(&url).expect("fetch"), "filing body");
        assert_eq!(client.request_count(), 2);
        assert_eq!(client.fetch_text(&url).expect("cached"), "filing body");
        assert_eq!(client.request_count(), 2);

        let requests = server.requests.lock().expect("lock");
        assert_eq!(requests.len(), 2);
        assert!(
            requests[0]
                .to_ascii_lowercase()
                .contains("user-agent: fundwatch tests ops@example.org")
        );
    }

    #[test]
    fn blocking_client_gives_up_after_bounded_retry() {
        let server = serve(vec![("/busy.txt", vec![too_many(), too_many()])]);
        let temp = tempdir().expect("tempdir");
        let mut client = BlockingFetchClient::with_pacer(
            settings(&server.base_url),
            temp.path(),
            Pacer::new(Duration::ZERO),
        )
        .expect("client");

        let error = client
            .fetch(&format!("{}/busy.txt", server.base_url))
            .expect_err("must fail");
        assert!(matches!(error, FetchError::RateLimited { attempts: 2, .. }));
        assert!(client.cache().read_web(&format!("{}/busy.txt", server.base_url)).is_none());
    }

    #[tokio::test]
    async fn fetch_many_reports_each_url_and_continues_past_failures() {
        let server = serve(vec![
            ("/a.txt", vec![reply(200, "", "alpha")]),
            ("/b.txt", vec![reply(404, "", "gone")]),
            ("/c.txt", vec![too_many(), reply(200, "", "gamma")]),
        ]);
        let temp = tempdir().expect("tempdir");
        let client = FetchClient::new(settings(&server.base_url), temp.path()).expect("client");
        let urls = ["a", "b", "c"]
            .iter()
            .map(|name| format!("{}/{name}.txt", server.base_url))
            .collect::<Vec<_>>();

        let results = client.fetch_many(&urls).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[&urls[0]].as_deref().ok(), Some("alpha"));
        assert!(matches!(
            results[&urls[1]],
            Err(FetchError::Status { status: 404, .. })
        ));
        assert_eq!(results[&urls[2]].as_deref().ok(), Some("gamma"));
        assert_eq!(client.cache().read_web(&urls[0]).as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn submissions_batch_uses_cache_and_validates_json() {
        let server = serve(vec![
            (
                "/submissions/CIK0000000002.json",
                vec![reply(200, "", "{\"cik\":\"2\",\"name\":\"Two Trust\"}")],
            ),
            ("/submissions/CIK0000000003.json", vec![reply(200, "", "<html>")]),
        ]);
        let temp = tempdir().expect("tempdir");
        let client = FetchClient::new(settings(&server.base_url), temp.path()).expect("client");
        client
            .cache()
            .write_index("1", "{\"cik\":\"1\"}")
            .expect("prime cache");

        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let results = client.fetch_submissions_batch(&ids).await;
        assert_eq!(results["1"].as_deref().ok(), Some("{\"cik\":\"1\"}"));
        assert!(results["2"].is_ok());
        assert!(matches!(results["3"], Err(FetchError::InvalidJson { .. })));
        assert!(client.cache().read_index("2").is_some());
        assert!(client.cache().read_index("3").is_none());
        assert_eq!(client.request_count(), 2);
    }
}
