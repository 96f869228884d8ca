//! Paced HTTP fetching + durable run-artifact storage for MNLD.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mnld-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Failure taxonomy for external sources. Transient failures have already
/// exhausted the client's retry budget by the time callers see them.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient failure for {url} after {attempts} attempts: {reason}")]
    Transient {
        url: String,
        attempts: usize,
        reason: String,
    },
    #[error("permanent failure for {url}: {reason}")]
    Permanent { url: String, reason: String },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PacedClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum spacing between consecutive requests to the same host.
    pub min_delay: Duration,
    pub max_redirects: usize,
    pub backoff: BackoffPolicy,
}

impl Default for PacedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            min_delay: Duration::from_millis(1000),
            max_redirects: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
            .unwrap_or(true)
    }
}

/// HTTP client that spaces requests per downstream host and retries
/// transient failures with capped exponential backoff. One instance is
/// constructed per source by the orchestrator and shared by reference;
/// the last-call clock advances on every attempt.
#[derive(Debug)]
pub struct PacedClient {
    client: reqwest::Client,
    min_delay: Duration,
    last_call: Mutex<HashMap<String, Instant>>,
    backoff: BackoffPolicy,
}

impl PacedClient {
    pub fn new(config: PacedClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            min_delay: config.min_delay,
            last_call: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, SourceError> {
        let request = self
            .client
            .get(url)
            .build()
            .map_err(|err| SourceError::Permanent {
                url: url.to_string(),
                reason: format!("invalid request: {err}"),
            })?;
        self.execute_with_retry(request).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, SourceError> {
        let mut builder = self.client.post(url).json(body);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.build().map_err(|err| SourceError::Permanent {
            url: url.to_string(),
            reason: format!("invalid request: {err}"),
        })?;
        self.execute_with_retry(request).await
    }

    /// Sleep until this host's next allowed slot, then stamp the clock.
    async fn pace(&self, host: &str) {
        if self.min_delay.is_zero() {
            return;
        }
        let wait = {
            let last = self.last_call.lock().await;
            match last.get(host) {
                Some(prev) => {
                    let next_allowed = *prev + self.min_delay;
                    next_allowed.saturating_duration_since(Instant::now())
                }
                None => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.last_call
            .lock()
            .await
            .insert(host.to_string(), Instant::now());
    }

    async fn execute_with_retry(
        &self,
        request: reqwest::Request,
    ) -> Result<FetchedResponse, SourceError> {
        let url = request.url().to_string();
        let host = request
            .url()
            .host_str()
            .unwrap_or("unknown-host")
            .to_string();

        let mut attempts = 0usize;
        let mut last_reason = String::new();

        for attempt in 0..=self.backoff.max_retries {
            attempts = attempt + 1;
            self.pace(&host).await;
            debug!(host = host.as_str(), url = url.as_str(), attempt, "http fetch");

            let req = request.try_clone().ok_or_else(|| SourceError::Permanent {
                url: url.clone(),
                reason: "request body not replayable".to_string(),
            })?;

            match self.client.execute(req).await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| SourceError::Transient {
                                url: final_url.clone(),
                                attempts,
                                reason: format!("reading body: {err}"),
                            })?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable {
                        last_reason = format!("http status {status}");
                        if attempt < self.backoff.max_retries {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        break;
                    }

                    return Err(SourceError::Permanent {
                        url: final_url,
                        reason: format!("http status {status}"),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        last_reason = err.to_string();
                        if attempt < self.backoff.max_retries {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        break;
                    }
                    return Err(SourceError::Permanent {
                        url: url.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Err(SourceError::Transient {
            url,
            attempts,
            reason: last_reason,
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Marker written once a phase snapshot is fully on disk. A snapshot file
/// without a matching marker (or whose hash disagrees) is treated as
/// incomplete, so partial writes are never mistaken for finished phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub completed_at: DateTime<Utc>,
    pub sha256: String,
    pub byte_size: u64,
}

/// Timestamp-addressed store for per-phase snapshots. Each run gets a
/// directory named by its run id; snapshots are written via temp file +
/// atomic rename and sealed with a `CompletionMarker`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn new_run_id(now: DateTime<Utc>) -> String {
        now.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn snapshot_path(&self, run_id: &str, name: &str) -> PathBuf {
        self.root.join(run_id).join(format!("{name}.json"))
    }

    fn marker_path(&self, run_id: &str, name: &str) -> PathBuf {
        self.root.join(run_id).join(format!("{name}.done"))
    }

    pub async fn write_snapshot<T: Serialize>(
        &self,
        run_id: &str,
        name: &str,
        payload: &T,
    ) -> anyhow::Result<PathBuf> {
        let path = self.snapshot_path(run_id, name);
        let parent = path.parent().expect("snapshot path always has parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating run directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(payload)
            .with_context(|| format!("serializing snapshot {name}"))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(path),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming snapshot {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    /// Seal a previously written snapshot. Only after this returns is the
    /// phase considered complete by `latest_complete`.
    pub async fn mark_complete(&self, run_id: &str, name: &str) -> anyhow::Result<()> {
        let path = self.snapshot_path(run_id, name);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot for sealing {}", path.display()))?;
        let marker = CompletionMarker {
            completed_at: Utc::now(),
            sha256: sha256_hex(&bytes),
            byte_size: bytes.len() as u64,
        };
        let marker_bytes =
            serde_json::to_vec_pretty(&marker).context("serializing completion marker")?;
        let marker_path = self.marker_path(run_id, name);
        fs::write(&marker_path, marker_bytes)
            .await
            .with_context(|| format!("writing completion marker {}", marker_path.display()))?;
        Ok(())
    }

    pub async fn read_snapshot<T: DeserializeOwned>(
        &self,
        run_id: &str,
        name: &str,
    ) -> anyhow::Result<T> {
        let path = self.snapshot_path(run_id, name);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing snapshot {}", path.display()))
    }

    pub async fn is_complete(&self, run_id: &str, name: &str) -> bool {
        let marker_path = self.marker_path(run_id, name);
        let Ok(marker_bytes) = fs::read(&marker_path).await else {
            return false;
        };
        let Ok(marker) = serde_json::from_slice::<CompletionMarker>(&marker_bytes) else {
            return false;
        };
        let Ok(data) = fs::read(self.snapshot_path(run_id, name)).await else {
            return false;
        };
        sha256_hex(&data) == marker.sha256
    }

    /// Newest run id (by directory name, which sorts chronologically) whose
    /// `name` snapshot is sealed and intact.
    pub async fn latest_complete(&self, name: &str) -> anyhow::Result<Option<String>> {
        let mut run_ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading run store root {}", self.root.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("iterating run store root")?
        {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                run_ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        run_ids.sort();
        for run_id in run_ids.into_iter().rev() {
            if self.is_complete(&run_id, name).await {
                return Ok(Some(run_id));
            }
        }
        Ok(None)
    }

    /// All run ids present in the store, newest first.
    pub async fn run_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut run_ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading run store root {}", self.root.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("iterating run store root")?
        {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                run_ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        run_ids.sort();
        run_ids.reverse();
        Ok(run_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_retries_rate_limits_and_server_errors() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn sha256_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn pacing_spaces_consecutive_calls_to_one_host() {
        let client = PacedClient::new(PacedClientConfig {
            min_delay: Duration::from_millis(40),
            ..Default::default()
        })
        .expect("client");

        let start = Instant::now();
        client.pace("example.com").await;
        client.pace("example.com").await;
        assert!(start.elapsed() >= Duration::from_millis(40));

        // A different host is not delayed by the first host's clock.
        let start = Instant::now();
        client.pace("other.example.com").await;
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn snapshots_are_only_complete_once_sealed() {
        let dir = tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());

        store
            .write_snapshot("20260101_000000", "01_search", &vec!["a", "b"])
            .await
            .expect("write");
        assert!(!store.is_complete("20260101_000000", "01_search").await);
        assert_eq!(store.latest_complete("01_search").await.expect("scan"), None);

        store
            .mark_complete("20260101_000000", "01_search")
            .await
            .expect("seal");
        assert!(store.is_complete("20260101_000000", "01_search").await);
        assert_eq!(
            store.latest_complete("01_search").await.expect("scan"),
            Some("20260101_000000".to_string())
        );

        let roundtrip: Vec<String> = store
            .read_snapshot("20260101_000000", "01_search")
            .await
            .expect("read");
        assert_eq!(roundtrip, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn latest_complete_prefers_newest_sealed_run() {
        let dir = tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());

        store
            .write_snapshot("20260101_000000", "01_search", &1u32)
            .await
            .expect("write old");
        store
            .mark_complete("20260101_000000", "01_search")
            .await
            .expect("seal old");

        // Newer run written but not sealed: must not win.
        store
            .write_snapshot("20260202_000000", "01_search", &2u32)
            .await
            .expect("write new");

        assert_eq!(
            store.latest_complete("01_search").await.expect("scan"),
            Some("20260101_000000".to_string())
        );
    }

    #[tokio::test]
    async fn tampered_snapshot_is_not_complete() {
        let dir = tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());

        store
            .write_snapshot("20260101_000000", "03_final", &vec![1, 2, 3])
            .await
            .expect("write");
        store
            .mark_complete("20260101_000000", "03_final")
            .await
            .expect("seal");

        let path = store.snapshot_path("20260101_000000", "03_final");
        std::fs::write(&path, b"[]").expect("tamper");
        assert!(!store.is_complete("20260101_000000", "03_final").await);
    }
}
