//! Download cache + HTTP fetch utilities for agtrack.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
pub use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agtrack-storage";

#[derive(Debug, Clone)]
pub struct CachedFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: u64,
    /// True when the file was already on disk and no bytes were written.
    pub reused: bool,
}

/// Flat directory of downloaded documents keyed by sanitized file name.
#[derive(Debug, Clone)]
pub struct DownloadCache {
    root: PathBuf,
}

impl DownloadCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Replaces path separators, reserved characters and whitespace with `_`.
    pub fn sanitize_file_name(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut last_underscore = false;
        for ch in raw.chars() {
            let bad = ch.is_whitespace()
                || ch.is_control()
                || matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|');
            if bad {
                if !last_underscore {
                    out.push('_');
                }
                last_underscore = true;
            } else {
                out.push(ch);
                last_underscore = false;
            }
        }
        let trimmed: String = out
            .trim_matches(|c| c == '_' || c == '.')
            .chars()
            .take(120)
            .collect();
        if trimmed.is_empty() {
            "document".to_string()
        } else {
            trimmed
        }
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Returns the cached file if a non-empty copy exists.
    pub async fn lookup(&self, file_name: &str) -> anyhow::Result<Option<CachedFile>> {
        let path = self.path_for(file_name);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("checking cached file {}", path.display()))
            }
        };
        if !meta.is_file() || meta.len() == 0 {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading cached file {}", path.display()))?;
        Ok(Some(CachedFile {
            content_hash: Self::sha256_hex(&bytes),
            byte_size: meta.len(),
            path,
            reused: true,
        }))
    }

    /// Store bytes under `file_name` using an atomic temp-file rename.
    pub async fn store(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<CachedFile> {
        if let Some(existing) = self.lookup(file_name).await? {
            return Ok(existing);
        }

        let final_path = self.path_for(file_name);
        self.write_atomic(&final_path, bytes).await?;

        Ok(CachedFile {
            path: final_path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len() as u64,
            reused: false,
        })
    }

    fn origin_path(&self, file_name: &str) -> PathBuf {
        self.root.join(format!("{file_name}.url"))
    }

    /// Remembers the URL a cached file was downloaded from in a `<file_name>.url` sidecar.
    pub async fn record_origin(&self, file_name: &str, url: &str) -> anyhow::Result<()> {
        self.write_atomic(&self.origin_path(file_name), url.as_bytes())
            .await
    }

    /// URL recorded by [`DownloadCache::record_origin`], if any.
    pub async fn origin(&self, file_name: &str) -> anyhow::Result<Option<String>> {
        let path = self.origin_path(file_name);
        match fs::read_to_string(&path).await {
            Ok(url) => Ok(Some(url.trim().to_string()).filter(|url| !url.is_empty())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading origin {}", path.display())),
        }
    }

    async fn write_atomic(&self, final_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating download directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp file {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            });
        }
        Ok(())
    }
}

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
            max_retries: 1,
            base_delay: Duration::from_millis(500),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            referer: None,
            global_concurrency: 16,
            per_source_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
}

/// Byte-level GET used by every pipeline stage; lets tests run without a network.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(referer) = &config.referer {
            let mut headers = HeaderMap::new();
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer).context("invalid referer header value")?,
            );
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                })
                            }
                            Err(err)
                                if can_retry
                                    && classify_reqwest_error(&err)
                                        == RetryDisposition::Retryable =>
                            {
                                debug!(attempt, error = %err, "body read failed; retrying");
                            }
                            Err(err) => return Err(FetchError::Request(err)),
                        }
                    } else if can_retry && classify_status(status) == RetryDisposition::Retryable {
                        debug!(attempt, status = status.as_u16(), "retryable status; retrying");
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => {
                    if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        debug!(attempt, error = %err, "request failed; retrying");
                    } else {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|err| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }
}
