//! Catalog persistence (atomic JSON writes, snapshots, run lock) and the
//! rate-limited HTTP fetcher shared by adapters and the link validator.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use gfpc_core::Catalog;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gfpc-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum CatalogIoError {
    #[error("reading catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing catalog: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog {path} is locked by another run")]
    Locked { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct SavedCatalog {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub products: usize,
}

/// File-backed catalog: one JSON document plus timestamped snapshots.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    catalog_path: PathBuf,
    snapshot_dir: PathBuf,
}

impl CatalogStore {
    pub fn new(catalog_path: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            snapshot_dir: snapshot_dir.into(),
        }
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog_path
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .catalog_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "catalog".into());
        name.push(".lock");
        self.catalog_path.with_file_name(name)
    }

    /// Load the last persisted catalog. A missing file is an empty catalog; an
    /// unreadable or malformed one is an error, never a partial catalog.
    pub async fn load(&self) -> Result<Catalog, CatalogIoError> {
        let bytes = match fs::read(&self.catalog_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.catalog_path.display(), "no persisted catalog; starting empty");
                return Ok(Catalog::new());
            }
            Err(source) => {
                return Err(CatalogIoError::Read {
                    path: self.catalog_path.clone(),
                    source,
                })
            }
        };
        let catalog: Catalog =
            serde_json::from_slice(&bytes).map_err(|source| CatalogIoError::Parse {
                path: self.catalog_path.clone(),
                source,
            })?;
        info!(products = catalog.len(), "loaded persisted catalog");
        Ok(catalog)
    }

    pub fn encode(catalog: &Catalog) -> Result<Vec<u8>, CatalogIoError> {
        let mut bytes = serde_json::to_vec_pretty(catalog).map_err(CatalogIoError::Serialize)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub async fn save(&self, catalog: &Catalog) -> Result<SavedCatalog, CatalogIoError> {
        let bytes = Self::encode(catalog)?;
        write_atomic(&self.catalog_path, &bytes)
            .await
            .map_err(|source| CatalogIoError::Write {
                path: self.catalog_path.clone(),
                source,
            })?;
        Ok(SavedCatalog {
            path: self.catalog_path.clone(),
            content_hash: sha256_hex(&bytes),
            byte_size: bytes.len(),
            products: catalog.len(),
        })
    }

    pub fn snapshot_path(&self, taken_at: DateTime<Utc>) -> PathBuf {
        let stamp = taken_at.format("%Y%m%d_%H%M%S");
        self.snapshot_dir
            .join(format!("glutenvrij_products_backup_{stamp}.json"))
    }

    pub async fn write_snapshot(
        &self,
        catalog: &Catalog,
        taken_at: DateTime<Utc>,
    ) -> Result<PathBuf, CatalogIoError> {
        let path = self.snapshot_path(taken_at);
        let bytes = Self::encode(catalog)?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| CatalogIoError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Take the single-writer lock for this catalog. Released when the guard drops.
    pub async fn acquire_lock(&self) -> Result<RunLock, CatalogIoError> {
        let path = self.lock_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| CatalogIoError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(CatalogIoError::Locked { path })
            }
            Err(source) => return Err(CatalogIoError::Write { path, source }),
        };
        let stamp = format!("pid={} at={}\n", std::process::id(), Utc::now().to_rfc3339());
        file.write_all(stamp.as_bytes())
            .await
            .map_err(|source| CatalogIoError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(RunLock { path })
    }
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Write bytes next to `path` under a temp name, sync, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let write_result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if write_result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    write_result
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
            max_retries: 2,
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
    pub connect_timeout: Duration,
    pub user_agents: Vec<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agents: Vec::new(),
            global_concurrency: 10,
            per_source_concurrency: 5,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
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
    #[error("fetcher is shutting down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            user_agents: config.user_agents,
            next_agent: AtomicUsize::new(0),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// Round-robin over the configured user agents.
    pub fn next_user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        Some(self.user_agents[index].as_str())
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match self.next_user_agent() {
            Some(agent) => builder.header(USER_AGENT, agent),
            None => builder,
        }
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET with per-source and global concurrency limits and retry on
    /// transient failures.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            let can_retry = attempt < self.backoff.max_retries;

            match self.request(reqwest::Method::GET, url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    /// Single HEAD request, no retries. Redirects are followed by the client.
    pub async fn probe(&self, url: &str) -> Result<StatusCode, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        let resp = self.request(reqwest::Method::HEAD, url).send().await?;
        Ok(resp.status())
    }
}
