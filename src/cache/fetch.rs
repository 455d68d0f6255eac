//! Source fetching into the content-addressed store
//!
//! A fetch is keyed by the recipe's expected digest: a hit returns the cached
//! object without touching the network, a miss downloads to a temporary file,
//! verifies it and only then moves it into the store. Concurrent fetches of
//! the same digest share one download.

use crate::cache::digest::{self, Digest};
use crate::cache::store::{CacheEntry, CacheStore};
use crate::config::schema::FetchConfig;
use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHUNK: usize = 64 * 1024;

/// Moves bytes from a URL to a local file
#[async_trait]
pub trait Transport: Send + Sync {
    /// Download `url` into `dest`, returning the byte count.
    ///
    /// Must stop promptly with `KilnError::Cancelled` once `cancel` fires.
    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken)
        -> KilnResult<u64>;
}

/// HTTP(S) transport using `ureq`
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    /// Create a transport with a whole-request timeout
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

/// Map a ureq error to a fetch error, deciding whether a retry can help
fn map_ureq_error(url: &str, err: &ureq::Error) -> KilnError {
    match err {
        ureq::Error::StatusCode(code) => {
            let retryable = *code >= 500 || *code == 408 || *code == 429;
            KilnError::fetch(url, format!("HTTP {}", code), retryable)
        }
        other => KilnError::fetch(url, other.to_string(), true),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> KilnResult<u64> {
        let agent = self.agent.clone();
        let url_owned = url.to_string();
        let dest = dest.to_path_buf();
        let token = cancel.clone();

        let task = tokio::task::spawn_blocking(move || -> KilnResult<u64> {
            let response = agent
                .get(&url_owned)
                .call()
                .map_err(|e| map_ureq_error(&url_owned, &e))?;
            let mut reader = response.into_body().into_reader();
            let mut file = std::fs::File::create(&dest)
                .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;

            let mut buf = vec![0u8; CHUNK];
            let mut total = 0u64;
            loop {
                if token.is_cancelled() {
                    // The caller may already have given up on `dest`
                    drop(file);
                    let _ = std::fs::remove_file(&dest);
                    return Err(KilnError::Cancelled);
                }
                let n = reader
                    .read(&mut buf)
                    .map_err(|e| KilnError::fetch(&url_owned, e.to_string(), true))?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])
                    .map_err(|e| KilnError::io(format!("writing {}", dest.display()), e))?;
                total += n as u64;
            }
            file.flush()
                .map_err(|e| KilnError::io(format!("flushing {}", dest.display()), e))?;
            Ok(total)
        });

        tokio::select! {
            joined = task => joined
                .map_err(|e| KilnError::Internal(format!("download task failed: {}", e)))?,
            _ = cancel.cancelled() => Err(KilnError::Cancelled),
        }
    }
}

/// Local file transport for `file://` URLs and bare absolute paths
pub struct FileTransport;

impl FileTransport {
    /// Resolve a `file://` URL or absolute path to a filesystem path
    pub fn local_path(url: &str) -> Option<PathBuf> {
        if let Some(path) = url.strip_prefix("file://") {
            Some(PathBuf::from(path))
        } else if url.starts_with('/') {
            Some(PathBuf::from(url))
        } else {
            None
        }
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> KilnResult<u64> {
        let src = Self::local_path(url)
            .ok_or_else(|| KilnError::fetch(url, "not a local path", false))?;

        let mut input = tokio::fs::File::open(&src).await.map_err(|e| {
            let retryable = e.kind() != std::io::ErrorKind::NotFound;
            KilnError::fetch(url, e.to_string(), retryable)
        })?;
        let mut output = tokio::fs::File::create(dest)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;

        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(KilnError::Cancelled);
            }
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| KilnError::fetch(url, e.to_string(), true))?;
            if n == 0 {
                break;
            }
            output
                .write_all(&buf[..n])
                .await
                .map_err(|e| KilnError::io(format!("writing {}", dest.display()), e))?;
            total += n as u64;
        }
        output
            .flush()
            .await
            .map_err(|e| KilnError::io(format!("flushing {}", dest.display()), e))?;
        Ok(total)
    }
}

/// Dispatches to a transport by URL scheme
pub struct SchemeTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl SchemeTransport {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            http: HttpTransport::new(Duration::from_secs(config.timeout_secs)),
            file: FileTransport,
        }
    }
}

#[async_trait]
impl Transport for SchemeTransport {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> KilnResult<u64> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.download(url, dest, cancel).await
        } else if FileTransport::local_path(url).is_some() {
            self.file.download(url, dest, cancel).await
        } else {
            Err(KilnError::fetch(url, "unsupported URL scheme", false))
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the wait after the first failure)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

type SharedOutcome = Result<CacheEntry, Arc<KilnError>>;
type InflightMap = Mutex<HashMap<Digest, watch::Receiver<Option<SharedOutcome>>>>;

/// Removes the in-flight marker even if the leading fetch is dropped mid-way
struct InflightGuard<'a> {
    map: &'a InflightMap,
    digest: Digest,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&self.digest);
    }
}

enum Role {
    Leader(watch::Sender<Option<SharedOutcome>>),
    Follower(watch::Receiver<Option<SharedOutcome>>),
}

/// Fetches sources into a [`CacheStore`]
pub struct Fetcher {
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    inflight: InflightMap,
}

impl Fetcher {
    pub fn new(store: Arc<CacheStore>, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            store,
            transport,
            retry,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Return the cached object for `expected`, downloading `url` on a miss
    pub async fn fetch(
        &self,
        url: &str,
        expected: &Digest,
        cancel: &CancellationToken,
    ) -> KilnResult<CacheEntry> {
        loop {
            if let Some(entry) = self.store.get(expected).await? {
                debug!("Cache hit for {}", expected.short());
                return Ok(entry);
            }

            let role = {
                let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
                match inflight.get(expected) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(expected.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InflightGuard {
                        map: &self.inflight,
                        digest: expected.clone(),
                    };
                    // A previous leader may have finished between the miss and registering
                    let result = match self.store.get(expected).await {
                        Ok(Some(entry)) => {
                            debug!("Cache hit for {} after in-flight download", expected.short());
                            Ok(entry)
                        }
                        Ok(None) => self.fetch_uncached(url, expected, cancel).await,
                        Err(e) => Err(e),
                    };
                    let shared = match &result {
                        Ok(entry) => Ok(entry.clone()),
                        Err(e) => Err(Arc::new(e.duplicate())),
                    };
                    tx.send_replace(Some(shared));
                    return result;
                }
                Role::Follower(mut rx) => {
                    debug!("Joining in-flight download of {}", expected.short());
                    let outcome = tokio::select! {
                        seen = rx.wait_for(|v| v.is_some()) => seen.ok().and_then(|v| v.clone()),
                        _ = cancel.cancelled() => return Err(KilnError::Cancelled),
                    };
                    match outcome {
                        Some(Ok(entry)) => return Ok(entry),
                        Some(Err(e)) => return Err(e.duplicate()),
                        // Leader dropped without an outcome; start over
                        None => continue,
                    }
                }
            }
        }
    }

    async fn fetch_uncached(
        &self,
        url: &str,
        expected: &Digest,
        cancel: &CancellationToken,
    ) -> KilnResult<CacheEntry> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let temp = self.store.temp_path();
            info!("Downloading {} (attempt {}/{})", url, attempt, self.retry.max_attempts);

            let result = self.transport.download(url, &temp, cancel).await;
            match result {
                Ok(bytes) => {
                    debug!("Downloaded {} bytes from {}", bytes, url);
                    return self.admit(url, expected, &temp).await;
                }
                Err(e) => {
                    discard(&temp).await;
                    if e.is_retryable() && attempt < self.retry.max_attempts {
                        let delay = self.retry.delay(attempt);
                        warn!(
                            "Download attempt {} failed: {}, retrying in {:?}...",
                            attempt, e, delay
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = cancel.cancelled() => return Err(KilnError::Cancelled),
                        }
                    }
                    return Err(match e {
                        KilnError::Fetch {
                            url,
                            reason,
                            retryable,
                            ..
                        } => KilnError::Fetch {
                            url,
                            reason,
                            attempts: attempt,
                            retryable,
                        },
                        other => other,
                    });
                }
            }
        }
    }

    /// Verify a finished download and move it into the store
    async fn admit(&self, url: &str, expected: &Digest, temp: &Path) -> KilnResult<CacheEntry> {
        let actual = match digest::compute_file(temp, expected.algorithm()).await {
            Ok(actual) => actual,
            Err(e) => {
                discard(temp).await;
                return Err(e);
            }
        };

        if actual != *expected {
            discard(temp).await;
            return Err(KilnError::Integrity {
                subject: url.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        match self.store.insert(expected, temp, &file_name_from_url(url)).await {
            Ok(entry) => Ok(entry),
            Err(e) => {
                discard(temp).await;
                Err(e)
            }
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Last path segment of a URL, without query or fragment
pub fn file_name_from_url(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .unwrap_or("source")
        .to_string()
}
