//! Content-addressed source store
//!
//! Objects live at `<root>/objects/<algorithm>/<hex>` and are never rewritten
//! once present. A JSON index records size, original file name and usage
//! times so the store can evict least-recently-used entries past its cap.

use crate::cache::digest::Digest;
use crate::error::{KilnError, KilnResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert MB to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb * 1024 * 1024
}

/// A cached source object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Content digest (the key)
    pub digest: Digest,
    /// Absolute path of the object
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// File name from the source URL, used to pick the unpack format
    pub file_name: String,
    /// When the object was downloaded
    pub fetched_at: DateTime<Utc>,
    /// Last cache hit or insert
    pub last_used: DateTime<Utc>,
}

type PinCounts = Arc<std::sync::Mutex<HashMap<Digest, usize>>>;

/// Keeps an entry out of eviction until dropped
#[derive(Debug)]
pub struct CachePin {
    pins: PinCounts,
    digest: Digest,
}

impl Drop for CachePin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = pins.get_mut(&self.digest) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.digest);
            }
        }
    }
}

/// Content-addressed store with LRU eviction
pub struct CacheStore {
    root: PathBuf,
    max_bytes: u64,
    index: Mutex<BTreeMap<Digest, CacheEntry>>,
    pins: PinCounts,
}

impl CacheStore {
    /// Open (or create) a store rooted at `root`; `max_bytes == 0` disables eviction
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> KilnResult<Self> {
        let root = root.into();
        for dir in [root.join("objects"), root.join("tmp")] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| KilnError::io(format!("creating {}", dir.display()), e))?;
        }

        let index_path = root.join("index.json");
        let mut index = BTreeMap::new();
        if index_path.exists() {
            let content = fs::read_to_string(&index_path)
                .await
                .map_err(|e| KilnError::io(format!("reading {}", index_path.display()), e))?;
            match serde_json::from_str::<Vec<CacheEntry>>(&content) {
                Ok(entries) => {
                    for entry in entries {
                        // Objects deleted behind our back are dropped from the index
                        if entry.path.exists() {
                            index.insert(entry.digest.clone(), entry);
                        }
                    }
                }
                Err(e) => warn!("Ignoring corrupt cache index {}: {}", index_path.display(), e),
            }
        }

        debug!("Opened cache at {} ({} entries)", root.display(), index.len());
        Ok(Self {
            root,
            max_bytes,
            index: Mutex::new(index),
            pins: Arc::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("objects").join(digest.object_path())
    }

    /// Look up an entry, refreshing its last-used time on a hit
    pub async fn get(&self, digest: &Digest) -> KilnResult<Option<CacheEntry>> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.get_mut(digest) else {
            return Ok(None);
        };

        if !entry.path.exists() {
            warn!("Cache object for {} disappeared, dropping entry", digest.short());
            index.remove(digest);
            self.persist(&index).await?;
            return Ok(None);
        }

        entry.last_used = Utc::now();
        let entry = entry.clone();
        self.persist(&index).await?;
        Ok(Some(entry))
    }

    /// Whether an entry exists, without touching its usage time
    pub async fn contains(&self, digest: &Digest) -> bool {
        self.index.lock().await.contains_key(digest)
    }

    /// Protect `digest` from eviction while the returned pin lives.
    ///
    /// The digest does not have to be cached yet.
    pub fn pin(&self, digest: &Digest) -> CachePin {
        let mut pins = self.pins.lock().unwrap_or_else(|p| p.into_inner());
        *pins.entry(digest.clone()).or_insert(0) += 1;
        CachePin {
            pins: self.pins.clone(),
            digest: digest.clone(),
        }
    }

    fn is_pinned(&self, digest: &Digest) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(digest)
    }

    /// A fresh path for an in-progress download
    pub fn temp_path(&self) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}.part", uuid::Uuid::new_v4()))
    }

    /// Move a verified temporary file into the store under `digest`.
    ///
    /// The caller must already have verified the content. If the object
    /// exists (another writer won), the temporary file is discarded and the
    /// existing entry returned.
    pub async fn insert(
        &self,
        digest: &Digest,
        temp: &Path,
        file_name: &str,
    ) -> KilnResult<CacheEntry> {
        let mut index = self.index.lock().await;
        let dest = self.object_path(digest);

        if let Some(existing) = index.get(digest) {
            if existing.path.exists() {
                let _ = fs::remove_file(temp).await;
                return Ok(existing.clone());
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::rename(temp, &dest).await.map_err(|e| {
            KilnError::io(
                format!("moving {} into cache at {}", temp.display(), dest.display()),
                e,
            )
        })?;

        let size = fs::metadata(&dest)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", dest.display()), e))?
            .len();
        let now = Utc::now();
        let entry = CacheEntry {
            digest: digest.clone(),
            path: dest,
            size,
            file_name: file_name.to_string(),
            fetched_at: now,
            last_used: now,
        };
        index.insert(digest.clone(), entry.clone());
        info!("Cached {} ({})", digest.short(), format_bytes(size));

        if self.max_bytes > 0 {
            self.evict_locked(&mut index, self.max_bytes, Some(digest)).await;
        }
        self.persist(&index).await?;
        Ok(entry)
    }

    /// Remove an entry and its object
    pub async fn remove(&self, digest: &Digest) -> KilnResult<bool> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.remove(digest) else {
            return Ok(false);
        };
        remove_if_exists(&entry.path).await?;
        self.persist(&index).await?;
        Ok(true)
    }

    /// All entries, most recently used first
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let index = self.index.lock().await;
        let mut entries: Vec<_> = index.values().cloned().collect();
        entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        entries
    }

    /// Total size of all objects
    pub async fn total_size(&self) -> u64 {
        self.index.lock().await.values().map(|e| e.size).sum()
    }

    /// Evict LRU entries until the store fits `limit` bytes; returns the evicted entries
    pub async fn evict_to(&self, limit: u64) -> KilnResult<Vec<CacheEntry>> {
        let mut index = self.index.lock().await;
        let evicted = self.evict_locked(&mut index, limit, None).await;
        self.persist(&index).await?;
        Ok(evicted)
    }

    /// Shrink to the configured cap and drop abandoned partial downloads
    pub async fn gc(&self) -> KilnResult<Vec<CacheEntry>> {
        let evicted = if self.max_bytes > 0 {
            self.evict_to(self.max_bytes).await?
        } else {
            Vec::new()
        };

        let tmp = self.root.join("tmp");
        let mut entries = fs::read_dir(&tmp)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", tmp.display()), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KilnError::io("reading cache temp entry", e))?
        {
            debug!("Removing stale partial download {}", entry.path().display());
            remove_if_exists(&entry.path()).await?;
        }

        Ok(evicted)
    }

    /// Remove every entry; returns how many were removed
    pub async fn clear(&self) -> KilnResult<usize> {
        let mut index = self.index.lock().await;
        let count = index.len();
        for entry in index.values() {
            remove_if_exists(&entry.path).await?;
        }
        index.clear();
        self.persist(&index).await?;
        Ok(count)
    }

    /// Pinned entries and `keep` are skipped
    async fn evict_locked(
        &self,
        index: &mut BTreeMap<Digest, CacheEntry>,
        limit: u64,
        keep: Option<&Digest>,
    ) -> Vec<CacheEntry> {
        let mut total: u64 = index.values().map(|e| e.size).sum();
        if total <= limit {
            return Vec::new();
        }

        let mut candidates: Vec<CacheEntry> = index
            .values()
            .filter(|e| Some(&e.digest) != keep && !self.is_pinned(&e.digest))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.last_used.cmp(&b.last_used));

        let mut evicted = Vec::new();
        for entry in candidates {
            if total <= limit {
                break;
            }
            if let Err(e) = remove_if_exists(&entry.path).await {
                warn!("Failed to evict {}: {}", entry.digest.short(), e);
                continue;
            }
            index.remove(&entry.digest);
            total = total.saturating_sub(entry.size);
            info!("Evicted {} ({})", entry.digest.short(), format_bytes(entry.size));
            evicted.push(entry);
        }
        evicted
    }

    /// Atomically replace the index file
    async fn persist(&self, index: &BTreeMap<Digest, CacheEntry>) -> KilnResult<()> {
        let entries: Vec<&CacheEntry> = index.values().collect();
        let content = serde_json::to_string_pretty(&entries)?;
        let path = self.root.join("index.json");
        let tmp = self.root.join("index.json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| KilnError::io(format!("replacing {}", path.display()), e))
    }
}

async fn remove_if_exists(path: &Path) -> KilnResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KilnError::io(format!("removing {}", path.display()), e)),
    }
}
