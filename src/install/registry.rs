//! Registry of installed packages
//!
//! A single JSON table at `<home>/state/registry.json`, keyed by package
//! name. Every write replaces the file atomically (temp file + rename).

use crate::error::{KilnError, KilnResult};
use crate::install::state::{InstallState, InstalledPackage};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Persisted table of installed packages
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    table: Mutex<BTreeMap<String, InstalledPackage>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Registry {
    /// Load the registry at `path`, starting empty if it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> KilnResult<Self> {
        let path = path.into();
        let table = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| KilnError::io(format!("reading registry {}", path.display()), e))?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        debug!("Opened registry {} ({} packages)", path.display(), table.len());
        Ok(Self {
            path,
            table: Mutex::new(table),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize mutations for one package name
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub async fn get(&self, name: &str) -> Option<InstalledPackage> {
        self.table.lock().await.get(name).cloned()
    }

    /// Whether `name` is recorded as installed
    pub async fn is_installed(&self, name: &str) -> bool {
        self.table
            .lock()
            .await
            .get(name)
            .is_some_and(|p| p.state == InstallState::Installed)
    }

    /// All packages, sorted by name
    pub async fn list(&self) -> Vec<InstalledPackage> {
        self.table.lock().await.values().cloned().collect()
    }

    /// Installed packages that declare `name` as a dependency
    pub async fn dependents(&self, name: &str) -> Vec<String> {
        let table = self.table.lock().await;
        crate::resolver::dependents(
            name,
            table
                .iter()
                .filter(|(n, _)| n.as_str() != name)
                .map(|(n, p)| (n, p.dependencies.as_slice())),
        )
    }

    /// Record a package, replacing any previous record for its name
    pub async fn put(&self, package: InstalledPackage) -> KilnResult<()> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        next.insert(package.name.clone(), package);
        self.persist(&next).await?;
        *table = next;
        Ok(())
    }

    /// Remove a package record, returning it if present
    pub async fn remove(&self, name: &str) -> KilnResult<Option<InstalledPackage>> {
        let mut table = self.table.lock().await;
        if !table.contains_key(name) {
            return Ok(None);
        }
        let mut next = table.clone();
        let removed = next.remove(name);
        self.persist(&next).await?;
        *table = next;
        Ok(removed)
    }

    async fn persist(&self, table: &BTreeMap<String, InstalledPackage>) -> KilnResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
        }

        let content = serde_json::to_string_pretty(table)?;
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, content)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", tmp.display()), e))?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(KilnError::io(
                format!("replacing registry {}", self.path.display()),
                e,
            ));
        }
        Ok(())
    }
}
