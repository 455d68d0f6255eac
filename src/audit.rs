//! Audit log of install and uninstall events
//!
//! Writes JSON lines to `<home>/state/audit.log`. Enabled unless
//! `general.audit_log = false`.

use crate::config::{Config, Layout};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// File-based audit logger that appends JSON lines
#[derive(Debug)]
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
    // Serializes appends from concurrent installs
    lock: Mutex<()>,
}

impl AuditLog {
    /// Create an audit logger for a layout
    pub fn new(config: &Config, layout: &Layout) -> Self {
        Self::at(layout.audit_log_path(), config.general.audit_log)
    }

    pub fn at(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            enabled,
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Logger that records nothing
    pub fn disabled() -> Self {
        Self::at(PathBuf::new(), false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log an audit event as a JSON line
    ///
    /// IO failures are logged and dropped; they never fail the operation.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
