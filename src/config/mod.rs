//! Configuration management for kiln

pub mod schema;

pub use schema::{
    BuildConfig, CacheConfig, Config, FetchConfig, GeneralConfig, InstallConfig, PathsConfig,
    TestPolicy, ToolchainConfig,
};

use crate::error::{KilnError, KilnResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub async fn load(&self) -> KilnResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> KilnResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> KilnResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            KilnError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    pub async fn ensure_config_dir(&self) -> KilnResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk layout derived from configuration
///
/// ```text
/// <home>/state/registry.json   installed packages
/// <home>/state/audit.log       audit events
/// <home>/cache/                content-addressed sources
/// <home>/build/                per-install work directories
/// <home>/staging/              per-install staging prefixes
/// <install_root>/<name>/<ver>  installed packages (default <home>/opt)
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    pub home: PathBuf,
    pub install_root: PathBuf,
}

impl Layout {
    /// Resolve the layout; an explicit home (flag or env) beats the config file
    pub fn resolve(config: &Config, home_override: Option<PathBuf>) -> Self {
        let home = home_override
            .or_else(|| config.paths.home.clone())
            .unwrap_or_else(Self::default_home);
        let install_root = config
            .paths
            .install_root
            .clone()
            .unwrap_or_else(|| home.join("opt"));
        Self { home, install_root }
    }

    /// Layout rooted entirely under `home`
    pub fn under(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            install_root: home.join("opt"),
            home,
        }
    }

    /// Platform default home directory
    pub fn default_home() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir().join("registry.json")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir().join("audit.log")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.home.join("build")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.home.join("staging")
    }

    /// Searched after configured recipe directories
    pub fn recipes_dir(&self) -> PathBuf {
        self.home.join("recipes")
    }

    /// Ensure all state directories exist
    pub async fn ensure_dirs(&self) -> KilnResult<()> {
        let dirs = [
            self.state_dir(),
            self.cache_dir(),
            self.build_dir(),
            self.staging_dir(),
            self.install_root.clone(),
        ];

        for dir in &dirs {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| KilnError::io(format!("creating directory {}", dir.display()), e))?;
        }

        Ok(())
    }
}
