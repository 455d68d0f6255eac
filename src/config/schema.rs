//! Configuration schema for kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Filesystem locations
    pub paths: PathsConfig,

    /// Source download settings
    pub fetch: FetchConfig,

    /// Source cache settings
    pub cache: CacheConfig,

    /// Build runner settings
    pub build: BuildConfig,

    /// Install pipeline settings
    pub install: InstallConfig,

    /// Toolchain injected into build commands
    pub toolchain: ToolchainConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for state, cache and build directories (default: platform data dir)
    pub home: Option<PathBuf>,

    /// Where packages are installed (default: `<home>/opt`)
    pub install_root: Option<PathBuf>,

    /// Directories searched for `<name>.toml` recipes, in order
    pub recipe_dirs: Vec<PathBuf>,
}

/// Source download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts per download before giving up
    pub max_attempts: u32,

    /// Delay before the first retry, doubled on each further retry
    pub initial_backoff_ms: u64,

    /// Upper bound for the retry delay
    pub max_backoff_ms: u64,

    /// Whole-request timeout for HTTP downloads
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            timeout_secs: 300,
        }
    }
}

/// Source cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum total cache size in MB before LRU eviction (0 = unlimited)
    pub max_total_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_total_mb: 2048 }
    }
}

/// What to do when a post-install test command fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestPolicy {
    /// Treat a failing test as an install failure
    #[default]
    FailClosed,
    /// Log the failure and keep the install
    Warn,
}

impl fmt::Display for TestPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailClosed => write!(f, "fail-closed"),
            Self::Warn => write!(f, "warn"),
        }
    }
}

impl std::str::FromStr for TestPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-closed" => Ok(Self::FailClosed),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "invalid test policy '{}': use fail-closed or warn",
                other
            )),
        }
    }
}

/// Build runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Maximum recipes built concurrently
    pub jobs: usize,

    /// Post-install test failure policy
    pub test_policy: TestPolicy,

    /// Per-command timeout in seconds (0 = none)
    pub command_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            jobs: 4,
            test_policy: TestPolicy::FailClosed,
            command_timeout_secs: 0,
        }
    }
}

/// Install pipeline settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Uninstall dependencies installed by a call whose target failed
    pub rollback_on_failure: bool,
}

/// Toolchain injected into build and test commands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Directories prepended to PATH
    pub path: Vec<PathBuf>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}
