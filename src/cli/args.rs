//! CLI argument definitions using clap derive

use crate::config::TestPolicy;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Kiln - recipe-driven package installer
///
/// Fetches verified sources into a content-addressed cache, builds them
/// with declared commands and records what is installed.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root for state, cache and the default install root
    #[arg(long, global = true, env = "KILN_HOME")]
    pub home: Option<PathBuf>,

    /// Recipe directory searched before configured ones (repeatable)
    #[arg(long = "recipes", global = true, env = "KILN_RECIPES", value_delimiter = ':')]
    pub recipe_dirs: Vec<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install recipes and their missing dependencies
    Install(InstallArgs),

    /// Remove an installed package
    Uninstall(UninstallArgs),

    /// List installed packages
    List(ListArgs),

    /// Show recipe details and install status
    Info(InfoArgs),

    /// Inspect or prune the source cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the install command
#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// Recipe names to install
    #[arg(required = true)]
    pub recipes: Vec<String>,

    /// Maximum recipes built concurrently (default: from config)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Uninstall dependencies installed by this call if a target fails
    #[arg(long)]
    pub rollback: bool,

    /// What to do when a post-install test fails (default: from config)
    #[arg(long, value_parser = parse_test_policy)]
    pub test_policy: Option<TestPolicy>,
}

/// Arguments for the uninstall command
#[derive(Parser, Debug)]
pub struct UninstallArgs {
    /// Package name
    pub recipe: String,

    /// Remove even if other installed packages depend on it
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the info command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Recipe name
    pub recipe: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., build.jobs)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached sources
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Evict least-recently-used sources past the size cap
    Gc,

    /// Remove every cached source
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn parse_test_policy(s: &str) -> Result<TestPolicy, String> {
    s.parse()
}
