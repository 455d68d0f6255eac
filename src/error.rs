//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use crate::install::InstallState;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Fetch and integrity errors
    #[error("Fetch failed for {url} after {attempts} attempt(s): {reason}")]
    Fetch {
        url: String,
        reason: String,
        attempts: u32,
        retryable: bool,
    },

    #[error("Integrity check failed for {subject}: expected {expected}, got {actual}")]
    Integrity {
        subject: String,
        expected: String,
        actual: String,
    },

    // Dependency errors
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Unresolved dependency '{dependency}' required by '{required_by}'")]
    UnresolvedDependency {
        dependency: String,
        required_by: String,
    },

    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Cannot uninstall {name}: required by {}", dependents.join(", "))]
    DependentsInstalled {
        name: String,
        dependents: Vec<String>,
    },

    // Build errors
    #[error("Build command failed: {command} (exit code {code})\n{output}")]
    Build {
        command: String,
        code: i32,
        output: String,
    },

    #[error("Required tool not found on toolchain PATH: {0}")]
    ToolNotFound(String),

    #[error("Test command failed: {command} (exit code {code})\n{output}")]
    TestFailure {
        command: String,
        code: i32,
        output: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    /// Pipeline failure annotated with the recipe and the stage it reached
    #[error("Installing {recipe} failed during {stage}: {source}")]
    Install {
        recipe: String,
        stage: InstallState,
        #[source]
        source: Box<KilnError>,
    },

    // Recipe and configuration errors
    #[error("Invalid recipe at {path}: {reason}")]
    RecipeInvalid { path: PathBuf, reason: String },

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed to start: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a build error from a failed command
    pub fn build_failed(command: impl Into<String>, code: i32, output: impl Into<String>) -> Self {
        Self::Build {
            command: command.into(),
            code,
            output: output.into(),
        }
    }

    /// Create a fetch error for a single attempt
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>, retryable: bool) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
            attempts: 1,
            retryable,
        }
    }

    /// Strip `Install` wrappers and return the underlying cause
    pub fn root_cause(&self) -> &KilnError {
        match self {
            Self::Install { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Stable kind name printed on stderr
    pub fn kind(&self) -> &'static str {
        match self.root_cause() {
            Self::Fetch { .. } => "FetchError",
            Self::Integrity { .. } => "IntegrityError",
            Self::DependencyCycle { .. } => "DependencyCycleError",
            Self::UnresolvedDependency { .. } => "UnresolvedDependencyError",
            Self::RecipeNotFound(_) => "RecipeNotFound",
            Self::DependentsInstalled { .. } => "DependentsInstalled",
            Self::Build { .. } | Self::ToolNotFound(_) => "BuildError",
            Self::TestFailure { .. } => "TestFailure",
            Self::Cancelled => "Cancelled",
            Self::RecipeInvalid { .. } => "RecipeInvalid",
            Self::ConfigInvalid { .. } => "ConfigInvalid",
            Self::Io { .. } | Self::CommandFailed { .. } => "IoError",
            Self::Json(_) | Self::TomlSerialize(_) => "SerializationError",
            Self::Internal(_) => "InternalError",
            Self::User(_) => "UsageError",
            Self::Install { .. } => "InstallError",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self.root_cause() {
            Self::Fetch { .. } | Self::Integrity { .. } => 1,
            Self::DependencyCycle { .. }
            | Self::UnresolvedDependency { .. }
            | Self::RecipeNotFound(_)
            | Self::DependentsInstalled { .. } => 2,
            Self::Build { .. } | Self::ToolNotFound(_) => 3,
            Self::TestFailure { .. } => 4,
            Self::Cancelled => 130,
            _ => 5,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { retryable: true, .. })
    }

    /// Produce an equivalent error for another waiter on the same operation.
    ///
    /// IO sources are not `Clone`, so they are rebuilt from kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Fetch {
                url,
                reason,
                attempts,
                retryable,
            } => Self::Fetch {
                url: url.clone(),
                reason: reason.clone(),
                attempts: *attempts,
                retryable: *retryable,
            },
            Self::Integrity {
                subject,
                expected,
                actual,
            } => Self::Integrity {
                subject: subject.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::Cancelled => Self::Cancelled,
            Self::Io { context, source } => Self::Io {
                context: context.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            other => Self::Internal(other.to_string()),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self.root_cause() {
            Self::Integrity { .. } => {
                Some("The source does not match the recipe digest; check the recipe's url and digest")
            }
            Self::RecipeNotFound(_) => Some("Add the recipe directory with --recipes <dir>"),
            Self::ToolNotFound(_) => Some("Add the tool's directory to [toolchain].path in config"),
            Self::DependentsInstalled { .. } => {
                Some("Uninstall the dependents first, or pass --force")
            }
            Self::Fetch { .. } => Some("Check network access and the recipe url"),
            _ => None,
        }
    }
}
