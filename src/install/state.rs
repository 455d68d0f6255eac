//! Install lifecycle states and installed-package records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::cache::Digest;

/// Per-recipe install state
///
/// ```text
/// pending -> fetching -> verifying -> resolving_deps -> building -> testing -> installed
///    \__________\____________\______________\_____________\___________\-> failed
/// failed | installed -> rolled_back
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Pending,
    Fetching,
    Verifying,
    ResolvingDeps,
    Building,
    Testing,
    Installed,
    Failed,
    RolledBack,
}

impl InstallState {
    /// Pipeline order, excluding the failure states
    pub const PIPELINE: [InstallState; 7] = [
        Self::Pending,
        Self::Fetching,
        Self::Verifying,
        Self::ResolvingDeps,
        Self::Building,
        Self::Testing,
        Self::Installed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::ResolvingDeps => "resolving_deps",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Installed => "installed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Failed | Self::RolledBack)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: InstallState) -> bool {
        use InstallState::*;
        match (self, next) {
            (Pending, Fetching)
            | (Fetching, Verifying)
            | (Verifying, ResolvingDeps)
            | (ResolvingDeps, Building)
            | (Building, Testing)
            | (Testing, Installed) => true,
            // A failed or removed recipe may be installed again from scratch
            (Failed | RolledBack, Pending) => true,
            (Failed | Installed, RolledBack) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry record for an installed package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,

    /// `<install_root>/<name>/<version>`
    pub path: PathBuf,

    /// Digest the source verified against
    pub digest: Digest,

    pub installed_at: DateTime<Utc>,

    pub state: InstallState,

    /// Recipe fingerprint at install time
    pub fingerprint: String,

    /// Dependencies it was built against
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub recipe: String,
    pub from: InstallState,
    pub to: InstallState,
    pub at: DateTime<Utc>,
}

/// How a recipe ended up installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Built and committed by this call
    Installed,
    /// Replaced an install from a different recipe definition
    Upgraded,
    /// Already installed with an unchanged recipe; nothing ran
    AlreadyInstalled,
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Installed => write!(f, "installed"),
            Self::Upgraded => write!(f, "upgraded"),
            Self::AlreadyInstalled => write!(f, "already installed"),
        }
    }
}
