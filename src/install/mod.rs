//! Install pipeline, package registry and lifecycle states

mod manager;
mod registry;
mod state;

pub use manager::{InstallManager, InstallObserver, InstallReport, PackageOutcome};
pub use registry::Registry;
pub use state::{InstallOutcome, InstallState, InstalledPackage, Transition};
