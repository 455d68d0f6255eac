//! CLI command implementations

pub mod cache;
pub mod config;
pub mod info;
pub mod install;
pub mod list;
pub mod uninstall;

pub use cache::execute as cache;
pub use config::execute as config;
pub use info::execute as info;
pub use install::execute as install;
pub use list::execute as list;
pub use uninstall::execute as uninstall;
