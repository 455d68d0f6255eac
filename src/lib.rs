//! Kiln - recipe-driven package installer
//!
//! Recipes are TOML data: a source URL, the digest it must hash to, and
//! argv commands that build and test it. Sources land in a
//! content-addressed cache, dependencies install first, and a package is
//! registered only after its build and tests succeed.

pub mod audit;
pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod install;
pub mod recipe;
pub mod resolver;
pub mod ui;

pub use error::{KilnError, KilnResult};
