//! Recipe manifest parsing
//!
//! A recipe is a TOML file describing where a package's source lives, the
//! digest it must hash to, and the argv commands that build and test it.

use crate::cache::Digest;
use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::path::Path;

/// A parsed, validated recipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    /// Package name, unique per install root
    pub name: String,

    /// One-line description
    #[serde(default)]
    pub description: String,

    /// Project homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    /// Source archive location
    pub url: String,

    /// Live/VCS source location (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,

    /// Expected digest of the source archive
    pub digest: Digest,

    /// Semantic version of the packaged source
    pub version: String,

    /// Recipes that must be installed before this one builds
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Executables the toolchain must provide
    #[serde(default)]
    pub tools: Vec<String>,

    /// Install commands, each an argv array
    #[serde(default)]
    pub install: Vec<Vec<String>>,

    /// Post-install test commands, each an argv array
    #[serde(default)]
    pub test: Vec<Vec<String>>,
}

impl Recipe {
    /// Parse a recipe from a TOML file on disk
    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading recipe {}", path.display()), e))?;
        Self::parse(&content, path)
    }

    /// Parse and validate a recipe; `origin` is only used in error messages
    pub fn parse(content: &str, origin: &Path) -> KilnResult<Self> {
        let recipe: Recipe = toml::from_str(content).map_err(|e| KilnError::RecipeInvalid {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        recipe.validate().map_err(|reason| KilnError::RecipeInvalid {
            path: origin.to_path_buf(),
            reason,
        })?;
        Ok(recipe)
    }

    /// Check structural rules that TOML typing cannot express
    pub fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)?;

        if self.url.trim().is_empty() {
            return Err("url must not be empty".to_string());
        }

        semver::Version::parse(&self.version)
            .map_err(|e| format!("version '{}' is not a semantic version: {}", self.version, e))?;

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            validate_name(dep)?;
            if dep == &self.name {
                return Err(format!("recipe '{}' depends on itself", self.name));
            }
            if !seen.insert(dep.as_str()) {
                return Err(format!("dependency '{}' is listed twice", dep));
            }
        }

        for tool in &self.tools {
            if tool.is_empty() || tool.contains('/') {
                return Err(format!("invalid tool name '{}'", tool));
            }
        }

        for (section, commands) in [("install", &self.install), ("test", &self.test)] {
            for (i, argv) in commands.iter().enumerate() {
                if argv.first().is_none_or(|program| program.trim().is_empty()) {
                    return Err(format!("{} command {} has no program", section, i + 1));
                }
            }
        }

        Ok(())
    }

    /// Parsed semantic version (validated at load time)
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(&self.version).ok()
    }

    /// Hash of the canonical JSON form; equal fingerprints mean an unchanged recipe
    pub fn fingerprint(&self) -> KilnResult<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

/// Validate that a recipe name is safe to use as a file and directory name
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("recipe name cannot be empty".to_string());
    }
    if name.contains("..") || name.starts_with('.') {
        return Err(format!("invalid recipe name '{}'", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '@'))
    {
        return Err(format!(
            "invalid recipe name '{}': use alphanumerics, '-', '_', '.', '+' or '@'",
            name
        ));
    }
    Ok(())
}
