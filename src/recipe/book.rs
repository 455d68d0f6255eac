//! Recipe lookup
//!
//! Resolves recipe names by searching, first match wins:
//! 1. Each configured recipe directory: `{dir}/{name}.toml`
//! 2. Built-in recipes compiled into the binary via `include_str!`

use crate::error::{KilnError, KilnResult};
use crate::recipe::manifest::{validate_name, Recipe};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

// Built-in recipes embedded at compile time
const BUILTIN_LOOP: &str = include_str!("../../recipes/loop.toml");

const BUILTINS: &[(&str, &str)] = &[("loop", BUILTIN_LOOP)];

/// Where a recipe was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeSource {
    /// `{dir}/{name}.toml`
    File(PathBuf),

    /// Compiled into the binary
    BuiltIn,
}

impl fmt::Display for RecipeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::BuiltIn => write!(f, "built-in"),
        }
    }
}

/// Recipes available for installation, keyed by name
pub type RecipeSet = BTreeMap<String, Arc<Recipe>>;

/// Searches recipe directories and built-ins
#[derive(Debug, Clone, Default)]
pub struct RecipeBook {
    dirs: Vec<PathBuf>,
    builtins: bool,
}

impl RecipeBook {
    /// Search `dirs` in order, then the built-in recipes
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            builtins: true,
        }
    }

    /// Search only `dirs`
    pub fn without_builtins(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            builtins: false,
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Find a recipe by name
    pub async fn find(&self, name: &str) -> KilnResult<Option<(Recipe, RecipeSource)>> {
        validate_name(name).map_err(KilnError::User)?;

        for dir in &self.dirs {
            let path = dir.join(format!("{}.toml", name));
            if path.is_file() {
                debug!("Found recipe {} at {}", name, path.display());
                let recipe = Recipe::from_file(&path).await?;
                check_name(&recipe, name, &path)?;
                return Ok(Some((recipe, RecipeSource::File(path))));
            }
        }

        if self.builtins {
            if let Some((_, content)) = BUILTINS.iter().find(|(n, _)| *n == name) {
                let origin = PathBuf::from(format!("<built-in>/{}.toml", name));
                let recipe = Recipe::parse(content, &origin)?;
                return Ok(Some((recipe, RecipeSource::BuiltIn)));
            }
        }

        Ok(None)
    }

    /// Load a recipe by name, failing if it does not exist
    pub async fn load(&self, name: &str) -> KilnResult<Recipe> {
        self.find(name)
            .await?
            .map(|(recipe, _)| recipe)
            .ok_or_else(|| KilnError::RecipeNotFound(name.to_string()))
    }

    /// Load the named recipes plus every dependency reachable from them.
    ///
    /// Dependencies that cannot be found are left out; the resolver reports
    /// them with the recipe that required them.
    pub async fn load_closure(&self, roots: &[String]) -> KilnResult<RecipeSet> {
        let mut set = RecipeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for root in roots {
            let recipe = self.load(root).await?;
            queue.extend(recipe.dependencies.iter().cloned());
            set.insert(root.clone(), Arc::new(recipe));
        }

        while let Some(name) = queue.pop_front() {
            if set.contains_key(&name) {
                continue;
            }
            if let Some((recipe, _)) = self.find(&name).await? {
                queue.extend(recipe.dependencies.iter().cloned());
                set.insert(name, Arc::new(recipe));
            }
        }

        Ok(set)
    }
}

fn check_name(recipe: &Recipe, expected: &str, path: &Path) -> KilnResult<()> {
    if recipe.name != expected {
        return Err(KilnError::RecipeInvalid {
            path: path.to_path_buf(),
            reason: format!(
                "file declares name '{}' but is looked up as '{}'",
                recipe.name, expected
            ),
        });
    }
    Ok(())
}
