//! Command-line interface

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};

use crate::config::{Config, ConfigManager, Layout};
use crate::error::KilnResult;
use crate::install::InstallManager;
use crate::recipe::RecipeBook;
use crate::ui::UiContext;
use std::path::PathBuf;
use tracing::debug;

/// Everything a command needs, resolved once from flags, env and config
pub struct CliContext {
    pub config: Config,
    pub config_manager: ConfigManager,
    pub layout: Layout,
    pub ui: UiContext,
    recipe_dirs: Vec<PathBuf>,
}

impl CliContext {
    /// Load configuration and resolve the on-disk layout
    pub async fn load(cli: &Cli) -> KilnResult<Self> {
        let config_manager = match cli.config {
            Some(ref path) => ConfigManager::with_path(path.clone()),
            None => ConfigManager::new(),
        };
        let config = config_manager.load().await?;
        let layout = Layout::resolve(&config, cli.home.clone());

        // Flags first, then config, then <home>/recipes; built-ins come last
        let mut recipe_dirs = cli.recipe_dirs.clone();
        recipe_dirs.extend(config.paths.recipe_dirs.iter().cloned());
        recipe_dirs.push(layout.recipes_dir());

        debug!(
            "home={} install_root={} recipe_dirs={:?}",
            layout.home.display(),
            layout.install_root.display(),
            recipe_dirs
        );

        Ok(Self {
            config,
            config_manager,
            layout,
            ui: UiContext::detect(),
            recipe_dirs,
        })
    }

    pub fn recipe_dirs(&self) -> &[PathBuf] {
        &self.recipe_dirs
    }

    pub fn book(&self) -> RecipeBook {
        RecipeBook::new(self.recipe_dirs.clone())
    }

    /// Install manager wired from the loaded config
    pub async fn manager(&self) -> KilnResult<InstallManager> {
        InstallManager::from_config(&self.config, self.layout.clone(), self.book()).await
    }
}
