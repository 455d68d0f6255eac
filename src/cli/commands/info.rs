//! Info command - recipe details and install status

use crate::cli::args::{InfoArgs, OutputFormat};
use crate::cli::CliContext;
use crate::error::{KilnError, KilnResult};
use crate::install::{InstalledPackage, Registry};
use crate::recipe::Recipe;
use crate::ui;

/// Execute the info command
pub async fn execute(args: InfoArgs, ctx: &CliContext) -> KilnResult<()> {
    let book = ctx.book();
    let (recipe, source) = book
        .find(&args.recipe)
        .await?
        .ok_or_else(|| KilnError::RecipeNotFound(args.recipe.clone()))?;

    let registry = Registry::open(ctx.layout.registry_path()).await?;
    let installed = registry.get(&recipe.name).await;
    let status = install_status(&recipe, installed.as_ref())?;

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "recipe": recipe,
                "source": source.to_string(),
                "status": status,
                "installed": installed,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Plain => {
            println!("{} {} ({})", recipe.name, recipe.version, status);
        }
        OutputFormat::Table => {
            ui::intro(&ctx.ui, &format!("{} {}", recipe.name, recipe.version));
            if !recipe.description.is_empty() {
                ui::remark(&ctx.ui, &recipe.description);
            }
            ui::key_value(&ctx.ui, "Recipe", &source.to_string());
            if let Some(ref homepage) = recipe.homepage {
                ui::key_value(&ctx.ui, "Homepage", homepage);
            }
            ui::key_value(&ctx.ui, "Source", &recipe.url);
            ui::key_value(&ctx.ui, "Digest", &recipe.digest.to_string());
            if let Some(ref head) = recipe.head {
                ui::key_value(&ctx.ui, "Head", &format!("{} (not installable)", head));
            }
            ui::key_value(&ctx.ui, "Dependencies", &join_or_none(&recipe.dependencies));
            ui::key_value(&ctx.ui, "Tools", &join_or_none(&recipe.tools));
            ui::key_value(
                &ctx.ui,
                "Commands",
                &format!("{} install, {} test", recipe.install.len(), recipe.test.len()),
            );
            ui::key_value_status(&ctx.ui, "Status", &status, installed.is_some());
            if let Some(package) = installed {
                ui::key_value(&ctx.ui, "Path", &package.path.display().to_string());
            }
        }
    }

    Ok(())
}

/// Human-readable install status of a recipe
fn install_status(recipe: &Recipe, installed: Option<&InstalledPackage>) -> KilnResult<String> {
    let Some(package) = installed else {
        return Ok("not installed".to_string());
    };

    if package.fingerprint == recipe.fingerprint()? {
        Ok(format!("{} {}", package.state, package.version))
    } else {
        Ok(format!(
            "{} {} (recipe changed, reinstall to upgrade)",
            package.state, package.version
        ))
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Algorithm, Digest};
    use crate::install::InstallState;
    use chrono::Utc;
    use std::path::{Path, PathBuf};

    fn recipe() -> Recipe {
        Recipe::parse(
            r#"
            name = "loop"
            url = "https://example.com/loop.tar.gz"
            digest = "sha256:56f351200bfddf72136aaf5051cd97ab04e0c42810ef312dbbd809125c4798ec"
            version = "0.3.3"
            "#,
            Path::new("loop.toml"),
        )
        .unwrap()
    }

    fn installed(fingerprint: String) -> InstalledPackage {
        InstalledPackage {
            name: "loop".to_string(),
            version: "0.3.3".to_string(),
            path: PathBuf::from("/opt/loop/0.3.3"),
            digest: Digest::of_bytes(Algorithm::Sha256, b"loop"),
            installed_at: Utc::now(),
            state: InstallState::Installed,
            fingerprint,
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn status_not_installed() {
        assert_eq!(install_status(&recipe(), None).unwrap(), "not installed");
    }

    #[test]
    fn status_matches_fingerprint() {
        let recipe = recipe();
        let package = installed(recipe.fingerprint().unwrap());
        assert_eq!(install_status(&recipe, Some(&package)).unwrap(), "installed 0.3.3");
    }

    #[test]
    fn status_flags_changed_recipe() {
        let package = installed("0".repeat(64));
        let status = install_status(&recipe(), Some(&package)).unwrap();
        assert!(status.contains("recipe changed"));
    }

    #[test]
    fn join_or_none_formats() {
        assert_eq!(join_or_none(&[]), "none");
        assert_eq!(join_or_none(&["a".to_string(), "b".to_string()]), "a, b");
    }
}
