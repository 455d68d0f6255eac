//! Install command - fetch, build and register recipes

use crate::cli::args::InstallArgs;
use crate::cli::CliContext;
use crate::error::KilnResult;
use crate::install::{InstallManager, InstallOutcome};
use crate::ui::{self, InstallProgress};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execute the install command
pub async fn execute(
    args: InstallArgs,
    ctx: &CliContext,
    cancel: &CancellationToken,
) -> KilnResult<()> {
    let mut config = ctx.config.clone();
    if let Some(jobs) = args.jobs {
        config.build.jobs = jobs;
    }
    if let Some(policy) = args.test_policy {
        config.build.test_policy = policy;
    }
    if args.rollback {
        config.install.rollback_on_failure = true;
    }

    let progress = Arc::new(InstallProgress::new(&ctx.ui));
    let manager = InstallManager::from_config(&config, ctx.layout.clone(), ctx.book())
        .await?
        .with_observer(progress.clone())
        .with_build_sink(progress.clone());

    ui::intro(&ctx.ui, &format!("Installing {}", args.recipes.join(", ")));

    let result = manager.install_many(&args.recipes, cancel).await;
    progress.finish();
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            ui::outro_error(&ctx.ui, "Install failed");
            return Err(e);
        }
    };

    let mut changed = 0;
    for package in &report.packages {
        let label = format!("{} {}", package.name, package.version);
        match package.outcome {
            InstallOutcome::AlreadyInstalled => {
                ui::step_info(&ctx.ui, &format!("{} is already installed", label));
            }
            outcome => {
                changed += 1;
                let path = manager
                    .layout()
                    .install_root
                    .join(&package.name)
                    .join(&package.version);
                ui::step_ok_detail(
                    &ctx.ui,
                    &format!("{} {}", label, outcome),
                    &path.display().to_string(),
                );
            }
        }

        for failure in &package.test_warnings {
            ui::step_warn_hint(&ctx.ui, &format!("{}: test failed", package.name), failure);
        }
    }

    if changed == 0 {
        ui::outro_success(&ctx.ui, "Nothing to do");
    } else {
        ui::outro_success(&ctx.ui, &format!("{} package(s) installed", changed));
    }

    Ok(())
}
