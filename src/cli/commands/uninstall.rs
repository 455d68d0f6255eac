//! Uninstall command - remove an installed package

use crate::cli::args::UninstallArgs;
use crate::cli::CliContext;
use crate::error::KilnResult;
use crate::ui::TaskSpinner;

/// Execute the uninstall command
pub async fn execute(args: UninstallArgs, ctx: &CliContext) -> KilnResult<()> {
    let manager = ctx.manager().await?;

    let mut spinner = TaskSpinner::new(&ctx.ui);
    spinner.start(&format!("Removing {}...", args.recipe));

    match manager.uninstall(&args.recipe, args.force).await {
        Ok(true) => spinner.stop(&format!("Removed {}", args.recipe)),
        Ok(false) => spinner.stop(&format!("{} is not installed", args.recipe)),
        Err(e) => {
            spinner.stop_error(&format!("Failed to remove {}", args.recipe));
            return Err(e);
        }
    }

    Ok(())
}
