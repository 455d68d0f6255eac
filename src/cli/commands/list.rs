//! List command - show installed packages

use crate::cli::args::{ListArgs, OutputFormat};
use crate::cli::CliContext;
use crate::error::KilnResult;
use crate::install::{InstallState, InstalledPackage, Registry};
use crate::ui;
use console::style;

/// Execute the list command
pub async fn execute(args: ListArgs, ctx: &CliContext) -> KilnResult<()> {
    let registry = Registry::open(ctx.layout.registry_path()).await?;
    let packages = registry.list().await;

    if packages.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => ui::step_info(&ctx.ui, "No packages installed"),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&packages),
        OutputFormat::Json => print_json(&packages)?,
        OutputFormat::Plain => print_plain(&packages),
    }

    Ok(())
}

fn print_table(packages: &[InstalledPackage]) {
    println!(
        "{:<20} {:<12} {:<12} {:<17} {}",
        style("NAME").bold(),
        style("VERSION").bold(),
        style("STATE").bold(),
        style("INSTALLED").bold(),
        style("PATH").bold()
    );
    println!("{}", "-".repeat(80));

    for package in packages {
        let state = match package.state {
            InstallState::Installed => style(package.state.as_str()).green(),
            InstallState::Failed => style(package.state.as_str()).red(),
            _ => style(package.state.as_str()).yellow(),
        };
        let installed = package.installed_at.format("%Y-%m-%d %H:%M").to_string();

        println!(
            "{:<20} {:<12} {:<12} {:<17} {}",
            package.name,
            package.version,
            state,
            installed,
            package.path.display()
        );
    }

    println!();
    println!("{} package(s)", packages.len());
}

fn print_json(packages: &[InstalledPackage]) -> KilnResult<()> {
    println!("{}", serde_json::to_string_pretty(packages)?);
    Ok(())
}

fn print_plain(packages: &[InstalledPackage]) {
    for package in packages {
        println!("{} {}", package.name, package.version);
    }
}
