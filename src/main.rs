//! Kiln - recipe-driven package installer
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use kiln::cli::{commands, Cli, CliContext, Commands};
use kiln::config::Config;
use kiln::error::{KilnError, KilnResult};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", style(format!("error[{}]", e.kind())).red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> KilnResult<()> {
    let cli = Cli::parse();
    let ctx = CliContext::load(&cli).await?;
    init_tracing(cli.verbose, &ctx.config);
    kiln::ui::init_theme();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, cancelling");
                on_signal.cancel();
            }
            Err(e) => debug!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    match cli.command {
        Commands::Install(args) => commands::install(args, &ctx, &cancel).await,
        Commands::Uninstall(args) => commands::uninstall(args, &ctx).await,
        Commands::List(args) => commands::list(args, &ctx).await,
        Commands::Info(args) => commands::info(args, &ctx).await,
        Commands::Cache(args) => commands::cache(args, &ctx).await,
        Commands::Config(args) => commands::config(args, &ctx).await,
    }
    .map_err(|e| match e {
        // A cancelled install surfaces as the cancellation itself
        e if cancel.is_cancelled() && e.exit_code() != 130 => {
            debug!("Error after cancellation: {}", e);
            KilnError::Cancelled
        }
        e => e,
    })
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_tracing(verbose: u8, config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "kiln=warn",
            1 => "kiln=info",
            _ => "kiln=debug",
        })
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.with_target(false).without_time().init();
    }
}
