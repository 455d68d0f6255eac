//! Cache command - inspect and prune the source cache

use crate::cache::{format_bytes, mb_to_bytes, CacheEntry, CacheStore};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::cli::CliContext;
use crate::error::KilnResult;
use crate::ui;
use console::style;

/// Execute the cache command
pub async fn execute(args: CacheArgs, ctx: &CliContext) -> KilnResult<()> {
    let store = CacheStore::open(
        ctx.layout.cache_dir(),
        mb_to_bytes(ctx.config.cache.max_total_mb),
    )
    .await?;

    match args.action {
        CacheAction::List { format } => list_entries(&store, format).await,
        CacheAction::Gc => gc(ctx, &store).await,
        CacheAction::Clear { yes } => clear(ctx, &store, yes).await,
    }
}

async fn list_entries(store: &CacheStore, format: OutputFormat) -> KilnResult<()> {
    let entries = store.entries().await;

    if entries.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => println!("No cached sources."),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(store, &entries).await,
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.digest);
            }
        }
    }

    Ok(())
}

async fn print_table(store: &CacheStore, entries: &[CacheEntry]) {
    println!(
        "{:<20} {:<32} {:>10} {:<17}",
        style("DIGEST").bold(),
        style("FILE").bold(),
        style("SIZE").bold(),
        style("LAST USED").bold()
    );
    println!("{}", "-".repeat(82));

    for entry in entries {
        println!(
            "{:<20} {:<32} {:>10} {:<17}",
            entry.digest.short(),
            entry.file_name,
            format_bytes(entry.size),
            entry.last_used.format("%Y-%m-%d %H:%M").to_string()
        );
    }

    println!();
    let cap = match store.max_bytes() {
        0 => "unlimited".to_string(),
        bytes => format_bytes(bytes),
    };
    println!(
        "Total: {} source(s), {} of {}",
        entries.len(),
        format_bytes(store.total_size().await),
        cap
    );
}

async fn gc(ctx: &CliContext, store: &CacheStore) -> KilnResult<()> {
    let before = store.total_size().await;
    let evicted = store.gc().await?;

    if evicted.is_empty() {
        ui::step_ok(
            &ctx.ui,
            &format!("Cache is within its limit ({})", format_bytes(before)),
        );
        return Ok(());
    }

    for entry in &evicted {
        ui::remark(
            &ctx.ui,
            &format!("evicted {} ({})", entry.file_name, format_bytes(entry.size)),
        );
    }
    let freed: u64 = evicted.iter().map(|e| e.size).sum();
    ui::step_ok(
        &ctx.ui,
        &format!("Evicted {} source(s), freed {}", evicted.len(), format_bytes(freed)),
    );

    Ok(())
}

async fn clear(ctx: &CliContext, store: &CacheStore, yes: bool) -> KilnResult<()> {
    let entries = store.entries().await;
    if entries.is_empty() {
        println!("No cached sources to clear.");
        return Ok(());
    }

    let total = store.total_size().await;
    let ui_ctx = ctx.ui.clone().with_auto_yes(yes);
    let prompt = format!(
        "Remove {} cached source(s) ({})?",
        entries.len(),
        format_bytes(total)
    );
    if !ui::confirm(&ui_ctx, &prompt, false).await? {
        ui::step_warn_hint(&ctx.ui, "Cache not cleared", "Pass --yes to skip the prompt");
        return Ok(());
    }

    let removed = store.clear().await?;
    ui::step_ok(
        &ctx.ui,
        &format!("Cleared {} source(s), freed {}", removed, format_bytes(total)),
    );

    Ok(())
}
