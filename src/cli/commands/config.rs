//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::cli::CliContext;
use crate::config::{Config, ConfigManager};
use crate::error::{KilnError, KilnResult};
use crate::ui::{self, UiContext};
use tokio::fs;
use toml_edit::{Array, DocumentMut, TableLike, Value};

/// Execute the config command
pub async fn execute(args: ConfigArgs, ctx: &CliContext) -> KilnResult<()> {
    let manager = &ctx.config_manager;

    match args.action {
        None | Some(ConfigAction::Show) => show_config(&ctx.config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(&ctx.ui, manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            set_value(manager, &key, &value).await?;
            ui::step_ok(&ctx.ui, &format!("Set {} = {}", key, value));
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> KilnResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(ctx: &UiContext, manager: &ConfigManager, force: bool) -> KilnResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(ctx, "Configuration initialized", &path.display().to_string());

    Ok(())
}

/// How a key's value is written to TOML
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Bool,
    Int,
    Str,
    /// Comma-separated on the command line
    List,
}

const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "general.audit_log",
    "paths.home",
    "paths.install_root",
    "paths.recipe_dirs",
    "fetch.max_attempts",
    "fetch.initial_backoff_ms",
    "fetch.max_backoff_ms",
    "fetch.timeout_secs",
    "cache.max_total_mb",
    "build.jobs",
    "build.test_policy",
    "build.command_timeout_secs",
    "install.rollback_on_failure",
    "toolchain.path",
    "toolchain.env.<NAME>",
];

fn key_kind(key: &str) -> Option<KeyKind> {
    let parts: Vec<&str> = key.split('.').collect();
    match parts.as_slice() {
        ["general", "audit_log"] | ["install", "rollback_on_failure"] => Some(KeyKind::Bool),
        ["fetch", "max_attempts" | "initial_backoff_ms" | "max_backoff_ms" | "timeout_secs"]
        | ["cache", "max_total_mb"]
        | ["build", "jobs" | "command_timeout_secs"] => Some(KeyKind::Int),
        ["general", "log_format"]
        | ["paths", "home" | "install_root"]
        | ["build", "test_policy"] => Some(KeyKind::Str),
        ["toolchain", "env", name] if !name.is_empty() => Some(KeyKind::Str),
        ["paths", "recipe_dirs"] | ["toolchain", "path"] => Some(KeyKind::List),
        _ => None,
    }
}

fn parse_value(kind: KeyKind, key: &str, value: &str) -> KilnResult<Value> {
    Ok(match kind {
        KeyKind::Bool => Value::from(parse_bool(value)?),
        KeyKind::Int => {
            let n: i64 = value
                .parse()
                .map_err(|_| KilnError::User(format!("Invalid number for {}: {}", key, value)))?;
            if n < 0 {
                return Err(KilnError::User(format!("{} must not be negative", key)));
            }
            Value::from(n)
        }
        KeyKind::Str => {
            if key == "general.log_format" && !matches!(value, "text" | "json") {
                return Err(KilnError::User(format!(
                    "Invalid log format: {}. Use text or json",
                    value
                )));
            }
            Value::from(value)
        }
        KeyKind::List => {
            let items: Array = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            Value::Array(items)
        }
    })
}

fn parse_bool(value: &str) -> KilnResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(KilnError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

/// Set a dotted key, creating intermediate tables and keeping the rest of the document intact
fn set_document_value(doc: &mut DocumentMut, key: &str, value: Value) -> KilnResult<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let Some((leaf, tables)) = parts.split_last() else {
        return Err(KilnError::User("Empty config key".to_string()));
    };

    let mut table: &mut dyn TableLike = doc.as_table_mut();
    for part in tables {
        table = table
            .entry(part)
            .or_insert(toml_edit::table())
            .as_table_like_mut()
            .ok_or_else(|| KilnError::User(format!("Expected a table at '{}'", part)))?;
    }

    table.insert(leaf, toml_edit::value(value));
    Ok(())
}

/// Edit one key in the config file, validating the result before writing
async fn set_value(manager: &ConfigManager, key: &str, value: &str) -> KilnResult<()> {
    let Some(kind) = key_kind(key) else {
        eprintln!("Valid keys:");
        for valid in VALID_KEYS {
            eprintln!("  {}", valid);
        }
        return Err(KilnError::User(format!("Unknown config key: {}", key)));
    };
    let parsed = parse_value(kind, key, value)?;

    let path = manager.path();
    let mut doc = if path.exists() {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
        content
            .parse::<DocumentMut>()
            .map_err(|e| KilnError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
    } else {
        DocumentMut::new()
    };

    set_document_value(&mut doc, key, parsed)?;

    let content = doc.to_string();
    toml::from_str::<Config>(&content).map_err(|e| KilnError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    manager.ensure_config_dir().await?;
    fs::write(path, content)
        .await
        .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;

    Ok(())
}
