//! Progress indicators with CI fallback

use super::context::UiContext;
use crate::build::{BuildSink, Phase};
use crate::install::{InstallObserver, InstallState, Transition};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Per-recipe progress for an install call.
///
/// Watches state transitions and build commands. In interactive mode each
/// recipe gets an indicatif bar that tracks `command N/M`; in CI every stage
/// change and command start is printed as a plain line.
pub struct InstallProgress {
    multi: Option<MultiProgress>,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl InstallProgress {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            multi: ctx.use_fancy_output().then(MultiProgress::new),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Clear any bars still on screen
    pub fn finish(&self) {
        for (_, bar) in self.bars().drain() {
            bar.finish_and_clear();
        }
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_bar(&self, multi: &MultiProgress, recipe: &str) -> ProgressBar {
        let bar = multi.add(ProgressBar::new(0));
        let template = "  {spinner:.cyan} {prefix:.bold} {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}";
        if let Ok(progress_style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(
                progress_style
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                    .progress_chars("━╸─"),
            );
        }
        bar.set_prefix(recipe.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }
}

impl InstallObserver for InstallProgress {
    fn on_transition(&self, transition: &Transition) {
        let recipe = &transition.recipe;

        let Some(ref multi) = self.multi else {
            if !matches!(transition.to, InstallState::Pending | InstallState::RolledBack) {
                println!("  {} {}", style(recipe).bold(), transition.to);
            }
            return;
        };

        let mut bars = self.bars();
        match transition.to {
            InstallState::Installed | InstallState::Failed | InstallState::RolledBack => {
                if let Some(bar) = bars.remove(recipe) {
                    bar.finish_and_clear();
                }
            }
            InstallState::Pending => {}
            stage => {
                let bar = bars
                    .entry(recipe.clone())
                    .or_insert_with(|| self.start_bar(multi, recipe));
                bar.set_message(stage.to_string());
            }
        }
    }
}

impl BuildSink for InstallProgress {
    fn command_started(&self, recipe: &str, phase: Phase, index: usize, total: usize, command: &str) {
        let label = match phase {
            Phase::Install => "install",
            Phase::Test => "test",
        };

        match self.bars().get(recipe) {
            Some(bar) => {
                bar.set_length(total as u64);
                bar.set_position(index.saturating_sub(1) as u64);
                bar.set_message(format!("{}: {}", label, truncate(command, 50)));
            }
            None if self.multi.is_none() => {
                println!("    {} {}/{}: {}", label, index, total, command);
            }
            None => {}
        }
    }

    fn output_line(&self, recipe: &str, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if let Some(bar) = self.bars().get(recipe) {
            bar.set_message(truncate(trimmed, 60));
        }
    }
}

/// Shorten to at most `max` characters, marking the cut with `...`
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transition(recipe: &str, from: InstallState, to: InstallState) -> Transition {
        Transition {
            recipe: recipe.to_string(),
            from,
            to,
            at: Utc::now(),
        }
    }

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Removing loop...");
        spinner.stop("Removed loop");
    }

    #[test]
    fn truncate_keeps_short_lines() {
        assert_eq!(truncate("cargo build", 60), "cargo build");
    }

    #[test]
    fn truncate_marks_cut() {
        let out = truncate(&"x".repeat(100), 20);
        assert_eq!(out.chars().count(), 20);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate(&"é".repeat(30), 10);
        assert_eq!(out, format!("{}...", "é".repeat(7)));
    }

    #[test]
    fn install_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = InstallProgress::new(&ctx);
        progress.on_transition(&transition("loop", InstallState::Pending, InstallState::Fetching));
        progress.command_started("loop", Phase::Install, 1, 2, "cargo install --path .");
        progress.output_line("loop", "   Compiling loop v0.3.3");
        progress.on_transition(&transition("loop", InstallState::Testing, InstallState::Installed));
        progress.finish();
        assert!(progress.bars().is_empty());
    }
}
