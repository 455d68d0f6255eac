//! Terminal output for the CLI
//!
//! `cliclack` steps and prompts plus `indicatif` bars on a terminal,
//! plain prefixed lines when stdout is not a TTY or CI is detected.

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_error, outro_success, remark, step_info, step_ok,
    step_ok_detail, step_warn_hint,
};
pub use progress::{InstallProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, KilnTheme};
