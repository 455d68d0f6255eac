//! Building recipes
//!
//! Install and test commands run as argv subprocesses inside a per-install
//! work directory, writing into a staging prefix that the install manager
//! promotes on success.

mod runner;
mod toolchain;
pub mod unpack;

pub use runner::{BuildResult, BuildRunner, BuildSink, NullSink, Phase, TestReport};
pub use toolchain::Toolchain;
pub use unpack::{unpack_source, ArchiveKind};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};

/// Max number of output lines to include in build error messages.
const BUILD_ERROR_TAIL_LINES: usize = 50;

/// Keep the last `BUILD_ERROR_TAIL_LINES` lines of combined output.
pub(crate) fn build_error_output(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(BUILD_ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_line` for each line.
///
/// Returns every line in arrival order for error reporting.
pub(crate) async fn stream_child_output(
    stdout: ChildStdout,
    stderr: ChildStderr,
    on_line: &(dyn Fn(&str) + Send + Sync),
) -> Vec<String> {
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut all_output = Vec::new();
    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
        }
    }

    all_output
}
