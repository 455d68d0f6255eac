//! Runs a recipe's install and test commands

use super::{build_error_output, stream_child_output, Toolchain};
use crate::config::{Config, TestPolicy};
use crate::error::{KilnError, KilnResult};
use crate::recipe::Recipe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which command list is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Install,
    Test,
}

/// Receives command progress and output lines
pub trait BuildSink: Send + Sync {
    fn command_started(&self, _recipe: &str, _phase: Phase, _index: usize, _total: usize, _command: &str) {}

    fn output_line(&self, _recipe: &str, _line: &str) {}
}

/// Sink that discards everything
pub struct NullSink;

impl BuildSink for NullSink {}

/// Outcome of the install command sequence
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Staging prefix the commands installed into
    pub prefix: PathBuf,
    pub commands: usize,
    pub duration: Duration,
}

/// Outcome of the test command sequence
#[derive(Debug, Clone, Default)]
pub struct TestReport {
    pub passed: usize,
    /// Failures tolerated under the `warn` policy
    pub failures: Vec<String>,
}

/// Values substituted into command arguments
struct Placeholders {
    prefix: String,
    bin: String,
    name: String,
    version: String,
    source: String,
}

impl Placeholders {
    fn new(recipe: &Recipe, work_dir: &Path, prefix: &Path) -> Self {
        Self {
            prefix: prefix.display().to_string(),
            bin: prefix.join("bin").display().to_string(),
            name: recipe.name.clone(),
            version: recipe.version.clone(),
            source: work_dir.display().to_string(),
        }
    }

    fn expand(&self, arg: &str) -> String {
        arg.replace("{prefix}", &self.prefix)
            .replace("{bin}", &self.bin)
            .replace("{name}", &self.name)
            .replace("{version}", &self.version)
            .replace("{source}", &self.source)
    }
}

enum Exit {
    Finished(Vec<String>, std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

struct CommandOutput {
    code: i32,
    lines: Vec<String>,
}

/// Executes recipe commands with an explicit toolchain
#[derive(Debug, Clone)]
pub struct BuildRunner {
    toolchain: Toolchain,
    test_policy: TestPolicy,
    command_timeout: Option<Duration>,
}

impl BuildRunner {
    pub fn new(toolchain: Toolchain) -> Self {
        Self {
            toolchain,
            test_policy: TestPolicy::FailClosed,
            command_timeout: None,
        }
    }

    /// Runner configured from `[toolchain]` and `[build]`
    pub fn from_config(config: &Config) -> Self {
        let timeout = config.build.command_timeout_secs;
        Self::new(Toolchain::from_config(&config.toolchain))
            .with_test_policy(config.build.test_policy)
            .with_command_timeout((timeout > 0).then(|| Duration::from_secs(timeout)))
    }

    pub fn with_test_policy(mut self, policy: TestPolicy) -> Self {
        self.test_policy = policy;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn test_policy(&self) -> TestPolicy {
        self.test_policy
    }

    /// Run the install commands in `work_dir`, installing into `prefix`.
    ///
    /// The first command exiting non-zero aborts the sequence.
    pub async fn build(
        &self,
        recipe: &Recipe,
        work_dir: &Path,
        prefix: &Path,
        cancel: &CancellationToken,
        sink: &dyn BuildSink,
    ) -> KilnResult<BuildResult> {
        let started = Instant::now();
        self.toolchain.check_tools(&recipe.tools)?;

        tokio::fs::create_dir_all(prefix)
            .await
            .map_err(|e| KilnError::io(format!("creating prefix {}", prefix.display()), e))?;

        let vars = Placeholders::new(recipe, work_dir, prefix);
        let total = recipe.install.len();

        for (i, argv) in recipe.install.iter().enumerate() {
            let argv: Vec<String> = argv.iter().map(|a| vars.expand(a)).collect();
            let command_line = argv.join(" ");
            info!("Building {} [{}/{}]: {}", recipe.name, i + 1, total, command_line);
            sink.command_started(&recipe.name, Phase::Install, i + 1, total, &command_line);

            let output = self
                .run_command(recipe, &argv, work_dir, prefix, cancel, sink)
                .await?;
            if output.code != 0 {
                return Err(KilnError::build_failed(
                    command_line,
                    output.code,
                    build_error_output(&output.lines),
                ));
            }
        }

        Ok(BuildResult {
            prefix: prefix.to_path_buf(),
            commands: total,
            duration: started.elapsed(),
        })
    }

    /// Run the test commands against the staged install.
    ///
    /// Under `fail-closed` the first failure is an error; under `warn` every
    /// command runs and failures are collected into the report.
    pub async fn test(
        &self,
        recipe: &Recipe,
        work_dir: &Path,
        prefix: &Path,
        cancel: &CancellationToken,
        sink: &dyn BuildSink,
    ) -> KilnResult<TestReport> {
        let vars = Placeholders::new(recipe, work_dir, prefix);
        let total = recipe.test.len();
        let mut report = TestReport::default();

        for (i, argv) in recipe.test.iter().enumerate() {
            let argv: Vec<String> = argv.iter().map(|a| vars.expand(a)).collect();
            let command_line = argv.join(" ");
            debug!("Testing {} [{}/{}]: {}", recipe.name, i + 1, total, command_line);
            sink.command_started(&recipe.name, Phase::Test, i + 1, total, &command_line);

            let output = match self
                .run_command(recipe, &argv, work_dir, prefix, cancel, sink)
                .await
            {
                Ok(output) => output,
                Err(e @ (KilnError::ToolNotFound(_) | KilnError::CommandFailed { .. })) => {
                    // A test program that cannot start is a failed test
                    CommandOutput {
                        code: 127,
                        lines: vec![e.to_string()],
                    }
                }
                Err(e) => return Err(e),
            };
            if output.code == 0 {
                report.passed += 1;
                continue;
            }

            match self.test_policy {
                TestPolicy::FailClosed => {
                    return Err(KilnError::TestFailure {
                        command: command_line,
                        code: output.code,
                        output: build_error_output(&output.lines),
                    });
                }
                TestPolicy::Warn => {
                    warn!(
                        "Test for {} failed (exit code {}), keeping install: {}",
                        recipe.name, output.code, command_line
                    );
                    report.failures.push(command_line);
                }
            }
        }

        Ok(report)
    }

    async fn run_command(
        &self,
        recipe: &Recipe,
        argv: &[String],
        work_dir: &Path,
        prefix: &Path,
        cancel: &CancellationToken,
        sink: &dyn BuildSink,
    ) -> KilnResult<CommandOutput> {
        let command_line = argv.join(" ");
        let program = argv
            .first()
            .ok_or_else(|| KilnError::Internal(format!("empty command in {}", recipe.name)))?;
        let resolved = self
            .toolchain
            .which(program)
            .ok_or_else(|| KilnError::ToolNotFound(program.clone()))?;

        let mut cmd = Command::new(&resolved);
        cmd.args(&argv[1..])
            .current_dir(work_dir)
            .env("PATH", self.toolchain.path_var()?)
            .envs(self.toolchain.env())
            .env("KILN_PREFIX", prefix)
            .env("KILN_NAME", &recipe.name)
            .env("KILN_VERSION", &recipe.version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| KilnError::command_failed(command_line.clone(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KilnError::Internal("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| KilnError::Internal("child stderr not captured".to_string()))?;

        let name = recipe.name.as_str();
        let on_line = move |line: &str| sink.output_line(name, line);
        let timeout = self.command_timeout;

        let exit = {
            let run = async {
                let lines = stream_child_output(stdout, stderr, &on_line).await;
                let status = child.wait().await;
                (lines, status)
            };
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                (lines, status) = run => Exit::Finished(lines, status),
                _ = cancel.cancelled() => Exit::Cancelled,
                _ = deadline => Exit::TimedOut,
            }
        };

        match exit {
            Exit::Finished(lines, status) => {
                let status = status.map_err(|e| KilnError::command_failed(command_line.clone(), e))?;
                let code = status.code().unwrap_or(-1);
                debug!("{} exited with {}", command_line, code);
                Ok(CommandOutput { code, lines })
            }
            Exit::Cancelled => {
                warn!("Cancelling {}: killing {}", recipe.name, command_line);
                let _ = child.kill().await;
                Err(KilnError::Cancelled)
            }
            Exit::TimedOut => {
                let _ = child.kill().await;
                let secs = timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                Err(KilnError::build_failed(
                    command_line,
                    -1,
                    format!("timed out after {:.1}s", secs),
                ))
            }
        }
    }
}
