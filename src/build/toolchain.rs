//! Build toolchain: the PATH and environment handed to recipe commands

use crate::config::ToolchainConfig;
use crate::error::{KilnError, KilnResult};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Directories and variables injected into every build and test command
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    /// Searched before the inherited PATH
    path: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    /// Inherited PATH; `None` searches only `path`
    inherited: Option<OsString>,
}

impl Toolchain {
    /// Toolchain from config, layered over the process PATH
    pub fn from_config(config: &ToolchainConfig) -> Self {
        Self {
            path: config.path.clone(),
            env: config.env.clone(),
            inherited: std::env::var_os("PATH"),
        }
    }

    /// Toolchain that only sees `path`
    pub fn isolated(path: Vec<PathBuf>) -> Self {
        Self {
            path,
            env: BTreeMap::new(),
            inherited: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Directories searched for programs, in order
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.path.clone();
        if let Some(inherited) = &self.inherited {
            dirs.extend(std::env::split_paths(inherited));
        }
        dirs
    }

    /// PATH value for child processes
    pub fn path_var(&self) -> KilnResult<OsString> {
        std::env::join_paths(self.search_dirs())
            .map_err(|e| KilnError::User(format!("invalid toolchain path: {}", e)))
    }

    /// Locate an executable on the toolchain PATH
    pub fn which(&self, program: &str) -> Option<PathBuf> {
        if program.contains('/') {
            let path = PathBuf::from(program);
            return is_executable(&path).then_some(path);
        }
        self.search_dirs()
            .into_iter()
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }

    /// Fail with the first tool that cannot be found
    pub fn check_tools(&self, tools: &[String]) -> KilnResult<()> {
        for tool in tools {
            if self.which(tool).is_none() {
                return Err(KilnError::ToolNotFound(tool.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_tool(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn finds_tools_on_configured_path() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(dir.path(), "cargo");
        let toolchain = Toolchain::isolated(vec![dir.path().to_path_buf()]);

        assert_eq!(toolchain.which("cargo"), Some(tool));
        assert!(toolchain.check_tools(&["cargo".to_string()]).is_ok());
    }

    #[test]
    fn missing_tool_is_reported() {
        let dir = TempDir::new().unwrap();
        let toolchain = Toolchain::isolated(vec![dir.path().to_path_buf()]);

        let err = toolchain.check_tools(&["rustc".to_string()]).unwrap_err();
        assert!(matches!(err, KilnError::ToolNotFound(ref t) if t == "rustc"));
        assert_eq!(err.exit_code(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cargo"), "not a program").unwrap();
        let toolchain = Toolchain::isolated(vec![dir.path().to_path_buf()]);
        assert!(toolchain.which("cargo").is_none());
    }

    #[test]
    fn configured_dirs_come_first() {
        let config = ToolchainConfig {
            path: vec![PathBuf::from("/opt/rust/bin")],
            env: BTreeMap::from([("CARGO_HOME".to_string(), "/opt/rust".to_string())]),
        };
        let toolchain = Toolchain::from_config(&config);

        assert_eq!(toolchain.search_dirs()[0], PathBuf::from("/opt/rust/bin"));
        assert_eq!(toolchain.env()["CARGO_HOME"], "/opt/rust");
    }
}
