//! Integration tests for the kiln binary

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn kiln(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.env("KILN_HOME", dir.path().join("home"))
            .env("KILN_CONFIG", dir.path().join("config.toml"))
            .env("KILN_RECIPES", dir.path().join("recipes"))
            .env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Install recipes"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn list_empty() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No packages installed"));

        kiln(&dir)
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::diff("[]\n"));
    }

    #[test]
    fn uninstall_absent_succeeds() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["uninstall", "nothing"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not installed"));
    }

    #[test]
    fn unknown_recipe_is_a_dependency_error() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["install", "no-such-recipe"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error[RecipeNotFound]"));
    }

    #[test]
    fn info_shows_builtin_recipe() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["info", "loop", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("loop 0.3.3 (not installed)"));

        kiln(&dir)
            .args(["info", "loop"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not installable"));
    }

    #[test]
    fn config_path_follows_env() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_set_then_show() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["config", "set", "build.jobs", "2"])
            .assert()
            .success();

        kiln(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("jobs = 2"));
    }

    #[test]
    fn config_set_unknown_key_fails() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["config", "set", "vm.name", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[build]\njobs = \"many\"\n").unwrap();
        kiln(&dir)
            .arg("list")
            .assert()
            .code(5)
            .stderr(predicate::str::contains("error[ConfigInvalid]"));
    }

    #[test]
    fn cache_list_empty() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached sources"));
    }
}

#[cfg(unix)]
mod install_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use sha2::{Digest, Sha256};
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Temporary home, recipe directory and plain-file sources
    struct Sandbox {
        dir: TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            for sub in ["home", "recipes", "sources"] {
                std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            }
            Self { dir }
        }

        fn kiln(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("kiln");
            cmd.env("KILN_HOME", self.home())
                .env("KILN_CONFIG", self.dir.path().join("config.toml"))
                .env("KILN_RECIPES", self.dir.path().join("recipes"))
                .env_remove("RUST_LOG");
            cmd
        }

        fn home(&self) -> PathBuf {
            self.dir.path().join("home")
        }

        fn build_log(&self) -> String {
            std::fs::read_to_string(self.dir.path().join("builds.log")).unwrap_or_default()
        }

        /// Write a source file; returns its file:// url and sha256 digest
        fn source(&self, name: &str, content: &str) -> (String, String) {
            let path = self.dir.path().join("sources").join(format!("{}.sh", name));
            std::fs::write(&path, content).unwrap();
            let digest = hex::encode(Sha256::digest(content.as_bytes()));
            (format!("file://{}", path.display()), format!("sha256:{}", digest))
        }

        /// Recipe whose install copies its source into `{bin}` and logs the build
        fn recipe(&self, name: &str, deps: &[&str], digest: Option<&str>, install: Option<&str>, test: &str) {
            let (url, real_digest) = self.source(name, &format!("echo {}\n", name));
            let log = self.dir.path().join("builds.log");
            let install = install.map(str::to_string).unwrap_or_else(|| {
                format!(
                    "mkdir -p {{bin}} && cp {{source}}/{name}.sh {{bin}}/{name} && echo {name} >> {log}",
                    name = name,
                    log = log.display()
                )
            });
            let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();

            let recipe = format!(
                r#"name = "{name}"
url = "{url}"
digest = "{digest}"
version = "1.0.0"
dependencies = [{deps}]
tools = ["sh"]
install = [["sh", "-c", "{install}"]]
test = [["sh", "-c", "{test}"]]
"#,
                name = name,
                url = url,
                digest = digest.unwrap_or(&real_digest),
                deps = deps.join(", "),
                install = install,
                test = test,
            );
            std::fs::write(
                self.dir.path().join("recipes").join(format!("{}.toml", name)),
                recipe,
            )
            .unwrap();
        }

        fn simple(&self, name: &str, deps: &[&str]) {
            self.recipe(name, deps, None, None, &format!("test -f {{bin}}/{}", name));
        }
    }

    #[test]
    fn install_then_list() {
        let sb = Sandbox::new();
        sb.simple("hello", &[]);

        sb.kiln()
            .args(["install", "hello"])
            .assert()
            .success()
            .stdout(predicate::str::contains("hello 1.0.0 installed"));

        assert!(sb.home().join("opt/hello/1.0.0/bin/hello").is_file());

        sb.kiln()
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::diff("hello 1.0.0\n"));
    }

    #[test]
    fn reinstall_is_a_no_op() {
        let sb = Sandbox::new();
        sb.simple("hello", &[]);

        sb.kiln().args(["install", "hello"]).assert().success();
        sb.kiln()
            .args(["install", "hello"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already installed"));

        assert_eq!(sb.build_log(), "hello\n");
    }

    #[test]
    fn dependencies_install_first() {
        let sb = Sandbox::new();
        sb.simple("base", &[]);
        sb.simple("lib", &["base"]);
        sb.simple("app", &["lib"]);

        sb.kiln().args(["install", "app"]).assert().success();

        assert_eq!(sb.build_log(), "base\nlib\napp\n");
        sb.kiln()
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::diff("app 1.0.0\nbase 1.0.0\nlib 1.0.0\n"));
    }

    #[test]
    fn digest_mismatch_leaves_no_trace() {
        let sb = Sandbox::new();
        let wrong = format!("sha256:{}", "0".repeat(64));
        sb.recipe("bad", &[], Some(wrong.as_str()), None, "true");

        sb.kiln()
            .args(["install", "bad"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("error[IntegrityError]"));

        assert_eq!(sb.build_log(), "");
        sb.kiln()
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
        sb.kiln()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
    }

    #[test]
    fn build_failure_installs_nothing() {
        let sb = Sandbox::new();
        sb.recipe("broken", &[], None, Some("mkdir -p {bin} && touch {bin}/half && exit 7"), "true");

        sb.kiln()
            .args(["install", "broken"])
            .assert()
            .code(3)
            .stderr(predicate::str::contains("error[BuildError]"));

        assert!(!sb.home().join("opt/broken").exists());
    }

    #[test]
    fn test_failure_policy() {
        let sb = Sandbox::new();
        sb.recipe("flaky", &[], None, None, "exit 1");

        sb.kiln()
            .args(["install", "flaky"])
            .assert()
            .code(4)
            .stderr(predicate::str::contains("error[TestFailure]"));
        assert!(!sb.home().join("opt/flaky").exists());

        sb.kiln()
            .args(["install", "flaky", "--test-policy", "warn"])
            .assert()
            .success()
            .stdout(predicate::str::contains("test failed"));
        assert!(sb.home().join("opt/flaky/1.0.0").is_dir());
    }

    #[test]
    fn cycle_is_rejected() {
        let sb = Sandbox::new();
        sb.simple("a", &["b"]);
        sb.simple("b", &["a"]);

        sb.kiln()
            .args(["install", "a"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error[DependencyCycleError]"));
        assert_eq!(sb.build_log(), "");
    }

    #[test]
    fn uninstall_respects_dependents() {
        let sb = Sandbox::new();
        sb.simple("base", &[]);
        sb.simple("app", &["base"]);
        sb.kiln().args(["install", "app"]).assert().success();

        sb.kiln()
            .args(["uninstall", "base"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error[DependentsInstalled]"));
        assert!(sb.home().join("opt/base/1.0.0").is_dir());

        sb.kiln().args(["uninstall", "app"]).assert().success();
        sb.kiln().args(["uninstall", "base"]).assert().success();
        assert!(!sb.home().join("opt/base").exists());
    }

    #[test]
    fn installed_source_is_cached() {
        let sb = Sandbox::new();
        sb.simple("hello", &[]);
        sb.kiln().args(["install", "hello"]).assert().success();

        let (_, digest) = sb.source("hello", "echo hello\n");
        sb.kiln()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::diff(format!("{}\n", digest)));

        sb.kiln().args(["cache", "clear", "--yes"]).assert().success();
        sb.kiln()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
    }
}
