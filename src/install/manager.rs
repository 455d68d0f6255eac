//! Install orchestration
//!
//! Drives each recipe through fetch, verify, dependency check, build, test
//! and commit. Recipes in the same resolver level run concurrently, bounded
//! by the job count; a level starts only after the previous one committed.

use crate::audit::AuditLog;
use crate::build::{unpack_source, BuildRunner, BuildSink, NullSink};
use crate::cache::{digest, CacheStore, Fetcher, RetryPolicy, SchemeTransport};
use crate::config::{Config, Layout};
use crate::error::{KilnError, KilnResult};
use crate::install::registry::Registry;
use crate::install::state::{InstallOutcome, InstallState, InstalledPackage, Transition};
use crate::recipe::{Recipe, RecipeBook};
use crate::resolver;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notified on every state transition
pub trait InstallObserver: Send + Sync {
    fn on_transition(&self, transition: &Transition);
}

/// Result for one recipe of an install call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOutcome {
    pub name: String,
    pub version: String,
    pub outcome: InstallOutcome,
    /// Test commands that failed under the `warn` policy
    pub test_warnings: Vec<String>,
}

/// Everything an install call did, in commit order
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub packages: Vec<PackageOutcome>,
}

impl InstallReport {
    pub fn get(&self, name: &str) -> Option<&PackageOutcome> {
        self.packages.iter().find(|p| p.name == name)
    }
}

/// Work and staging directories for one pipeline run, removed on drop
struct Scratch {
    work: PathBuf,
    staging: PathBuf,
}

impl Scratch {
    fn new(layout: &Layout, name: &str) -> Self {
        let id = Uuid::new_v4();
        Self {
            work: layout.build_dir().join(format!("{}-{}", name, id)),
            staging: layout.staging_dir().join(format!("{}-{}", name, id)),
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for dir in [&self.work, &self.staging] {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                }
            }
        }
    }
}

/// Orchestrates installs and uninstalls against one layout
pub struct InstallManager {
    layout: Layout,
    book: RecipeBook,
    fetcher: Arc<Fetcher>,
    runner: BuildRunner,
    registry: Arc<Registry>,
    audit: Arc<AuditLog>,
    jobs: usize,
    rollback_on_failure: bool,
    observers: Vec<Arc<dyn InstallObserver>>,
    sink: Arc<dyn BuildSink>,
    states: Mutex<HashMap<String, InstallState>>,
    history: Mutex<Vec<Transition>>,
}

impl InstallManager {
    pub fn new(
        layout: Layout,
        book: RecipeBook,
        fetcher: Arc<Fetcher>,
        runner: BuildRunner,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            layout,
            book,
            fetcher,
            runner,
            registry,
            audit: Arc::new(AuditLog::disabled()),
            jobs: 1,
            rollback_on_failure: false,
            observers: Vec::new(),
            sink: Arc::new(NullSink),
            states: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Wire up cache, transports, registry and audit log from config
    pub async fn from_config(config: &Config, layout: Layout, book: RecipeBook) -> KilnResult<Self> {
        layout.ensure_dirs().await?;

        let store = Arc::new(
            CacheStore::open(
                layout.cache_dir(),
                crate::cache::mb_to_bytes(config.cache.max_total_mb),
            )
            .await?,
        );
        let fetcher = Arc::new(Fetcher::new(
            store,
            Arc::new(SchemeTransport::new(&config.fetch)),
            RetryPolicy::from(&config.fetch),
        ));
        let registry = Arc::new(Registry::open(layout.registry_path()).await?);
        let audit = Arc::new(AuditLog::new(config, &layout));

        Ok(Self::new(layout, book, fetcher, BuildRunner::from_config(config), registry)
            .with_audit(audit)
            .with_jobs(config.build.jobs)
            .with_rollback(config.install.rollback_on_failure))
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_rollback(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = rollback;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn InstallObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_build_sink(mut self, sink: Arc<dyn BuildSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        self.fetcher.store()
    }

    /// Last state reached by `name` in this manager
    pub fn state(&self, name: &str) -> Option<InstallState> {
        lock(&self.states).get(name).copied()
    }

    /// Transitions recorded for `name`, oldest first
    pub fn history(&self, name: &str) -> Vec<Transition> {
        lock(&self.history)
            .iter()
            .filter(|t| t.recipe == name)
            .cloned()
            .collect()
    }

    /// Install one recipe and its missing dependencies
    pub async fn install(&self, name: &str, cancel: &CancellationToken) -> KilnResult<InstallReport> {
        self.install_many(&[name.to_string()], cancel).await
    }

    /// Install several recipes and their missing dependencies
    pub async fn install_many(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> KilnResult<InstallReport> {
        let available = self.book.load_closure(names).await?;
        let order = match resolver::resolve_many(names, &available) {
            Ok(order) => order,
            Err(e) => {
                for name in names {
                    self.audit_failure(name, None, &e).await;
                }
                return Err(e);
            }
        };
        let waves = resolver::levels(&order, &available)?;
        debug!("Install plan: {:?}", waves);

        let mut report = InstallReport::default();
        for wave in &waves {
            if cancel.is_cancelled() {
                return self.abort(report, &order, KilnError::Cancelled).await;
            }

            let available = &available;
            let results: Vec<(String, KilnResult<PackageOutcome>)> = stream::iter(wave.iter())
                .map(|name| async move {
                    let result = match available.get(name) {
                        Some(recipe) => self.install_one(recipe.clone(), cancel).await,
                        None => Err(KilnError::RecipeNotFound(name.clone())),
                    };
                    (name.clone(), result)
                })
                .buffer_unordered(self.jobs)
                .collect()
                .await;

            let mut by_name: HashMap<String, KilnResult<PackageOutcome>> =
                results.into_iter().collect();
            let mut failure = None;
            for name in wave {
                match by_name.remove(name) {
                    Some(Ok(outcome)) => report.packages.push(outcome),
                    Some(Err(e)) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                    None => {}
                }
            }

            if let Some(e) = failure {
                return self.abort(report, &order, e).await;
            }
        }

        self.trim_cache().await;
        Ok(report)
    }

    /// Remove `name`; returns false when it was not installed.
    ///
    /// Refuses while installed packages depend on it, unless `force`.
    pub async fn uninstall(&self, name: &str, force: bool) -> KilnResult<bool> {
        let _guard = self.registry.lock(name).await;

        let Some(package) = self.registry.get(name).await else {
            debug!("{} is not installed", name);
            return Ok(false);
        };

        let dependents = self.registry.dependents(name).await;
        if !dependents.is_empty() {
            if !force {
                return Err(KilnError::DependentsInstalled {
                    name: name.to_string(),
                    dependents,
                });
            }
            warn!("Forcing uninstall of {} (required by {})", name, dependents.join(", "));
        }

        remove_install_dir(&package.path).await?;
        self.registry.remove(name).await?;
        self.force_state(name, package.state);
        self.transition(name, InstallState::RolledBack)?;

        info!("Uninstalled {} {}", name, package.version);
        self.audit
            .log(
                "uninstall.completed",
                &serde_json::json!({
                    "name": name,
                    "version": package.version,
                    "path": package.path,
                    "forced": force && !dependents.is_empty(),
                }),
            )
            .await;
        Ok(true)
    }

    /// Roll back fresh installs from a failed call, then return the error
    async fn abort(
        &self,
        report: InstallReport,
        plan: &[String],
        error: KilnError,
    ) -> KilnResult<InstallReport> {
        self.trim_cache().await;
        if !self.rollback_on_failure {
            return Err(error);
        }

        for package in report.packages.iter().rev() {
            if package.outcome != InstallOutcome::Installed {
                continue;
            }
            info!("Rolling back {}", package.name);
            if let Err(e) = self.uninstall(&package.name, true).await {
                warn!("Rollback of {} failed: {}", package.name, e);
            }
        }

        let failed: Vec<&String> = {
            let states = lock(&self.states);
            plan.iter()
                .filter(|name| states.get(name.as_str()) == Some(&InstallState::Failed))
                .collect()
        };
        for name in failed {
            if let Err(e) = self.transition(name, InstallState::RolledBack) {
                warn!("Could not mark {} rolled back: {}", name, e);
            }
        }

        Err(error)
    }

    /// Shrink the cache back to its cap once no source is pinned by this call
    async fn trim_cache(&self) {
        let store = self.cache();
        if store.max_bytes() == 0 {
            return;
        }
        match store.evict_to(store.max_bytes()).await {
            Ok(evicted) if !evicted.is_empty() => {
                debug!("Trimmed {} cached sources after install", evicted.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to trim cache: {}", e),
        }
    }

    async fn install_one(
        &self,
        recipe: Arc<Recipe>,
        cancel: &CancellationToken,
    ) -> KilnResult<PackageOutcome> {
        let _guard = self.registry.lock(&recipe.name).await;
        let fingerprint = recipe.fingerprint()?;

        let previous = self.registry.get(&recipe.name).await;
        if let Some(existing) = &previous {
            if existing.fingerprint == fingerprint
                && existing.state == InstallState::Installed
                && existing.path.exists()
            {
                debug!("{} {} is up to date", recipe.name, recipe.version);
                return Ok(PackageOutcome {
                    name: recipe.name.clone(),
                    version: existing.version.clone(),
                    outcome: InstallOutcome::AlreadyInstalled,
                    test_warnings: Vec::new(),
                });
            }
        }

        self.force_state(&recipe.name, InstallState::Pending);
        let scratch = Scratch::new(&self.layout, &recipe.name);

        match self
            .run_pipeline(&recipe, &fingerprint, previous.as_ref(), &scratch, cancel)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(source) => {
                let stage = self.state(&recipe.name).unwrap_or(InstallState::Pending);
                let _ = self.transition(&recipe.name, InstallState::Failed);
                self.audit_failure(&recipe.name, Some(stage), &source).await;
                warn!("Installing {} failed during {}: {}", recipe.name, stage, source);
                Err(KilnError::Install {
                    recipe: recipe.name.clone(),
                    stage,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn run_pipeline(
        &self,
        recipe: &Recipe,
        fingerprint: &str,
        previous: Option<&InstalledPackage>,
        scratch: &Scratch,
        cancel: &CancellationToken,
    ) -> KilnResult<PackageOutcome> {
        let name = recipe.name.as_str();

        // Held until the source is unpacked so concurrent inserts cannot evict it
        let pin = self.cache().pin(&recipe.digest);
        self.transition(name, InstallState::Fetching)?;
        let entry = self.fetcher.fetch(&recipe.url, &recipe.digest, cancel).await?;

        self.transition(name, InstallState::Verifying)?;
        if !digest::verify_file(&entry.path, &recipe.digest).await? {
            let actual = digest::compute_file(&entry.path, recipe.digest.algorithm()).await?;
            warn!("Cached source for {} was modified, evicting it", name);
            self.cache().remove(&recipe.digest).await?;
            return Err(KilnError::Integrity {
                subject: entry.path.display().to_string(),
                expected: recipe.digest.to_string(),
                actual: actual.to_string(),
            });
        }

        self.transition(name, InstallState::ResolvingDeps)?;
        for dep in &recipe.dependencies {
            if !self.registry.is_installed(dep).await {
                return Err(KilnError::UnresolvedDependency {
                    dependency: dep.clone(),
                    required_by: name.to_string(),
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }
        self.transition(name, InstallState::Building)?;
        unpack_source(entry.path.clone(), entry.file_name.clone(), scratch.work.clone()).await?;
        drop(pin);
        let build = self
            .runner
            .build(recipe, &scratch.work, &scratch.staging, cancel, self.sink.as_ref())
            .await?;
        debug!("Built {} in {:.1}s", name, build.duration.as_secs_f64());

        self.transition(name, InstallState::Testing)?;
        let tests = self
            .runner
            .test(recipe, &scratch.work, &scratch.staging, cancel, self.sink.as_ref())
            .await?;
        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }

        let dest = self
            .layout
            .install_root
            .join(&recipe.name)
            .join(&recipe.version);
        promote(&scratch.staging, &dest).await?;

        let package = InstalledPackage {
            name: recipe.name.clone(),
            version: recipe.version.clone(),
            path: dest.clone(),
            digest: recipe.digest.clone(),
            installed_at: Utc::now(),
            state: InstallState::Installed,
            fingerprint: fingerprint.to_string(),
            dependencies: recipe.dependencies.clone(),
        };
        if let Err(e) = self.registry.put(package).await {
            if previous.map(|p| p.path != dest).unwrap_or(true) {
                let _ = remove_install_dir(&dest).await;
            }
            return Err(e);
        }
        self.transition(name, InstallState::Installed)?;

        if let Some(old) = previous {
            if old.path != dest {
                if let Err(e) = remove_install_dir(&old.path).await {
                    warn!("Failed to remove previous install {}: {}", old.path.display(), e);
                }
            }
        }

        let outcome = if previous.is_some_and(|p| p.fingerprint != fingerprint) {
            InstallOutcome::Upgraded
        } else {
            InstallOutcome::Installed
        };
        info!("Installed {} {} ({})", name, recipe.version, outcome);
        self.audit
            .log(
                "install.completed",
                &serde_json::json!({
                    "name": name,
                    "version": recipe.version,
                    "digest": recipe.digest.to_string(),
                    "path": dest,
                    "outcome": outcome.to_string(),
                    "test_warnings": tests.failures,
                }),
            )
            .await;

        Ok(PackageOutcome {
            name: recipe.name.clone(),
            version: recipe.version.clone(),
            outcome,
            test_warnings: tests.failures,
        })
    }

    /// Move `name` to `next`, rejecting illegal transitions
    fn transition(&self, name: &str, next: InstallState) -> KilnResult<()> {
        let from = {
            let mut states = lock(&self.states);
            let from = states.get(name).copied().unwrap_or(InstallState::Pending);
            if !from.can_transition_to(next) {
                return Err(KilnError::Internal(format!(
                    "illegal transition for {}: {} -> {}",
                    name, from, next
                )));
            }
            states.insert(name.to_string(), next);
            from
        };

        let transition = Transition {
            recipe: name.to_string(),
            from,
            to: next,
            at: Utc::now(),
        };
        debug!("{}: {} -> {}", name, from, next);
        for observer in &self.observers {
            observer.on_transition(&transition);
        }
        lock(&self.history).push(transition);
        Ok(())
    }

    /// Set a starting state without recording a transition
    fn force_state(&self, name: &str, state: InstallState) {
        lock(&self.states).insert(name.to_string(), state);
    }

    async fn audit_failure(&self, name: &str, stage: Option<InstallState>, error: &KilnError) {
        self.audit
            .log(
                "install.failed",
                &serde_json::json!({
                    "name": name,
                    "stage": stage.map(|s| s.to_string()),
                    "kind": error.kind(),
                    "error": error.to_string(),
                }),
            )
            .await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Move a staged prefix to `dest`, replacing any existing directory.
///
/// The new tree is first placed next to `dest` (copying when a rename
/// crosses filesystems), so the final swap is a rename within one directory.
async fn promote(staging: &Path, dest: &Path) -> KilnResult<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| KilnError::Internal(format!("no parent for {}", dest.display())))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;

    let id = Uuid::new_v4();
    let incoming = parent.join(format!(".incoming-{}", id));
    if tokio::fs::rename(staging, &incoming).await.is_err() {
        let (from, to) = (staging.to_path_buf(), incoming.clone());
        let copied = tokio::task::spawn_blocking(move || copy_dir(&from, &to))
            .await
            .map_err(|e| KilnError::Internal(format!("copy task failed: {}", e)))?;
        if let Err(e) = copied {
            let _ = tokio::fs::remove_dir_all(&incoming).await;
            return Err(e);
        }
    }

    let old = parent.join(format!(".old-{}", id));
    let replacing = dest.exists();
    if replacing {
        tokio::fs::rename(dest, &old)
            .await
            .map_err(|e| KilnError::io(format!("moving aside {}", dest.display()), e))?;
    }

    if let Err(e) = tokio::fs::rename(&incoming, dest).await {
        if replacing {
            let _ = tokio::fs::rename(&old, dest).await;
        }
        let _ = tokio::fs::remove_dir_all(&incoming).await;
        return Err(KilnError::io(format!("installing into {}", dest.display()), e));
    }

    if replacing {
        if let Err(e) = tokio::fs::remove_dir_all(&old).await {
            warn!("Failed to remove replaced install {}: {}", old.display(), e);
        }
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> KilnResult<()> {
    std::fs::create_dir_all(to).map_err(|e| KilnError::io(format!("creating {}", to.display()), e))?;
    let entries =
        std::fs::read_dir(from).map_err(|e| KilnError::io(format!("reading {}", from.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| KilnError::io(format!("reading {}", from.display()), e))?;
        let target = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| KilnError::io(format!("inspecting {}", entry.path().display()), e))?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| KilnError::io(format!("copying to {}", target.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> KilnResult<()> {
    let link = std::fs::read_link(from)
        .map_err(|e| KilnError::io(format!("reading link {}", from.display()), e))?;
    std::os::unix::fs::symlink(link, to)
        .map_err(|e| KilnError::io(format!("creating link {}", to.display()), e))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> KilnResult<()> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|e| KilnError::io(format!("copying to {}", to.display()), e))
}

/// Remove an install directory and its `<name>` parent once empty
async fn remove_install_dir(path: &Path) -> KilnResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(KilnError::io(format!("removing {}", path.display()), e)),
    }
    if let Some(parent) = path.parent() {
        // Fails harmlessly while other versions remain
        let _ = tokio::fs::remove_dir(parent).await;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::build::Toolchain;
    use crate::cache::{Algorithm, Digest};
    use crate::config::{FetchConfig, TestPolicy};
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestEnv {
        tmp: TempDir,
    }

    impl TestEnv {
        fn new() -> Self {
            let env = Self {
                tmp: TempDir::new().unwrap(),
            };
            std::fs::create_dir_all(env.recipes()).unwrap();
            std::fs::create_dir_all(env.sources()).unwrap();
            env
        }

        fn home(&self) -> PathBuf {
            self.tmp.path().join("home")
        }

        fn recipes(&self) -> PathBuf {
            self.tmp.path().join("recipes")
        }

        fn sources(&self) -> PathBuf {
            self.tmp.path().join("sources")
        }

        fn layout(&self) -> Layout {
            Layout::under(self.home())
        }

        /// Log appended to by every build command, one line per build
        fn build_log(&self) -> PathBuf {
            self.tmp.path().join("builds.log")
        }

        fn builds(&self) -> usize {
            std::fs::read_to_string(self.build_log())
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        /// Write a source file and a recipe that installs it as `{bin}/<name>`
        fn recipe(&self, name: &str, version: &str, deps: &[&str]) -> Recipe {
            let content = format!("#!/bin/sh\necho {} {}\n", name, version);
            let source = self.sources().join(format!("{}.sh", name));
            std::fs::write(&source, &content).unwrap();

            Recipe {
                name: name.to_string(),
                description: format!("{} for tests", name),
                homepage: None,
                url: format!("file://{}", source.display()),
                head: None,
                digest: Digest::of_bytes(Algorithm::Sha256, content.as_bytes()),
                version: version.to_string(),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                tools: vec!["sh".to_string()],
                install: vec![sh(&format!(
                    "echo {{name}} >> {} && mkdir -p {{bin}} && cp {{name}}.sh {{bin}}/{{name}} && chmod +x {{bin}}/{{name}}",
                    self.build_log().display()
                ))],
                test: vec![vec!["{bin}/{name}".to_string()]],
            }
        }

        fn write(&self, recipe: &Recipe) {
            let content = toml::to_string(recipe).unwrap();
            std::fs::write(self.recipes().join(format!("{}.toml", recipe.name)), content).unwrap();
        }

        fn add(&self, name: &str, deps: &[&str]) -> Recipe {
            let recipe = self.recipe(name, "1.0.0", deps);
            self.write(&recipe);
            recipe
        }

        async fn manager(&self) -> InstallManager {
            self.manager_with(TestPolicy::FailClosed).await
        }

        async fn manager_with(&self, policy: TestPolicy) -> InstallManager {
            self.build_manager(policy, 0).await
        }

        async fn build_manager(&self, policy: TestPolicy, cache_bytes: u64) -> InstallManager {
            let layout = self.layout();
            layout.ensure_dirs().await.unwrap();
            let store = Arc::new(CacheStore::open(layout.cache_dir(), cache_bytes).await.unwrap());
            let fetch = FetchConfig::default();
            let fetcher = Arc::new(Fetcher::new(
                store,
                Arc::new(SchemeTransport::new(&fetch)),
                RetryPolicy::from(&fetch),
            ));
            let runner = BuildRunner::new(Toolchain::isolated(vec![
                PathBuf::from("/bin"),
                PathBuf::from("/usr/bin"),
            ]))
            .with_test_policy(policy);
            let registry = Arc::new(Registry::open(layout.registry_path()).await.unwrap());
            let audit = Arc::new(AuditLog::at(layout.audit_log_path(), true));

            InstallManager::new(
                layout,
                RecipeBook::without_builtins(vec![self.recipes()]),
                fetcher,
                runner,
                registry,
            )
            .with_audit(audit)
            .with_jobs(2)
        }

        fn is_empty(dir: &Path) -> bool {
            std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<(String, InstallState)>>,
    }

    impl InstallObserver for RecordingObserver {
        fn on_transition(&self, transition: &Transition) {
            lock(&self.seen).push((transition.recipe.clone(), transition.to));
        }
    }

    #[tokio::test]
    async fn installs_dependencies_first() {
        let env = TestEnv::new();
        env.add("base", &[]);
        env.add("app", &["base"]);
        let manager = env.manager().await;

        let report = manager.install("app", &CancellationToken::new()).await.unwrap();

        let names: Vec<&str> = report.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["base", "app"]);
        assert!(report.packages.iter().all(|p| p.outcome == InstallOutcome::Installed));

        let base = manager.registry().get("base").await.unwrap();
        let app = manager.registry().get("app").await.unwrap();
        assert!(base.installed_at <= app.installed_at);
        assert_eq!(app.dependencies, vec!["base"]);
        assert_eq!(app.path, env.layout().install_root.join("app").join("1.0.0"));
        assert!(app.path.join("bin/app").is_file());

        let states: Vec<InstallState> = manager.history("app").iter().map(|t| t.to).collect();
        assert_eq!(states, InstallState::PIPELINE[1..].to_vec());

        let audit = std::fs::read_to_string(env.layout().audit_log_path()).unwrap();
        assert_eq!(audit.matches("install.completed").count(), 2);
    }

    #[tokio::test]
    async fn unchanged_recipe_is_a_noop() {
        let env = TestEnv::new();
        env.add("tool", &[]);
        let manager = env.manager().await;
        let cancel = CancellationToken::new();

        manager.install("tool", &cancel).await.unwrap();
        let report = manager.install("tool", &cancel).await.unwrap();

        assert_eq!(report.get("tool").unwrap().outcome, InstallOutcome::AlreadyInstalled);
        assert_eq!(env.builds(), 1);
    }

    #[tokio::test]
    async fn changed_recipe_replaces_previous_install() {
        let env = TestEnv::new();
        env.add("tool", &[]);
        let manager = env.manager().await;
        let cancel = CancellationToken::new();
        manager.install("tool", &cancel).await.unwrap();

        let upgraded = env.recipe("tool", "1.1.0", &[]);
        env.write(&upgraded);
        let report = manager.install("tool", &cancel).await.unwrap();

        assert_eq!(report.get("tool").unwrap().outcome, InstallOutcome::Upgraded);
        let root = env.layout().install_root.join("tool");
        assert!(root.join("1.1.0/bin/tool").is_file());
        assert!(!root.join("1.0.0").exists());
        assert_eq!(manager.registry().get("tool").await.unwrap().version, "1.1.0");
    }

    #[tokio::test]
    async fn build_failure_leaves_no_files() {
        let env = TestEnv::new();
        let mut recipe = env.recipe("broken", "1.0.0", &[]);
        recipe.install = vec![
            sh("mkdir -p {bin} && touch {bin}/partial"),
            sh("echo linker exploded >&2; exit 1"),
        ];
        env.write(&recipe);
        let manager = env.manager().await;

        let err = manager
            .install("broken", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "BuildError");
        assert_eq!(err.exit_code(), 3);
        assert!(matches!(err, KilnError::Install { stage: InstallState::Building, .. }));
        assert!(err.to_string().contains("linker exploded"));
        assert_eq!(manager.state("broken"), Some(InstallState::Failed));

        let layout = env.layout();
        assert!(!layout.install_root.join("broken").exists());
        assert!(TestEnv::is_empty(&layout.build_dir()));
        assert!(TestEnv::is_empty(&layout.staging_dir()));
        assert!(manager.registry().list().await.is_empty());

        let audit = std::fs::read_to_string(layout.audit_log_path()).unwrap();
        assert!(audit.contains("install.failed"));
    }

    #[tokio::test]
    async fn digest_mismatch_caches_nothing() {
        let env = TestEnv::new();
        let mut recipe = env.recipe("evil", "1.0.0", &[]);
        recipe.digest = Digest::of_bytes(Algorithm::Sha256, b"something else");
        env.write(&recipe);
        let manager = env.manager().await;

        let err = manager
            .install("evil", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "IntegrityError");
        assert_eq!(err.exit_code(), 1);
        assert!(manager.cache().entries().await.is_empty());
        assert!(manager.registry().list().await.is_empty());
        assert_eq!(env.builds(), 0);
    }

    #[tokio::test]
    async fn tampered_cache_entry_is_rejected() {
        let env = TestEnv::new();
        let recipe = env.add("tool", &[]);
        let manager = env.manager().await;
        let cancel = CancellationToken::new();

        manager.install("tool", &cancel).await.unwrap();
        manager.uninstall("tool", false).await.unwrap();

        let entry = manager.cache().get(&recipe.digest).await.unwrap().unwrap();
        std::fs::write(&entry.path, "tampered").unwrap();

        let err = manager.install("tool", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");
        assert!(matches!(err, KilnError::Install { stage: InstallState::Verifying, .. }));
        assert!(!manager.cache().contains(&recipe.digest).await);
        assert!(!manager.registry().is_installed("tool").await);
    }

    #[tokio::test]
    async fn failing_test_fails_closed() {
        let env = TestEnv::new();
        let mut recipe = env.recipe("flaky", "1.0.0", &[]);
        recipe.test = vec![sh("echo self-check failed; exit 1")];
        env.write(&recipe);
        let manager = env.manager().await;

        let err = manager
            .install("flaky", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "TestFailure");
        assert_eq!(err.exit_code(), 4);
        assert!(!env.layout().install_root.join("flaky").exists());
        assert!(manager.registry().get("flaky").await.is_none());
    }

    #[tokio::test]
    async fn warn_policy_keeps_install() {
        let env = TestEnv::new();
        let mut recipe = env.recipe("flaky", "1.0.0", &[]);
        recipe.test = vec![sh("exit 1")];
        env.write(&recipe);
        let manager = env.manager_with(TestPolicy::Warn).await;

        let report = manager.install("flaky", &CancellationToken::new()).await.unwrap();

        assert_eq!(report.get("flaky").unwrap().test_warnings.len(), 1);
        assert!(manager.registry().is_installed("flaky").await);
    }

    #[tokio::test]
    async fn missing_test_binary_follows_policy() {
        let env = TestEnv::new();
        let mut recipe = env.recipe("nobin", "1.0.0", &[]);
        recipe.install = vec![sh("mkdir -p {prefix}")];
        recipe.test = vec![vec!["{bin}/nobin".to_string(), "-V".to_string()]];
        env.write(&recipe);
        let cancel = CancellationToken::new();

        let manager = env.manager().await;
        let err = manager.install("nobin", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "TestFailure");
        assert_eq!(err.exit_code(), 4);
        assert!(matches!(err, KilnError::Install { stage: InstallState::Testing, .. }));
        assert!(!env.layout().install_root.join("nobin").exists());

        let manager = env.manager_with(TestPolicy::Warn).await;
        let report = manager.install("nobin", &cancel).await.unwrap();
        assert_eq!(report.get("nobin").unwrap().test_warnings.len(), 1);
        assert!(manager.registry().is_installed("nobin").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn siblings_survive_a_tiny_cache() {
        let env = TestEnv::new();
        let names: Vec<String> = (0..6).map(|i| format!("sib{}", i)).collect();
        for name in &names {
            env.add(name, &[]);
        }
        let manager = env.build_manager(TestPolicy::FailClosed, 1).await.with_jobs(6);

        let report = manager
            .install_many(&names, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.packages.len(), 6);
        for name in &names {
            assert!(manager.registry().is_installed(name).await);
        }
        // Trimmed back under the cap once nothing is pinned
        assert_eq!(manager.cache().entries().await.len(), 0);
    }

    #[tokio::test]
    async fn rollback_only_touches_the_failing_call() {
        let env = TestEnv::new();
        let mut old = env.recipe("old", "1.0.0", &[]);
        old.install = vec![sh("exit 1")];
        env.write(&old);
        let mut app = env.recipe("app", "1.0.0", &[]);
        app.install = vec![sh("exit 1")];
        env.write(&app);
        let mut manager = env.manager().await;
        let cancel = CancellationToken::new();

        manager.install("old", &cancel).await.unwrap_err();
        assert_eq!(manager.state("old"), Some(InstallState::Failed));

        manager.rollback_on_failure = true;
        manager.install("app", &cancel).await.unwrap_err();

        assert_eq!(manager.state("app"), Some(InstallState::RolledBack));
        assert_eq!(manager.state("old"), Some(InstallState::Failed));
    }

    #[tokio::test]
    async fn rollback_removes_fresh_dependencies() {
        let env = TestEnv::new();
        env.add("base", &[]);
        let mut app = env.recipe("app", "1.0.0", &["base"]);
        app.install = vec![sh("exit 1")];
        env.write(&app);
        let manager = env.manager().await.with_rollback(true);

        let err = manager.install("app", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), "BuildError");
        assert!(manager.registry().list().await.is_empty());
        assert!(!env.layout().install_root.join("base").exists());
        assert_eq!(manager.state("base"), Some(InstallState::RolledBack));
        assert_eq!(manager.state("app"), Some(InstallState::RolledBack));
    }

    #[tokio::test]
    async fn without_rollback_dependencies_stay() {
        let env = TestEnv::new();
        env.add("base", &[]);
        let mut app = env.recipe("app", "1.0.0", &["base"]);
        app.install = vec![sh("exit 1")];
        env.write(&app);
        let manager = env.manager().await;

        manager.install("app", &CancellationToken::new()).await.unwrap_err();

        assert!(manager.registry().is_installed("base").await);
        assert!(!manager.registry().is_installed("app").await);
    }

    #[tokio::test]
    async fn uninstall_respects_dependents() {
        let env = TestEnv::new();
        env.add("base", &[]);
        env.add("app", &["base"]);
        let manager = env.manager().await;
        manager.install("app", &CancellationToken::new()).await.unwrap();

        let err = manager.uninstall("base", false).await.unwrap_err();
        assert!(matches!(err, KilnError::DependentsInstalled { .. }));
        assert_eq!(err.exit_code(), 2);

        assert!(manager.uninstall("app", false).await.unwrap());
        assert!(manager.uninstall("base", false).await.unwrap());
        assert!(!manager.uninstall("base", false).await.unwrap());
        assert!(!env.layout().install_root.join("base").exists());
        assert_eq!(manager.state("base"), Some(InstallState::RolledBack));
    }

    #[tokio::test]
    async fn forced_uninstall_ignores_dependents() {
        let env = TestEnv::new();
        env.add("base", &[]);
        env.add("app", &["base"]);
        let manager = env.manager().await;
        manager.install("app", &CancellationToken::new()).await.unwrap();

        assert!(manager.uninstall("base", true).await.unwrap());
        assert!(manager.registry().get("base").await.is_none());
        assert!(manager.registry().get("app").await.is_some());
    }

    #[tokio::test]
    async fn cancellation_stops_build() {
        let env = TestEnv::new();
        let mut recipe = env.recipe("slow", "1.0.0", &[]);
        recipe.install = vec![sh("sleep 30")];
        env.write(&recipe);
        let manager = env.manager().await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(10), manager.install("slow", &cancel))
            .await
            .expect("install did not stop after cancellation")
            .unwrap_err();

        assert_eq!(err.kind(), "Cancelled");
        assert_eq!(err.exit_code(), 130);
        assert_eq!(manager.state("slow"), Some(InstallState::Failed));
        assert!(TestEnv::is_empty(&env.layout().staging_dir()));
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_fetching() {
        let env = TestEnv::new();
        env.add("a", &["b"]);
        env.add("b", &["a"]);
        let manager = env.manager().await;

        let err = manager.install("a", &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), "DependencyCycleError");
        assert_eq!(err.exit_code(), 2);
        assert!(manager.cache().entries().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_dependency_is_unresolved() {
        let env = TestEnv::new();
        env.add("app", &["ghost"]);
        let manager = env.manager().await;

        let err = manager.install("app", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "UnresolvedDependencyError");
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn observers_see_every_transition() {
        let env = TestEnv::new();
        env.add("left", &[]);
        env.add("right", &[]);
        env.add("top", &["left", "right"]);
        let observer = Arc::new(RecordingObserver::default());
        let manager = env.manager().await.with_observer(observer.clone());

        manager.install("top", &CancellationToken::new()).await.unwrap();

        let seen = lock(&observer.seen).clone();
        assert_eq!(seen.len(), 18);
        let top_building = seen
            .iter()
            .position(|(n, s)| n == "top" && *s == InstallState::Building)
            .unwrap();
        for dep in ["left", "right"] {
            let installed = seen
                .iter()
                .position(|(n, s)| n == dep && *s == InstallState::Installed)
                .unwrap();
            assert!(installed < top_building);
        }
    }
}
