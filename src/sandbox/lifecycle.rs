//! Container lifecycle: inspect, create, start, stop, remove, reconcile.
//!
//! Every state transition for an identity runs under that identity's
//! [`KeyedLocks`] entry. Status is always read from the engine; nothing
//! here remembers what it saw last time.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::cache::CacheVolumeManager;
use super::engine::{ContainerEngine, ContainerStatus, ContainerSummary, ListFilter};
use super::hardening::{CreateSpec, Hardening, Mount, NetworkMode};
use super::home::HomeDirectoryManager;
use super::identity::{ConfigHash, SandboxProfile};
use crate::concurrency::KeyedLocks;
use crate::config::Config;
use crate::error::{ErrorKind, Result};

/// Bumped whenever the container layout changes incompatibly. Containers
/// labelled with an older generation (or none) are removed on reconcile.
pub const GENERATION: u32 = 2;

pub const LABEL_APP: &str = "app";
pub const LABEL_ENV: &str = "env";
pub const LABEL_CONFIG_HASH: &str = "config_hash";
pub const LABEL_GENERATION: &str = "generation";

/// A running workload container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub name: String,
    pub slug: String,
    pub config_hash: ConfigHash,
    /// Key this container's transitions are serialized on
    pub lock_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed_orphans: Vec<String>,
    pub removed_legacy: Vec<String>,
    pub kept: Vec<String>,
}

impl ReconcileReport {
    pub fn removed(&self) -> usize {
        self.removed_orphans.len() + self.removed_legacy.len()
    }
}

pub struct ContainerLifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    locks: KeyedLocks,
    homes: HomeDirectoryManager,
    cache: Arc<CacheVolumeManager>,
    volumes_ready: OnceCell<()>,
    name_prefix: String,
    app_label: String,
    image: String,
    keep_alive: Vec<String>,
    user: String,
    stop_grace: Duration,
    pooling: bool,
    legacy_prefixes: Vec<String>,
}

impl ContainerLifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        homes: HomeDirectoryManager,
        cache: Arc<CacheVolumeManager>,
        config: &Config,
    ) -> Self {
        let c = &config.container;
        Self {
            engine,
            locks: KeyedLocks::new(),
            homes,
            cache,
            volumes_ready: OnceCell::new(),
            name_prefix: c.name_prefix.clone(),
            app_label: c.app_label.clone(),
            image: c.image.clone(),
            keep_alive: c.keep_alive.clone(),
            user: format!("{}:{}", c.runtime_uid, c.runtime_gid),
            stop_grace: Duration::from_secs(c.stop_timeout_secs),
            pooling: c.pooling,
            legacy_prefixes: c.legacy_prefixes.clone(),
        }
    }

    /// The lock table shared with the exec runner.
    pub fn locks(&self) -> KeyedLocks {
        self.locks.clone()
    }

    pub fn homes(&self) -> &HomeDirectoryManager {
        &self.homes
    }

    pub fn container_name(&self, slug: &str) -> String {
        format!("{}-{}", self.name_prefix, slug)
    }

    fn lock_key(&self, slug: &str, hash: &ConfigHash) -> String {
        if self.pooling {
            format!("hash:{}", hash.full())
        } else {
            slug.to_string()
        }
    }

    fn handle(&self, slug: &str, hash: &ConfigHash) -> ContainerHandle {
        ContainerHandle {
            name: self.container_name(slug),
            slug: slug.to_string(),
            config_hash: hash.clone(),
            lock_key: self.lock_key(slug, hash),
        }
    }

    /// Read-only status query; takes no lock.
    pub async fn status(&self, slug: &str) -> Result<ContainerStatus> {
        self.engine.container_status(&self.container_name(slug)).await
    }

    /// Return a running container for the environment, creating or starting
    /// it as needed.
    pub async fn ensure(&self, slug: &str, profile: &SandboxProfile) -> Result<ContainerHandle> {
        profile.limits.validate()?;
        let hash = profile.config_hash()?;
        let handle = self.handle(slug, &hash);
        let _guard = self.locks.lock(&handle.lock_key).await;

        self.volumes_ready
            .get_or_try_init(|| self.cache.ensure_volumes())
            .await?;

        let status = self.engine.container_status(&handle.name).await?;
        debug!("{} is {}", handle.name, status.as_str());

        match status {
            ContainerStatus::Running => {
                self.config_drifted(slug, &handle).await;
                return Ok(handle);
            }
            ContainerStatus::Exited | ContainerStatus::Created => {
                self.config_drifted(slug, &handle).await;
                match self.engine.start_container(&handle.name).await {
                    Ok(()) => {
                        info!("Started existing container {}", handle.name);
                        return Ok(handle);
                    }
                    Err(e) if e.kind() == ErrorKind::ContainerBadState => {
                        warn!("{}; recreating {}", e, handle.name);
                        self.engine.remove_container(&handle.name).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            ContainerStatus::Absent => {}
            other => {
                warn!(
                    "Container {} is {}; removing and recreating",
                    handle.name,
                    other.as_str()
                );
                self.engine.remove_container(&handle.name).await?;
            }
        }

        self.create_and_start(slug, profile, &hash).await?;
        Ok(handle)
    }

    /// Compare the existing container's `config_hash` label with the
    /// profile's. Limits and mounts only change when the container is
    /// recreated, so a mismatch is logged and the container kept.
    async fn config_drifted(&self, slug: &str, handle: &ContainerHandle) -> bool {
        let rows = match self
            .engine
            .list_containers(&ListFilter::Label {
                key: LABEL_ENV.to_string(),
                value: slug.to_string(),
            })
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!("Could not read labels of {}: {}", handle.name, e);
                return false;
            }
        };
        let Some(current) = rows.iter().find(|c| c.name == handle.name) else {
            return false;
        };
        match current.label(LABEL_CONFIG_HASH) {
            Some(label) if label == handle.config_hash.full() => false,
            label => {
                warn!(
                    "Container {} was created with config {} but the profile is now {}; \
                     new limits apply when it is next recreated",
                    handle.name,
                    label.unwrap_or("<none>"),
                    handle.config_hash.short()
                );
                true
            }
        }
    }

    async fn create_and_start(
        &self,
        slug: &str,
        profile: &SandboxProfile,
        hash: &ConfigHash,
    ) -> Result<()> {
        self.homes.ensure(slug)?;
        let spec = self.build_create_spec(slug, profile, hash)?;

        match self.engine.create_container(&spec).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::ContainerCreateFailed => {
                warn!("{}; cleaning up and retrying once", e);
                self.engine.remove_container(&spec.name).await?;
                self.engine.create_container(&spec).await?;
            }
            Err(e) => return Err(e),
        }

        self.engine.start_container(&spec.name).await?;
        info!(
            "Created container {} (config {})",
            spec.name,
            hash.short()
        );
        Ok(())
    }

    /// The complete, typed creation argument set for an environment.
    pub fn build_create_spec(
        &self,
        slug: &str,
        profile: &SandboxProfile,
        hash: &ConfigHash,
    ) -> Result<CreateSpec> {
        let limits = &profile.limits;

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP.to_string(), self.app_label.clone());
        labels.insert(LABEL_ENV.to_string(), slug.to_string());
        labels.insert(LABEL_CONFIG_HASH.to_string(), hash.full().to_string());
        labels.insert(LABEL_GENERATION.to_string(), GENERATION.to_string());

        let container_home = self.homes.container_home().to_string();
        let mut mounts = vec![
            Mount::bind(self.homes.path(slug), container_home.clone(), false),
            Mount::bind(
                self.homes.shared_dir(),
                self.homes.shared_mount_target(),
                true,
            ),
        ];
        mounts.extend(self.cache.workload_mounts());

        let mut env = self.cache.workload_env();
        env.insert("HOME".to_string(), container_home.clone());

        let hardening = Hardening {
            init: true,
            cap_drop_all: true,
            no_new_privileges: true,
            pids_limit: limits.pids,
            memory_bytes: limits.memory_bytes()?,
            cpu_millis: limits.cpu_millis()?,
            network: if profile.network_enabled() {
                NetworkMode::Bridge
            } else {
                NetworkMode::None
            },
            user: self.user.clone(),
        };

        Ok(CreateSpec {
            name: self.container_name(slug),
            image: self.image.clone(),
            labels,
            mounts,
            env,
            workdir: Some(container_home),
            hardening,
            command: self.keep_alive.clone(),
        })
    }

    /// Stop (bounded), remove, and optionally delete the home directory.
    pub async fn teardown(
        &self,
        slug: &str,
        profile: &SandboxProfile,
        delete_home: bool,
    ) -> Result<()> {
        let hash = profile.config_hash()?;
        let handle = self.handle(slug, &hash);
        let _guard = self.locks.lock(&handle.lock_key).await;

        let status = self.engine.container_status(&handle.name).await?;
        if status == ContainerStatus::Running {
            if let Err(e) = self.engine.stop_container(&handle.name, self.stop_grace).await {
                if e.kind() == ErrorKind::EngineUnavailable {
                    return Err(e);
                }
                warn!("Graceful stop of {} failed: {}", handle.name, e);
            }
        }
        if status != ContainerStatus::Absent {
            self.engine.remove_container(&handle.name).await?;
            info!("Removed container {}", handle.name);
        }

        if delete_home {
            self.homes.remove(slug)?;
        }
        Ok(())
    }

    /// Every container carrying this application's label.
    pub async fn list_managed(&self) -> Result<Vec<ContainerSummary>> {
        self.engine
            .list_containers(&ListFilter::Label {
                key: LABEL_APP.to_string(),
                value: self.app_label.clone(),
            })
            .await
    }

    fn is_current(&self, c: &ContainerSummary) -> bool {
        c.label(LABEL_APP) == Some(self.app_label.as_str())
            && c
                .label(LABEL_GENERATION)
                .and_then(|g| g.parse::<u32>().ok())
                .is_some_and(|g| g >= GENERATION)
    }

    /// Remove labelled containers whose environment no longer exists, and
    /// every container from an older generation. Idempotent.
    pub async fn reconcile(&self, live_slugs: &HashSet<String>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();

        for c in self.list_managed().await? {
            seen.insert(c.name.clone());

            if !self.is_current(&c) {
                if self.remove_quietly(&c.name).await {
                    report.removed_legacy.push(c.name);
                }
                continue;
            }

            let slug = c.label(LABEL_ENV).unwrap_or_default().to_string();
            if live_slugs.contains(&slug) {
                report.kept.push(c.name);
                continue;
            }

            let key = match (self.pooling, c.label(LABEL_CONFIG_HASH)) {
                (true, Some(hash)) => format!("hash:{}", hash),
                _ => slug,
            };
            let _guard = self.locks.lock(&key).await;
            if self.remove_quietly(&c.name).await {
                report.removed_orphans.push(c.name);
            }
        }

        for prefix in &self.legacy_prefixes {
            let rows = self
                .engine
                .list_containers(&ListFilter::NamePrefix(prefix.clone()))
                .await?;
            for c in rows {
                if seen.contains(&c.name) || self.is_current(&c) {
                    continue;
                }
                seen.insert(c.name.clone());
                if self.remove_quietly(&c.name).await {
                    report.removed_legacy.push(c.name);
                }
            }
        }

        if report.removed() > 0 {
            info!(
                "Reconciled containers: {} orphaned, {} legacy removed, {} kept",
                report.removed_orphans.len(),
                report.removed_legacy.len(),
                report.kept.len()
            );
        } else {
            debug!("Reconcile: nothing to remove ({} kept)", report.kept.len());
        }
        Ok(report)
    }

    async fn remove_quietly(&self, name: &str) -> bool {
        match self.engine.remove_container(name).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove container {}: {}", name, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for ContainerLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLifecycleManager")
            .field("name_prefix", &self.name_prefix)
            .field("image", &self.image)
            .field("pooling", &self.pooling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::{FakeEngine, test_config};
    use crate::sandbox::identity::{ResourceLimits, TrustLevel};
    use std::time::Instant;

    fn profile() -> SandboxProfile {
        SandboxProfile::new(
            TrustLevel::Untrusted,
            ResourceLimits::from(&crate::config::LimitsConfig::default()),
        )
    }

    fn manager(engine: Arc<FakeEngine>, config: &Config) -> ContainerLifecycleManager {
        let cache = Arc::new(CacheVolumeManager::new(engine.clone(), config).unwrap());
        let homes = HomeDirectoryManager::new(&config.paths, &config.container);
        ContainerLifecycleManager::new(engine, homes, cache, config)
    }

    #[tokio::test]
    async fn ensure_creates_then_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);

        let first = lifecycle.ensure("proj-alpha", &profile()).await.unwrap();
        let second = lifecycle.ensure("proj-alpha", &profile()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, "agentbox-proj-alpha");
        assert_eq!(engine.create_count("agentbox-proj-alpha"), 1);
        assert_eq!(engine.status_of("agentbox-proj-alpha"), ContainerStatus::Running);
        assert!(lifecycle.locks().is_empty());
    }

    #[tokio::test]
    async fn concurrent_ensure_creates_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.set_create_delay("agentbox-shared", Duration::from_millis(200));
        let lifecycle = Arc::new(manager(engine.clone(), &config));

        let a = {
            let l = lifecycle.clone();
            tokio::spawn(async move { l.ensure("shared", &profile()).await })
        };
        let b = {
            let l = lifecycle.clone();
            tokio::spawn(async move { l.ensure("shared", &profile()).await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(a, b);
        assert_eq!(engine.create_count("agentbox-shared"), 1);
        assert_eq!(engine.container_names(), vec!["agentbox-shared".to_string()]);
    }

    #[tokio::test]
    async fn distinct_slugs_do_not_block_each_other() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.set_create_delay("agentbox-slow", Duration::from_secs(3));
        let lifecycle = Arc::new(manager(engine.clone(), &config));

        // Volumes are created once up front so neither ensure waits on that
        lifecycle.ensure("warmup", &profile()).await.unwrap();

        let slow = {
            let l = lifecycle.clone();
            tokio::spawn(async move { l.ensure("slow", &profile()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        lifecycle.ensure("fast", &profile()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!slow.is_finished());

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exited_container_is_started_not_recreated() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.insert_container("agentbox-a", "exited", &[("env", "a")]);
        let lifecycle = manager(engine.clone(), &config);

        lifecycle.ensure("a", &profile()).await.unwrap();
        assert_eq!(engine.create_count("agentbox-a"), 0);
        assert_eq!(engine.status_of("agentbox-a"), ContainerStatus::Running);
    }

    #[tokio::test]
    async fn running_container_with_stale_config_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.insert_container(
            "agentbox-a",
            "running",
            &[("env", "a"), (LABEL_CONFIG_HASH, "0000-old-profile")],
        );
        let lifecycle = manager(engine.clone(), &config);

        let handle = lifecycle.ensure("a", &profile()).await.unwrap();
        assert_eq!(handle.name, "agentbox-a");
        assert_eq!(engine.create_count("agentbox-a"), 0);
        assert!(engine.removed().is_empty());
        assert!(lifecycle.config_drifted("a", &handle).await);

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);
        let handle = lifecycle.ensure("a", &profile()).await.unwrap();
        assert!(!lifecycle.config_drifted("a", &handle).await);
    }

    #[tokio::test]
    async fn failed_start_recreates_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.insert_container("agentbox-a", "exited", &[("env", "a")]);
        engine.fail_starts("agentbox-a", 1);
        let lifecycle = manager(engine.clone(), &config);

        lifecycle.ensure("a", &profile()).await.unwrap();
        assert_eq!(engine.create_count("agentbox-a"), 1);
        assert_eq!(engine.removed(), vec!["agentbox-a".to_string()]);
    }

    #[tokio::test]
    async fn failed_start_after_recreate_is_not_retried_forever() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.insert_container("agentbox-a", "exited", &[("env", "a")]);
        engine.fail_starts("agentbox-a", 5);
        let lifecycle = manager(engine.clone(), &config);

        let err = lifecycle.ensure("a", &profile()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerBadState);
        assert_eq!(engine.create_count("agentbox-a"), 1);
    }

    #[tokio::test]
    async fn dead_container_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.insert_container("agentbox-a", "dead", &[("env", "a")]);
        let lifecycle = manager(engine.clone(), &config);

        lifecycle.ensure("a", &profile()).await.unwrap();
        assert_eq!(engine.create_count("agentbox-a"), 1);
        assert_eq!(engine.status_of("agentbox-a"), ContainerStatus::Running);
    }

    #[tokio::test]
    async fn create_failure_retries_once_after_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        engine.fail_creates(1);
        let lifecycle = manager(engine.clone(), &config);

        lifecycle.ensure("a", &profile()).await.unwrap();
        assert_eq!(engine.create_count("agentbox-a"), 1);

        engine.fail_creates(2);
        let err = lifecycle.ensure("b", &profile()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerCreateFailed);
    }

    #[tokio::test]
    async fn missing_image_and_unavailable_engine_propagate() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);

        lifecycle.ensure("warm", &profile()).await.unwrap();
        engine.set_image_missing(true);
        let err = lifecycle.ensure("a", &profile()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageMissing);
        assert!(err.is_unavailable());

        engine.set_image_missing(false);
        engine.set_unavailable(true);
        let err = lifecycle.ensure("a", &profile()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineUnavailable);
    }

    #[tokio::test]
    async fn invalid_limits_are_rejected_before_any_engine_call() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);

        let mut bad = profile();
        bad.limits.memory = "lots".into();
        let err = lifecycle.ensure("a", &bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn create_spec_has_labels_mounts_and_hardening() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);
        let profile = profile();
        let hash = profile.config_hash().unwrap();

        let spec = lifecycle.build_create_spec("proj-alpha", &profile, &hash).unwrap();
        assert_eq!(spec.labels[LABEL_APP], "agentbox");
        assert_eq!(spec.labels[LABEL_ENV], "proj-alpha");
        assert_eq!(spec.labels[LABEL_CONFIG_HASH], hash.full());
        assert_eq!(spec.labels[LABEL_CONFIG_HASH].len(), 64);
        assert_eq!(spec.labels[LABEL_GENERATION], GENERATION.to_string());

        let home = &spec.mounts[0];
        assert_eq!(home.target, "/home/agent");
        assert!(!home.read_only);
        let shared = &spec.mounts[1];
        assert_eq!(shared.target, "/home/agent/data");
        assert!(shared.read_only);
        let caches: Vec<&Mount> = spec
            .mounts
            .iter()
            .filter(|m| m.target.starts_with("/opt/cache"))
            .collect();
        assert_eq!(caches.len(), 2);
        assert!(caches.iter().all(|m| m.read_only));

        assert!(spec.hardening.init);
        assert!(spec.hardening.cap_drop_all);
        assert!(spec.hardening.no_new_privileges);
        assert_eq!(spec.hardening.network, NetworkMode::None);
        assert_eq!(spec.hardening.memory_bytes, 512 * 1024 * 1024);

        let networked = profile.clone().with_capability("network", serde_json::json!(true));
        let spec = lifecycle
            .build_create_spec("proj-alpha", &networked, &networked.config_hash().unwrap())
            .unwrap();
        assert_eq!(spec.hardening.network, NetworkMode::Bridge);
    }

    #[tokio::test]
    async fn reconcile_removes_orphans_and_legacy_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let generation = GENERATION.to_string();
        engine.insert_container(
            "agentbox-live",
            "running",
            &[("app", "agentbox"), ("env", "live"), ("generation", &generation)],
        );
        engine.insert_container(
            "agentbox-orphan",
            "exited",
            &[("app", "agentbox"), ("env", "orphan"), ("generation", &generation)],
        );
        engine.insert_container("agentbox-old", "running", &[("app", "agentbox"), ("env", "live")]);
        engine.insert_container("agentbox-session-123", "running", &[]);
        engine.insert_container("unrelated", "running", &[("app", "other")]);
        let lifecycle = manager(engine.clone(), &config);

        let live: HashSet<String> = ["live".to_string()].into_iter().collect();
        let report = lifecycle.reconcile(&live).await.unwrap();
        assert_eq!(report.removed_orphans, vec!["agentbox-orphan".to_string()]);
        let mut legacy = report.removed_legacy.clone();
        legacy.sort();
        assert_eq!(
            legacy,
            vec!["agentbox-old".to_string(), "agentbox-session-123".to_string()]
        );
        assert_eq!(report.kept, vec!["agentbox-live".to_string()]);

        let removed_before = engine.removed().len();
        let again = lifecycle.reconcile(&live).await.unwrap();
        assert_eq!(again.removed(), 0);
        assert_eq!(engine.removed().len(), removed_before);
        assert!(engine.has_container("agentbox-live"));
        assert!(engine.has_container("unrelated"));
    }

    #[tokio::test]
    async fn legacy_prefix_does_not_catch_current_containers() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);

        // slug "session-x" yields a name under the legacy prefix
        lifecycle.ensure("session-x", &profile()).await.unwrap();
        let live: HashSet<String> = ["session-x".to_string()].into_iter().collect();
        let report = lifecycle.reconcile(&live).await.unwrap();
        assert_eq!(report.removed(), 0);
        assert!(engine.has_container("agentbox-session-x"));
    }

    #[tokio::test]
    async fn home_survives_ensure_and_teardown_without_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);

        lifecycle.ensure("a", &profile()).await.unwrap();
        let home = lifecycle.homes().path("a");
        std::fs::write(home.join("state.json"), "{}").unwrap();

        lifecycle.ensure("a", &profile()).await.unwrap();
        assert!(home.join("state.json").exists());

        lifecycle.teardown("a", &profile(), false).await.unwrap();
        assert!(!engine.has_container("agentbox-a"));
        assert!(home.join("state.json").exists());

        lifecycle.ensure("a", &profile()).await.unwrap();
        lifecycle.teardown("a", &profile(), true).await.unwrap();
        assert!(!home.exists());
        assert_eq!(engine.stops(), 2);
    }

    #[tokio::test]
    async fn pooling_locks_by_config_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.container.pooling = true;
        let engine = Arc::new(FakeEngine::new());
        let lifecycle = manager(engine.clone(), &config);

        let a = lifecycle.ensure("a", &profile()).await.unwrap();
        let b = lifecycle.ensure("b", &profile()).await.unwrap();
        assert_eq!(a.lock_key, b.lock_key);
        assert!(a.lock_key.starts_with("hash:"));
        // Still one container per environment
        assert_ne!(a.name, b.name);
        assert_eq!(engine.container_names().len(), 2);
    }
}
