//! Facade over the sandbox layer.
//!
//! Callers deal in environment slugs and sessions; the orchestrator finds
//! the record, keeps the container running, runs turns and cleans up when
//! the last session leaves.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::cache::{CacheVolumeManager, Ecosystem, VolumeSize};
use super::engine::{CliEngine, ContainerEngine, ContainerStatus};
use super::exec::{EventStream, ExecSessionRunner, ExecSettings, TurnContext, TurnRequest};
use super::home::HomeDirectoryManager;
use super::identity::{ResourceLimits, SandboxProfile, TrustLevel};
use super::lifecycle::{ContainerHandle, ContainerLifecycleManager, ReconcileReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{ContainerEnv, EnvRegistry, EnvStore, SessionRef};

/// How a session without an environment should get one.
#[derive(Debug, Clone, Default)]
pub struct OpenSession {
    /// Join (or create) this named, shared environment. `None` means a
    /// private environment with a generated slug.
    pub shared_slug: Option<String>,
    pub display_name: Option<String>,
    pub capabilities: Map<String, Value>,
}

/// Output of `inspect`.
#[derive(Debug, Clone, Default)]
pub struct InspectReport {
    pub engine_version: String,
    pub volumes: Vec<VolumeSize>,
    pub live_containers: usize,
    pub total_containers: usize,
    pub warnings: Vec<String>,
}

pub struct SandboxOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<EnvStore>,
    cache: Arc<CacheVolumeManager>,
    lifecycle: ContainerLifecycleManager,
    runner: ExecSessionRunner,
    default_limits: ResourceLimits,
    prune_days: u32,
    warn_size_bytes: u64,
}

impl SandboxOrchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>, store: Arc<EnvStore>, config: &Config) -> Result<Self> {
        let cache = Arc::new(CacheVolumeManager::new(engine.clone(), config)?);
        let homes = HomeDirectoryManager::new(&config.paths, &config.container);
        let lifecycle = ContainerLifecycleManager::new(engine.clone(), homes, cache.clone(), config);
        let runner = ExecSessionRunner::new(engine.clone(), lifecycle.locks(), ExecSettings::from(config));

        let default_limits = ResourceLimits::from(&config.limits);
        default_limits.validate()?;

        Ok(Self {
            engine,
            store,
            cache,
            lifecycle,
            runner,
            default_limits,
            prune_days: config.cache.prune_days,
            warn_size_bytes: config.cache.warn_size_mb.saturating_mul(1024 * 1024),
        })
    }

    /// Production wiring: CLI engine and the JSON store under `state_dir`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let engine: Arc<dyn ContainerEngine> = Arc::new(CliEngine::new(&config.engine));
        let store = Arc::new(EnvStore::open(config.paths.env_store()));
        Self::new(engine, store, config)
    }

    pub fn store(&self) -> &EnvStore {
        &self.store
    }

    pub fn lifecycle(&self) -> &ContainerLifecycleManager {
        &self.lifecycle
    }

    pub fn cache(&self) -> &CacheVolumeManager {
        &self.cache
    }

    pub fn default_profile(&self, trust_level: TrustLevel) -> SandboxProfile {
        SandboxProfile::new(trust_level, self.default_limits.clone())
    }

    fn env(&self, slug: &str) -> Result<ContainerEnv> {
        self.store
            .get(slug)?
            .ok_or_else(|| Error::Store(format!("no environment '{}'", slug)))
    }

    /// Make sure the environment's container is running.
    pub async fn ensure(&self, slug: &str) -> Result<ContainerHandle> {
        let env = self.env(slug)?;
        self.lifecycle.ensure(&env.slug, &env.profile).await
    }

    /// Run one turn. Lifecycle failures are returned as `Err` before the
    /// turn starts; anything after that arrives as an `error` event.
    pub async fn run(
        &self,
        slug: &str,
        request: TurnRequest,
        context: TurnContext,
    ) -> Result<EventStream> {
        let env = self.env(slug)?;
        let handle = self.lifecycle.ensure(&env.slug, &env.profile).await?;
        let deadline = Duration::from_secs(env.profile.limits.timeout_secs);
        Ok(self.runner.run(&handle, request, context, deadline))
    }

    /// Remove orphaned and legacy containers. Never fails; problems are
    /// logged and an empty report comes back.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconcile_with(self.store.as_ref()).await
    }

    pub async fn reconcile_with(&self, registry: &dyn EnvRegistry) -> ReconcileReport {
        let live = match registry.live_slugs() {
            Ok(live) => live,
            Err(e) => {
                warn!("Skipping reconcile, environment records unavailable: {}", e);
                return ReconcileReport::default();
            }
        };
        match self.lifecycle.reconcile(&live).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Reconcile failed: {}", e);
                ReconcileReport::default()
            }
        }
    }

    /// Stop and remove the container. The home goes too, but only for a
    /// private environment nobody references any more.
    pub async fn teardown(&self, slug: &str) -> Result<()> {
        let env = self.env(slug)?;
        let refs = self.store.session_refs(slug)?;
        let delete_home = !env.shared && refs == 0;
        self.lifecycle.teardown(slug, &env.profile, delete_home).await
    }

    /// Tear down and forget an environment, home included. Refuses while
    /// sessions still reference it.
    pub async fn destroy(&self, slug: &str) -> Result<()> {
        let env = self.env(slug)?;
        let refs = self.store.session_refs(slug)?;
        if refs > 0 {
            return Err(Error::Store(format!(
                "environment '{}' is still used by {} session(s)",
                slug, refs
            )));
        }
        self.lifecycle.teardown(slug, &env.profile, true).await?;
        self.store.remove(slug)?;
        info!("Destroyed environment {}", slug);
        Ok(())
    }

    /// Give the session an environment if it has none, and record the
    /// reference. Afterwards `session.container_env_id` is always set.
    pub fn open_session(&self, session: &mut SessionRef, request: OpenSession) -> Result<ContainerEnv> {
        if let Some(ref slug) = session.container_env_id
            && self.store.get(slug)?.is_some()
        {
            return self.store.attach(slug, &session.session_id);
        }

        // Attached earlier but the caller never stored the id
        if session.container_env_id.is_none()
            && let Some(env) = self.store.env_for_session(&session.session_id)?
        {
            session.container_env_id = Some(env.slug.clone());
            return Ok(env);
        }

        let mut profile = self.default_profile(session.trust_level);
        profile.capabilities = request.capabilities;

        let (slug, shared) = match request.shared_slug {
            Some(slug) => (slug, true),
            None => (private_slug(), false),
        };
        let env = self.store.get_or_create_and_attach(
            &slug,
            request.display_name,
            shared,
            profile,
            &session.session_id,
        )?;
        session.container_env_id = Some(env.slug.clone());
        info!(
            "Session {} uses environment {} ({})",
            session.session_id,
            env.slug,
            env.config_hash.short()
        );
        Ok(env)
    }

    /// Drop the session's reference. When it was the last one the container
    /// is torn down and the record removed; a private home is deleted, a
    /// shared one is kept for the next environment with that name.
    /// Returns whether the environment was destroyed.
    pub async fn close_session(&self, session_id: &str) -> Result<bool> {
        let Some((env, remaining)) = self.store.detach(session_id)? else {
            return Ok(false);
        };
        if remaining > 0 {
            return Ok(false);
        }

        self.lifecycle
            .teardown(&env.slug, &env.profile, !env.shared)
            .await?;
        self.store.remove(&env.slug)?;
        info!("Environment {} released by its last session", env.slug);
        Ok(true)
    }

    /// Fails with [`Error::EngineUnavailable`] when the engine daemon does
    /// not answer, before any volume or container is touched.
    pub async fn inspect(&self) -> Result<InspectReport> {
        let engine_version = self.engine.version().await?;
        let volumes = self.cache.sizes().await?;
        let containers = self.lifecycle.list_managed().await?;
        let live_containers = containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Running)
            .count();

        let warnings = volumes
            .iter()
            .filter(|v| v.bytes > self.warn_size_bytes)
            .map(|v| {
                format!(
                    "cache volume {} is {} MiB (threshold {} MiB); consider `clean-cache --trim`",
                    v.volume,
                    v.bytes / (1024 * 1024),
                    self.warn_size_bytes / (1024 * 1024)
                )
            })
            .collect();

        Ok(InspectReport {
            engine_version,
            volumes,
            live_containers,
            total_containers: containers.len(),
            warnings,
        })
    }

    /// `trim`: age-based prune. Otherwise remove and recreate every volume.
    pub async fn clean_cache(&self, trim: bool) -> Result<()> {
        if trim {
            self.cache.prune(self.prune_days).await
        } else {
            self.cache.purge().await
        }
    }

    pub async fn warm_cache(&self, ecosystem: Ecosystem, packages: &[String]) -> Result<()> {
        self.cache.warm(ecosystem, packages).await
    }
}

/// `s-` plus 48 bits of a v4 uuid.
fn private_slug() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("s-{}", &id[..12])
}
