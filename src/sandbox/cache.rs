//! Shared package-download caches.
//!
//! One engine volume per ecosystem. Workload containers only ever get the
//! volume read-only; the single write path is an ephemeral cache-builder
//! container started by maintenance commands, never from a turn.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::engine::ContainerEngine;
use super::hardening::{EphemeralRun, Mount, NetworkMode};
use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ecosystem {
    Pip,
    Npm,
}

impl Ecosystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Pip => "pip",
            Ecosystem::Npm => "npm",
        }
    }

    /// In-container mount point.
    pub fn mount_path(&self) -> &'static str {
        match self {
            Ecosystem::Pip => "/opt/cache/pip",
            Ecosystem::Npm => "/opt/cache/npm",
        }
    }

    /// Env var the package tool reads its cache location from.
    pub fn env_var(&self) -> &'static str {
        match self {
            Ecosystem::Pip => "PIP_CACHE_DIR",
            Ecosystem::Npm => "npm_config_cache",
        }
    }

    fn warm_command(&self, packages: &[String]) -> Vec<String> {
        match self {
            Ecosystem::Pip => {
                let mut cmd: Vec<String> = [
                    "pip",
                    "download",
                    "--disable-pip-version-check",
                    "--cache-dir",
                    self.mount_path(),
                    "--dest",
                    "/tmp/agentbox-warm",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                cmd.extend(packages.iter().cloned());
                cmd
            }
            Ecosystem::Npm => {
                let mut cmd = vec!["npm".to_string(), "cache".to_string(), "add".to_string()];
                cmd.extend(packages.iter().cloned());
                cmd.extend(["--cache".to_string(), self.mount_path().to_string()]);
                cmd
            }
        }
    }
}

impl FromStr for Ecosystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pip" | "python" => Ok(Ecosystem::Pip),
            "npm" | "node" => Ok(Ecosystem::Npm),
            other => Err(Error::invalid_config(format!(
                "unknown cache ecosystem '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte size of one cache volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSize {
    pub ecosystem: Ecosystem,
    pub volume: String,
    pub bytes: u64,
}

pub struct CacheVolumeManager {
    engine: Arc<dyn ContainerEngine>,
    ecosystems: Vec<Ecosystem>,
    volume_prefix: String,
    app_label: String,
    workload_image: String,
    builder_image: String,
    runtime_user: String,
}

impl CacheVolumeManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &Config) -> Result<Self> {
        let mut ecosystems = config
            .cache
            .ecosystems
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<Ecosystem>>>()?;
        ecosystems.sort();
        ecosystems.dedup();

        Ok(Self {
            engine,
            ecosystems,
            volume_prefix: config.cache.volume_prefix.clone(),
            app_label: config.container.app_label.clone(),
            workload_image: config.container.image.clone(),
            builder_image: config.builder_image().to_string(),
            runtime_user: format!(
                "{}:{}",
                config.container.runtime_uid, config.container.runtime_gid
            ),
        })
    }

    pub fn ecosystems(&self) -> &[Ecosystem] {
        &self.ecosystems
    }

    pub fn volume_name(&self, ecosystem: Ecosystem) -> String {
        format!("{}-{}", self.volume_prefix, ecosystem.as_str())
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), self.app_label.clone());
        labels.insert("role".to_string(), "cache".to_string());
        labels
    }

    fn enabled(&self, ecosystem: Ecosystem) -> Result<()> {
        if self.ecosystems.contains(&ecosystem) {
            Ok(())
        } else {
            Err(Error::invalid_config(format!(
                "cache ecosystem '{}' is not enabled",
                ecosystem
            )))
        }
    }

    /// Create any missing cache volume. Safe to call repeatedly.
    pub async fn ensure_volumes(&self) -> Result<()> {
        let labels = self.labels();
        for eco in &self.ecosystems {
            let name = self.volume_name(*eco);
            if self.engine.volume_exists(&name).await? {
                continue;
            }
            self.engine.create_volume(&name, &labels).await?;
            info!("Created cache volume {}", name);
        }
        Ok(())
    }

    /// Read-only mounts for workload containers.
    pub fn workload_mounts(&self) -> Vec<Mount> {
        self.ecosystems
            .iter()
            .map(|eco| Mount::volume(self.volume_name(*eco), eco.mount_path(), true))
            .collect()
    }

    pub fn workload_env(&self) -> BTreeMap<String, String> {
        self.ecosystems
            .iter()
            .map(|eco| (eco.env_var().to_string(), eco.mount_path().to_string()))
            .collect()
    }

    fn builder_run(&self, ecosystem: Ecosystem, network: NetworkMode, command: Vec<String>) -> EphemeralRun {
        let mut labels = self.labels();
        labels.insert("role".to_string(), "cache-builder".to_string());
        let mut env = BTreeMap::new();
        env.insert(
            ecosystem.env_var().to_string(),
            ecosystem.mount_path().to_string(),
        );
        EphemeralRun {
            image: self.builder_image.clone(),
            labels,
            mounts: vec![Mount::volume(
                self.volume_name(ecosystem),
                ecosystem.mount_path(),
                false,
            )],
            env,
            network,
            user: "0:0".to_string(),
            command,
        }
    }

    /// Populate a cache through the builder. The only writer of cache volumes.
    pub async fn warm(&self, ecosystem: Ecosystem, packages: &[String]) -> Result<()> {
        self.enabled(ecosystem)?;
        if packages.is_empty() {
            return Err(Error::invalid_config("no packages to warm"));
        }
        if let Some(bad) = packages.iter().find(|p| p.starts_with('-')) {
            return Err(Error::invalid_config(format!(
                "package '{}' looks like an option",
                bad
            )));
        }

        self.ensure_volumes().await?;
        let run = self.builder_run(
            ecosystem,
            NetworkMode::Bridge,
            ecosystem.warm_command(packages),
        );
        info!(
            "Warming {} cache with {} package(s)",
            ecosystem,
            packages.len()
        );
        self.engine.run_ephemeral(&run).await?;
        Ok(())
    }

    /// Measure each volume with a read-only, network-less `du` run.
    pub async fn sizes(&self) -> Result<Vec<VolumeSize>> {
        if self.ecosystems.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_volumes().await?;

        let mut command = vec!["du".to_string(), "-sb".to_string()];
        command.extend(self.ecosystems.iter().map(|e| e.mount_path().to_string()));
        let mut labels = self.labels();
        labels.insert("role".to_string(), "cache-size".to_string());

        let run = EphemeralRun {
            image: self.workload_image.clone(),
            labels,
            mounts: self.workload_mounts(),
            env: BTreeMap::new(),
            network: NetworkMode::None,
            user: self.runtime_user.clone(),
            command,
        };
        let output = self.engine.run_ephemeral(&run).await?;
        let measured = parse_du(&output);

        Ok(self
            .ecosystems
            .iter()
            .map(|eco| VolumeSize {
                ecosystem: *eco,
                volume: self.volume_name(*eco),
                bytes: measured.get(eco.mount_path()).copied().unwrap_or(0),
            })
            .collect())
    }

    /// Delete cache files not accessed in `days` days, then empty directories.
    pub async fn prune(&self, days: u32) -> Result<()> {
        self.ensure_volumes().await?;
        for eco in &self.ecosystems {
            let script = format!(
                "find {path} -type f -atime +{days} -delete; \
                 find {path} -mindepth 1 -type d -empty -delete",
                path = eco.mount_path(),
                days = days
            );
            let run = self.builder_run(
                *eco,
                NetworkMode::None,
                vec!["sh".to_string(), "-c".to_string(), script],
            );
            debug!("Pruning {} cache entries older than {} days", eco, days);
            self.engine.run_ephemeral(&run).await?;
        }
        info!("Pruned cache volumes (older than {} days)", days);
        Ok(())
    }

    /// Remove and recreate every cache volume.
    pub async fn purge(&self) -> Result<()> {
        for eco in &self.ecosystems {
            let name = self.volume_name(*eco);
            if let Err(e) = self.engine.remove_volume(&name).await {
                // A volume still mounted by a workload cannot be removed
                warn!("Failed to remove cache volume {}: {}", name, e);
                return Err(e);
            }
            info!("Removed cache volume {}", name);
        }
        self.ensure_volumes().await
    }
}

/// Parse `du -sb` output into `path -> bytes`.
fn parse_du(output: &str) -> BTreeMap<String, u64> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let bytes = parts.next()?.parse().ok()?;
            let path = parts.next()?;
            Some((path.trim_end_matches('/').to_string(), bytes))
        })
        .collect()
}
