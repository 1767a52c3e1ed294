//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. agentbox-specific env var (AGENTBOX_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.
//!
//! The data directory is the sandbox *data root*: environment homes live
//! under `<data_dir>/sandbox/envs/<slug>/home`, so moving the data root to
//! another machine moves every environment with it.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::getuid;
use std::path::{Path, PathBuf};

/// Resolved directory paths for the entire application.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Data root: environment homes and the shared data tree
    pub data_dir: PathBuf,

    /// State directory: environment records, logs
    pub state_dir: PathBuf,

    /// Cache directory
    pub cache_dir: PathBuf,

    /// Runtime directory: lock files.
    /// None if no suitable runtime directory is available.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "AGENTBOX_CONFIG_DIR", || {
            strategy.config_dir().join("agentbox")
        });

        let data_dir = env_or(&env_fn, "AGENTBOX_DATA_DIR", || {
            strategy.data_dir().join("agentbox")
        });

        let state_dir = env_or(&env_fn, "AGENTBOX_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("agentbox")
        });

        let cache_dir = env_or(&env_fn, "AGENTBOX_CACHE_DIR", || {
            strategy.cache_dir().join("agentbox")
        });

        let runtime_dir = resolve_runtime_dir(&env_fn);

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
            cache_dir,
            runtime_dir,
        })
    }

    /// Build a `Paths` rooted entirely under one directory (tests, portable installs).
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
            runtime_dir: Some(root.join("run")),
        }
    }

    // ── Convenience accessors for specific files ──

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Root of all environment directories: data_dir/sandbox/envs
    pub fn envs_dir(&self) -> PathBuf {
        self.data_dir.join("sandbox").join("envs")
    }

    /// Per-environment directory: data_dir/sandbox/envs/{slug}
    pub fn env_dir(&self, slug: &str) -> PathBuf {
        self.envs_dir().join(slug)
    }

    /// Home directory bind-mounted read-write into the environment's container
    pub fn env_home(&self, slug: &str) -> PathBuf {
        self.env_dir(slug).join("home")
    }

    /// Shared data tree, mounted read-only into every workload
    pub fn shared_data_dir(&self) -> PathBuf {
        self.data_dir.join("shared")
    }

    /// Environment records: state_dir/envs.json
    pub fn env_store(&self) -> PathBuf {
        self.state_dir.join("envs.json")
    }

    /// Logs directory
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Maintenance lock file (in runtime_dir, falls back to state_dir)
    pub fn maintenance_lock(&self) -> PathBuf {
        self.runtime_dir
            .as_ref()
            .unwrap_or(&self.state_dir)
            .join("maintenance.lock")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            &self.config_dir,
            &self.data_dir,
            &self.state_dir,
            &self.cache_dir,
        ];

        for dir in &dirs {
            create_dir_with_mode(dir)?;
        }

        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }

        std::fs::create_dir_all(self.envs_dir())
            .with_context(|| format!("Failed to create {}", self.envs_dir().display()))?;
        std::fs::create_dir_all(self.shared_data_dir())
            .with_context(|| format!("Failed to create {}", self.shared_data_dir().display()))?;

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            // Fallback when no home directory can be resolved
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("agentbox"),
                data_dir: home.join(".local").join("share").join("agentbox"),
                state_dir: home.join(".local").join("state").join("agentbox"),
                cache_dir: home.join(".cache").join("agentbox"),
                runtime_dir: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join("agentbox"));
        }
    }

    // Fallback: $TMPDIR/agentbox-$UID on Unix
    #[cfg(unix)]
    {
        let uid = unsafe { getuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        Some(PathBuf::from(tmpdir).join(format!("agentbox-{}", uid)))
    }

    #[cfg(not(unix))]
    {
        env_fn("TEMP").ok().map(|t| {
            let user = env_fn("USERNAME").unwrap_or_else(|_| "user".into());
            PathBuf::from(t).join(format!("agentbox-{}", user))
        })
    }
}

/// Create a directory with mode 0700 per XDG spec.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
