use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub exec: ExecConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Override for the data root (environment homes + shared data tree).
    /// Takes effect only when AGENTBOX_DATA_DIR is not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// Which container CLI to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineRuntime {
    #[default]
    Docker,
    Podman,
}

impl EngineRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            EngineRuntime::Docker => "docker",
            EngineRuntime::Podman => "podman",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub runtime: EngineRuntime,

    /// Upper bound for any single engine CLI invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Attempts for read-only status queries (destructive calls are never retried)
    #[serde(default = "default_status_retries")]
    pub status_retries: u32,
}

/// Where the shared data tree lands inside the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMount {
    /// `<home_path>/<data_subdir>`, nested inside the home bind mount
    #[default]
    Nested,
    /// `/workspace`, for platforms without nested bind mount support
    Alternate,
}

/// How home directory ownership is reconciled with the container user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    /// chown the home to runtime_uid:runtime_gid on creation
    #[default]
    Chown,
    /// The engine's user namespace maps ownership automatically (rootless podman/docker)
    Userns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_image")]
    pub image: String,

    /// Container name = "{name_prefix}-{slug}"
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Value of the `app` label on everything this process creates
    #[serde(default = "default_app_label")]
    pub app_label: String,

    /// Home directory path inside the container
    #[serde(default = "default_home_path")]
    pub home_path: String,

    #[serde(default)]
    pub data_mount: DataMount,

    #[serde(default = "default_data_subdir")]
    pub data_subdir: String,

    #[serde(default = "default_runtime_id")]
    pub runtime_uid: u32,

    #[serde(default = "default_runtime_id")]
    pub runtime_gid: u32,

    #[serde(default)]
    pub ownership: Ownership,

    /// PID-1 keep-alive command (run under the engine's init)
    #[serde(default = "default_keep_alive")]
    pub keep_alive: Vec<String>,

    /// Per-turn entrypoint executed with `exec -i`
    #[serde(default = "default_entrypoint")]
    pub entrypoint: Vec<String>,

    /// Seconds to wait on stop before the engine force-kills
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Lock by config hash instead of slug. Containers stay one per environment.
    #[serde(default)]
    pub pooling: bool,

    /// Name prefixes of a previous isolation scheme, removed on reconcile
    #[serde(default = "default_legacy_prefixes")]
    pub legacy_prefixes: Vec<String>,
}

/// Default resource limits for new environments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Memory limit, e.g. "512m", "1g"
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU quota in cores
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Max processes/threads in the container
    #[serde(default = "default_pids")]
    pub pids: u32,

    /// Wall-clock deadline per turn
    #[serde(default = "default_turn_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Poll interval for each stdout line read, so the deadline is rechecked
    #[serde(default = "default_line_read_timeout")]
    pub line_read_timeout_ms: u64,

    /// How long to wait for the exec process to exit after stdout closes
    #[serde(default = "default_exit_wait")]
    pub exit_wait_ms: u64,

    /// Exit code that means the kernel OOM killer ended the process
    #[serde(default = "default_oom_exit_code")]
    pub oom_exit_code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Volume name = "{volume_prefix}-{ecosystem}"
    #[serde(default = "default_volume_prefix")]
    pub volume_prefix: String,

    /// Enabled ecosystems: "pip" | "npm"
    #[serde(default = "default_ecosystems")]
    pub ecosystems: Vec<String>,

    /// Image for cache-builder runs (defaults to container.image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_image: Option<String>,

    /// Age-based prune threshold for `clean-cache --trim`
    #[serde(default = "default_prune_days")]
    pub prune_days: u32,

    /// `inspect` warns when a volume grows past this
    #[serde(default = "default_warn_size_mb")]
    pub warn_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_command_timeout() -> u64 {
    60
}
fn default_status_retries() -> u32 {
    3
}
fn default_image() -> String {
    "agentbox-runtime:latest".to_string()
}
fn default_name_prefix() -> String {
    "agentbox".to_string()
}
fn default_app_label() -> String {
    "agentbox".to_string()
}
fn default_home_path() -> String {
    "/home/agent".to_string()
}
fn default_data_subdir() -> String {
    "data".to_string()
}
fn default_runtime_id() -> u32 {
    1000
}
fn default_keep_alive() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}
fn default_entrypoint() -> Vec<String> {
    vec!["agent-runner".to_string()]
}
fn default_stop_timeout() -> u64 {
    10
}
fn default_legacy_prefixes() -> Vec<String> {
    // Per-session containers from before environments were durable
    vec!["agentbox-session".to_string()]
}
fn default_memory() -> String {
    "512m".to_string()
}
fn default_cpus() -> f64 {
    1.0
}
fn default_pids() -> u32 {
    256
}
fn default_turn_timeout() -> u64 {
    300
}
fn default_line_read_timeout() -> u64 {
    1000
}
fn default_exit_wait() -> u64 {
    5000
}
fn default_oom_exit_code() -> i32 {
    137 // 128 + SIGKILL
}
fn default_volume_prefix() -> String {
    "agentbox-cache".to_string()
}
fn default_ecosystems() -> Vec<String> {
    vec!["pip".to_string(), "npm".to_string()]
}
fn default_prune_days() -> u32 {
    30
}
fn default_warn_size_mb() -> u64 {
    2048
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: EngineRuntime::default(),
            command_timeout_secs: default_command_timeout(),
            status_retries: default_status_retries(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            name_prefix: default_name_prefix(),
            app_label: default_app_label(),
            home_path: default_home_path(),
            data_mount: DataMount::default(),
            data_subdir: default_data_subdir(),
            runtime_uid: default_runtime_id(),
            runtime_gid: default_runtime_id(),
            ownership: Ownership::default(),
            keep_alive: default_keep_alive(),
            entrypoint: default_entrypoint(),
            stop_timeout_secs: default_stop_timeout(),
            pooling: false,
            legacy_prefixes: default_legacy_prefixes(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            pids: default_pids(),
            timeout_secs: default_turn_timeout(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            line_read_timeout_ms: default_line_read_timeout(),
            exit_wait_ms: default_exit_wait(),
            oom_exit_code: default_oom_exit_code(),
            default_model: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            volume_prefix: default_volume_prefix(),
            ecosystems: default_ecosystems(),
            builder_image: None,
            prune_days: default_prune_days(),
            warn_size_mb: default_warn_size_mb(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        let data_dir_pinned = std::env::var("AGENTBOX_DATA_DIR").is_ok();
        let config = Self::load_from(paths, data_dir_pinned)?;
        config.paths.ensure_dirs()?;
        Ok(config)
    }

    /// Load config.toml from `paths.config_file()`, creating it from the
    /// template on first run.
    pub fn load_from(paths: Paths, data_dir_pinned: bool) -> Result<Self> {
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;

        if !data_dir_pinned && let Some(ref dir) = config.storage.data_dir {
            let expanded = shellexpand::tilde(dir);
            let data_dir = PathBuf::from(expanded.to_string());
            if data_dir.is_absolute() {
                config.paths.data_dir = data_dir;
            }
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["engine", "runtime"] => Ok(self.engine.runtime.binary().to_string()),
            ["engine", "command_timeout_secs"] => Ok(self.engine.command_timeout_secs.to_string()),
            ["container", "image"] => Ok(self.container.image.clone()),
            ["container", "name_prefix"] => Ok(self.container.name_prefix.clone()),
            ["container", "pooling"] => Ok(self.container.pooling.to_string()),
            ["limits", "memory"] => Ok(self.limits.memory.clone()),
            ["limits", "cpus"] => Ok(self.limits.cpus.to_string()),
            ["limits", "pids"] => Ok(self.limits.pids.to_string()),
            ["limits", "timeout_secs"] => Ok(self.limits.timeout_secs.to_string()),
            ["cache", "prune_days"] => Ok(self.cache.prune_days.to_string()),
            ["cache", "warn_size_mb"] => Ok(self.cache.warn_size_mb.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["engine", "runtime"] => {
                self.engine.runtime = match value {
                    "docker" => EngineRuntime::Docker,
                    "podman" => EngineRuntime::Podman,
                    other => anyhow::bail!("Unknown engine runtime: {}", other),
                }
            }
            ["engine", "command_timeout_secs"] => self.engine.command_timeout_secs = value.parse()?,
            ["container", "image"] => self.container.image = value.to_string(),
            ["container", "name_prefix"] => self.container.name_prefix = value.to_string(),
            ["container", "pooling"] => self.container.pooling = value.parse()?,
            ["limits", "memory"] => self.limits.memory = value.to_string(),
            ["limits", "cpus"] => self.limits.cpus = value.parse()?,
            ["limits", "pids"] => self.limits.pids = value.parse()?,
            ["limits", "timeout_secs"] => self.limits.timeout_secs = value.parse()?,
            ["cache", "prune_days"] => self.cache.prune_days = value.parse()?,
            ["cache", "warn_size_mb"] => self.cache.warn_size_mb = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    /// Image used for cache-builder and size-check runs.
    pub fn builder_image(&self) -> &str {
        self.cache
            .builder_image
            .as_deref()
            .unwrap_or(&self.container.image)
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# agentbox configuration
# Auto-created on first run. Edit as needed.

# [storage]
# Data root for environment homes and the shared data tree.
# AGENTBOX_DATA_DIR takes precedence.
# data_dir = "~/.local/share/agentbox"

[engine]
runtime = "docker"                      # docker | podman
command_timeout_secs = 60

[container]
image = "agentbox-runtime:latest"
name_prefix = "agentbox"
app_label = "agentbox"
home_path = "/home/agent"
data_mount = "nested"                   # nested | alternate (/workspace)
runtime_uid = 1000
runtime_gid = 1000
ownership = "chown"                     # chown | userns (rootless engines)
entrypoint = ["agent-runner"]
stop_timeout_secs = 10

[limits]
memory = "512m"
cpus = 1.0
pids = 256
timeout_secs = 300

[exec]
line_read_timeout_ms = 1000
exit_wait_ms = 5000
oom_exit_code = 137

[cache]
volume_prefix = "agentbox-cache"
ecosystems = ["pip", "npm"]
prune_days = 30
warn_size_mb = 2048

[logging]
level = "info"
"#;
