//! Container engine boundary.
//!
//! [`ContainerEngine`] is everything the sandbox layer needs from Docker or
//! Podman. [`CliEngine`] drives the engine's CLI through
//! `tokio::process::Command` only, so a slow or hung daemon suspends the
//! calling task and never the runtime.
//!
//! The engine is the source of truth for container state. Nothing here
//! caches status between calls.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::hardening::{CreateSpec, EphemeralRun, ExecSpec, PID_KILL_SCRIPT};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Engine-reported container state. `Absent` means the engine has no such
/// container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Absent,
    Created,
    Running,
    Exited,
    Paused,
    Restarting,
    Removing,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "" => ContainerStatus::Absent,
            "created" | "configured" | "initialized" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "exited" | "stopped" => ContainerStatus::Exited,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" | "stopping" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContainerStatus::Absent => "absent",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown(s) => s,
        }
    }
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub name: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|s| s.as_str())
    }
}

/// Which containers to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFilter {
    /// Containers carrying `key=value`
    Label { key: String, value: String },
    /// Containers whose name starts with the prefix
    NamePrefix(String),
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Ask the daemon for its version. Fails with `EngineUnavailable` when it is unreachable.
    async fn version(&self) -> Result<String>;

    async fn container_status(&self, name: &str) -> Result<ContainerStatus>;

    async fn create_container(&self, spec: &CreateSpec) -> Result<()>;

    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stop with a bounded grace period; the engine force-kills after it.
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()>;

    /// Force-remove. Removing an absent container succeeds.
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn list_containers(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Run a one-shot container to completion and return its stdout.
    async fn run_ephemeral(&self, run: &EphemeralRun) -> Result<String>;

    /// Start an `exec -i` process with piped stdio. The child is killed if dropped.
    fn spawn_exec(&self, spec: &ExecSpec) -> Result<Child>;

    /// SIGKILL the process an exec recorded in `pid_file`, inside the
    /// container. Succeeds if the file or the container is already gone.
    async fn kill_exec(&self, container: &str, pid_file: &str) -> Result<()>;
}

/// How a failed engine invocation should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Unavailable,
    NotFound,
    ImageMissing,
    Other,
}

fn classify(stderr: &str) -> Failure {
    let s = stderr.to_ascii_lowercase();
    if s.contains("cannot connect to the docker daemon")
        || s.contains("is the docker daemon running")
        || s.contains("error during connect")
        || s.contains("connection refused")
        || s.contains("cannot connect to podman")
    {
        Failure::Unavailable
    } else if s.contains("unable to find image")
        || s.contains("no such image")
        || s.contains("image not known")
        || s.contains("pull access denied")
    {
        Failure::ImageMissing
    } else if s.contains("no such container")
        || s.contains("no such object")
        || s.contains("no container with name or id")
        || s.contains("no such volume")
        || s.contains("no volume with name")
        || s.contains("is not running")
    {
        Failure::NotFound
    } else {
        Failure::Other
    }
}

/// Docker/Podman CLI engine.
#[derive(Debug, Clone)]
pub struct CliEngine {
    binary: String,
    command_timeout: Duration,
    status_retries: u32,
}

impl CliEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.runtime.binary().to_string(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            status_retries: config.status_retries.max(1),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run one engine command with the per-command timeout.
    async fn invoke(&self, args: &[String]) -> Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = tokio::time::timeout(self.command_timeout, self.command(args).output())
            .await
            .map_err(|_| {
                Error::EngineUnavailable(format!(
                    "`{} {}` timed out after {}s",
                    self.binary,
                    args.first().map(String::as_str).unwrap_or(""),
                    self.command_timeout.as_secs()
                ))
            })?;

        output.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::EngineUnavailable(format!("'{}' not found in PATH", self.binary))
            } else {
                Error::EngineUnavailable(format!("failed to run '{}': {}", self.binary, e))
            }
        })
    }

    fn command_error(&self, args: &[String], stderr: &str) -> Error {
        Error::EngineCommand {
            command: format!(
                "{} {}",
                self.binary,
                args.iter().take(2).cloned().collect::<Vec<_>>().join(" ")
            ),
            detail: stderr.trim().to_string(),
        }
    }

    async fn status_once(&self, name: &str) -> Result<ContainerStatus> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            name.to_string(),
        ];
        let output = self.invoke(&args).await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(ContainerStatus::parse(&stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify(&stderr) {
            Failure::NotFound => Ok(ContainerStatus::Absent),
            Failure::Unavailable => Err(Error::EngineUnavailable(stderr.trim().to_string())),
            _ => Err(self.command_error(&args, &stderr)),
        }
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn version(&self) -> Result<String> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let output = self.invoke(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(Error::EngineUnavailable(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus> {
        // Read-only, so safe to retry across daemon hiccups
        let mut delay = Duration::from_millis(200);
        let mut attempt = 1;
        loop {
            match self.status_once(name).await {
                Err(Error::EngineUnavailable(msg)) if attempt < self.status_retries => {
                    warn!(
                        "Status query for {} failed (attempt {}/{}): {}",
                        name, attempt, self.status_retries, msg
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<()> {
        let args = spec.to_args();
        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(match classify(&stderr) {
            Failure::Unavailable => Error::EngineUnavailable(stderr.trim().to_string()),
            Failure::ImageMissing => Error::ImageMissing {
                image: spec.image.clone(),
                detail: stderr.trim().to_string(),
            },
            _ => Error::ContainerCreateFailed {
                name: spec.name.clone(),
                detail: stderr.trim().to_string(),
            },
        })
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let args = vec!["start".to_string(), name.to_string()];
        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(match classify(&stderr) {
            Failure::Unavailable => Error::EngineUnavailable(stderr.trim().to_string()),
            _ => Error::ContainerBadState {
                name: name.to_string(),
                state: format!("start failed: {}", stderr.trim()),
            },
        })
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "--time".to_string(),
            grace.as_secs().to_string(),
            name.to_string(),
        ];
        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify(&stderr) {
            Failure::NotFound => Ok(()),
            Failure::Unavailable => Err(Error::EngineUnavailable(stderr.trim().to_string())),
            _ => Err(self.command_error(&args, &stderr)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "--force".to_string(), name.to_string()];
        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify(&stderr) {
            Failure::NotFound => Ok(()),
            Failure::Unavailable => Err(Error::EngineUnavailable(stderr.trim().to_string())),
            _ => Err(self.command_error(&args, &stderr)),
        }
    }

    async fn list_containers(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>> {
        let filter_arg = match filter {
            ListFilter::Label { key, value } => format!("label={}={}", key, value),
            ListFilter::NamePrefix(prefix) => format!("name=^{}", prefix),
        };
        let args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            filter_arg,
            "--format".to_string(),
            "{{.Names}}\t{{.State}}\t{{.Labels}}".to_string(),
        ];
        let output = self.invoke(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(match classify(&stderr) {
                Failure::Unavailable => Error::EngineUnavailable(stderr.trim().to_string()),
                _ => self.command_error(&args, &stderr),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut rows: Vec<ContainerSummary> = stdout.lines().filter_map(parse_ps_line).collect();
        // The engine's name filter is a substring/regex match; enforce the prefix exactly
        if let ListFilter::NamePrefix(prefix) = filter {
            rows.retain(|r| r.name.starts_with(prefix.as_str()));
        }
        Ok(rows)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let args = vec!["volume".to_string(), "inspect".to_string(), name.to_string()];
        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify(&stderr) {
            Failure::NotFound => Ok(false),
            Failure::Unavailable => Err(Error::EngineUnavailable(stderr.trim().to_string())),
            _ => Err(self.command_error(&args, &stderr)),
        }
    }

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        for (k, v) in labels {
            args.extend(["--label".to_string(), format!("{}={}", k, v)]);
        }
        args.push(name.to_string());

        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(match classify(&stderr) {
            Failure::Unavailable => Error::EngineUnavailable(stderr.trim().to_string()),
            _ => self.command_error(&args, &stderr),
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let args = vec![
            "volume".to_string(),
            "rm".to_string(),
            "--force".to_string(),
            name.to_string(),
        ];
        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify(&stderr) {
            Failure::NotFound => Ok(()),
            Failure::Unavailable => Err(Error::EngineUnavailable(stderr.trim().to_string())),
            _ => Err(self.command_error(&args, &stderr)),
        }
    }

    async fn run_ephemeral(&self, run: &EphemeralRun) -> Result<String> {
        let args = run.to_args();
        let output = self.invoke(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(match classify(&stderr) {
                Failure::Unavailable => Error::EngineUnavailable(stderr.trim().to_string()),
                Failure::ImageMissing => Error::ImageMissing {
                    image: run.image.clone(),
                    detail: stderr.trim().to_string(),
                },
                _ => Error::EngineCommand {
                    command: format!("{} run {}", self.binary, run.command.join(" ")),
                    detail: stderr.trim().to_string(),
                },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn_exec(&self, spec: &ExecSpec) -> Result<Child> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(spec.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::EngineUnavailable(format!("'{}' not found in PATH", self.binary))
            } else {
                Error::EngineUnavailable(format!("failed to spawn exec: {}", e))
            }
        })
    }

    async fn kill_exec(&self, container: &str, pid_file: &str) -> Result<()> {
        let args = vec![
            "exec".to_string(),
            container.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            PID_KILL_SCRIPT.to_string(),
            pid_file.to_string(),
        ];
        let output = self.invoke(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify(&stderr) {
            Failure::NotFound => Ok(()),
            Failure::Unavailable => Err(Error::EngineUnavailable(stderr.trim().to_string())),
            _ => Err(self.command_error(&args, &stderr)),
        }
    }
}

/// Parse one `name\tstate\tlabels` row from `ps`.
fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let mut parts = line.splitn(3, '\t');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let status = ContainerStatus::parse(parts.next().unwrap_or(""));
    let labels = parse_labels(parts.next().unwrap_or(""));
    Some(ContainerSummary {
        name: name.trim_start_matches('/').to_string(),
        status,
        labels,
    })
}

/// Accepts Docker's `k=v,k2=v2` and Podman's `map[k:v k2:v2]`.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    let raw = raw.trim();
    let mut labels = BTreeMap::new();

    if let Some(inner) = raw.strip_prefix("map[").and_then(|s| s.strip_suffix(']')) {
        for pair in inner.split_whitespace() {
            if let Some((k, v)) = pair.split_once(':') {
                labels.insert(k.to_string(), v.to_string());
            }
        }
        return labels;
    }

    for pair in raw.split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            labels.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineRuntime;

    #[test]
    fn status_parsing() {
        assert_eq!(ContainerStatus::parse("running\n"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::parse("Created"), ContainerStatus::Created);
        assert_eq!(ContainerStatus::parse("dead"), ContainerStatus::Dead);
        assert_eq!(ContainerStatus::parse(""), ContainerStatus::Absent);
        assert_eq!(
            ContainerStatus::parse("weird"),
            ContainerStatus::Unknown("weird".into())
        );
    }

    #[test]
    fn stderr_classification() {
        assert_eq!(
            classify("Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"),
            Failure::Unavailable
        );
        assert_eq!(
            classify("Error response from daemon: container 4f2a is not running"),
            Failure::NotFound
        );
        assert_eq!(
            classify("Error: No such object: agentbox-x"),
            Failure::NotFound
        );
        assert_eq!(
            classify("Error response from daemon: No such container: agentbox-x"),
            Failure::NotFound
        );
        assert_eq!(
            classify("Unable to find image 'agentbox-runtime:latest' locally"),
            Failure::ImageMissing
        );
        assert_eq!(classify("Error: image not known"), Failure::ImageMissing);
        assert_eq!(classify("Conflict. The container name is already in use"), Failure::Other);
    }

    #[test]
    fn ps_rows_parse_docker_and_podman_labels() {
        let docker = parse_ps_line("agentbox-a\trunning\tapp=agentbox,env=a,config_hash=abc").unwrap();
        assert_eq!(docker.name, "agentbox-a");
        assert_eq!(docker.status, ContainerStatus::Running);
        assert_eq!(docker.label("env"), Some("a"));
        assert_eq!(docker.label("config_hash"), Some("abc"));

        let podman = parse_ps_line("agentbox-b\texited\tmap[app:agentbox env:b]").unwrap();
        assert_eq!(podman.status, ContainerStatus::Exited);
        assert_eq!(podman.label("app"), Some("agentbox"));
        assert_eq!(podman.label("env"), Some("b"));

        assert!(parse_ps_line("").is_none());
        let bare = parse_ps_line("agentbox-session-1\texited\t").unwrap();
        assert!(bare.labels.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_engine_unavailable() {
        let engine = CliEngine {
            binary: "agentbox-no-such-engine-binary".into(),
            command_timeout: Duration::from_secs(5),
            status_retries: 1,
        };
        let err = engine.container_status("x").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::EngineUnavailable);
        let err = engine.version().await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn new_uses_runtime_binary() {
        let config = EngineConfig {
            runtime: EngineRuntime::Podman,
            ..EngineConfig::default()
        };
        assert_eq!(CliEngine::new(&config).binary(), "podman");
    }
}
