//! Typed container creation arguments.
//!
//! Every workload container is created from a [`CreateSpec`]. Security flags
//! live in [`Hardening`], whose fields are all mandatory, so a flag cannot be
//! dropped by omission. `to_args()` is the only place argv is rendered.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Network attachment for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// No interfaces besides loopback
    None,
    /// Engine default bridge, outbound allowed
    Bridge,
}

impl NetworkMode {
    fn as_arg(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
        }
    }
}

/// Security and resource flags applied to every workload container.
#[derive(Debug, Clone, PartialEq)]
pub struct Hardening {
    /// Run the engine's init as PID 1 (reaps exec'd orphans, forwards signals)
    pub init: bool,
    pub cap_drop_all: bool,
    pub no_new_privileges: bool,
    pub pids_limit: u32,
    pub memory_bytes: u64,
    /// CPU quota in thousandths of a core
    pub cpu_millis: u64,
    pub network: NetworkMode,
    /// "uid:gid"
    pub user: String,
}

impl Hardening {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.init {
            args.push("--init".to_string());
        }
        if self.cap_drop_all {
            args.extend(["--cap-drop".to_string(), "ALL".to_string()]);
        }
        if self.no_new_privileges {
            args.extend([
                "--security-opt".to_string(),
                "no-new-privileges".to_string(),
            ]);
        }
        args.extend(["--pids-limit".to_string(), self.pids_limit.to_string()]);
        args.extend(["--memory".to_string(), self.memory_bytes.to_string()]);
        // Disable swap on top of the memory limit so the OOM killer fires
        args.extend(["--memory-swap".to_string(), self.memory_bytes.to_string()]);
        args.extend(["--cpus".to_string(), format_cpus(self.cpu_millis)]);
        args.extend([
            "--network".to_string(),
            self.network.as_arg().to_string(),
        ]);
        args.extend(["--user".to_string(), self.user.clone()]);
        args
    }
}

fn format_cpus(millis: u64) -> String {
    format!("{}.{:03}", millis / 1000, millis % 1000)
}

#[derive(Debug, Clone, PartialEq)]
pub enum MountSource {
    /// Host path bind mount
    Bind(PathBuf),
    /// Engine-managed named volume
    Volume(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            source: MountSource::Bind(source.into()),
            target: target.into(),
            read_only,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            source: MountSource::Volume(name.into()),
            target: target.into(),
            read_only,
        }
    }

    /// `--mount` value in the engine's long syntax.
    pub fn to_arg(&self) -> String {
        let (kind, source) = match &self.source {
            MountSource::Bind(path) => ("bind", path.display().to_string()),
            MountSource::Volume(name) => ("volume", name.clone()),
        };
        let mut arg = format!("type={},source={},target={}", kind, source, self.target);
        if self.read_only {
            arg.push_str(",readonly");
        }
        arg
    }
}

/// Full argument set for creating one workload container.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub hardening: Hardening,
    pub command: Vec<String>,
}

impl CreateSpec {
    /// argv after the engine binary, starting with `create`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--pull".to_string(),
            "never".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];

        args.extend(self.hardening.to_args());

        for (k, v) in &self.labels {
            args.extend(["--label".to_string(), format!("{}={}", k, v)]);
        }
        for mount in &self.mounts {
            args.extend(["--mount".to_string(), mount.to_arg()]);
        }
        for (k, v) in &self.env {
            args.extend(["--env".to_string(), format!("{}={}", k, v)]);
        }
        if let Some(ref dir) = self.workdir {
            args.extend(["--workdir".to_string(), dir.clone()]);
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// A one-shot `run --rm` container (cache builder, size check).
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralRun {
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub network: NetworkMode,
    pub user: String,
    pub command: Vec<String>,
}

impl EphemeralRun {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--pull".to_string(),
            "never".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--network".to_string(),
            self.network.as_arg().to_string(),
            "--user".to_string(),
            self.user.clone(),
        ];
        for (k, v) in &self.labels {
            args.extend(["--label".to_string(), format!("{}={}", k, v)]);
        }
        for mount in &self.mounts {
            args.extend(["--mount".to_string(), mount.to_arg()]);
        }
        for (k, v) in &self.env {
            args.extend(["--env".to_string(), format!("{}={}", k, v)]);
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Records the wrapper's pid in the file named by `$0`, then replaces itself
/// with the real command so the pid stays valid.
const PID_WRAPPER: &str = r#"echo $$ > "$0" && exec "$@""#;

/// Kills the process recorded in `$0` and its direct children, then removes
/// the file. A missing file means the turn already finished.
pub const PID_KILL_SCRIPT: &str = r#"pid=$(cat "$0" 2>/dev/null) || exit 0
pkill -KILL -P "$pid" 2>/dev/null
kill -KILL "$pid" 2>/dev/null
rm -f "$0""#;

/// One `exec -i` invocation against a running container.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub container: String,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub command: Vec<String>,
    /// In-container file that receives the command's pid, so the process can
    /// be killed from the engine side. Killing the local `exec` client does
    /// not signal the process inside the container.
    pub pid_file: Option<String>,
}

impl ExecSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        for (k, v) in &self.env {
            args.extend(["--env".to_string(), format!("{}={}", k, v)]);
        }
        if let Some(ref dir) = self.workdir {
            args.extend(["--workdir".to_string(), dir.clone()]);
        }
        args.push(self.container.clone());
        if let Some(ref pid_file) = self.pid_file {
            args.extend([
                "sh".to_string(),
                "-c".to_string(),
                PID_WRAPPER.to_string(),
                pid_file.clone(),
            ]);
        }
        args.extend(self.command.iter().cloned());
        args
    }
}
