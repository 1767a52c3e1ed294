//! Error taxonomy for sandbox provisioning and execution.
//!
//! Lifecycle failures that happen before a turn starts are returned as
//! [`Error`]. Failures that happen during a turn (timeout, OOM, workload
//! crash) are never returned; the exec runner turns them into `error`
//! events on the turn's stream, coded by [`ErrorKind::code`].

use std::io;

/// Coarse classification of an [`Error`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EngineUnavailable,
    ImageMissing,
    ContainerCreateFailed,
    ContainerBadState,
    EngineCommand,
    ExecFailed,
    ExecTimeout,
    OomKilled,
    WorkloadExit,
    InvalidConfig,
    HomeOwnership,
    Store,
    Io,
}

impl ErrorKind {
    /// Machine-readable code carried on `error` events and in CLI output.
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::EngineUnavailable => "engine_unavailable",
            ErrorKind::ImageMissing => "image_missing",
            ErrorKind::ContainerCreateFailed => "container_create_failed",
            ErrorKind::ContainerBadState => "container_bad_state",
            ErrorKind::EngineCommand => "engine_command",
            ErrorKind::ExecFailed => "exec_failed",
            ErrorKind::ExecTimeout => "timeout",
            ErrorKind::OomKilled => "oom",
            ErrorKind::WorkloadExit => "workload_exit",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::HomeOwnership => "home_ownership",
            ErrorKind::Store => "store",
            ErrorKind::Io => "io",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The engine daemon or CLI could not be reached.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("container image '{image}' is not present; pull or build it first ({detail})")]
    ImageMissing { image: String, detail: String },

    #[error("engine rejected creation of container '{name}': {detail}")]
    ContainerCreateFailed { name: String, detail: String },

    #[error("container '{name}' is in unexpected state '{state}'")]
    ContainerBadState { name: String, state: String },

    /// Any other engine CLI failure (volume ops, ephemeral runs, stop).
    #[error("`{command}` failed: {detail}")]
    EngineCommand { command: String, detail: String },

    #[error("failed to start the sandboxed agent: {0}")]
    ExecFailed(String),

    #[error("the agent did not finish within {secs}s and was stopped")]
    ExecTimeout { secs: u64 },

    #[error(
        "sandbox '{name}' ran out of memory and was reset; it will be recreated on the next message"
    )]
    OomKilled { name: String },

    /// The workload died without reporting a result or error itself.
    #[error("the sandboxed agent exited unexpectedly (exit code {status})")]
    WorkloadExit { status: String },

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "cannot give {path} to uid {uid}: {source}. Run the one-time ownership fix \
         (`sudo chown -R {uid}:{gid} <data_dir>/sandbox/envs`) or set \
         container.ownership = \"userns\" for rootless engines"
    )]
    HomeOwnership {
        path: String,
        uid: u32,
        gid: u32,
        #[source]
        source: io::Error,
    },

    #[error("environment store: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            Error::ImageMissing { .. } => ErrorKind::ImageMissing,
            Error::ContainerCreateFailed { .. } => ErrorKind::ContainerCreateFailed,
            Error::ContainerBadState { .. } => ErrorKind::ContainerBadState,
            Error::EngineCommand { .. } => ErrorKind::EngineCommand,
            Error::ExecFailed(_) => ErrorKind::ExecFailed,
            Error::ExecTimeout { .. } => ErrorKind::ExecTimeout,
            Error::OomKilled { .. } => ErrorKind::OomKilled,
            Error::WorkloadExit { .. } => ErrorKind::WorkloadExit,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::HomeOwnership { .. } => ErrorKind::HomeOwnership,
            Error::Store(_) => ErrorKind::Store,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Whether the caller should report "sandboxing unavailable" rather than
    /// a generic failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::EngineUnavailable | ErrorKind::ImageMissing
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
