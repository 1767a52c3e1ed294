//! Persistent, hardened container sandboxes.
//!
//! One container plus one host-visible home directory per environment:
//!
//! - [`identity`]: config hash over trust level, capabilities and limits
//! - [`engine`]: Docker/Podman boundary, async only
//! - [`hardening`]: typed creation arguments
//! - [`home`]: `<data_root>/sandbox/envs/<slug>/home`
//! - [`cache`]: shared read-only package caches and the cache builder
//! - [`lifecycle`]: ensure / teardown / reconcile under per-identity locks
//! - [`exec`], [`events`]: one turn over `exec -i` and its NDJSON stream
//! - [`orchestrator`]: the facade the rest of the platform talks to

pub mod cache;
pub mod engine;
pub mod events;
pub mod exec;
pub mod hardening;
pub mod home;
pub mod identity;
pub mod lifecycle;
pub mod orchestrator;

pub use cache::{CacheVolumeManager, Ecosystem, VolumeSize};
pub use engine::{CliEngine, ContainerEngine, ContainerStatus, ContainerSummary, ListFilter};
pub use events::Event;
pub use exec::{
    EventStream, ExecSessionRunner, ExecSettings, Secret, TurnCapabilities, TurnContext,
    TurnRequest,
};
pub use home::HomeDirectoryManager;
pub use identity::{ConfigHash, ResourceLimits, SandboxProfile, TrustLevel};
pub use lifecycle::{ContainerHandle, ContainerLifecycleManager, ReconcileReport};
pub use orchestrator::{InspectReport, OpenSession, SandboxOrchestrator};
