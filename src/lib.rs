//! agentbox - persistent, hardened container sandboxes for agent sessions
//!
//! This crate provides:
//! - Config identity hashing for sandbox profiles
//! - Container lifecycle over a Docker/Podman engine, with per-identity locks
//! - Host-visible home directories and shared read-only package caches
//! - A line-delimited exec protocol for running one agent turn at a time
//! - Startup reconciliation against durable environment records

pub mod concurrency;
pub mod config;
pub mod error;
pub mod paths;
pub mod sandbox;
pub mod store;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use sandbox::SandboxOrchestrator;
