//! Durable environment records.
//!
//! Stand-in for the session/workspace database that owns environments in a
//! full deployment. Records live in `<state_dir>/envs.json`; every mutation
//! takes an exclusive `fs2` lock on the sibling `envs.json.lock`, re-reads
//! the file, applies the change and writes it back atomically (temp file +
//! rename). Concurrent handles, in this process or another, never lose each
//! other's updates.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sandbox::identity::{ConfigHash, SandboxProfile, TrustLevel};

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("valid regex"));

/// Container names are limited to 63 characters; leave room for the prefix.
const MAX_SLUG_LEN: usize = 48;

pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.len() > MAX_SLUG_LEN {
        return Err(Error::invalid_config(format!(
            "environment slug '{}' is longer than {} characters",
            slug, MAX_SLUG_LEN
        )));
    }
    if !SLUG_RE.is_match(slug) {
        return Err(Error::invalid_config(format!(
            "environment slug '{}' must match [a-z0-9][a-z0-9-]*",
            slug
        )));
    }
    Ok(())
}

/// The durable unit of isolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEnv {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub config_hash: ConfigHash,
    pub created_at: DateTime<Utc>,
    /// Shared (named) environments keep their home when the last session leaves
    #[serde(default)]
    pub shared: bool,
    pub profile: SandboxProfile,
    /// Sessions currently referencing this environment
    #[serde(default)]
    pub sessions: BTreeSet<String>,
}

impl ContainerEnv {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.slug)
    }
}

/// A session as seen by the sandbox layer. Owned elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
    pub trust_level: TrustLevel,
    pub workspace_id: String,
    #[serde(default)]
    pub container_env_id: Option<String>,
}

/// Read access to environment records, as reconciliation and teardown need it.
#[cfg_attr(test, mockall::automock)]
pub trait EnvRegistry: Send + Sync {
    /// Slugs of every environment that still exists.
    fn live_slugs(&self) -> Result<HashSet<String>>;

    fn get(&self, slug: &str) -> Result<Option<ContainerEnv>>;

    /// Number of sessions referencing the environment.
    fn session_refs(&self, slug: &str) -> Result<usize>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EnvFile {
    #[serde(default)]
    envs: BTreeMap<String, ContainerEnv>,
}

/// Releases the store's file lock on drop.
struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// JSON-file backed environment records.
#[derive(Debug)]
pub struct EnvStore {
    path: PathBuf,
    // Serializes read-modify-write within this process
    write_lock: Mutex<()>,
}

impl EnvStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<EnvFile> {
        if !self.path.exists() {
            return Ok(EnvFile::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(EnvFile::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            Error::Store(format!("{} is corrupt: {}", self.path.display(), e))
        })
    }

    fn write(&self, file: &EnvFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(file)?;

        let tmp_path = self.path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().as_simple()
        ));
        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!("Saved {} environment(s) to {:?}", file.envs.len(), self.path);
        Ok(())
    }

    /// `envs.json` -> `envs.json.lock`
    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("envs.json"));
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Blocking cross-process lock held for one read-modify-write.
    fn lock_file(&self) -> Result<FileLockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        file.lock_exclusive()?;
        Ok(FileLockGuard { file })
    }

    /// Lock, re-read, mutate, save.
    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut EnvFile) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = self.lock_file()?;
        let mut file = self.read()?;
        let out = f(&mut file)?;
        self.write(&file)?;
        Ok(out)
    }

    pub fn list(&self) -> Result<Vec<ContainerEnv>> {
        Ok(self.read()?.envs.into_values().collect())
    }

    /// The environment a session is attached to, if any.
    pub fn env_for_session(&self, session_id: &str) -> Result<Option<ContainerEnv>> {
        Ok(self
            .read()?
            .envs
            .into_values()
            .find(|env| env.sessions.contains(session_id)))
    }

    pub fn create(
        &self,
        slug: &str,
        display_name: Option<String>,
        shared: bool,
        profile: SandboxProfile,
    ) -> Result<ContainerEnv> {
        let env = new_env(slug, display_name, shared, profile)?;
        self.update(|file| {
            if file.envs.contains_key(slug) {
                return Err(Error::Store(format!("environment '{}' already exists", slug)));
            }
            file.envs.insert(slug.to_string(), env.clone());
            Ok(env)
        })
    }

    /// Reference `slug` from a session. A session belongs to one environment.
    pub fn attach(&self, slug: &str, session_id: &str) -> Result<ContainerEnv> {
        self.update(|file| attach_in(file, slug, session_id))
    }

    /// Look up `slug`, create it if missing, and attach the session, all
    /// under one lock. An existing record keeps its own profile.
    pub fn get_or_create_and_attach(
        &self,
        slug: &str,
        display_name: Option<String>,
        shared: bool,
        profile: SandboxProfile,
        session_id: &str,
    ) -> Result<ContainerEnv> {
        let candidate = new_env(slug, display_name, shared, profile)?;
        self.update(|file| {
            if !file.envs.contains_key(slug) {
                file.envs.insert(slug.to_string(), candidate);
            }
            attach_in(file, slug, session_id)
        })
    }

    /// Drop a session's reference. Returns the environment and how many
    /// references remain, or `None` if the session was not attached.
    pub fn detach(&self, session_id: &str) -> Result<Option<(ContainerEnv, usize)>> {
        self.update(|file| {
            let Some(env) = file
                .envs
                .values_mut()
                .find(|e| e.sessions.contains(session_id))
            else {
                return Ok(None);
            };
            env.sessions.remove(session_id);
            let remaining = env.sessions.len();
            Ok(Some((env.clone(), remaining)))
        })
    }

    /// The only mutation allowed on an existing environment.
    pub fn rename(&self, slug: &str, display_name: Option<String>) -> Result<ContainerEnv> {
        self.update(|file| {
            let env = file
                .envs
                .get_mut(slug)
                .ok_or_else(|| Error::Store(format!("no environment '{}'", slug)))?;
            env.display_name = display_name.filter(|n| !n.trim().is_empty());
            Ok(env.clone())
        })
    }

    /// Delete the record. Returns whether it existed.
    pub fn remove(&self, slug: &str) -> Result<bool> {
        self.update(|file| Ok(file.envs.remove(slug).is_some()))
    }
}

fn new_env(
    slug: &str,
    display_name: Option<String>,
    shared: bool,
    profile: SandboxProfile,
) -> Result<ContainerEnv> {
    validate_slug(slug)?;
    profile.limits.validate()?;
    let config_hash = profile.config_hash()?;
    Ok(ContainerEnv {
        slug: slug.to_string(),
        display_name,
        config_hash,
        created_at: Utc::now(),
        shared,
        profile,
        sessions: BTreeSet::new(),
    })
}

fn attach_in(file: &mut EnvFile, slug: &str, session_id: &str) -> Result<ContainerEnv> {
    if let Some(other) = file
        .envs
        .values()
        .find(|e| e.slug != slug && e.sessions.contains(session_id))
    {
        return Err(Error::Store(format!(
            "session '{}' is already attached to '{}'",
            session_id, other.slug
        )));
    }
    let env = file
        .envs
        .get_mut(slug)
        .ok_or_else(|| Error::Store(format!("no environment '{}'", slug)))?;
    env.sessions.insert(session_id.to_string());
    Ok(env.clone())
}

impl EnvRegistry for EnvStore {
    fn live_slugs(&self) -> Result<HashSet<String>> {
        Ok(self.read()?.envs.into_keys().collect())
    }

    fn get(&self, slug: &str) -> Result<Option<ContainerEnv>> {
        Ok(self.read()?.envs.remove(slug))
    }

    fn session_refs(&self, slug: &str) -> Result<usize> {
        Ok(self
            .read()?
            .envs
            .get(slug)
            .map(|e| e.sessions.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::sandbox::identity::ResourceLimits;

    fn profile() -> SandboxProfile {
        SandboxProfile::new(
            TrustLevel::Standard,
            ResourceLimits::from(&LimitsConfig::default()),
        )
    }

    fn store(dir: &Path) -> EnvStore {
        EnvStore::open(dir.join("envs.json"))
    }

    #[test]
    fn slug_validation() {
        assert!(validate_slug("proj-alpha").is_ok());
        assert!(validate_slug("s-0123456789ab").is_ok());
        assert!(validate_slug("-lead").is_err());
        assert!(validate_slug("Upper").is_err());
        assert!(validate_slug("has_underscore").is_err());
        assert!(validate_slug("").is_err());
        assert!(validate_slug(&"a".repeat(MAX_SLUG_LEN + 1)).is_err());
    }

    #[test]
    fn create_persists_and_rejects_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());

        let env = s.create("proj-alpha", Some("Alpha".into()), true, profile()).unwrap();
        assert_eq!(env.config_hash, profile().config_hash().unwrap());
        assert!(s.create("proj-alpha", None, true, profile()).is_err());

        let reopened = store(tmp.path());
        let got = reopened.get("proj-alpha").unwrap().unwrap();
        assert_eq!(got, env);
        assert_eq!(got.label(), "Alpha");
    }

    #[test]
    fn attach_detach_counts_references() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.create("shared", None, true, profile()).unwrap();

        s.attach("shared", "sess-1").unwrap();
        s.attach("shared", "sess-2").unwrap();
        assert_eq!(s.session_refs("shared").unwrap(), 2);
        assert_eq!(s.env_for_session("sess-2").unwrap().unwrap().slug, "shared");

        let (env, remaining) = s.detach("sess-1").unwrap().unwrap();
        assert_eq!(env.slug, "shared");
        assert_eq!(remaining, 1);
        assert!(s.detach("sess-1").unwrap().is_none());
        assert_eq!(s.detach("sess-2").unwrap().unwrap().1, 0);
    }

    #[test]
    fn session_cannot_join_two_environments() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.create("a", None, true, profile()).unwrap();
        s.create("b", None, true, profile()).unwrap();
        s.attach("a", "sess").unwrap();
        assert!(s.attach("b", "sess").is_err());
        // Re-attaching to the same environment is a no-op
        s.attach("a", "sess").unwrap();
        assert_eq!(s.session_refs("a").unwrap(), 1);
    }

    #[test]
    fn rename_only_touches_display_name() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let before = s.create("a", None, false, profile()).unwrap();
        let after = s.rename("a", Some("Renamed".into())).unwrap();
        assert_eq!(after.display_name.as_deref(), Some("Renamed"));
        assert_eq!(after.config_hash, before.config_hash);
        assert_eq!(after.created_at, before.created_at);

        let cleared = s.rename("a", Some("  ".into())).unwrap();
        assert_eq!(cleared.display_name, None);
        assert!(s.rename("missing", None).is_err());
    }

    #[test]
    fn remove_and_live_slugs() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.create("a", None, false, profile()).unwrap();
        s.create("b", None, false, profile()).unwrap();
        assert!(s.remove("a").unwrap());
        assert!(!s.remove("a").unwrap());
        let live = s.live_slugs().unwrap();
        assert_eq!(live.len(), 1);
        assert!(live.contains("b"));
    }

    #[test]
    fn get_or_create_and_attach_reuses_existing_record() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let first = s
            .get_or_create_and_attach("team", Some("Team".into()), true, profile(), "sess-1")
            .unwrap();

        let mut other = profile();
        other.limits.memory = "1g".into();
        let second = s
            .get_or_create_and_attach("team", None, true, other, "sess-2")
            .unwrap();
        assert_eq!(second.config_hash, first.config_hash);
        assert_eq!(second.display_name.as_deref(), Some("Team"));
        assert_eq!(s.session_refs("team").unwrap(), 2);

        // A failed attach leaves no half-created record behind
        assert!(s
            .get_or_create_and_attach("other", None, true, profile(), "sess-1")
            .is_err());
        assert!(s.get("other").unwrap().is_none());
    }

    #[test]
    fn two_handles_on_one_file_keep_every_record() {
        let tmp = tempfile::tempdir().unwrap();
        let a = store(tmp.path());
        let b = store(tmp.path());

        std::thread::scope(|scope| {
            for (prefix, handle) in [("a", &a), ("b", &b)] {
                scope.spawn(move || {
                    for i in 0..25 {
                        handle
                            .create(&format!("{}-{}", prefix, i), None, false, profile())
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(a.list().unwrap().len(), 50);
        assert!(tmp.path().join("envs.json.lock").exists());
    }

    #[test]
    fn corrupt_file_is_an_error_not_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        fs::write(s.path(), "{ not json").unwrap();
        let err = s.live_slugs().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Store);
    }

    #[test]
    fn atomic_save_leaves_no_tmp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        for i in 0..5 {
            s.create(&format!("env-{}", i), None, false, profile()).unwrap();
        }
        let tmp_files: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(tmp_files.is_empty(), "found {:?}", tmp_files);
        assert_eq!(s.list().unwrap().len(), 5);
    }
}
