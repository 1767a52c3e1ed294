//! Host-side home directories for environments.
//!
//! Each environment owns `<data_root>/sandbox/envs/<slug>/home`, bind-mounted
//! read-write at the container's home path. Because everything lives under
//! the data root, copying that one tree to another machine carries every
//! environment's state with it.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{ContainerConfig, DataMount, Ownership};
use crate::error::{Error, Result};
use crate::paths::Paths;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Where the alternate data mount lands when nested mounts are unavailable.
pub const ALTERNATE_DATA_PATH: &str = "/workspace";

#[derive(Debug, Clone)]
pub struct HomeDirectoryManager {
    envs_dir: PathBuf,
    shared_dir: PathBuf,
    container_home: String,
    data_mount: DataMount,
    data_subdir: String,
    ownership: Ownership,
    uid: u32,
    gid: u32,
}

impl HomeDirectoryManager {
    pub fn new(paths: &Paths, container: &ContainerConfig) -> Self {
        Self {
            envs_dir: paths.envs_dir(),
            shared_dir: paths.shared_data_dir(),
            container_home: container.home_path.clone(),
            data_mount: container.data_mount,
            data_subdir: container.data_subdir.clone(),
            ownership: container.ownership,
            uid: container.runtime_uid,
            gid: container.runtime_gid,
        }
    }

    /// Host path of the environment's home. Pure.
    pub fn path(&self, slug: &str) -> PathBuf {
        self.envs_dir.join(slug).join("home")
    }

    pub fn exists(&self, slug: &str) -> bool {
        self.path(slug).is_dir()
    }

    /// Host directory mounted read-only into every workload.
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn container_home(&self) -> &str {
        &self.container_home
    }

    /// In-container path of the read-only shared data tree.
    pub fn shared_mount_target(&self) -> String {
        match self.data_mount {
            DataMount::Nested => format!(
                "{}/{}",
                self.container_home.trim_end_matches('/'),
                self.data_subdir.trim_matches('/')
            ),
            DataMount::Alternate => ALTERNATE_DATA_PATH.to_string(),
        }
    }

    /// Create the home (and the shared tree) if missing and hand it to the
    /// container's runtime user. Never touches existing contents.
    pub fn ensure(&self, slug: &str) -> Result<PathBuf> {
        let home = self.path(slug);
        let created = !home.exists();

        fs::create_dir_all(&home)?;
        #[cfg(unix)]
        fs::set_permissions(&home, fs::Permissions::from_mode(0o700))?;
        fs::create_dir_all(&self.shared_dir)?;

        match self.ownership {
            Ownership::Chown => self.chown(&home)?,
            Ownership::Userns => {
                debug!("Skipping chown of {} (userns ownership)", home.display())
            }
        }

        if created {
            info!("Created home directory {}", home.display());
        }
        Ok(home)
    }

    /// Delete `<envs_dir>/<slug>` and everything under it. Absent is fine.
    pub fn remove(&self, slug: &str) -> Result<()> {
        let dir = self.envs_dir.join(slug);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Removed home directory {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn chown(&self, home: &Path) -> Result<()> {
        std::os::unix::fs::chown(home, Some(self.uid), Some(self.gid)).map_err(|source| {
            Error::HomeOwnership {
                path: home.display().to_string(),
                uid: self.uid,
                gid: self.gid,
                source,
            }
        })
    }

    #[cfg(not(unix))]
    fn chown(&self, _home: &Path) -> Result<()> {
        Ok(())
    }
}
