// Filesystem ownership coordination.
//
// Containers run with fixed uids (synapse 991, postgres 999) while the
// install tooling runs as the invoking host user. Ownership of the
// persistent data dirs is transferred to the runtime identities strictly
// before the first service start; the session record stays host-owned so
// the orchestrator can keep writing it afterwards.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::errors::{InstallError, Result};
use crate::paths::InstallPaths;

/// Runtime identity of the matrixdotorg/synapse image.
pub const SYNAPSE_UID: u32 = 991;
pub const SYNAPSE_GID: u32 = 991;
/// Runtime identity of the official postgres image.
pub const POSTGRES_UID: u32 = 999;
pub const POSTGRES_GID: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Path -> required runtime owner, applied at prepare_for_service_start.
#[derive(Debug, Clone)]
pub struct OwnershipPolicy {
    entries: Vec<(PathBuf, Ownership)>,
}

impl OwnershipPolicy {
    pub fn new(entries: Vec<(PathBuf, Ownership)>) -> Self {
        Self { entries }
    }

    /// The policy for the homeserver stack: synapse owns its config/media
    /// tree (it writes signing keys there on first boot), postgres owns
    /// its data dir.
    pub fn for_stack(paths: &InstallPaths) -> Self {
        Self {
            entries: vec![
                (
                    paths.synapse_dir(),
                    Ownership {
                        uid: SYNAPSE_UID,
                        gid: SYNAPSE_GID,
                    },
                ),
                (
                    paths.postgres_dir(),
                    Ownership {
                        uid: POSTGRES_UID,
                        gid: POSTGRES_GID,
                    },
                ),
            ],
        }
    }

    pub fn entries(&self) -> &[(PathBuf, Ownership)] {
        &self.entries
    }
}

pub struct PermissionCoordinator<'a> {
    paths: &'a InstallPaths,
    policy: OwnershipPolicy,
}

impl<'a> PermissionCoordinator<'a> {
    pub fn new(paths: &'a InstallPaths) -> Self {
        let policy = OwnershipPolicy::for_stack(paths);
        Self { paths, policy }
    }

    pub fn with_policy(paths: &'a InstallPaths, policy: OwnershipPolicy) -> Self {
        Self { paths, policy }
    }

    /// Create the persistent data directories, owned by the invoking host
    /// identity so install tooling can write templates and session state.
    pub fn prepare_for_setup(&self) -> Result<()> {
        for dir in [
            self.paths.root.clone(),
            self.paths.synapse_dir(),
            self.paths.media_store_dir(),
            self.paths.postgres_dir(),
            self.paths.element_dir(),
            self.paths.log_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| map_perm(e, "creating", &dir))?;
        }
        debug!(
            "[PHASE: permissions] [STEP: setup] data directories ready under {}",
            self.paths.root.display()
        );
        Ok(())
    }

    /// Transfer ownership of the service-owned paths to their runtime
    /// identities. Must run after config rendering and strictly before any
    /// service start (first boot writes secret material into these paths).
    pub fn prepare_for_service_start(&self) -> Result<()> {
        let session_file = self.paths.session_file();
        for (path, owner) in self.policy.entries() {
            chown_recursive(path, *owner, &session_file)?;
            info!(
                "[PHASE: permissions] [STEP: transfer] {} -> {}:{}",
                path.display(),
                owner.uid,
                owner.gid
            );
        }
        Ok(())
    }
}

/// Chown a tree to `owner`, skipping the session record if it ever appears
/// inside a transferred path.
fn chown_recursive(path: &Path, owner: Ownership, session_file: &Path) -> Result<()> {
    if path == session_file {
        return Ok(());
    }
    chown_one(path, owner)?;
    if path.is_dir() {
        let entries = std::fs::read_dir(path).map_err(|e| map_perm(e, "reading", path))?;
        for entry in entries {
            let entry = entry.map_err(|e| map_perm(e, "reading", path))?;
            chown_recursive(&entry.path(), owner, session_file)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn chown_one(path: &Path, owner: Ownership) -> Result<()> {
    std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
        .map_err(|e| map_perm(e, "changing ownership of", path))
}

#[cfg(not(unix))]
fn chown_one(_path: &Path, _owner: Ownership) -> Result<()> {
    Err(InstallError::Topology(
        "ownership transfer is only supported on unix hosts".into(),
    ))
}

fn map_perm(e: std::io::Error, action: &'static str, path: &Path) -> InstallError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        InstallError::Permission {
            action,
            path: path.to_path_buf(),
            source: e,
        }
    } else {
        InstallError::Io(e)
    }
}
