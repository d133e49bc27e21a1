// Well-known filesystem layout for one install target.

use std::path::PathBuf;

/// Everything lives under one install root:
///
/// ```text
/// <root>/
///   install-session.json          session record (host-owned)
///   docker-compose.yml            rendered topology
///   docker-compose.override.yml   restart-policy override (install runs only)
///   synapse/homeserver.yaml       rendered core config
///   synapse/media_store/          synapse-owned at runtime
///   postgres/                     postgres-owned at runtime
///   element/config.json           web client config
///   templates/                    optional user template overrides
///   logs/
/// ```
#[derive(Debug, Clone)]
pub struct InstallPaths {
    pub root: PathBuf,
}

impl InstallPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn session_file(&self) -> PathBuf {
        self.root.join("install-session.json")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.root.join("docker-compose.yml")
    }

    pub fn override_file(&self) -> PathBuf {
        self.root.join("docker-compose.override.yml")
    }

    pub fn synapse_dir(&self) -> PathBuf {
        self.root.join("synapse")
    }

    pub fn homeserver_yaml(&self) -> PathBuf {
        self.synapse_dir().join("homeserver.yaml")
    }

    pub fn media_store_dir(&self) -> PathBuf {
        self.synapse_dir().join("media_store")
    }

    pub fn postgres_dir(&self) -> PathBuf {
        self.root.join("postgres")
    }

    pub fn element_dir(&self) -> PathBuf {
        self.root.join("element")
    }

    pub fn element_config(&self) -> PathBuf {
        self.element_dir().join("config.json")
    }

    pub fn template_override(&self) -> PathBuf {
        self.root.join("templates").join("homeserver.template.yaml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Default install root: `/opt/matrix-stack` for root, otherwise the
/// user's data dir (e.g. `~/.local/share/matrix-stack`).
pub fn default_install_root() -> PathBuf {
    if is_root_user() {
        return PathBuf::from("/opt/matrix-stack");
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("matrix-stack")
}

#[cfg(unix)]
fn is_root_user() -> bool {
    // /proc/self is owned by our effective uid.
    std::fs::metadata("/proc/self")
        .map(|m| {
            use std::os::unix::fs::MetadataExt;
            m.uid() == 0
        })
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_root_user() -> bool {
    false
}
