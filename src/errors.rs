// Install error taxonomy.
//
// Every fatal error names the phase/service responsible; nothing is reported
// as a bare "installation failed".

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    /// Base template missing or structurally invalid.
    #[error("template error: {0}")]
    Template(String),

    /// Bad user input (domain/port/toggles). Reported immediately, no retry.
    #[error("invalid install intent: {0}")]
    Validation(String),

    /// Filesystem refused an ownership change. Fatal: retrying without
    /// elevated privilege cannot succeed.
    #[error("permission denied while {action} {}: {source}", path.display())]
    Permission {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Programming error in the static service topology.
    #[error("service topology error: {0}")]
    Topology(String),

    /// A service stayed unhealthy past its bounded wait.
    #[error("service '{service}' not healthy after {waited_secs}s ({detail})")]
    HealthTimeout {
        service: String,
        waited_secs: u64,
        detail: String,
    },

    /// A service process exited instead of becoming healthy.
    #[error("service '{service}' crashed during startup: {detail}")]
    ServiceCrash { service: String, detail: String },

    /// Account/space creation failed after the core service reported healthy.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Install session record could not be read/written, or is in a state
    /// that requires an explicit user decision (e.g. aborted).
    #[error("install session: {0}")]
    Session(String),

    /// An external command (docker/compose) failed in a way we could not
    /// attribute to a specific service.
    #[error("command '{operation}' failed: {detail}")]
    Command { operation: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl InstallError {
    /// Fatal errors stop the run with no automatic retry: repeating the
    /// same invocation cannot succeed without operator action (elevated
    /// privilege, corrected topology).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InstallError::Permission { .. } | InstallError::Topology(_)
        )
    }

    /// Whether the session record should be marked `Aborted`. Only a
    /// broken static topology is unrecoverable; a permission failure
    /// leaves the session at its last completed phase so a privileged
    /// re-run resumes it.
    pub fn aborts_session(&self) -> bool {
        matches!(self, InstallError::Topology(_))
    }

    /// The service this error is attributed to, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            InstallError::HealthTimeout { service, .. }
            | InstallError::ServiceCrash { service, .. } => Some(service),
            _ => None,
        }
    }
}

pub type Result<T, E = InstallError> = std::result::Result<T, E>;
