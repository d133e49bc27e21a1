//! Installer for a single-host Matrix homeserver stack.
//!
//! Turns an install intent (domain, port) into a running, provisioned
//! docker compose deployment: Postgres, Synapse, Element and the Synapse
//! admin console. Handles config templating, ownership transfer to the
//! container runtime identities, dependency-ordered startup with health
//! gating, restart-loop suppression during install, post-install account
//! and space provisioning, and idempotent resume from a persisted session
//! record.

pub mod compose;
pub mod config;
pub mod errors;
pub mod intent;
pub mod logsetup;
pub mod orchestrator;
pub mod paths;
pub mod permissions;
pub mod process;
pub mod provision;
pub mod sequencer;
pub mod session;
pub mod topology;

pub use errors::{InstallError, Result};
pub use intent::InstallIntent;
pub use orchestrator::{InstallOrchestrator, InstallOutcome};
pub use paths::InstallPaths;
pub use session::{InstallPhase, InstallSession};
