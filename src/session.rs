// Persisted install session record.
//
// One JSON file per install target. The record is created at install start,
// rewritten after every phase transition, and never deleted implicitly; the
// user resets it explicitly with --reset-session.

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, info};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::errors::{InstallError, Result};

pub const SESSION_VERSION: u32 = 1;

/// Credential names generated at session creation.
pub const CRED_POSTGRES_PASSWORD: &str = "postgres_password";
pub const CRED_REGISTRATION_SECRET: &str = "registration_shared_secret";
pub const CRED_ADMIN_PASSWORD: &str = "admin_password";
pub const CRED_SUPPORT_PASSWORD: &str = "support_password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallPhase {
    NotStarted,
    ConfigGenerated,
    PermissionsSet,
    ServicesHealthy,
    Provisioned,
    Complete,
    Aborted,
}

impl InstallPhase {
    /// Ordinal used for resume comparisons. `Aborted` is terminal and
    /// deliberately outside the forward ordering.
    pub fn rank(self) -> u8 {
        match self {
            InstallPhase::NotStarted => 0,
            InstallPhase::ConfigGenerated => 1,
            InstallPhase::PermissionsSet => 2,
            InstallPhase::ServicesHealthy => 3,
            InstallPhase::Provisioned => 4,
            InstallPhase::Complete => 5,
            InstallPhase::Aborted => u8::MAX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstallPhase::NotStarted => "notStarted",
            InstallPhase::ConfigGenerated => "configGenerated",
            InstallPhase::PermissionsSet => "permissionsSet",
            InstallPhase::ServicesHealthy => "servicesHealthy",
            InstallPhase::Provisioned => "provisioned",
            InstallPhase::Complete => "complete",
            InstallPhase::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSession {
    pub version: u32,
    pub domain: String,
    pub port: u16,
    /// Generated secrets by name. Never logged raw.
    pub credentials: BTreeMap<String, String>,
    pub phase: InstallPhase,
    /// Completion timestamp per phase, keyed by InstallPhase::as_str().
    pub phase_completed_at: BTreeMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstallSession {
    /// Create a fresh session for an install target, generating all
    /// credentials up front so re-runs reuse the same secrets.
    pub fn new(domain: &str, port: u16) -> Result<Self> {
        let rng = SystemRandom::new();
        let mut credentials = BTreeMap::new();
        for name in [
            CRED_POSTGRES_PASSWORD,
            CRED_REGISTRATION_SECRET,
            CRED_ADMIN_PASSWORD,
            CRED_SUPPORT_PASSWORD,
        ] {
            credentials.insert(name.to_string(), generate_secret(&rng)?);
        }
        let now = Utc::now();
        Ok(Self {
            version: SESSION_VERSION,
            domain: domain.to_string(),
            port,
            credentials,
            phase: InstallPhase::NotStarted,
            phase_completed_at: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn credential(&self, name: &str) -> Result<&str> {
        self.credentials
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| InstallError::Session(format!("credential '{}' missing from session", name)))
    }

    /// True if `phase` (a forward phase) has already been completed.
    pub fn completed(&self, phase: InstallPhase) -> bool {
        self.phase != InstallPhase::Aborted && self.phase.rank() >= phase.rank()
    }

    /// Load the session record if one exists.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let session: InstallSession = serde_json::from_str(&raw).map_err(|e| {
            InstallError::Session(format!(
                "corrupt session record at {} ({}); use --reset-session to discard it",
                path.display(),
                e
            ))
        })?;
        if session.version != SESSION_VERSION {
            return Err(InstallError::Session(format!(
                "session record version {} is not supported (expected {})",
                session.version, SESSION_VERSION
            )));
        }
        debug!(
            "[PHASE: session] [STEP: load] loaded session (phase={}, domain={})",
            session.phase.as_str(),
            session.domain
        );
        Ok(Some(session))
    }

    /// Persist the record atomically (write temp file, then rename) with
    /// owner-only permissions; it holds secrets.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| InstallError::Session(format!("serialize session: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Mark `phase` complete and persist before any later phase begins.
    pub fn advance(&mut self, phase: InstallPhase, path: &Path) -> Result<()> {
        let now = Utc::now();
        self.phase = phase;
        self.phase_completed_at
            .insert(phase.as_str().to_string(), now);
        self.updated_at = now;
        self.save(path)?;
        info!(
            "[PHASE: session] [STEP: advance] phase '{}' persisted",
            phase.as_str()
        );
        Ok(())
    }

    /// Terminal abort on fatal errors (permission/topology).
    pub fn abort(&mut self, path: &Path) -> Result<()> {
        self.phase = InstallPhase::Aborted;
        self.updated_at = Utc::now();
        self.save(path)
    }
}

/// 32 random bytes, base64 url-safe encoded (43 chars, no padding).
fn generate_secret(rng: &SystemRandom) -> Result<String> {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes)
        .map_err(|_| InstallError::Session("secure random generation failed".into()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}
