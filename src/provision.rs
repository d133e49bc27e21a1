// Post-install provisioning against the Synapse administrative interface.
//
// Shared-secret registration: fetch a nonce, MAC
// `nonce \0 user \0 password \0 admin|notadmin` with HMAC-SHA1 keyed by
// the homeserver's registration_shared_secret, POST the registration.
// "Already exists" responses are successes: the contract is "account
// exists with these properties", not "account was newly created".

use async_trait::async_trait;
use log::{info, warn};
use ring::hmac;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{InstallError, Result};
use crate::session::{
    InstallSession, CRED_ADMIN_PASSWORD, CRED_REGISTRATION_SECRET, CRED_SUPPORT_PASSWORD,
};

/// Account/space provisioning against a healthy core service. The
/// production implementation talks to the local Synapse admin API; tests
/// substitute their own.
#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    async fn provision(&self, session: &InstallSession) -> Result<()>;
}

pub struct SynapseProvisioner;

#[async_trait]
impl AccountProvisioner for SynapseProvisioner {
    async fn provision(&self, session: &InstallSession) -> Result<()> {
        PostProvisioner::run(session).await
    }
}

pub const ADMIN_USERNAME: &str = "admin";
pub const SUPPORT_USERNAME: &str = "support";
/// Alias localpart of the root space all further spaces hang off.
pub const ROOT_SPACE_ALIAS: &str = "root-space";
pub const ROOT_SPACE_NAME: &str = "Homeserver";

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
    errcode: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

pub struct PostProvisioner {
    client: reqwest::Client,
    /// Local (non-TLS) base URL of the core service, e.g.
    /// `http://127.0.0.1:8008`.
    base_url: String,
    shared_secret: String,
}

impl PostProvisioner {
    pub fn new(port: u16, shared_secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: format!("http://127.0.0.1:{}", port),
            shared_secret,
        }
    }

    /// Create the administrative and auxiliary accounts, then the root
    /// space. Safe to re-run: existing accounts/spaces are successes.
    pub async fn run(session: &InstallSession) -> Result<()> {
        let provisioner = Self::new(
            session.port,
            session.credential(CRED_REGISTRATION_SECRET)?.to_string(),
        );

        provisioner
            .ensure_account(ADMIN_USERNAME, session.credential(CRED_ADMIN_PASSWORD)?, true)
            .await?;
        provisioner
            .ensure_account(
                SUPPORT_USERNAME,
                session.credential(CRED_SUPPORT_PASSWORD)?,
                false,
            )
            .await?;
        provisioner
            .ensure_root_space(
                ADMIN_USERNAME,
                session.credential(CRED_ADMIN_PASSWORD)?,
            )
            .await?;
        Ok(())
    }

    async fn fetch_nonce(&self) -> Result<String> {
        let url = format!("{}/_synapse/admin/v1/register", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            InstallError::Provision(format!(
                "admin interface unreachable after health was reported ({}): {}",
                url, e
            ))
        })?;
        if !resp.status().is_success() {
            return Err(InstallError::Provision(format!(
                "nonce request returned {}",
                resp.status()
            )));
        }
        let body: NonceResponse = resp
            .json()
            .await
            .map_err(|e| InstallError::Provision(format!("malformed nonce response: {}", e)))?;
        Ok(body.nonce)
    }

    /// Ensure `username` exists with the given password/admin bit.
    pub async fn ensure_account(&self, username: &str, password: &str, admin: bool) -> Result<()> {
        let nonce = self.fetch_nonce().await?;
        let mac = registration_mac(&self.shared_secret, &nonce, username, password, admin);

        let url = format!("{}/_synapse/admin/v1/register", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "nonce": nonce,
                "username": username,
                "password": password,
                "admin": admin,
                "mac": mac,
            }))
            .send()
            .await
            .map_err(|e| {
                InstallError::Provision(format!("registration request failed: {}", e))
            })?;

        let status = resp.status();
        if status.is_success() {
            info!(
                "[PHASE: provision] [STEP: account] user '{}' registered (admin={})",
                username, admin
            );
            return Ok(());
        }

        let body: MatrixErrorBody = resp.json().await.unwrap_or(MatrixErrorBody {
            errcode: None,
            error: None,
        });
        if body.errcode.as_deref() == Some("M_USER_IN_USE") {
            info!(
                "[PHASE: provision] [STEP: account] user '{}' already exists",
                username
            );
            return Ok(());
        }

        Err(InstallError::Provision(format!(
            "registering '{}' failed with {} ({})",
            username,
            status,
            body.error
                .or(body.errcode)
                .unwrap_or_else(|| "no error body".into())
        )))
    }

    /// Ensure the root space exists, creating it as the admin user.
    pub async fn ensure_root_space(&self, admin_user: &str, admin_password: &str) -> Result<()> {
        let token = self.login(admin_user, admin_password).await?;

        let url = format!("{}/_matrix/client/v3/createRoom", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({
                "name": ROOT_SPACE_NAME,
                "topic": "Root space for this homeserver",
                "preset": "private_chat",
                "room_alias_name": ROOT_SPACE_ALIAS,
                "creation_content": { "type": "m.space" },
            }))
            .send()
            .await
            .map_err(|e| InstallError::Provision(format!("createRoom request failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            info!("[PHASE: provision] [STEP: space] root space ensured");
            return Ok(());
        }

        let body: MatrixErrorBody = resp.json().await.unwrap_or(MatrixErrorBody {
            errcode: None,
            error: None,
        });
        // Alias taken: the space already exists from a previous run.
        if body.errcode.as_deref() == Some("M_ROOM_IN_USE") {
            info!("[PHASE: provision] [STEP: space] root space already exists");
            return Ok(());
        }

        warn!(
            "[PHASE: provision] [STEP: space] createRoom failed with {}",
            status
        );
        Err(InstallError::Provision(format!(
            "creating root space failed with {} ({})",
            status,
            body.error
                .or(body.errcode)
                .unwrap_or_else(|| "no error body".into())
        )))
    }

    async fn login(&self, username: &str, password: &str) -> Result<String> {
        let url = format!("{}/_matrix/client/v3/login", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "type": "m.login.password",
                "identifier": { "type": "m.id.user", "user": username },
                "password": password,
            }))
            .send()
            .await
            .map_err(|e| InstallError::Provision(format!("login request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            // Credential rejection after health was reported is a genuine
            // provisioning failure, not a health false positive.
            return Err(InstallError::Provision(format!(
                "login as '{}' rejected with {}",
                username, status
            )));
        }
        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|e| InstallError::Provision(format!("malformed login response: {}", e)))?;
        Ok(body.access_token)
    }
}

/// HMAC-SHA1 registration MAC as Synapse's shared-secret protocol
/// requires: fields joined by NUL bytes, hex-encoded digest. SHA1 is fixed
/// by the protocol, hence the legacy ring algorithm.
pub fn registration_mac(
    shared_secret: &str,
    nonce: &str,
    username: &str,
    password: &str,
    admin: bool,
) -> String {
    let key = hmac::Key::new(
        hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        shared_secret.as_bytes(),
    );
    let mut msg = Vec::new();
    msg.extend_from_slice(nonce.as_bytes());
    msg.push(0);
    msg.extend_from_slice(username.as_bytes());
    msg.push(0);
    msg.extend_from_slice(password.as_bytes());
    msg.push(0);
    msg.extend_from_slice(if admin { b"admin" } else { b"notadmin" });
    let tag = hmac::sign(&key, &msg);
    hex_encode(tag.as_ref())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
