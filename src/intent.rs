// Install intent: the user-supplied parameters defining one install target.

use regex::Regex;

use crate::errors::{InstallError, Result};

/// Optional boolean feature toggles applied to the rendered homeserver
/// config. Only top-level keys Synapse understands are accepted.
pub const ALLOWED_TOGGLES: &[&str] = &["enable_registration", "report_stats"];

#[derive(Debug, Clone)]
pub struct InstallIntent {
    /// Hostname the homeserver is reachable under (also the Matrix
    /// server_name).
    pub domain: String,
    /// Host port published for the Synapse client/federation listener.
    pub port: u16,
    /// (toggle name, enabled) pairs, validated against ALLOWED_TOGGLES.
    pub toggles: Vec<(String, bool)>,
}

impl InstallIntent {
    pub fn new(domain: String, port: u16, toggles: Vec<(String, bool)>) -> Result<Self> {
        validate_hostname(&domain)?;
        validate_port(port)?;
        for (name, _) in &toggles {
            if !ALLOWED_TOGGLES.contains(&name.as_str()) {
                return Err(InstallError::Validation(format!(
                    "unknown feature toggle '{}' (allowed: {})",
                    name,
                    ALLOWED_TOGGLES.join(", ")
                )));
            }
        }
        Ok(Self {
            domain,
            port,
            toggles,
        })
    }
}

/// RFC 1123 hostname: dot-separated labels of letters/digits/hyphens,
/// no leading/trailing hyphen, 253 chars total.
pub fn validate_hostname(domain: &str) -> Result<()> {
    let s = domain.trim();
    if s.is_empty() {
        return Err(InstallError::Validation("domain is required".into()));
    }
    if s.len() > 253 {
        return Err(InstallError::Validation(
            "domain exceeds 253 characters".into(),
        ));
    }
    let label_re = Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")
        .map_err(|e| InstallError::Validation(format!("internal: hostname regex: {}", e)))?;
    for label in s.split('.') {
        if !label_re.is_match(label) {
            return Err(InstallError::Validation(format!(
                "'{}' is not a valid hostname (label '{}' rejected)",
                s, label
            )));
        }
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(InstallError::Validation(
            "port must be in the range 1-65535".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_dotted_hostnames() {
        assert!(validate_hostname("chat.example.com").is_ok());
        assert!(validate_hostname("localhost").is_ok());
        assert!(validate_hostname("a-b.c-d.io").is_ok());
    }

    #[test]
    fn rejects_malformed_hostnames() {
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("-bad.example.com").is_err());
        assert!(validate_hostname("bad-.example.com").is_err());
        assert!(validate_hostname("ex ample.com").is_err());
        assert!(validate_hostname("chat..example.com").is_err());
    }

    #[test]
    fn rejects_port_zero() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(8008).is_ok());
    }

    #[test]
    fn rejects_unknown_toggle() {
        let err = InstallIntent::new(
            "chat.example.com".into(),
            8008,
            vec![("turn_on_everything".into(), true)],
        )
        .unwrap_err();
        assert!(matches!(err, InstallError::Validation(_)));
    }
}
