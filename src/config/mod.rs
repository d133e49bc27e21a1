// Config templating: structured load -> field mutation -> serialize.
//
// The base template is parsed as a YAML document and mutated field by
// field; no text substitution, so repeated renders can never produce
// malformed output. The database block and the compose file are rendered
// from the same declared identity, which is what makes a credential
// mismatch between them unrepresentable.

use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::errors::{InstallError, Result};
use crate::intent::InstallIntent;
use crate::paths::InstallPaths;
use crate::session::{InstallSession, CRED_POSTGRES_PASSWORD, CRED_REGISTRATION_SECRET};
use crate::topology::{
    ServiceTopology, CONTAINER_ELEMENT, CONTAINER_POSTGRES, CONTAINER_SYNAPSE,
    CONTAINER_SYNAPSE_ADMIN, DB_NAME, DB_USER, ELEMENT_PORT, SVC_ELEMENT, SVC_POSTGRES,
    SVC_SYNAPSE, SVC_SYNAPSE_ADMIN, SYNAPSE_ADMIN_PORT,
};

/// Bundled base template; a copy under `<root>/templates/` takes
/// precedence.
const DEFAULT_TEMPLATE: &str = include_str!("../../templates/homeserver.template.yaml");

/// Minimal Synapse log config mounted into the container.
const SYNAPSE_LOG_CONFIG: &str = r#"version: 1
formatters:
  precise:
    format: '%(asctime)s - %(name)s - %(lineno)d - %(levelname)s - %(request)s - %(message)s'
handlers:
  console:
    class: logging.StreamHandler
    formatter: precise
root:
  level: INFO
  handlers: [console]
disable_existing_loggers: false
"#;

/// The public base URL is a pure function of (domain, port): recomputed on
/// every render, never independently edited.
pub fn public_base_url(domain: &str, port: u16) -> String {
    format!("https://{}:{}/", domain, port)
}

#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub public_base_url: String,
    pub homeserver_yaml: std::path::PathBuf,
    pub compose_file: std::path::PathBuf,
    pub element_config: std::path::PathBuf,
}

pub struct ConfigTemplater<'a> {
    intent: &'a InstallIntent,
    session: &'a InstallSession,
    topology: &'a ServiceTopology,
    paths: &'a InstallPaths,
}

impl<'a> ConfigTemplater<'a> {
    pub fn new(
        intent: &'a InstallIntent,
        session: &'a InstallSession,
        topology: &'a ServiceTopology,
        paths: &'a InstallPaths,
    ) -> Self {
        Self {
            intent,
            session,
            topology,
            paths,
        }
    }

    /// Render all configuration for this install target, overwriting any
    /// prior render. Deterministic for a given (intent, session).
    pub async fn render(&self) -> Result<RenderedConfig> {
        self.topology
            .check_port_free(self.intent.port, SVC_SYNAPSE)?;

        let homeserver = self.render_homeserver().await?;
        let base_url = public_base_url(&self.intent.domain, self.intent.port);

        let homeserver_path = self.paths.homeserver_yaml();
        write_file(&homeserver_path, &homeserver).await?;
        write_file(&self.paths.synapse_dir().join("log.config"), SYNAPSE_LOG_CONFIG).await?;

        let element_path = self.paths.element_config();
        write_file(&element_path, &self.render_element_config(&base_url)?).await?;

        let compose_path = self.paths.compose_file();
        write_file(&compose_path, &self.render_compose()?).await?;

        info!(
            "[PHASE: config] [STEP: render] configuration rendered (base_url={}, homeserver={})",
            base_url,
            homeserver_path.display()
        );

        Ok(RenderedConfig {
            public_base_url: base_url,
            homeserver_yaml: homeserver_path,
            compose_file: compose_path,
            element_config: element_path,
        })
    }

    /// Load the base template and rewrite the install-specific fields.
    async fn render_homeserver(&self) -> Result<String> {
        let template_path = self.paths.template_override();
        let raw = if template_path.exists() {
            tokio::fs::read_to_string(&template_path)
                .await
                .map_err(|e| {
                    InstallError::Template(format!(
                        "cannot read template {}: {}",
                        template_path.display(),
                        e
                    ))
                })?
        } else {
            DEFAULT_TEMPLATE.to_string()
        };

        let mut doc: Value = serde_yaml::from_str(&raw)
            .map_err(|e| InstallError::Template(format!("template is not valid YAML: {}", e)))?;
        let root = doc.as_mapping_mut().ok_or_else(|| {
            InstallError::Template("template root must be a YAML mapping".into())
        })?;

        set(root, "server_name", Value::from(self.intent.domain.clone()));
        set(
            root,
            "public_baseurl",
            Value::from(public_base_url(&self.intent.domain, self.intent.port)),
        );
        set(
            root,
            "registration_shared_secret",
            Value::from(self.session.credential(CRED_REGISTRATION_SECRET)?),
        );

        // Listener port: first listener in the template is the one we
        // publish.
        let listeners = root
            .get_mut(Value::from("listeners"))
            .and_then(Value::as_sequence_mut)
            .ok_or_else(|| {
                InstallError::Template("template is missing the 'listeners' list".into())
            })?;
        let first = listeners
            .first_mut()
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| {
                InstallError::Template("template 'listeners' must contain a mapping".into())
            })?;
        set(first, "port", Value::from(self.intent.port));

        // Database identity comes from the declared topology, never
        // configured independently.
        let database = root
            .get_mut(Value::from("database"))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| {
                InstallError::Template("template is missing the 'database' mapping".into())
            })?;
        let args = database
            .get_mut(Value::from("args"))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| {
                InstallError::Template("template 'database' is missing 'args'".into())
            })?;
        set(args, "user", Value::from(DB_USER));
        set(
            args,
            "password",
            Value::from(self.session.credential(CRED_POSTGRES_PASSWORD)?),
        );
        set(args, "database", Value::from(DB_NAME));
        set(args, "host", Value::from(SVC_POSTGRES));

        for (name, enabled) in &self.intent.toggles {
            set(root, name, Value::from(*enabled));
        }

        serde_yaml::to_string(&doc)
            .map_err(|e| InstallError::Template(format!("serialize homeserver.yaml: {}", e)))
    }

    fn render_element_config(&self, base_url: &str) -> Result<String> {
        let config = serde_json::json!({
            "default_server_config": {
                "m.homeserver": {
                    "base_url": base_url,
                    "server_name": self.intent.domain,
                }
            },
            "brand": "Element",
            "default_country_code": "US",
            "show_labs_settings": false,
        });
        serde_json::to_string_pretty(&config)
            .map_err(|e| InstallError::Template(format!("serialize element config: {}", e)))
    }

    /// Build the compose document for the declared topology. Structured
    /// serialization, same rationale as the homeserver render.
    fn render_compose(&self) -> Result<String> {
        let vol = |sub: &Path, target: &str| format!("{}:{}", sub.display(), target);

        let mut services = BTreeMap::new();
        services.insert(
            SVC_POSTGRES.to_string(),
            ComposeService {
                image: "postgres:15-alpine".into(),
                container_name: CONTAINER_POSTGRES.into(),
                restart: Some("unless-stopped".into()),
                ports: vec![],
                volumes: vec![vol(&self.paths.postgres_dir(), "/var/lib/postgresql/data")],
                environment: BTreeMap::from([
                    ("POSTGRES_USER".to_string(), DB_USER.to_string()),
                    (
                        "POSTGRES_PASSWORD".to_string(),
                        self.session.credential(CRED_POSTGRES_PASSWORD)?.to_string(),
                    ),
                    ("POSTGRES_DB".to_string(), DB_NAME.to_string()),
                    (
                        "POSTGRES_INITDB_ARGS".to_string(),
                        "--encoding=UTF8 --locale=C".to_string(),
                    ),
                ]),
                depends_on: vec![],
            },
        );
        services.insert(
            SVC_SYNAPSE.to_string(),
            ComposeService {
                image: "matrixdotorg/synapse:latest".into(),
                container_name: CONTAINER_SYNAPSE.into(),
                restart: Some("unless-stopped".into()),
                ports: vec![format!("{0}:{0}", self.intent.port)],
                volumes: vec![vol(&self.paths.synapse_dir(), "/data")],
                environment: BTreeMap::new(),
                depends_on: vec![SVC_POSTGRES.into()],
            },
        );
        services.insert(
            SVC_ELEMENT.to_string(),
            ComposeService {
                image: "vectorim/element-web:latest".into(),
                container_name: CONTAINER_ELEMENT.into(),
                restart: Some("unless-stopped".into()),
                ports: vec![format!("{}:80", ELEMENT_PORT)],
                volumes: vec![vol(
                    &self.paths.element_config(),
                    "/app/config.json",
                )],
                environment: BTreeMap::new(),
                depends_on: vec![SVC_SYNAPSE.into()],
            },
        );
        services.insert(
            SVC_SYNAPSE_ADMIN.to_string(),
            ComposeService {
                image: "awesometechnologies/synapse-admin:latest".into(),
                container_name: CONTAINER_SYNAPSE_ADMIN.into(),
                restart: Some("unless-stopped".into()),
                ports: vec![format!("{}:80", SYNAPSE_ADMIN_PORT)],
                volumes: vec![],
                environment: BTreeMap::new(),
                depends_on: vec![SVC_SYNAPSE.into()],
            },
        );

        let doc = ComposeFile { services };
        serde_yaml::to_string(&doc)
            .map_err(|e| InstallError::Template(format!("serialize compose file: {}", e)))
    }
}

#[derive(Debug, Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
}

fn set(map: &mut Mapping, key: &str, value: Value) {
    map.insert(Value::from(key), value);
}

async fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}
