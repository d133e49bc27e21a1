// Static service topology: the declared services, their startup
// dependencies, and their health probes.
//
// Ordering is a checked invariant (validated acyclic graph), not an
// artifact of statement order.

pub mod health;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{InstallError, Result};
use crate::intent::InstallIntent;
use health::{ExecProbe, HealthProbe, HttpProbe, PollSpec};

// Service names (compose service keys).
pub const SVC_POSTGRES: &str = "postgres";
pub const SVC_SYNAPSE: &str = "synapse";
pub const SVC_ELEMENT: &str = "element";
pub const SVC_SYNAPSE_ADMIN: &str = "synapse-admin";

// Fixed container names so exec probes can address containers without
// depending on compose project naming.
pub const CONTAINER_POSTGRES: &str = "matrix-postgres";
pub const CONTAINER_SYNAPSE: &str = "matrix-synapse";
pub const CONTAINER_ELEMENT: &str = "matrix-element";
pub const CONTAINER_SYNAPSE_ADMIN: &str = "matrix-synapse-admin";

/// Database identity the core service must be configured against. Both the
/// compose file and homeserver.yaml are rendered from this one place,
/// which is what rules out the credential-mismatch bug.
pub const DB_USER: &str = "synapse";
pub const DB_NAME: &str = "synapse";

// Fixed published ports for the web frontends.
pub const ELEMENT_PORT: u16 = 8080;
pub const SYNAPSE_ADMIN_PORT: u16 = 8082;

/// Static declaration of one managed service.
pub struct ServiceDescriptor {
    pub name: String,
    pub depends_on: Vec<String>,
    pub probe: Arc<dyn HealthProbe>,
    pub poll: PollSpec,
    /// Host port the service publishes, if any (collision-checked against
    /// the install intent).
    pub published_port: Option<u16>,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("probe", &self.probe.describe())
            .field("published_port", &self.published_port)
            .finish()
    }
}

/// Validated dependency graph over the declared services.
#[derive(Debug)]
pub struct ServiceTopology {
    services: Vec<ServiceDescriptor>,
    order: Vec<usize>,
}

impl ServiceTopology {
    /// Validate (no dangling references, no cycles) and compute the
    /// startup order (Kahn's algorithm, stable by declaration order).
    pub fn new(services: Vec<ServiceDescriptor>) -> Result<Self> {
        let index: BTreeMap<&str, usize> = services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        if index.len() != services.len() {
            return Err(InstallError::Topology(
                "duplicate service name declared".into(),
            ));
        }

        let mut in_degree = vec![0usize; services.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); services.len()];
        for (i, svc) in services.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for dep in &svc.depends_on {
                let Some(&j) = index.get(dep.as_str()) else {
                    return Err(InstallError::Topology(format!(
                        "service '{}' depends on undeclared service '{}'",
                        svc.name, dep
                    )));
                };
                if j == i {
                    return Err(InstallError::Topology(format!(
                        "service '{}' depends on itself",
                        svc.name
                    )));
                }
                if seen.insert(j) {
                    in_degree[i] += 1;
                    dependents[j].push(i);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..services.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(services.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if order.len() != services.len() {
            let stuck: Vec<&str> = (0..services.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| services[i].name.as_str())
                .collect();
            return Err(InstallError::Topology(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(Self { services, order })
    }

    /// Services in startup order: every service after all of its
    /// dependencies.
    pub fn start_order(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.order.iter().map(|&i| &self.services[i])
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Reject an intent whose port collides with another declared
    /// service's published port.
    pub fn check_port_free(&self, port: u16, for_service: &str) -> Result<()> {
        for svc in &self.services {
            if svc.name != for_service && svc.published_port == Some(port) {
                return Err(InstallError::Validation(format!(
                    "port {} is already declared for service '{}'",
                    port, svc.name
                )));
            }
        }
        Ok(())
    }
}

/// The homeserver stack this installer manages: postgres, then synapse,
/// then the two web frontends.
pub fn matrix_stack(intent: &InstallIntent) -> Result<ServiceTopology> {
    let services = vec![
        ServiceDescriptor {
            name: SVC_POSTGRES.into(),
            depends_on: vec![],
            probe: Arc::new(ExecProbe::new(
                CONTAINER_POSTGRES,
                &["pg_isready", "-U", DB_USER, "-d", DB_NAME],
            )),
            poll: PollSpec::new(Duration::from_secs(2), Duration::from_secs(60)),
            published_port: None,
        },
        ServiceDescriptor {
            name: SVC_SYNAPSE.into(),
            depends_on: vec![SVC_POSTGRES.into()],
            probe: Arc::new(HttpProbe::new(format!(
                "http://127.0.0.1:{}/health",
                intent.port
            ))),
            // First boot generates signing keys and runs migrations.
            poll: PollSpec::new(Duration::from_secs(3), Duration::from_secs(180)),
            published_port: Some(intent.port),
        },
        ServiceDescriptor {
            name: SVC_ELEMENT.into(),
            depends_on: vec![SVC_SYNAPSE.into()],
            probe: Arc::new(HttpProbe::new(format!(
                "http://127.0.0.1:{}/",
                ELEMENT_PORT
            ))),
            poll: PollSpec::new(Duration::from_secs(2), Duration::from_secs(60)),
            published_port: Some(ELEMENT_PORT),
        },
        ServiceDescriptor {
            name: SVC_SYNAPSE_ADMIN.into(),
            depends_on: vec![SVC_SYNAPSE.into()],
            probe: Arc::new(HttpProbe::new(format!(
                "http://127.0.0.1:{}/",
                SYNAPSE_ADMIN_PORT
            ))),
            poll: PollSpec::new(Duration::from_secs(2), Duration::from_secs(60)),
            published_port: Some(SYNAPSE_ADMIN_PORT),
        },
    ];
    let topology = ServiceTopology::new(services)?;
    topology.check_port_free(intent.port, SVC_SYNAPSE)?;
    Ok(topology)
}
