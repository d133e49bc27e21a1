// End-to-end phase-machine runs against scripted services: no docker, no
// ownership transfer, no provisioning HTTP.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use matrix_installer::compose::ServiceState;
use matrix_installer::errors::{InstallError, Result};
use matrix_installer::orchestrator::{InstallOrchestrator, InstallOutcome};
use matrix_installer::permissions::{Ownership, OwnershipPolicy, PermissionCoordinator};
use matrix_installer::provision::AccountProvisioner;
use matrix_installer::sequencer::ServiceControl;
use matrix_installer::session::{InstallPhase, InstallSession};
use matrix_installer::topology::health::{HealthProbe, PollSpec};
use matrix_installer::topology::{
    ServiceDescriptor, ServiceTopology, SVC_ELEMENT, SVC_POSTGRES, SVC_SYNAPSE, SVC_SYNAPSE_ADMIN,
};
use matrix_installer::{InstallIntent, InstallPaths};

// Shared scripted world, same shape the sequencer's unit tests use.
#[derive(Default)]
struct World {
    heal_after: BTreeMap<String, u32>,
    started: Vec<String>,
    running: BTreeMap<String, ServiceState>,
    crashed: BTreeMap<String, bool>,
}

struct ScriptedProbe {
    name: String,
    world: Arc<Mutex<World>>,
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self) -> Result<bool> {
        let mut w = self.world.lock().unwrap();
        if !w.started.contains(&self.name) {
            return Ok(false);
        }
        match w.heal_after.get_mut(&self.name) {
            Some(0) | None => Ok(true),
            Some(n) => {
                *n -= 1;
                Ok(false)
            }
        }
    }
    fn describe(&self) -> String {
        format!("scripted probe for {}", self.name)
    }
}

struct ScriptedControl {
    world: Arc<Mutex<World>>,
}

#[async_trait]
impl ServiceControl for ScriptedControl {
    async fn start(&self, service: &str) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.started.push(service.to_string());
        let crashed = w.crashed.get(service).copied().unwrap_or(false);
        w.running.insert(
            service.to_string(),
            if crashed {
                ServiceState::Exited
            } else {
                ServiceState::Running
            },
        );
        Ok(())
    }

    async fn state(&self, service: &str) -> Result<ServiceState> {
        let w = self.world.lock().unwrap();
        Ok(w.running
            .get(service)
            .copied()
            .unwrap_or(ServiceState::Missing))
    }

    async fn up_all(&self) -> Result<()> {
        Ok(())
    }
}

// Provisioner that fails a scripted number of times, then succeeds.
struct ScriptedProvisioner {
    calls: Mutex<u32>,
    failures_remaining: Mutex<u32>,
}

impl ScriptedProvisioner {
    fn always_ok() -> Self {
        Self::failing(0)
    }

    fn failing(times: u32) -> Self {
        Self {
            calls: Mutex::new(0),
            failures_remaining: Mutex::new(times),
        }
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl AccountProvisioner for ScriptedProvisioner {
    async fn provision(&self, _session: &InstallSession) -> Result<()> {
        *self.calls.lock().unwrap() += 1;
        let mut remaining = self.failures_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(InstallError::Provision(
                "admin interface rejected the request".into(),
            ));
        }
        Ok(())
    }
}

fn descriptor(name: &str, deps: &[&str], world: &Arc<Mutex<World>>) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.into(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        probe: Arc::new(ScriptedProbe {
            name: name.into(),
            world: Arc::clone(world),
        }),
        poll: PollSpec::new(Duration::from_millis(1), Duration::from_millis(500)),
        published_port: None,
    }
}

/// The production stack shape with scripted probes substituted.
fn scripted_stack(world: &Arc<Mutex<World>>) -> ServiceTopology {
    ServiceTopology::new(vec![
        descriptor(SVC_POSTGRES, &[], world),
        descriptor(SVC_SYNAPSE, &[SVC_POSTGRES], world),
        descriptor(SVC_ELEMENT, &[SVC_SYNAPSE], world),
        descriptor(SVC_SYNAPSE_ADMIN, &[SVC_SYNAPSE], world),
    ])
    .unwrap()
}

fn intent(port: u16) -> InstallIntent {
    InstallIntent::new("matrix.example.org".into(), port, vec![]).unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    paths: InstallPaths,
    world: Arc<Mutex<World>>,
    topology: ServiceTopology,
    control: ScriptedControl,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::new(dir.path().to_path_buf());
        let world = Arc::new(Mutex::new(World::default()));
        let topology = scripted_stack(&world);
        let control = ScriptedControl {
            world: Arc::clone(&world),
        };
        Self {
            _dir: dir,
            paths,
            world,
            topology,
            control,
        }
    }

    async fn run(&self, orchestrator: &InstallOrchestrator) -> Result<InstallOutcome> {
        self.run_provisioned(orchestrator, &ScriptedProvisioner::always_ok())
            .await
    }

    async fn run_provisioned(
        &self,
        orchestrator: &InstallOrchestrator,
        provisioner: &dyn AccountProvisioner,
    ) -> Result<InstallOutcome> {
        let coordinator =
            PermissionCoordinator::with_policy(&self.paths, OwnershipPolicy::new(vec![]));
        orchestrator
            .run_with(&self.topology, &coordinator, &self.control, provisioner)
            .await
    }

    fn session(&self) -> InstallSession {
        InstallSession::load(&self.paths.session_file())
            .unwrap()
            .expect("session record exists")
    }
}

#[tokio::test]
async fn fresh_install_reaches_complete_and_drops_the_override() {
    let h = Harness::new();
    let orchestrator = InstallOrchestrator::new(intent(8008), h.paths.clone(), false)
        .without_provisioning();

    let outcome = h.run(&orchestrator).await.unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::Installed {
            public_base_url: "https://matrix.example.org:8008/".into()
        }
    );

    // Everything rendered.
    assert!(h.paths.homeserver_yaml().exists());
    assert!(h.paths.compose_file().exists());
    assert!(h.paths.element_config().exists());

    // Services came up in dependency order.
    let started = h.world.lock().unwrap().started.clone();
    assert_eq!(started[0], SVC_POSTGRES);
    assert_eq!(started[1], SVC_SYNAPSE);

    // Production restart policy restored: the override is gone, the
    // session is terminal.
    assert!(!h.paths.override_file().exists());
    assert_eq!(h.session().phase, InstallPhase::Complete);
}

#[tokio::test]
async fn crash_suspends_the_session_and_a_rerun_resumes_past_completed_phases() {
    let h = Harness::new();
    {
        let mut w = h.world.lock().unwrap();
        w.crashed.insert(SVC_POSTGRES.into(), true);
        w.heal_after.insert(SVC_POSTGRES.into(), u32::MAX);
    }
    let orchestrator = InstallOrchestrator::new(intent(8008), h.paths.clone(), false)
        .without_provisioning();

    let err = h.run(&orchestrator).await.unwrap_err();
    assert!(matches!(err, InstallError::ServiceCrash { .. }));
    assert_eq!(err.service(), Some(SVC_POSTGRES));

    // Not fatal: the session suspends at the last completed phase, the
    // dependents were never started, and the override stays on disk for
    // inspection.
    assert_eq!(h.session().phase, InstallPhase::PermissionsSet);
    assert!(!h.world.lock().unwrap().started.contains(&SVC_SYNAPSE.to_string()));
    assert!(h.paths.override_file().exists());

    // Mark the rendered config so a re-render would be visible.
    std::fs::write(h.paths.homeserver_yaml(), "# operator edit\n").unwrap();

    // Fix the database and re-run the same command.
    {
        let mut w = h.world.lock().unwrap();
        w.crashed.insert(SVC_POSTGRES.into(), false);
        w.heal_after.remove(SVC_POSTGRES);
    }
    let outcome = h.run(&orchestrator).await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed { .. }));

    // The resume skipped the config phase entirely and retried from the
    // database start.
    assert_eq!(
        std::fs::read_to_string(h.paths.homeserver_yaml()).unwrap(),
        "# operator edit\n"
    );
    assert_eq!(h.session().phase, InstallPhase::Complete);
    assert!(!h.paths.override_file().exists());

    let started = h.world.lock().unwrap().started.clone();
    assert_eq!(
        started.iter().filter(|s| s.as_str() == SVC_POSTGRES).count(),
        2
    );
    assert_eq!(
        started.iter().filter(|s| s.as_str() == SVC_SYNAPSE).count(),
        1
    );
}

#[tokio::test]
async fn rerun_against_a_complete_install_touches_nothing() {
    let h = Harness::new();
    let orchestrator = InstallOrchestrator::new(intent(8008), h.paths.clone(), false)
        .without_provisioning();
    h.run(&orchestrator).await.unwrap();

    let starts_before = h.world.lock().unwrap().started.len();
    let compose_before = std::fs::read_to_string(h.paths.compose_file()).unwrap();

    let outcome = h.run(&orchestrator).await.unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::AlreadyComplete {
            public_base_url: "https://matrix.example.org:8008/".into()
        }
    );

    // Verification only: no service starts, no rewrites.
    assert_eq!(h.world.lock().unwrap().started.len(), starts_before);
    assert_eq!(
        std::fs::read_to_string(h.paths.compose_file()).unwrap(),
        compose_before
    );
    assert!(!h.paths.override_file().exists());
}

#[tokio::test]
async fn changed_intent_is_rejected_without_reconfigure() {
    let h = Harness::new();
    let first = InstallOrchestrator::new(intent(8008), h.paths.clone(), false)
        .without_provisioning();
    h.run(&first).await.unwrap();

    let changed = InstallOrchestrator::new(intent(9008), h.paths.clone(), false)
        .without_provisioning();
    let err = h.run(&changed).await.unwrap_err();
    assert!(matches!(err, InstallError::Session(_)));
    assert!(err.to_string().contains("--reconfigure"));

    // The stored session is untouched.
    let session = h.session();
    assert_eq!(session.port, 8008);
    assert_eq!(session.phase, InstallPhase::Complete);
}

#[tokio::test]
async fn reconfigure_replays_phases_but_keeps_credentials() {
    let h = Harness::new();
    let first = InstallOrchestrator::new(intent(8008), h.paths.clone(), false)
        .without_provisioning();
    h.run(&first).await.unwrap();
    let creds_before = h.session().credentials.clone();

    let second = InstallOrchestrator::new(intent(9008), h.paths.clone(), true)
        .without_provisioning();
    let outcome = h.run(&second).await.unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::Installed {
            public_base_url: "https://matrix.example.org:9008/".into()
        }
    );

    let session = h.session();
    assert_eq!(session.port, 9008);
    assert_eq!(session.phase, InstallPhase::Complete);
    // The database already trusts the generated secrets.
    assert_eq!(session.credentials, creds_before);

    // The rendered compose file follows the new intent.
    let compose = std::fs::read_to_string(h.paths.compose_file()).unwrap();
    assert!(compose.contains("9008:9008"));
}

#[tokio::test]
async fn permission_failure_leaves_the_session_resumable() {
    let h = Harness::new();
    let orchestrator = InstallOrchestrator::new(intent(8008), h.paths.clone(), false)
        .without_provisioning();

    // A real ownership transfer to the synapse runtime identity; rejected
    // unless the test runs privileged.
    let coordinator = PermissionCoordinator::with_policy(
        &h.paths,
        OwnershipPolicy::new(vec![(h.paths.synapse_dir(), Ownership { uid: 991, gid: 991 })]),
    );
    let provisioner = ScriptedProvisioner::always_ok();
    match orchestrator
        .run_with(&h.topology, &coordinator, &h.control, &provisioner)
        .await
    {
        // Privileged run: the transfer succeeded and the install went
        // through.
        Ok(outcome) => assert!(matches!(outcome, InstallOutcome::Installed { .. })),
        // Unprivileged: the run halts, but the session keeps its last
        // completed phase instead of aborting, so a privileged re-run
        // resumes it.
        Err(err) => {
            assert!(matches!(err, InstallError::Permission { .. }));
            assert_eq!(h.session().phase, InstallPhase::ConfigGenerated);

            let outcome = h.run(&orchestrator).await.unwrap();
            assert!(matches!(outcome, InstallOutcome::Installed { .. }));
            assert_eq!(h.session().phase, InstallPhase::Complete);
        }
    }
}

#[tokio::test]
async fn provision_failure_leaves_services_healthy_and_rerun_retries_only_provisioning() {
    let h = Harness::new();
    let orchestrator = InstallOrchestrator::new(intent(8008), h.paths.clone(), false);
    let provisioner = ScriptedProvisioner::failing(1);

    let err = h
        .run_provisioned(&orchestrator, &provisioner)
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::Provision(_)));
    // The services are up; only provisioning remains.
    assert_eq!(h.session().phase, InstallPhase::ServicesHealthy);
    assert!(h.paths.override_file().exists());

    let starts_before = h.world.lock().unwrap().started.len();
    let outcome = h
        .run_provisioned(&orchestrator, &provisioner)
        .await
        .unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed { .. }));

    // The re-run touched no services and retried provisioning alone.
    assert_eq!(h.world.lock().unwrap().started.len(), starts_before);
    assert_eq!(provisioner.calls(), 2);
    assert_eq!(h.session().phase, InstallPhase::Complete);
    assert!(!h.paths.override_file().exists());
}

#[tokio::test]
async fn reset_session_discards_the_record() {
    let h = Harness::new();
    let orchestrator = InstallOrchestrator::new(intent(8008), h.paths.clone(), false)
        .without_provisioning();
    h.run(&orchestrator).await.unwrap();

    assert!(InstallOrchestrator::reset_session(&h.paths).unwrap());
    assert!(InstallSession::load(&h.paths.session_file())
        .unwrap()
        .is_none());
    // Resetting twice is a no-op.
    assert!(!InstallOrchestrator::reset_session(&h.paths).unwrap());
}
