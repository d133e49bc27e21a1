// Startup sequencing: bring every declared service to healthy, in
// dependency order, or fail naming exactly which service blocked progress.
//
// While an install run is underway, a compose override file disables
// automatic restarts. Without it, a dependent service crashing against an
// unready dependency gets restarted by policy and races its replacement
// for the listener port. The override's presence on disk is observable
// install state: present means "install in progress or aborted", absent
// means "complete or never started".

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use log::{info, warn};
use serde_yaml::Value;

use crate::compose::{ComposeProject, ServiceState};
use crate::errors::{InstallError, Result};
use crate::topology::{ServiceDescriptor, ServiceTopology};

/// The temporary restart-policy relaxation, materialized as a compose
/// override file: `restart: "no"` for every declared service.
#[derive(Debug, Clone)]
pub struct RestartPolicyOverride {
    path: PathBuf,
}

impl RestartPolicyOverride {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    /// Write the override for the given services. Idempotent.
    pub fn install(&self, topology: &ServiceTopology) -> Result<()> {
        let mut services = serde_yaml::Mapping::new();
        for svc in topology.services() {
            let mut entry = serde_yaml::Mapping::new();
            entry.insert(Value::from("restart"), Value::from("no"));
            services.insert(Value::from(svc.name.clone()), Value::Mapping(entry));
        }
        let mut root = serde_yaml::Mapping::new();
        root.insert(Value::from("services"), Value::Mapping(services));
        let text = serde_yaml::to_string(&Value::Mapping(root))
            .map_err(|e| InstallError::Template(format!("serialize restart override: {}", e)))?;
        std::fs::write(&self.path, text)?;
        info!(
            "[PHASE: sequence] [STEP: override] restart-policy override installed at {}",
            self.path.display()
        );
        Ok(())
    }

    /// Remove the override, restoring the production restart policy.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(
                    "[PHASE: sequence] [STEP: override] restart-policy override removed"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Starting and inspecting services. The production implementation shells
/// out to docker compose; tests substitute their own.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self, service: &str) -> Result<()>;
    async fn state(&self, service: &str) -> Result<ServiceState>;
    /// Bring the whole project up under whatever restart policy the
    /// compose files currently declare.
    async fn up_all(&self) -> Result<()>;
    /// Failure context for error messages (e.g. a log tail).
    async fn diagnostics(&self, _service: &str) -> String {
        String::new()
    }
}

pub struct ComposeControl {
    project: ComposeProject,
}

impl ComposeControl {
    pub fn new(project: ComposeProject) -> Self {
        Self { project }
    }
}

#[async_trait]
impl ServiceControl for ComposeControl {
    async fn start(&self, service: &str) -> Result<()> {
        self.project.up(Some(service)).await
    }

    async fn state(&self, service: &str) -> Result<ServiceState> {
        self.project.service_state(service).await
    }

    async fn up_all(&self) -> Result<()> {
        self.project.up(None).await
    }

    async fn diagnostics(&self, service: &str) -> String {
        self.project
            .logs(service, 40)
            .await
            .unwrap_or_else(|e| format!("(logs unavailable: {})", e))
    }
}

pub struct StartupSequencer<'a> {
    topology: &'a ServiceTopology,
    control: &'a dyn ServiceControl,
    override_file: &'a RestartPolicyOverride,
}

impl<'a> StartupSequencer<'a> {
    pub fn new(
        topology: &'a ServiceTopology,
        control: &'a dyn ServiceControl,
        override_file: &'a RestartPolicyOverride,
    ) -> Self {
        Self {
            topology,
            control,
            override_file,
        }
    }

    /// Bring every service to healthy in dependency order.
    ///
    /// Already-healthy services are skipped, so re-running an install does
    /// not restart them. On failure the override file stays in place for
    /// operator inspection; nothing is rolled back.
    pub async fn bring_up(&self) -> Result<()> {
        for svc in self.topology.start_order() {
            let state = self.control.state(&svc.name).await?;
            if state == ServiceState::Running && svc.probe.check().await? {
                info!(
                    "[PHASE: sequence] [STEP: {}] already healthy, skipping",
                    svc.name
                );
                continue;
            }

            // The override must exist before any service starts.
            if !self.override_file.is_present() {
                self.override_file.install(self.topology)?;
            }

            info!("[PHASE: sequence] [STEP: {}] starting", svc.name);
            self.control.start(&svc.name).await?;
            self.wait_healthy(svc).await?;
            info!("[PHASE: sequence] [STEP: {}] healthy", svc.name);
        }
        Ok(())
    }

    /// Poll one service's probe until healthy, crashed, or timed out.
    async fn wait_healthy(&self, svc: &ServiceDescriptor) -> Result<()> {
        let started = Instant::now();
        loop {
            if svc.probe.check().await? {
                return Ok(());
            }

            match self.control.state(&svc.name).await? {
                ServiceState::Exited => {
                    let detail = self.control.diagnostics(&svc.name).await;
                    warn!(
                        "[PHASE: sequence] [STEP: {}] container exited during startup",
                        svc.name
                    );
                    return Err(InstallError::ServiceCrash {
                        service: svc.name.clone(),
                        detail: if detail.is_empty() {
                            "container exited before becoming healthy".into()
                        } else {
                            format!("container exited; last log lines:\n{}", detail.trim_end())
                        },
                    });
                }
                ServiceState::Running | ServiceState::Other | ServiceState::Missing => {}
            }

            if started.elapsed() >= svc.poll.max_wait {
                return Err(InstallError::HealthTimeout {
                    service: svc.name.clone(),
                    waited_secs: svc.poll.max_wait.as_secs(),
                    detail: format!("waiting for {}", svc.probe.describe()),
                });
            }

            tokio::time::sleep(svc.poll.interval).await;
        }
    }

    /// After the install is fully provisioned: drop the override and
    /// re-apply the project so containers run under the production restart
    /// policy that will persist across host reboots.
    pub async fn restore_production_policy(&self) -> Result<()> {
        self.override_file.remove()?;
        self.control.up_all().await?;
        // The restart recreates containers; confirm everything came back.
        for svc in self.topology.start_order() {
            self.wait_healthy(svc).await?;
        }
        info!("[PHASE: sequence] [STEP: finalize] production restart policy active");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::health::{HealthProbe, PollSpec};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // Shared scripted world for mock probes and control.
    #[derive(Default)]
    struct World {
        // service -> polls remaining before healthy (None = healthy now)
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
            // Not healthy until started.
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

    fn chain_topology(world: &Arc<Mutex<World>>) -> ServiceTopology {
        ServiceTopology::new(vec![
            descriptor("a", &[], world),
            descriptor("b", &["a"], world),
            descriptor("c", &["b"], world),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn slow_dependency_blocks_dependent_start() {
        let world = Arc::new(Mutex::new(World::default()));
        // b needs several polls to heal; c must not start until b is done.
        world.lock().unwrap().heal_after.insert("b".into(), 5);

        let dir = tempfile::tempdir().unwrap();
        let override_file =
            RestartPolicyOverride::new(dir.path().join("docker-compose.override.yml"));
        let topology = chain_topology(&world);
        let control = ScriptedControl {
            world: Arc::clone(&world),
        };

        StartupSequencer::new(&topology, &control, &override_file)
            .bring_up()
            .await
            .unwrap();

        let started = world.lock().unwrap().started.clone();
        assert_eq!(started, vec!["a", "b", "c"]);
        // b healed fully (its countdown exhausted) before c was started:
        // the countdown only decrements through polling, so reaching zero
        // ordered strictly before the c start entry.
        assert_eq!(world.lock().unwrap().heal_after.get("b"), Some(&0));
    }

    #[tokio::test]
    async fn already_healthy_services_are_not_restarted() {
        let world = Arc::new(Mutex::new(World::default()));
        {
            let mut w = world.lock().unwrap();
            // a already running and healthy from a prior run
            w.running.insert("a".into(), ServiceState::Running);
            w.started.push("a".into());
        }

        let dir = tempfile::tempdir().unwrap();
        let override_file =
            RestartPolicyOverride::new(dir.path().join("docker-compose.override.yml"));
        let topology = chain_topology(&world);
        let control = ScriptedControl {
            world: Arc::clone(&world),
        };

        StartupSequencer::new(&topology, &control, &override_file)
            .bring_up()
            .await
            .unwrap();

        let started = world.lock().unwrap().started.clone();
        // "a" appears once (the pre-seeded entry), never started again.
        assert_eq!(started.iter().filter(|s| s.as_str() == "a").count(), 1);
        assert_eq!(&started[1..], &["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn crash_is_attributed_to_the_service_and_leaves_override() {
        let world = Arc::new(Mutex::new(World::default()));
        {
            let mut w = world.lock().unwrap();
            w.crashed.insert("b".into(), true);
            w.heal_after.insert("b".into(), u32::MAX);
        }

        let dir = tempfile::tempdir().unwrap();
        let override_file =
            RestartPolicyOverride::new(dir.path().join("docker-compose.override.yml"));
        let topology = chain_topology(&world);
        let control = ScriptedControl {
            world: Arc::clone(&world),
        };

        let err = StartupSequencer::new(&topology, &control, &override_file)
            .bring_up()
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::ServiceCrash { .. }));
        assert_eq!(err.service(), Some("b"));
        // c never started
        assert!(!world.lock().unwrap().started.contains(&"c".to_string()));
        // override stays for operator inspection
        assert!(override_file.is_present());
    }

    #[tokio::test]
    async fn timeout_is_attributed_to_the_service() {
        let world = Arc::new(Mutex::new(World::default()));
        world
            .lock()
            .unwrap()
            .heal_after
            .insert("a".into(), u32::MAX);

        let dir = tempfile::tempdir().unwrap();
        let override_file =
            RestartPolicyOverride::new(dir.path().join("docker-compose.override.yml"));
        let topology = ServiceTopology::new(vec![ServiceDescriptor {
            name: "a".into(),
            depends_on: vec![],
            probe: Arc::new(ScriptedProbe {
                name: "a".into(),
                world: Arc::clone(&world),
            }),
            poll: PollSpec::new(Duration::from_millis(1), Duration::from_millis(20)),
            published_port: None,
        }])
        .unwrap();
        let control = ScriptedControl {
            world: Arc::clone(&world),
        };

        let err = StartupSequencer::new(&topology, &control, &override_file)
            .bring_up()
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::HealthTimeout { .. }));
        assert_eq!(err.service(), Some("a"));
    }

    #[tokio::test]
    async fn override_is_installed_before_first_start_and_removed_on_finalize() {
        let world = Arc::new(Mutex::new(World::default()));
        let dir = tempfile::tempdir().unwrap();
        let override_file =
            RestartPolicyOverride::new(dir.path().join("docker-compose.override.yml"));
        let topology = chain_topology(&world);
        let control = ScriptedControl {
            world: Arc::clone(&world),
        };

        let sequencer = StartupSequencer::new(&topology, &control, &override_file);
        sequencer.bring_up().await.unwrap();
        // Present after bring_up: removal happens only at finalize.
        assert!(override_file.is_present());

        sequencer.restore_production_policy().await.unwrap();
        assert!(!override_file.is_present());
    }

    #[test]
    fn override_file_disables_restart_for_every_service() {
        let world = Arc::new(Mutex::new(World::default()));
        let dir = tempfile::tempdir().unwrap();
        let override_file =
            RestartPolicyOverride::new(dir.path().join("docker-compose.override.yml"));
        let topology = chain_topology(&world);

        override_file.install(&topology).unwrap();
        let doc: Value =
            serde_yaml::from_str(&std::fs::read_to_string(override_file.path()).unwrap()).unwrap();
        for name in ["a", "b", "c"] {
            assert_eq!(doc["services"][name]["restart"].as_str(), Some("no"));
        }
        // Idempotent re-install and tolerant removal.
        override_file.install(&topology).unwrap();
        override_file.remove().unwrap();
        override_file.remove().unwrap();
    }
}
