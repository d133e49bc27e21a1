// Top-level install driver: one idempotent run over the persisted phase
// machine.
//
// NotStarted -> ConfigGenerated -> PermissionsSet -> ServicesHealthy ->
// Provisioned -> Complete, with Aborted terminal only for unrecoverable
// errors (a broken static topology). Every transition is persisted before
// the next phase begins, so a crash mid-install resumes at the last
// completed phase; a permission failure stops the run but stays resumable
// under sufficient privilege.

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use uuid::Uuid;

use crate::compose::{detect_compose_invocation, preflight_docker, ComposeProject};
use crate::config::ConfigTemplater;
use crate::errors::{InstallError, Result};
use crate::intent::InstallIntent;
use crate::paths::InstallPaths;
use crate::permissions::PermissionCoordinator;
use crate::provision::{AccountProvisioner, SynapseProvisioner};
use crate::sequencer::{ComposeControl, RestartPolicyOverride, ServiceControl, StartupSequencer};
use crate::session::{InstallPhase, InstallSession};
use crate::topology::{matrix_stack, ServiceTopology};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Full run (or resume) finished; the stack is up and provisioned.
    Installed { public_base_url: String },
    /// The session was already Complete; health verified, nothing touched.
    AlreadyComplete { public_base_url: String },
}

pub struct InstallOrchestrator {
    intent: InstallIntent,
    paths: InstallPaths,
    reconfigure: bool,
    /// Skip account/space provisioning (used when the admin interface is
    /// managed elsewhere).
    provision: bool,
}

impl InstallOrchestrator {
    pub fn new(intent: InstallIntent, paths: InstallPaths, reconfigure: bool) -> Self {
        Self {
            intent,
            paths,
            reconfigure,
            provision: true,
        }
    }

    pub fn without_provisioning(mut self) -> Self {
        self.provision = false;
        self
    }

    /// Explicit user-requested session reset. Returns whether a record
    /// existed. This is the only codepath that deletes a session.
    pub fn reset_session(paths: &InstallPaths) -> Result<bool> {
        let file = paths.session_file();
        match std::fs::remove_file(&file) {
            Ok(()) => {
                info!("[PHASE: session] [STEP: reset] removed {}", file.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Full production run: real topology, real ownership policy, docker
    /// compose control.
    pub async fn run(&self) -> Result<InstallOutcome> {
        // Static topology first: a topology or intent error must surface
        // before anything is mutated.
        let topology = matrix_stack(&self.intent)?;
        let coordinator = PermissionCoordinator::new(&self.paths);

        preflight_docker().await?;
        let inv = detect_compose_invocation().await?;
        let project =
            ComposeProject::new(self.paths.compose_file(), self.paths.override_file(), inv);
        let control = ComposeControl::new(project);

        self.run_with(&topology, &coordinator, &control, &SynapseProvisioner)
            .await
    }

    /// The phase machine with its collaborators injected; `run` wires the
    /// production ones.
    pub async fn run_with(
        &self,
        topology: &ServiceTopology,
        coordinator: &PermissionCoordinator<'_>,
        control: &dyn ServiceControl,
        provisioner: &dyn AccountProvisioner,
    ) -> Result<InstallOutcome> {
        let run_id = Uuid::new_v4();
        info!(
            "[PHASE: orchestrate] [STEP: begin] install run {} (domain={}, port={})",
            run_id, self.intent.domain, self.intent.port
        );

        coordinator.prepare_for_setup()?;

        let session_path = self.paths.session_file();
        let mut session = match InstallSession::load(&session_path)? {
            Some(existing) => self.adopt_session(existing, &session_path)?,
            None => {
                let fresh = InstallSession::new(&self.intent.domain, self.intent.port)?;
                fresh.save(&session_path)?;
                fresh
            }
        };

        if session.phase == InstallPhase::Aborted {
            return Err(InstallError::Session(format!(
                "previous install aborted; inspect {} and re-run with --reset-session to start over",
                self.paths.root.display()
            )));
        }

        if session.phase == InstallPhase::Complete && !self.reconfigure {
            return self.verify_complete(topology).await;
        }

        let override_file = RestartPolicyOverride::new(self.paths.override_file());
        let result = self
            .run_phases(
                &mut session,
                &session_path,
                topology,
                coordinator,
                control,
                provisioner,
                &override_file,
            )
            .await;

        if let Err(err) = &result {
            if err.aborts_session() {
                error!(
                    "[PHASE: orchestrate] [STEP: abort] unrecoverable error at phase '{}': {}",
                    session.phase.as_str(),
                    err
                );
                session.abort(&session_path)?;
            } else if err.is_fatal() {
                // No automatic retry can succeed, but the session stays at
                // its last completed phase for a privileged re-run.
                error!(
                    "[PHASE: orchestrate] [STEP: halt] run {} stopped at phase '{}' ({}); re-run with sufficient privilege to resume",
                    run_id,
                    session.phase.as_str(),
                    err
                );
            } else {
                warn!(
                    "[PHASE: orchestrate] [STEP: suspend] run {} stopped at phase '{}' ({}); re-run to resume",
                    run_id,
                    session.phase.as_str(),
                    err
                );
            }
        }
        result
    }

    /// Reconcile an existing session with the current intent.
    fn adopt_session(
        &self,
        mut session: InstallSession,
        session_path: &std::path::Path,
    ) -> Result<InstallSession> {
        let matches = session.domain == self.intent.domain && session.port == self.intent.port;
        if matches && !(self.reconfigure && session.phase == InstallPhase::Complete) {
            return Ok(session);
        }
        if !self.reconfigure {
            return Err(InstallError::Session(format!(
                "existing session targets {}:{}; pass --reconfigure to change it or --reset-session to discard it",
                session.domain, session.port
            )));
        }
        // Reconfiguration keeps the generated credentials (the database
        // already trusts them) and replays every phase.
        info!(
            "[PHASE: session] [STEP: reconfigure] {}:{} -> {}:{}",
            session.domain, session.port, self.intent.domain, self.intent.port
        );
        session.domain = self.intent.domain.clone();
        session.port = self.intent.port;
        session.phase = InstallPhase::NotStarted;
        session.phase_completed_at.clear();
        session.save(session_path)?;
        Ok(session)
    }

    async fn run_phases(
        &self,
        session: &mut InstallSession,
        session_path: &std::path::Path,
        topology: &ServiceTopology,
        coordinator: &PermissionCoordinator<'_>,
        control: &dyn ServiceControl,
        provisioner: &dyn AccountProvisioner,
        override_file: &RestartPolicyOverride,
    ) -> Result<InstallOutcome> {
        let spinner = phase_spinner();

        // Phase 1: configuration
        if !session.completed(InstallPhase::ConfigGenerated) {
            spinner.set_message("rendering configuration");
            let templater = ConfigTemplater::new(&self.intent, session, topology, &self.paths);
            templater.render().await?;
            // The override exists from ConfigGenerated onward; the
            // sequencer re-creates it if anything removed it in between.
            override_file.install(topology)?;
            session.advance(InstallPhase::ConfigGenerated, session_path)?;
        } else {
            info!("[PHASE: config] [STEP: skip] already rendered, resuming");
        }

        // Phase 2: ownership transfer
        if !session.completed(InstallPhase::PermissionsSet) {
            spinner.set_message("transferring data-directory ownership");
            coordinator.prepare_for_service_start()?;
            session.advance(InstallPhase::PermissionsSet, session_path)?;
        }

        // Phase 3: service startup
        let sequencer = StartupSequencer::new(topology, control, override_file);
        if !session.completed(InstallPhase::ServicesHealthy) {
            spinner.set_message("starting services");
            sequencer.bring_up().await?;
            session.advance(InstallPhase::ServicesHealthy, session_path)?;
        }

        // Phase 4: provisioning (retried alone on re-run if it fails)
        if !session.completed(InstallPhase::Provisioned) {
            if self.provision {
                spinner.set_message("provisioning accounts");
                provisioner.provision(session).await?;
            }
            session.advance(InstallPhase::Provisioned, session_path)?;
        }

        // Phase 5: back to the production restart policy, then Complete.
        if !session.completed(InstallPhase::Complete) {
            spinner.set_message("restoring production restart policy");
            sequencer.restore_production_policy().await?;
            session.advance(InstallPhase::Complete, session_path)?;
        }

        let base_url = crate::config::public_base_url(&self.intent.domain, self.intent.port);
        spinner.finish_and_clear();
        info!(
            "[PHASE: orchestrate] [STEP: done] installation complete ({})",
            base_url
        );
        Ok(InstallOutcome::Installed {
            public_base_url: base_url,
        })
    }

    /// For a Complete session: verify every service's health without
    /// touching anything.
    async fn verify_complete(&self, topology: &ServiceTopology) -> Result<InstallOutcome> {
        for svc in topology.start_order() {
            if !svc.probe.check().await? {
                return Err(InstallError::HealthTimeout {
                    service: svc.name.clone(),
                    waited_secs: 0,
                    detail: "install is marked complete but the service is not healthy; re-run with --reconfigure to repair"
                        .into(),
                });
            }
        }
        let base_url = crate::config::public_base_url(&self.intent.domain, self.intent.port);
        info!(
            "[PHASE: orchestrate] [STEP: verify] install already complete and healthy ({})",
            base_url
        );
        Ok(InstallOutcome::AlreadyComplete {
            public_base_url: base_url,
        })
    }
}

fn phase_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    spinner
}
