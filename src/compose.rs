// Docker / docker compose plumbing.
//
// The services themselves are opaque containers; everything we need from
// docker is: preflight (binary + daemon), `compose up -d [service]`, and a
// per-service state query for crash detection.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::time::Duration;

use crate::errors::{InstallError, Result};
use crate::process::{run_cmd_with_timeout, CommandOutput};

const COMPOSE_CMD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeInvocation {
    /// `docker-compose` standalone binary (V1).
    DockerComposeBinary,
    /// `docker compose` plugin (V2, preferred).
    DockerSubcommand,
}

/// Observable state of one compose service's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Exited,
    /// No container exists for the service yet.
    Missing,
    /// Created/restarting/paused and similar transitional states.
    Other,
}

/// Verify docker is installed and the daemon is reachable.
pub async fn preflight_docker() -> Result<()> {
    if which::which("docker").is_err() {
        return Err(InstallError::Command {
            operation: "docker_preflight".into(),
            detail: "docker binary not found in PATH; install Docker first".into(),
        });
    }
    let out = run_cmd_with_timeout(
        "docker",
        &["info".to_string()],
        Duration::from_secs(15),
        "docker_info",
    )
    .await?;
    if !out.success() {
        let detail = if out.stderr.to_lowercase().contains("permission denied") {
            "docker daemon refused the connection (permission denied); add the user to the docker group or run with elevated privilege"
                .to_string()
        } else {
            format!("docker daemon not reachable: {}", out.stderr.trim())
        };
        return Err(InstallError::Command {
            operation: "docker_preflight".into(),
            detail,
        });
    }
    Ok(())
}

/// Detect which compose invocation is available, preferring V2.
pub async fn detect_compose_invocation() -> Result<ComposeInvocation> {
    debug!("[PHASE: preflight] [STEP: docker] checking for docker compose (V2)");
    let out = run_cmd_with_timeout(
        "docker",
        &["compose".to_string(), "version".to_string()],
        Duration::from_secs(10),
        "compose_v2_version",
    )
    .await;
    if out.as_ref().map(|o| o.success()).unwrap_or(false) {
        return Ok(ComposeInvocation::DockerSubcommand);
    }

    debug!("[PHASE: preflight] [STEP: docker] V2 not available, checking docker-compose (V1)");
    let out = run_cmd_with_timeout(
        "docker-compose",
        &["--version".to_string()],
        Duration::from_secs(10),
        "compose_v1_version",
    )
    .await;
    if out.as_ref().map(|o| o.success()).unwrap_or(false) {
        return Ok(ComposeInvocation::DockerComposeBinary);
    }

    Err(InstallError::Command {
        operation: "compose_detect".into(),
        detail: "neither 'docker compose' (V2) nor 'docker-compose' (V1) is available".into(),
    })
}

/// Handle to one compose project (a compose file plus optional override).
#[derive(Debug, Clone)]
pub struct ComposeProject {
    pub compose_file: PathBuf,
    pub override_file: PathBuf,
    inv: ComposeInvocation,
}

impl ComposeProject {
    pub fn new(compose_file: PathBuf, override_file: PathBuf, inv: ComposeInvocation) -> Self {
        Self {
            compose_file,
            override_file,
            inv,
        }
    }

    fn file_args(&self) -> Result<Vec<String>> {
        let f = self
            .compose_file
            .to_str()
            .ok_or_else(|| InstallError::Command {
                operation: "compose".into(),
                detail: format!("non-UTF8 compose path {:?}", self.compose_file),
            })?;
        let mut args = vec!["-f".to_string(), f.to_string()];
        // The override only participates while it exists; its absence IS the
        // production restart policy.
        if self.override_file.exists() {
            if let Some(o) = self.override_file.to_str() {
                args.push("-f".to_string());
                args.push(o.to_string());
            }
        }
        Ok(args)
    }

    async fn run(&self, subcommand: &str, extra: &[&str], label: &str) -> Result<CommandOutput> {
        let files = self.file_args()?;
        let (program, mut args) = match self.inv {
            ComposeInvocation::DockerComposeBinary => ("docker-compose", files),
            ComposeInvocation::DockerSubcommand => {
                let mut a = vec!["compose".to_string()];
                a.extend(files);
                ("docker", a)
            }
        };
        args.push(subcommand.to_string());
        for e in extra {
            args.push(e.to_string());
        }
        run_cmd_with_timeout(program, &args, COMPOSE_CMD_TIMEOUT, label).await
    }

    /// `compose up -d [service]`. With no service, brings up the whole
    /// project (used for the final production-policy restart).
    pub async fn up(&self, service: Option<&str>) -> Result<()> {
        let mut extra = vec!["-d"];
        if let Some(s) = service {
            extra.push(s);
        }
        info!(
            "[PHASE: sequence] [STEP: compose] up -d {}",
            service.unwrap_or("(all)")
        );
        let out = self.run("up", &extra, "compose_up").await?;
        if out.success() {
            return Ok(());
        }
        warn!(
            "[PHASE: sequence] [STEP: compose] up failed: {}",
            out.stderr.trim()
        );
        Err(InstallError::Command {
            operation: format!("compose_up[{}]", service.unwrap_or("all")),
            detail: out.stderr.trim().to_string(),
        })
    }

    /// State of one service's container, via `compose ps <service>`.
    pub async fn service_state(&self, service: &str) -> Result<ServiceState> {
        let out = self
            .run("ps", &["-a", service], "compose_ps")
            .await?;
        if !out.success() {
            return Err(InstallError::Command {
                operation: format!("compose_ps[{}]", service),
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(parse_service_state(&out.stdout))
    }

    /// Tail a service's logs, for failure attribution in error messages.
    pub async fn logs(&self, service: &str, tail: u32) -> Result<String> {
        let tail_arg = format!("--tail={}", tail);
        let out = self
            .run("logs", &[&tail_arg, service], "compose_logs")
            .await?;
        // compose interleaves service output over stdout and stderr
        Ok(format!("{}{}", out.stdout, out.stderr))
    }
}

/// Parse `compose ps -a <service>` table output into a ServiceState.
///
/// Handles both V1 ("Up 2 minutes" / "Exit 1") and V2 ("running" /
/// "exited") status wording.
pub fn parse_service_state(stdout: &str) -> ServiceState {
    let mut saw_container = false;
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let upper = line.to_uppercase();
        // Header rows from either compose version
        if upper.contains("NAME") && (upper.contains("STATUS") || upper.contains("STATE")) {
            continue;
        }
        if line.starts_with('-') {
            continue;
        }
        saw_container = true;
        let lower = line.to_lowercase();
        if lower.contains("running") || lower.contains(" up ") || lower.ends_with(" up") {
            return ServiceState::Running;
        }
        if lower.contains("exited") || lower.contains("exit ") {
            return ServiceState::Exited;
        }
    }
    if saw_container {
        ServiceState::Other
    } else {
        ServiceState::Missing
    }
}

/// Run a command inside a running container (`docker exec`). Used by
/// command-style health probes such as pg_isready.
pub async fn docker_exec(container: &str, command: &[&str], label: &str) -> Result<CommandOutput> {
    let mut args = vec!["exec".to_string(), container.to_string()];
    for c in command {
        args.push(c.to_string());
    }
    run_cmd_with_timeout("docker", &args, Duration::from_secs(30), label).await
}
