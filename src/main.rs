use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use log::error;

use matrix_installer::orchestrator::InstallOrchestrator;
use matrix_installer::paths::{default_install_root, InstallPaths};
use matrix_installer::topology::{ELEMENT_PORT, SYNAPSE_ADMIN_PORT};
use matrix_installer::{InstallIntent, InstallOutcome};

const USAGE: &str = "\
matrix-installer - install a Matrix homeserver stack on this host

USAGE:
    matrix-installer --domain <HOSTNAME> [OPTIONS]

OPTIONS:
    --domain <HOSTNAME>       Hostname the homeserver is reachable under (required)
    --port <PORT>             Published Synapse port [default: 8008]
    --install-root <DIR>      Install root [default: /opt/matrix-stack or ~/.local/share/matrix-stack]
    --enable-registration     Allow open user registration on the homeserver
    --report-stats            Opt in to anonymous usage statistics
    --reconfigure             Re-render config for a Complete session (or a changed intent)
    --skip-provisioning       Skip account/space creation (admin interface managed elsewhere)
    --reset-session           Discard the persisted install session and exit
    --help                    Show this help

Logging level comes from MATRIX_INSTALLER_LOG (error|warn|info|debug|trace).
";

struct CliArgs {
    domain: Option<String>,
    port: u16,
    install_root: PathBuf,
    toggles: Vec<(String, bool)>,
    reconfigure: bool,
    reset_session: bool,
    skip_provisioning: bool,
}

fn parse_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut parsed = CliArgs {
        domain: None,
        port: 8008,
        install_root: default_install_root(),
        toggles: Vec::new(),
        reconfigure: false,
        reset_session: false,
        skip_provisioning: false,
    };

    let mut it = args.iter().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--domain" => {
                parsed.domain = Some(
                    it.next()
                        .context("--domain requires a value")?
                        .to_string(),
                );
            }
            "--port" => {
                let raw = it.next().context("--port requires a value")?;
                parsed.port = raw
                    .parse()
                    .with_context(|| format!("invalid port '{}'", raw))?;
            }
            "--install-root" => {
                parsed.install_root =
                    PathBuf::from(it.next().context("--install-root requires a value")?);
            }
            "--enable-registration" => {
                parsed.toggles.push(("enable_registration".into(), true));
            }
            "--report-stats" => {
                parsed.toggles.push(("report_stats".into(), true));
            }
            "--reconfigure" => parsed.reconfigure = true,
            "--skip-provisioning" => parsed.skip_provisioning = true,
            "--reset-session" => parsed.reset_session = true,
            "--help" | "-h" => {
                print!("{}", USAGE);
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown flag '{}' (see --help)", other),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {:#}", e);
            eprint!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    let paths = InstallPaths::new(cli.install_root.clone());
    if let Err(e) = matrix_installer::logsetup::init_logging(&paths.log_dir()) {
        eprintln!("warning: logging unavailable: {:#}", e);
    }

    if cli.reset_session {
        return match InstallOrchestrator::reset_session(&paths) {
            Ok(true) => {
                println!("Install session discarded.");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                println!("No install session to discard.");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let Some(domain) = cli.domain else {
        eprintln!("error: --domain is required");
        eprint!("{}", USAGE);
        return ExitCode::from(2);
    };

    let intent = match InstallIntent::new(domain, cli.port, cli.toggles) {
        Ok(intent) => intent,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    let mut orchestrator = InstallOrchestrator::new(intent, paths, cli.reconfigure);
    if cli.skip_provisioning {
        orchestrator = orchestrator.without_provisioning();
    }
    match orchestrator.run().await {
        Ok(InstallOutcome::Installed { public_base_url }) => {
            println!("Installation complete.");
            println!("  Homeserver:    {}", public_base_url);
            println!("  Element:       http://127.0.0.1:{}/", ELEMENT_PORT);
            println!("  Admin console: http://127.0.0.1:{}/", SYNAPSE_ADMIN_PORT);
            ExitCode::SUCCESS
        }
        Ok(InstallOutcome::AlreadyComplete { public_base_url }) => {
            println!(
                "Already installed and healthy at {} (use --reconfigure to change settings).",
                public_base_url
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("[PHASE: orchestrate] [STEP: exit] {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
