// External command execution with timeouts and bounded retries.
//
// All docker/compose invocations go through here. Secrets never reach the
// log: argument values that look sensitive are masked before logging.

use std::process::Stdio;
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::errors::{InstallError, Result};
use crate::logsetup::mask_sensitive;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn mask_arg_for_log(arg: &str) -> String {
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password")
        || lower.contains("secret")
        || lower.contains("token")
        || lower.contains("mac=")
    {
        return "***".to_string();
    }
    if arg.len() > 48 {
        return mask_sensitive(arg);
    }
    arg.to_string()
}

fn is_transient_exec_error(e: &InstallError) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("temporarily")
        || msg.contains("busy")
        || msg.contains("resource")
        || msg.contains("connection")
        || msg.contains("network")
}

async fn run_once(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: exec] [STEP: cmd] spawn (operation={}, program={}, args=[{}], timeout_ms={})",
        operation,
        program,
        args.iter()
            .map(|a| mask_arg_for_log(a))
            .collect::<Vec<_>>()
            .join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| InstallError::Command {
        operation: operation.to_string(),
        detail: format!("failed to spawn '{}': {}", program, e),
    })?;

    let mut stdout = child.stdout.take().ok_or_else(|| InstallError::Command {
        operation: operation.to_string(),
        detail: "failed to capture stdout".into(),
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| InstallError::Command {
        operation: operation.to_string(),
        detail: "failed to capture stderr".into(),
    })?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(InstallError::Command {
                operation: operation.to_string(),
                detail: format!("wait failed for '{}': {}", program, e),
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: exec] [STEP: cmd] timeout reached (operation={}, program={}, timeout_ms={}); killing process",
                operation,
                program,
                timeout_dur.as_millis()
            );
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: exec] [STEP: cmd] failed to kill timed-out process (operation={}): {}",
                    operation, e
                );
            }
            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;
            return Err(InstallError::Command {
                operation: operation.to_string(),
                detail: format!(
                    "'{}' timed out after {}ms",
                    program,
                    timeout_dur.as_millis()
                ),
            });
        }
    };

    let read_fail = |what: &str| InstallError::Command {
        operation: operation.to_string(),
        detail: format!("{} capture failed", what),
    };
    let stdout_str = stdout_task
        .await
        .map_err(|_| read_fail("stdout"))?
        .map_err(|_| read_fail("stdout"))?;
    let stderr_str = stderr_task
        .await
        .map_err(|_| read_fail("stderr"))?
        .map_err(|_| read_fail("stderr"))?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: exec] [STEP: cmd] done (operation={}, exit_code={:?}, duration_ms={})",
        operation, out.exit_code, out.duration_ms
    );

    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient
/// failures. Returns captured stdout/stderr even on non-zero exit; the
/// caller decides what counts as success.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    let program_owned = program.to_string();
    let args_owned = args.to_vec();
    let operation_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let op = operation_owned.clone();
        async move { run_once(&program, &args, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &InstallError| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: exec] [STEP: cmd] transient failure, retrying (operation={}, err={})",
                operation, e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: exec] [STEP: cmd] {} exit_code={:?} duration_ms={}",
                operation,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: exec] [STEP: cmd] {} failed after {}ms: {}",
                operation,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}
