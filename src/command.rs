//! External commands: operator hooks and helper binaries.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::abort::{abortable_wait, StopSignal};
use crate::config::CommandHook;
use crate::{Error, Result};

/// Captured result of a finished command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Run `program args..` with a deadline. The child is killed when the
/// deadline passes or the stop signal fires.
pub async fn run(
    stop: &StopSignal,
    program: impl AsRef<Path>,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput> {
    let program = program.as_ref();
    let what = format!("{} {}", program.display(), args.join(" "));
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::command(format!("{what}: {e}")))?;

    let out = abortable_wait(stop, &what, tokio::time::timeout(timeout, child.wait_with_output()))
        .await?
        .map_err(|_| Error::timeout(format!("{what} after {}s", timeout.as_secs())))?
        .map_err(|e| Error::command(format!("{what}: {e}")))?;

    Ok(CommandOutput {
        success: out.status.success(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Run a shell command line with `sh -c`
pub async fn run_shell(stop: &StopSignal, command: &str, timeout: Duration) -> Result<CommandOutput> {
    run(stop, "sh", &["-c", command], timeout).await
}

/// Run an operator hook and write the command, its output and any error to
/// the hook's output path. A failing command is an error.
pub async fn run_hook(stop: &StopSignal, name: &str, hook: &CommandHook) -> Result<()> {
    if !hook.is_set() {
        return Ok(());
    }
    info!(hook = %name, command = %hook.command, "running command hook");
    let timeout = Duration::from_secs(hook.timeout_seconds.max(1));
    let result = run_shell(stop, &hook.command, timeout).await;

    let mut report = format!("$ {}\n\n", hook.command);
    let outcome = match &result {
        Ok(out) => {
            report.push_str(&out.combined());
            if out.success {
                Ok(())
            } else {
                report.push_str("\n\nerror: command exited with a non-zero status\n");
                Err(Error::command(format!("{name}: {}", out.stderr.trim())))
            }
        }
        Err(e) => {
            report.push_str(&format!("error: {e}\n"));
            Err(Error::command(format!("{name}: {e}")))
        }
    };

    if !hook.output_path.is_empty() {
        if let Err(e) = std::fs::write(&hook.output_path, &report) {
            warn!(hook = %name, path = %hook.output_path, error = %e, "failed to write hook output");
        }
    }
    if let Err(e) = &outcome {
        warn!(hook = %name, error = %e, "command hook failed");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(dir: &Path, command: &str) -> CommandHook {
        CommandHook {
            command: command.into(),
            output_path: dir.join("hook.out.log").display().to_string(),
            timeout_seconds: 10,
        }
    }

    /// Story: a hook's command and output are written for export
    #[tokio::test]
    async fn story_hook_output_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let h = hook(dir.path(), "echo cluster-ready");
        run_hook(&StopSignal::new(), "after-create-cluster", &h).await.unwrap();

        let written = std::fs::read_to_string(&h.output_path).unwrap();
        assert!(written.starts_with("$ echo cluster-ready"));
        assert!(written.contains("cluster-ready\n"));
    }

    /// Story: a failing hook fails the phase and says so in its output
    #[tokio::test]
    async fn story_failing_hook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = hook(dir.path(), "echo boom >&2; exit 3");
        let err = run_hook(&StopSignal::new(), "after-create-add-ons", &h)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        let written = std::fs::read_to_string(&h.output_path).unwrap();
        assert!(written.contains("non-zero status"));
    }

    #[tokio::test]
    async fn unset_hook_is_skipped() {
        run_hook(&StopSignal::new(), "none", &CommandHook::default()).await.unwrap();
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run_shell(&StopSignal::new(), "sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn stopped_signal_aborts_before_spawn_completes() {
        let stop = StopSignal::new();
        stop.stop("operator");
        let err = run_shell(&stop, "sleep 5", Duration::from_secs(10)).await.unwrap_err();
        assert!(err.is_aborted());
    }
}
