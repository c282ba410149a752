//! Forced termination. Fire-and-forget: success means the OS accepted the
//! request, not that the process is gone.

use std::future::Future;

use crate::error::RunnerError;

fn refuse_self(pid: u32) -> Result<(), RunnerError> {
    if pid == 0 || pid == std::process::id() {
        return Err(RunnerError::SignalFailed {
            pid,
            reason: "refusing to signal the agent itself".to_string(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn raw_pid(pid: u32) -> Result<libc::pid_t, RunnerError> {
    libc::pid_t::try_from(pid).map_err(|_| RunnerError::SignalFailed {
        pid,
        reason: "pid out of range".to_string(),
    })
}

#[cfg(unix)]
fn kill_raw(target: libc::pid_t) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(target, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// SIGKILL a single process.
#[cfg(unix)]
pub async fn force_kill(pid: u32) -> Result<(), RunnerError> {
    refuse_self(pid)?;
    let target = raw_pid(pid)?;
    kill_raw(target).map_err(|e| RunnerError::SignalFailed {
        pid,
        reason: e.to_string(),
    })
}

/// SIGKILL the process group led by `pid`. Falls back to the single pid
/// when no such group exists.
#[cfg(unix)]
pub async fn force_kill_tree(pid: u32) -> Result<(), RunnerError> {
    refuse_self(pid)?;
    let target = raw_pid(pid)?;
    match kill_raw(-target) {
        Ok(()) => Ok(()),
        Err(group_err) => kill_raw(target).map_err(|e| RunnerError::SignalFailed {
            pid,
            reason: format!("{e} (process group: {group_err})"),
        }),
    }
}

#[cfg(windows)]
async fn taskkill(pid: u32, tree: bool) -> Result<(), RunnerError> {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str()];
    if tree {
        args.push("/T");
    }
    args.push("/F");

    let output = tokio::process::Command::new("taskkill")
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RunnerError::SignalFailed {
            pid,
            reason: format!("failed to run taskkill: {e}"),
        })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    Err(RunnerError::SignalFailed {
        pid,
        reason: if detail.is_empty() {
            "taskkill failed (no output)".to_string()
        } else {
            detail
        },
    })
}

#[cfg(windows)]
pub async fn force_kill(pid: u32) -> Result<(), RunnerError> {
    refuse_self(pid)?;
    taskkill(pid, false).await
}

#[cfg(windows)]
pub async fn force_kill_tree(pid: u32) -> Result<(), RunnerError> {
    refuse_self(pid)?;
    taskkill(pid, true).await
}

/// Seam over per-pid termination so correlation kills can be exercised
/// without touching real processes.
pub trait Terminator: Send + Sync {
    fn terminate(&self, pid: u32) -> impl Future<Output = Result<(), RunnerError>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsTerminator;

impl Terminator for OsTerminator {
    fn terminate(&self, pid: u32) -> impl Future<Output = Result<(), RunnerError>> + Send {
        force_kill(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_signals_itself() {
        let err = force_kill(std::process::id()).await.unwrap_err();
        assert!(matches!(err, RunnerError::SignalFailed { .. }));
        assert!(force_kill_tree(0).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kills_a_child_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        force_kill(pid).await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signalling_a_dead_pid_fails() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert!(force_kill(pid).await.is_err());
    }
}
