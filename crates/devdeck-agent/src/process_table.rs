//! Read-only view of the OS process table.
//!
//! Every public entry point degrades to "nothing found" on failure: status
//! polling runs continuously and must not be broken by a flaky OS query.

use std::{path::PathBuf, process::Stdio, time::Duration};

use devdeck_process::{OsProcess, ProcessSnapshot};
use tokio::process::Command;

use crate::error::ProbeError;

/// Runs an OS query under a deadline. The child is killed if the deadline
/// passes. A non-zero exit only counts as failure when stdout is empty
/// (`lsof` exits 1 whenever any selector matched nothing).
pub(crate) async fn run_probe(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, ProbeError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let out = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(source)) => {
            return Err(ProbeError::Io {
                program: program.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(ProbeError::Timeout {
                program: program.to_string(),
                timeout_ms: timeout.as_millis(),
            });
        }
    };

    if !out.status.success() && out.stdout.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ProbeError::Status {
            program: program.to_string(),
            status: out.status,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg_attr(windows, allow(dead_code))]
/// Splits off the first whitespace-delimited token, keeping the remainder's
/// inner spacing intact.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(end) => Some((&s[..end], &s[end..])),
        None => Some((s, "")),
    }
}

#[cfg_attr(windows, allow(dead_code))]
/// Parses `ps -eo pid=,ppid=,args=` output. Malformed rows are skipped.
pub(crate) fn parse_ps_output(stdout: &str) -> Vec<(u32, Option<u32>, String)> {
    let mut out = Vec::new();
    for line in stdout.lines() {
        let Some((pid, rest)) = next_token(line) else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        let Some((ppid, rest)) = next_token(rest) else {
            continue;
        };
        let ppid = ppid.parse::<u32>().ok().filter(|p| *p != 0);
        out.push((pid, ppid, rest.trim().to_string()));
    }
    out
}

/// Parses `lsof -d cwd -Fpn` field output into pid -> cwd pairs.
#[cfg_attr(any(target_os = "linux", windows), allow(dead_code))]
pub(crate) fn parse_lsof_cwds(stdout: &str) -> Vec<(u32, PathBuf)> {
    let mut out = Vec::new();
    let mut current: Option<u32> = None;
    for line in stdout.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current = pid.trim().parse::<u32>().ok();
        } else if let Some(name) = line.strip_prefix('n') {
            if let Some(pid) = current {
                out.push((pid, PathBuf::from(name)));
            }
        }
    }
    out
}

#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CimProcess {
    process_id: u32,
    parent_process_id: Option<u32>,
    command_line: Option<String>,
    name: Option<String>,
}

/// Parses `Get-CimInstance Win32_Process | ConvertTo-Json` output, which is
/// an object for a single row and an array otherwise.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_cim_json(stdout: &str) -> Result<Vec<OsProcess>, ProbeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parse_err = |e: serde_json::Error| ProbeError::Parse {
        program: "powershell".to_string(),
        detail: e.to_string(),
    };
    let rows: Vec<CimProcess> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(parse_err)?
    } else {
        vec![serde_json::from_str(trimmed).map_err(parse_err)?]
    };

    Ok(rows
        .into_iter()
        .filter_map(|r| {
            let command_line = r
                .command_line
                .filter(|c| !c.trim().is_empty())
                .or(r.name)?;
            Some(OsProcess {
                pid: r.process_id,
                parent_pid: r.parent_process_id.filter(|p| *p != 0),
                command_line,
                working_directory: None,
            })
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct ProcessProber {
    timeout: Duration,
}

impl Default for ProcessProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fresh snapshot of the process table; empty if the query failed.
    pub async fn list_processes(&self) -> ProcessSnapshot {
        match self.try_list().await {
            Ok(processes) => ProcessSnapshot::new(processes),
            Err(err) => {
                tracing::warn!(error = %err, "process table probe failed");
                ProcessSnapshot::default()
            }
        }
    }

    /// Command line of a single process, if it can be resolved.
    pub async fn command_of(&self, pid: u32) -> Option<String> {
        #[cfg(unix)]
        {
            let pid_arg = pid.to_string();
            match run_probe("ps", &["-p", &pid_arg, "-o", "args="], self.timeout).await {
                Ok(out) => Some(out.trim().to_string()).filter(|s| !s.is_empty()),
                Err(err) => {
                    tracing::debug!(pid, error = %err, "single process lookup failed");
                    None
                }
            }
        }

        #[cfg(not(unix))]
        {
            self.list_processes()
                .await
                .get(pid)
                .map(|p| p.command_line.clone())
        }
    }

    #[cfg(unix)]
    async fn try_list(&self) -> Result<Vec<OsProcess>, ProbeError> {
        let stdout = run_probe("ps", &["-eo", "pid=,ppid=,args="], self.timeout).await?;
        let rows = parse_ps_output(&stdout);
        if rows.is_empty() {
            return Err(ProbeError::Parse {
                program: "ps".to_string(),
                detail: "no process rows".to_string(),
            });
        }

        let cwds = self.resolve_cwds(&rows).await;
        Ok(rows
            .into_iter()
            .zip(cwds)
            .map(|((pid, parent_pid, command_line), working_directory)| OsProcess {
                pid,
                parent_pid,
                command_line,
                working_directory,
            })
            .collect())
    }

    #[cfg(windows)]
    async fn try_list(&self) -> Result<Vec<OsProcess>, ProbeError> {
        let stdout = run_probe(
            "powershell",
            &[
                "-NoProfile",
                "-NonInteractive",
                "-Command",
                "Get-CimInstance Win32_Process | Select-Object ProcessId,ParentProcessId,CommandLine,Name | ConvertTo-Json -Compress",
            ],
            self.timeout,
        )
        .await?;
        parse_cim_json(&stdout)
    }

    // Per-process lookups may fail (permissions, process already gone); those
    // rows keep `None` without affecting the rest of the batch.
    #[cfg(target_os = "linux")]
    async fn resolve_cwds(&self, rows: &[(u32, Option<u32>, String)]) -> Vec<Option<PathBuf>> {
        use futures_util::StreamExt;

        let pids: Vec<u32> = rows.iter().map(|(pid, _, _)| *pid).collect();
        let lookups = pids.into_iter().map(|pid| async move {
            tokio::fs::read_link(format!("/proc/{pid}/cwd")).await.ok()
        });
        let all = futures_util::stream::iter(lookups)
            .buffered(64)
            .collect::<Vec<_>>();

        match tokio::time::timeout(self.timeout, all).await {
            Ok(cwds) => cwds,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "cwd resolution timed out"
                );
                vec![None; rows.len()]
            }
        }
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    async fn resolve_cwds(&self, rows: &[(u32, Option<u32>, String)]) -> Vec<Option<PathBuf>> {
        let by_pid: std::collections::HashMap<u32, PathBuf> =
            match run_probe("lsof", &["-d", "cwd", "-Fpn"], self.timeout).await {
                Ok(out) => parse_lsof_cwds(&out).into_iter().collect(),
                Err(err) => {
                    tracing::debug!(error = %err, "cwd resolution via lsof failed");
                    Default::default()
                }
            };
        rows.iter()
            .map(|(pid, _, _)| by_pid.get(pid).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn listing_future_can_cross_threads() {
        let prober = ProcessProber::default();
        let listing = prober.list_processes();
        assert_send(&listing);
    }

    #[test]
    fn parses_ps_rows_and_keeps_command_spacing() {
        let out = "    1     0 /sbin/init splash\n  100    50 npm run dev --port  3000\n\ngarbage line\n  7 x\n";
        let rows = parse_ps_output(out);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (1, None, "/sbin/init splash".to_string()));
        assert_eq!(
            rows[1],
            (100, Some(50), "npm run dev --port  3000".to_string())
        );
        assert_eq!(rows[2], (7, None, String::new()));
    }

    #[test]
    fn parses_lsof_cwd_fields() {
        let out = "p10\nfcwd\nn/home/me/app\np11\nfcwd\nn/\np12\n";
        let rows = parse_lsof_cwds(out);
        assert_eq!(
            rows,
            vec![
                (10, PathBuf::from("/home/me/app")),
                (11, PathBuf::from("/")),
            ]
        );
    }

    #[test]
    fn parses_cim_json_object_and_array() {
        let single = r#"{"ProcessId":4,"ParentProcessId":0,"CommandLine":null,"Name":"System"}"#;
        let rows = parse_cim_json(single).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].command_line, "System");
        assert_eq!(rows[0].parent_pid, None);
        assert_eq!(rows[0].working_directory, None);

        let many = r#"[{"ProcessId":10,"ParentProcessId":4,"CommandLine":"node server.js","Name":"node.exe"},
                       {"ProcessId":11,"ParentProcessId":10,"CommandLine":null,"Name":null}]"#;
        let rows = parse_cim_json(many).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 10);
        assert_eq!(rows[0].parent_pid, Some(4));

        assert!(parse_cim_json("not json").is_err());
        assert!(parse_cim_json("  ").unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lists_the_current_process() {
        let snap = ProcessProber::default().list_processes().await;
        if snap.is_empty() {
            // No `ps` on this host; the probe degraded as designed.
            return;
        }
        let me = snap.get(std::process::id());
        assert!(me.is_some());
        #[cfg(target_os = "linux")]
        assert_eq!(
            me.and_then(|p| p.working_directory.clone()),
            std::env::current_dir().ok()
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_probe_error() {
        let err = run_probe(
            "devdeck-definitely-not-a-program",
            &[],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Io { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_probe_times_out() {
        let err = run_probe("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
    }
}
