//! Matches a declared script (working directory + command text) to live OS
//! processes the agent did not spawn itself.

use std::path::{Component, Path, PathBuf};

use devdeck_process::ProcessSnapshot;
use serde::Serialize;

use crate::{error::CorrelateError, process_table::ProcessProber, signal::Terminator};

/// Case-insensitive fragments identifying a shell or terminal emulator.
pub const TERMINAL_KEYWORDS: &[&str] = &[
    "bash",
    "zsh",
    // Plain substring of the whole line, so any path containing "sh" counts.
    "sh",
    "terminal",
    "konsole",
    "gnome-terminal",
    "xterm",
    "iterm",
    "cmd.exe",
    "powershell",
    "command prompt",
    "terminal.app",
    "rxvt",
    "terminator",
    "alacritty",
    "kitty",
    "conhost.exe",
    "windowsterminal",
];

/// How far up the parent chain a terminal-like ancestor is looked for.
pub const TERMINAL_ANCESTOR_DEPTH: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMatch {
    pub pid: u32,
    pub command_line: String,
    /// Parent recognised as a shell/terminal, closed alongside the match.
    pub terminal_pid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationReport {
    pub killed_pids: Vec<u32>,
    pub killed_terminal_pids: Vec<u32>,
}

pub fn is_terminal_like(command_line: &str) -> bool {
    let lower = command_line.to_lowercase();
    TERMINAL_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Lexical normalisation: drops `.`, folds `..` and trailing separators.
/// Symlinks are not resolved here.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn same_dir(a: &Path, b: &Path) -> bool {
    let (a, b) = (normalize_path(a), normalize_path(b));
    if cfg!(windows) {
        a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

fn commands_overlap(process_command: &str, command_text: &str) -> bool {
    let process_command = process_command.trim();
    if process_command.is_empty() || command_text.is_empty() {
        return false;
    }
    process_command.contains(command_text) || command_text.contains(process_command)
}

/// Pure matcher over a snapshot. A process matches only when its working
/// directory equals one of `dirs` and its command line overlaps
/// `command_text`. Processes with an unknown working directory never match.
fn find_in_dirs(
    snapshot: &ProcessSnapshot,
    dirs: &[PathBuf],
    command_text: &str,
) -> Vec<ProcessMatch> {
    let own_pid = std::process::id();
    let command_text = command_text.trim();

    snapshot
        .iter()
        .filter(|p| p.pid != own_pid)
        .filter(|p| {
            p.working_directory
                .as_deref()
                .is_some_and(|cwd| dirs.iter().any(|d| same_dir(cwd, d)))
        })
        .filter(|p| commands_overlap(&p.command_line, command_text))
        .map(|p| ProcessMatch {
            pid: p.pid,
            command_line: p.command_line.clone(),
            terminal_pid: terminal_ancestor(snapshot, p.parent_pid, own_pid),
        })
        .collect()
}

fn terminal_ancestor(snapshot: &ProcessSnapshot, parent: Option<u32>, own_pid: u32) -> Option<u32> {
    let mut next = parent;
    for _ in 0..TERMINAL_ANCESTOR_DEPTH {
        // pid 1 is init, never a terminal window.
        let pid = next.filter(|p| *p > 1 && *p != own_pid)?;
        let proc = snapshot.get(pid)?;
        if is_terminal_like(&proc.command_line) {
            return Some(pid);
        }
        next = proc.parent_pid;
    }
    None
}

pub fn find_in_snapshot(
    snapshot: &ProcessSnapshot,
    working_directory: &str,
    command_text: &str,
) -> Result<Vec<ProcessMatch>, CorrelateError> {
    let matches = find_in_dirs(snapshot, &[PathBuf::from(working_directory)], command_text);
    if matches.is_empty() {
        return Err(no_match(working_directory, command_text));
    }
    Ok(matches)
}

fn no_match(working_directory: &str, command_text: &str) -> CorrelateError {
    CorrelateError::NoMatch {
        path: working_directory.to_string(),
        command: command_text.trim().to_string(),
    }
}

/// Takes a fresh snapshot and matches against it. The declared directory is
/// tried as given and, when it differs, in its canonical form.
pub async fn find_by_path_and_command(
    prober: &ProcessProber,
    working_directory: &str,
    command_text: &str,
) -> Result<Vec<ProcessMatch>, CorrelateError> {
    let snapshot = prober.list_processes().await;
    find_with_snapshot(&snapshot, working_directory, command_text).await
}

pub(crate) async fn find_with_snapshot(
    snapshot: &ProcessSnapshot,
    working_directory: &str,
    command_text: &str,
) -> Result<Vec<ProcessMatch>, CorrelateError> {
    let declared = PathBuf::from(working_directory);
    let mut dirs = vec![declared.clone()];
    if let Ok(canonical) = tokio::fs::canonicalize(&declared).await {
        if !same_dir(&canonical, &declared) {
            dirs.push(canonical);
        }
    }

    let matches = find_in_dirs(snapshot, &dirs, command_text);
    if matches.is_empty() {
        return Err(no_match(working_directory, command_text));
    }
    Ok(matches)
}

/// Kills every matched pid, then every distinct terminal ancestor. Each
/// kill is independent; failures are logged and left out of the report.
pub async fn terminate_matches<T: Terminator>(
    matches: &[ProcessMatch],
    terminator: &T,
) -> TerminationReport {
    let mut report = TerminationReport::default();

    for m in matches {
        match terminator.terminate(m.pid).await {
            Ok(()) => {
                tracing::info!(pid = m.pid, command = %m.command_line, "killed correlated process");
                report.killed_pids.push(m.pid);
            }
            Err(err) => tracing::warn!(pid = m.pid, error = %err, "failed to kill correlated process"),
        }
    }

    let mut terminals: Vec<u32> = Vec::new();
    for pid in matches.iter().filter_map(|m| m.terminal_pid) {
        if !terminals.contains(&pid) && !report.killed_pids.contains(&pid) {
            terminals.push(pid);
        }
    }

    for pid in terminals {
        match terminator.terminate(pid).await {
            Ok(()) => {
                tracing::info!(pid, "killed terminal ancestor");
                report.killed_terminal_pids.push(pid);
            }
            Err(err) => tracing::warn!(pid, error = %err, "failed to kill terminal ancestor"),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use devdeck_process::OsProcess;
    use std::sync::Mutex;

    fn proc(pid: u32, ppid: Option<u32>, cwd: Option<&str>, cmd: &str) -> OsProcess {
        OsProcess {
            pid,
            parent_pid: ppid,
            command_line: cmd.to_string(),
            working_directory: cwd.map(PathBuf::from),
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<u32>>,
        refuse: Vec<u32>,
    }

    impl Terminator for Recorder {
        async fn terminate(&self, pid: u32) -> Result<(), RunnerError> {
            if self.refuse.contains(&pid) {
                return Err(RunnerError::SignalFailed {
                    pid,
                    reason: "denied".to_string(),
                });
            }
            self.sent.lock().unwrap().push(pid);
            Ok(())
        }
    }

    fn app_snapshot(parent_cmd: &str) -> ProcessSnapshot {
        ProcessSnapshot::new(vec![
            proc(10, Some(1), Some("/"), "gnome-terminal-server"),
            proc(50, Some(10), Some("/tmp/app"), parent_cmd),
            proc(100, Some(50), Some("/tmp/app"), "npm run dev --port 3000"),
            proc(200, Some(50), Some("/tmp/other"), "npm run dev"),
        ])
    }

    #[test]
    fn matches_on_path_and_command_overlap() {
        let snap = app_snapshot("bash");
        let got = find_in_snapshot(&snap, "/tmp/app", "dev").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].pid, 100);

        // The declared command may be longer than the live one.
        let snap = ProcessSnapshot::new(vec![proc(7, None, Some("/srv/api"), "node server.js")]);
        assert!(find_in_snapshot(&snap, "/srv/api/", "node server.js --watch").is_ok());
    }

    #[test]
    fn unrelated_command_or_directory_is_no_match() {
        let snap = app_snapshot("bash");
        assert_eq!(
            find_in_snapshot(&snap, "/tmp/app", "build"),
            Err(CorrelateError::NoMatch {
                path: "/tmp/app".to_string(),
                command: "build".to_string()
            })
        );
        assert!(find_in_snapshot(&snap, "/nowhere", "npm").is_err());
    }

    #[test]
    fn unknown_working_directory_never_matches() {
        let snap = ProcessSnapshot::new(vec![proc(5, None, None, "npm run dev")]);
        assert!(find_in_snapshot(&snap, "/", "dev").is_err());
        assert!(find_in_snapshot(&snap, "", "dev").is_err());
    }

    #[test]
    fn blank_command_never_matches() {
        let snap = app_snapshot("bash");
        assert!(find_in_snapshot(&snap, "/tmp/app", "   ").is_err());
    }

    #[test]
    fn path_normalisation_is_lexical() {
        assert_eq!(
            normalize_path(Path::new("/tmp/./app/../app/")),
            PathBuf::from("/tmp/app")
        );
        assert!(same_dir(Path::new("/tmp/app"), Path::new("/tmp/app/.")));
        assert!(!same_dir(Path::new("/tmp/app"), Path::new("/tmp/application")));
    }

    #[test]
    fn terminal_keywords_are_case_insensitive() {
        assert!(is_terminal_like("/bin/BASH --login"));
        assert!(is_terminal_like("C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe"));
        assert!(!is_terminal_like("node server.js"));
    }

    #[test]
    fn shell_fragment_matches_anywhere_in_the_command_line() {
        assert!(is_terminal_like("node /home/ashley/app/server.js"));
        assert!(is_terminal_like("/usr/bin/fish"));
        assert!(!is_terminal_like("python manage.py runserver"));
    }

    #[test]
    fn own_process_is_excluded() {
        let me = std::process::id();
        let snap = ProcessSnapshot::new(vec![proc(me, None, Some("/tmp/app"), "devdeck-agent dev")]);
        assert!(find_in_snapshot(&snap, "/tmp/app", "dev").is_err());
    }

    #[tokio::test]
    async fn shell_parent_is_killed_after_the_match() {
        let matches = find_in_snapshot(&app_snapshot("bash"), "/tmp/app", "dev").unwrap();
        assert_eq!(matches[0].terminal_pid, Some(50));

        let rec = Recorder::default();
        let report = terminate_matches(&matches, &rec).await;
        assert_eq!(report.killed_pids, vec![100]);
        assert_eq!(report.killed_terminal_pids, vec![50]);
        assert_eq!(*rec.sent.lock().unwrap(), vec![100, 50]);
    }

    #[tokio::test]
    async fn non_terminal_parent_is_left_alone() {
        let matches = find_in_snapshot(&app_snapshot("node"), "/tmp/app", "dev").unwrap();
        assert_eq!(matches[0].terminal_pid, None);

        let report = terminate_matches(&matches, &Recorder::default()).await;
        assert_eq!(report.killed_pids, vec![100]);
        assert!(report.killed_terminal_pids.is_empty());
    }

    #[tokio::test]
    async fn one_failed_kill_does_not_stop_the_rest() {
        let snap = ProcessSnapshot::new(vec![
            proc(50, Some(1), Some("/"), "zsh"),
            proc(100, Some(50), Some("/w"), "vite"),
            proc(101, Some(50), Some("/w"), "vite --host"),
        ]);
        let matches = find_in_snapshot(&snap, "/w", "vite").unwrap();
        assert_eq!(matches.len(), 2);

        let rec = Recorder {
            refuse: vec![100],
            ..Default::default()
        };
        let report = terminate_matches(&matches, &rec).await;
        assert_eq!(report.killed_pids, vec![101]);
        assert_eq!(report.killed_terminal_pids, vec![50]);
    }

    #[test]
    fn init_is_never_a_terminal_ancestor() {
        let snap = ProcessSnapshot::new(vec![
            proc(1, None, Some("/"), "/sbin/init splash"),
            proc(9, Some(1), Some("/w"), "vite"),
        ]);
        let matches = find_in_snapshot(&snap, "/w", "vite").unwrap();
        assert_eq!(matches[0].terminal_pid, None);
    }
}
