use devdeck_process::{LogicalProject, LogicalScript, ProcessSnapshot};

use crate::{
    correlator, error::CorrelateError, ports::PortChecker, process_table::ProcessProber,
    script_runner::ScriptRunner,
};

/// The term looked for in process command lines. `npm run dev` probes for
/// `dev`; anything else probes for its first word.
pub fn probe_term(command: &str) -> Option<&str> {
    let mut tokens = command.split_whitespace();
    let first = tokens.next()?;
    if first == "npm" {
        if let Some(third) = tokens.nth(1) {
            return Some(third);
        }
    }
    Some(first)
}

/// Refreshes `isRunning` on client-declared projects from live OS state.
///
/// Never fails as a whole: every per-script problem degrades to "not
/// running" for that script only.
#[derive(Debug, Clone)]
pub struct StatusReconciler {
    runner: ScriptRunner,
    prober: ProcessProber,
    ports: PortChecker,
}

impl StatusReconciler {
    pub fn new(runner: ScriptRunner, prober: ProcessProber, ports: PortChecker) -> Self {
        Self {
            runner,
            prober,
            ports,
        }
    }

    /// Returns refreshed copies; the input is left untouched. One process
    /// table snapshot is shared by every script in the pass.
    pub async fn reconcile(&self, projects: &[LogicalProject]) -> Vec<LogicalProject> {
        let snapshot = self.prober.list_processes().await;
        self.reconcile_against(&snapshot, projects).await
    }

    pub(crate) async fn reconcile_against(
        &self,
        snapshot: &ProcessSnapshot,
        projects: &[LogicalProject],
    ) -> Vec<LogicalProject> {
        let mut out = Vec::with_capacity(projects.len());
        for project in projects {
            let mut refreshed = project.clone();
            for script in &mut refreshed.scripts {
                self.refresh_script(snapshot, &project.project_name, script)
                    .await;
            }
            out.push(refreshed);
        }
        out
    }

    async fn refresh_script(
        &self,
        snapshot: &ProcessSnapshot,
        project_name: &str,
        script: &mut LogicalScript,
    ) {
        script.port_status = match script.port {
            Some(port) => Some(self.ports.find_owner(port).await),
            None => None,
        };

        let (Some(path), Some(command)) = (script.path(), script.command_text()) else {
            tracing::debug!(project = project_name, script_id = %script.id, "missing path or command; not running");
            script.is_running = false;
            return;
        };

        if self.runner.is_managed(&script.id).await {
            script.is_running = true;
            return;
        }

        let Some(term) = probe_term(command) else {
            script.is_running = false;
            return;
        };

        script.is_running = match correlator::find_with_snapshot(snapshot, path, term).await {
            Ok(matches) => {
                tracing::debug!(
                    project = project_name,
                    script_id = %script.id,
                    pids = ?matches.iter().map(|m| m.pid).collect::<Vec<_>>(),
                    "script correlated"
                );
                true
            }
            Err(CorrelateError::NoMatch { .. }) => false,
        };
    }
}
