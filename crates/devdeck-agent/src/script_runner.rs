use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use devdeck_process::{ManagedProcessInfo, RunningScript, ScriptStatus, ServerEvent};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::Mutex,
    task::JoinHandle,
};

use crate::{error::RunnerError, observer_hub::ObserverHub, signal};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
struct ManagedEntry {
    /// Distinguishes successive runs of the same script id.
    run_id: u64,
    pid: u32,
    start_time: DateTime<Utc>,
    command: String,
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn event(self, script_id: String, pid: u32, data: String) -> ServerEvent {
        match self {
            Self::Stdout => ServerEvent::Stdout {
                script_id,
                pid,
                data,
            },
            Self::Stderr => ServerEvent::Stderr {
                script_id,
                pid,
                data,
            },
        }
    }
}

#[derive(Debug)]
struct RunnerInner {
    registry: Mutex<HashMap<String, ManagedEntry>>,
    /// Serializes start/stop for the same script id. An entry lives only
    /// while some start or stop holds it.
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_run: AtomicU64,
    hub: ObserverHub,
    output_drain: Duration,
}

/// Owner of every process the agent spawned itself.
///
/// Per script id the event sequence is `status(true)`, output chunks,
/// `exit`, `status(false)`. Restarting a running script kills the old
/// process group first; the old run's trailing events carry its own pid and
/// it emits no `status(false)`, since the script id is running again.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    inner: Arc<RunnerInner>,
}

impl ScriptRunner {
    pub fn new(hub: ObserverHub, output_drain: Duration) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                registry: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                next_run: AtomicU64::new(1),
                hub,
                output_drain,
            }),
        }
    }

    async fn gate(&self, script_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .gates
            .lock()
            .await
            .entry(script_id.to_string())
            .or_default()
            .clone()
    }

    async fn release_gate(&self, script_id: &str) {
        let mut gates = self.inner.gates.lock().await;
        if gates
            .get(script_id)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(script_id);
        }
    }

    /// Runs `op` while holding the script's gate.
    async fn gated<T>(&self, script_id: &str, op: impl Future<Output = T>) -> T {
        let gate = self.gate(script_id).await;
        let out = {
            let _guard = gate.lock().await;
            op.await
        };
        drop(gate);
        self.release_gate(script_id).await;
        out
    }

    /// Spawns `command` through the platform shell in `cwd` and returns its
    /// pid once the OS accepted the spawn.
    pub async fn start(&self, script_id: &str, command: &str, cwd: &str) -> Result<u32, RunnerError> {
        let invalid = || RunnerError::InvalidPath {
            path: cwd.to_string(),
        };
        if cwd.trim().is_empty() {
            return Err(invalid());
        }
        match tokio::fs::metadata(cwd).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(invalid()),
        }

        self.gated(script_id, self.start_locked(script_id, command, cwd))
            .await
    }

    async fn start_locked(&self, script_id: &str, command: &str, cwd: &str) -> Result<u32, RunnerError> {
        let superseded = self.inner.registry.lock().await.remove(script_id);
        if let Some(old) = &superseded {
            tracing::info!(script_id, pid = old.pid, "superseding running script");
            if let Err(err) = signal::force_kill_tree(old.pid).await {
                tracing::warn!(script_id, pid = old.pid, error = %err, "failed to kill superseded run");
            }
        }

        let mut child = match spawn_shell(command, cwd) {
            Ok(child) => child,
            Err(source) => {
                if superseded.is_some() {
                    self.inner
                        .hub
                        .publish(ServerEvent::status(ScriptStatus::stopped(script_id)))
                        .await;
                }
                return Err(RunnerError::SpawnFailed {
                    command: command.to_string(),
                    source,
                });
            }
        };

        let Some(pid) = child.id() else {
            return Err(RunnerError::SpawnFailed {
                command: command.to_string(),
                source: std::io::Error::other("child exited before its pid was read"),
            });
        };

        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        self.inner.registry.lock().await.insert(
            script_id.to_string(),
            ManagedEntry {
                run_id,
                pid,
                start_time: Utc::now(),
                command: command.to_string(),
            },
        );
        tracing::info!(script_id, pid, cwd, command, "script started");

        self.inner
            .hub
            .publish(ServerEvent::status(ScriptStatus::running(script_id, pid)))
            .await;

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(self.pump(out, script_id, pid, OutputStream::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(self.pump(err, script_id, pid, OutputStream::Stderr));
        }

        let runner = self.clone();
        let id = script_id.to_string();
        tokio::spawn(async move {
            let res = child.wait().await;

            let drain = runner.inner.output_drain;
            let drained =
                tokio::time::timeout(drain, futures_util::future::join_all(readers.iter_mut()))
                    .await;
            if drained.is_err() {
                // A grandchild still holds the pipes open.
                tracing::debug!(script_id = %id, pid, "output readers outlived the process; aborting");
                for reader in readers {
                    reader.abort();
                    let _ = reader.await;
                }
            }

            let code = match res {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(script_id = %id, pid, error = %err, "wait failed");
                    None
                }
            };
            tracing::info!(script_id = %id, pid, code, "script exited");

            runner
                .inner
                .hub
                .publish(ServerEvent::Exit {
                    script_id: id.clone(),
                    pid,
                    code,
                })
                .await;

            let removed = {
                let mut map = runner.inner.registry.lock().await;
                match map.get(&id) {
                    Some(e) if e.run_id == run_id => map.remove(&id).is_some(),
                    _ => false,
                }
            };
            if removed {
                runner
                    .inner
                    .hub
                    .publish(ServerEvent::status(ScriptStatus::stopped(id)))
                    .await;
            }
        });

        Ok(pid)
    }

    fn pump<R>(&self, mut reader: R, script_id: &str, pid: u32, stream: OutputStream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let hub = self.inner.hub.clone();
        let script_id = script_id.to_string();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            // Bytes of a character split across reads.
            let mut pending = Vec::new();
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        tracing::debug!(script_id = %script_id, pid, stream = stream.as_str(), error = %err, "output read failed");
                        break;
                    }
                };
                pending.extend_from_slice(&buf[..n]);
                let Some(data) = take_utf8(&mut pending) else {
                    continue;
                };
                tracing::debug!(script_id = %script_id, pid, stream = stream.as_str(), "{}", data.trim_end());
                hub.publish(stream.event(script_id.clone(), pid, data)).await;
            }
            if !pending.is_empty() {
                let data = String::from_utf8_lossy(&pending).into_owned();
                hub.publish(stream.event(script_id, pid, data)).await;
            }
        })
    }

    /// Requests termination of the script's process group. Exit is observed
    /// asynchronously by the watcher installed at start.
    pub async fn stop(&self, script_id: &str) -> Result<(), RunnerError> {
        self.gated(script_id, self.stop_locked(script_id)).await
    }

    async fn stop_locked(&self, script_id: &str) -> Result<(), RunnerError> {
        let pid = self
            .inner
            .registry
            .lock()
            .await
            .get(script_id)
            .map(|e| e.pid)
            .ok_or_else(|| RunnerError::NotFound {
                script_id: script_id.to_string(),
            })?;

        signal::force_kill_tree(pid).await?;
        tracing::info!(script_id, pid, "stop requested");
        Ok(())
    }

    pub async fn list_managed(&self) -> Vec<ManagedProcessInfo> {
        let mut out: Vec<ManagedProcessInfo> = self
            .inner
            .registry
            .lock()
            .await
            .iter()
            .map(|(script_id, e)| ManagedProcessInfo {
                script_id: script_id.clone(),
                pid: e.pid,
                start_time: e.start_time,
                command: e.command.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.script_id.cmp(&b.script_id));
        out
    }

    pub async fn running_scripts(&self) -> Vec<RunningScript> {
        self.list_managed()
            .await
            .into_iter()
            .map(|m| RunningScript {
                script_id: m.script_id,
                pid: m.pid,
            })
            .collect()
    }

    pub async fn status(&self, script_id: &str) -> ScriptStatus {
        match self.inner.registry.lock().await.get(script_id) {
            Some(e) => ScriptStatus::running(script_id, e.pid),
            None => ScriptStatus::stopped(script_id),
        }
    }

    pub async fn is_managed(&self, script_id: &str) -> bool {
        self.inner.registry.lock().await.contains_key(script_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.lock().await.len()
    }
}

/// Drains the decodable prefix of `pending`. An incomplete trailing
/// sequence stays behind for the next read; invalid bytes become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> Option<String> {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                break;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        break;
                    }
                }
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

fn spawn_shell(command: &str, cwd: &str) -> std::io::Result<tokio::process::Child> {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // Own session, so stop can signal the whole tree.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.spawn()
}

#[cfg(test)]
mod decode_tests {
    use super::take_utf8;

    #[test]
    fn split_character_is_carried_to_the_next_read() {
        let mut pending = b"caf\xC3".to_vec();
        assert_eq!(take_utf8(&mut pending).as_deref(), Some("caf"));
        assert_eq!(pending, b"\xC3");

        pending.extend_from_slice(b"\xA9!");
        assert_eq!(take_utf8(&mut pending).as_deref(), Some("\u{e9}!"));
        assert!(pending.is_empty());
    }

    #[test]
    fn lone_tail_byte_yields_nothing_yet() {
        let mut pending = b"\xE2\x82".to_vec();
        assert_eq!(take_utf8(&mut pending), None);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn invalid_bytes_are_replaced_not_held() {
        let mut pending = b"a\xFFb".to_vec();
        assert_eq!(take_utf8(&mut pending).as_deref(), Some("a\u{FFFD}b"));
        assert!(pending.is_empty());
    }
}
