use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use devdeck_process::{
    ClientMessage, LogicalProject, LogicalScript, PortOccupancy, ScriptType, ServerEvent,
    string_or_number,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    correlator::{self, TerminationReport},
    error::{ApiError, CorrelateError, RunnerError},
    security,
    signal::OsTerminator,
    state::AppState,
};

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/run-script", post(run_script))
        .route("/stop-script", post(stop_script))
        .route("/running-scripts", get(running_scripts))
        .route("/check-status", post(check_status))
        .route("/kill-command", post(kill_command))
        .route("/stop-scripts", post(stop_scripts))
        .route("/used-ports", get(used_ports))
        .route("/ports/:port", get(port_status));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(observer_ws))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::origin_guard,
        ))
        .with_state(state)
}

/// Observer-only listener; the socket is served at `/`.
pub fn ws_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(observer_ws))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::origin_guard,
        ))
        .with_state(state)
}

type Payload<T> = Result<Json<T>, JsonRejection>;

fn body<T>(payload: Payload<T>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{field} is required")))
}

#[derive(Debug, Serialize)]
pub struct Healthz {
    status: &'static str,
    version: &'static str,
    managed: usize,
}

pub async fn healthz(State(state): State<AppState>) -> Json<Healthz> {
    Json(Healthz {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        managed: state.runner.len().await,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScriptRequest {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, alias = "command")]
    pub script: Option<String>,
    #[serde(default)]
    pub absolute_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScriptResponse {
    success: bool,
    script_id: String,
    pid: u32,
}

pub async fn run_script(
    State(state): State<AppState>,
    payload: Payload<RunScriptRequest>,
) -> Result<Json<RunScriptResponse>, ApiError> {
    let req = body(payload)?;
    let id = required(Some(req.id), "id")?;
    let script = required(req.script, "script")?;
    let path = required(req.absolute_path, "absolutePath")?;

    let pid = state.runner.start(&id, &script, &path).await?;
    Ok(Json(RunScriptResponse {
        success: true,
        script_id: id,
        pid,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StopScriptRequest {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct StopScriptResponse {
    success: bool,
    message: String,
}

pub async fn stop_script(
    State(state): State<AppState>,
    payload: Payload<StopScriptRequest>,
) -> Result<Json<StopScriptResponse>, ApiError> {
    let id = required(Some(body(payload)?.id), "id")?;
    state.runner.stop(&id).await?;
    Ok(Json(StopScriptResponse {
        success: true,
        message: format!("termination requested for script {id}"),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningEntry {
    running: bool,
    pid: u32,
    start_time: DateTime<Utc>,
    command: String,
}

pub async fn running_scripts(State(state): State<AppState>) -> Json<BTreeMap<String, RunningEntry>> {
    let map = state
        .runner
        .list_managed()
        .await
        .into_iter()
        .map(|m| {
            (
                m.script_id,
                RunningEntry {
                    running: true,
                    pid: m.pid,
                    start_time: m.start_time,
                    command: m.command,
                },
            )
        })
        .collect();
    Json(map)
}

/// The dashboard posts either a single project or the whole list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProjectsPayload {
    Many(Vec<LogicalProject>),
    One(Box<LogicalProject>),
}

pub async fn check_status(
    State(state): State<AppState>,
    payload: Payload<ProjectsPayload>,
) -> Result<Json<ProjectsPayload>, ApiError> {
    let refreshed = match body(payload)? {
        ProjectsPayload::Many(projects) => {
            ProjectsPayload::Many(state.reconciler.reconcile(&projects).await)
        }
        ProjectsPayload::One(project) => {
            let mut out = state
                .reconciler
                .reconcile(std::slice::from_ref(project.as_ref()))
                .await;
            match out.pop() {
                Some(p) => ProjectsPayload::One(Box::new(p)),
                None => ProjectsPayload::One(project),
            }
        }
    };
    Ok(Json(refreshed))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillCommandRequest {
    #[serde(default)]
    pub absolute_path: Option<String>,
    #[serde(default, alias = "command")]
    pub script: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillCommandResponse {
    message: String,
    script_pids: Vec<u32>,
    terminal_pids: Vec<u32>,
}

async fn kill_correlated(
    state: &AppState,
    path: &str,
    command: &str,
) -> Result<TerminationReport, CorrelateError> {
    let matches = correlator::find_by_path_and_command(&state.prober, path, command).await?;
    Ok(correlator::terminate_matches(&matches, &OsTerminator).await)
}

pub async fn kill_command(
    State(state): State<AppState>,
    payload: Payload<KillCommandRequest>,
) -> Result<Json<KillCommandResponse>, ApiError> {
    let req = body(payload)?;
    let path = required(req.absolute_path, "absolutePath")?;
    let script = required(req.script, "script")?;

    let report = kill_correlated(&state, &path, &script).await?;
    Ok(Json(KillCommandResponse {
        message: format!(
            "Terminated {} processes and {} terminal processes",
            report.killed_pids.len(),
            report.killed_terminal_pids.len()
        ),
        script_pids: report.killed_pids,
        terminal_pids: report.killed_terminal_pids,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopScriptsRequest {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub project_name: Option<String>,
    pub scripts: Vec<LogicalScript>,
    #[serde(default)]
    pub script_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotFound,
    NotRunning,
    SkipMissingInfo,
    Error,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopScriptResult {
    script_id: String,
    name: String,
    #[serde(rename = "type")]
    kind: ScriptType,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    status: StopOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    killed_pids: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    killed_terminals: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopScriptsResponse {
    project_id: String,
    project_name: String,
    script_count: usize,
    results: Vec<StopScriptResult>,
}

async fn stop_one(state: &AppState, script: &LogicalScript) -> StopScriptResult {
    let mut result = StopScriptResult {
        script_id: script.id.clone(),
        name: script.name.clone(),
        kind: script.kind,
        port: script.port,
        script: script.command.clone(),
        status: StopOutcome::NotRunning,
        killed_pids: None,
        killed_terminals: None,
        error: None,
    };

    let (Some(path), Some(command)) = (script.path(), script.command_text()) else {
        result.status = StopOutcome::SkipMissingInfo;
        return result;
    };
    if !script.is_running {
        return result;
    }

    let managed = state.runner.status(&script.id).await;
    if let Some(pid) = managed.pid {
        match state.runner.stop(&script.id).await {
            Ok(()) => {
                result.status = StopOutcome::Stopped;
                result.killed_pids = Some(vec![pid]);
                result.killed_terminals = Some(Vec::new());
            }
            // Exited between the lookup and the signal.
            Err(RunnerError::NotFound { .. }) => {}
            Err(err) => {
                result.status = StopOutcome::Error;
                result.error = Some(err.to_string());
            }
        }
        return result;
    }

    match kill_correlated(state, path, command).await {
        Ok(report) => {
            result.status = if report.killed_pids.is_empty() {
                StopOutcome::NotFound
            } else {
                StopOutcome::Stopped
            };
            result.killed_pids = Some(report.killed_pids);
            result.killed_terminals = Some(report.killed_terminal_pids);
        }
        Err(CorrelateError::NoMatch { .. }) => {}
    }
    result
}

pub async fn stop_scripts(
    State(state): State<AppState>,
    payload: Payload<StopScriptsRequest>,
) -> Result<Json<StopScriptsResponse>, ApiError> {
    let req = body(payload)?;
    let id = required(Some(req.id), "id")?;

    let mut results = Vec::with_capacity(req.scripts.len());
    for script in &req.scripts {
        results.push(stop_one(&state, script).await);
    }

    Ok(Json(StopScriptsResponse {
        project_id: id,
        project_name: req
            .project_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        script_count: req.script_count.unwrap_or(req.scripts.len()),
        results,
    }))
}

#[derive(Debug, Serialize)]
pub struct UsedPorts {
    ports: Vec<u16>,
}

pub async fn used_ports(State(state): State<AppState>) -> Json<UsedPorts> {
    Json(UsedPorts {
        ports: state.ports.used_ports().await,
    })
}

pub async fn port_status(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<PortOccupancy>, ApiError> {
    if port == 0 {
        return Err(ApiError::bad_request("port must be between 1 and 65535"));
    }
    Ok(Json(state.ports.find_owner(port).await))
}

pub async fn observer_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer_socket(state, socket))
}

async fn handle_observer_socket(state: AppState, socket: WebSocket) {
    let span = tracing::info_span!("observer_ws");
    async move {
        let (mut sender, mut receiver) = socket.split();

        let initial = ServerEvent::AllRunningScripts {
            scripts: state.runner.running_scripts().await,
        };
        let (id, mut rx) = state.hub.connect(initial).await;
        tracing::debug!(observer = %id, "observer connected");

        let mut writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode observer event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            // The hub dropped this connection; close so the client resyncs.
            let _ = sender.send(Message::Close(None)).await;
        });

        loop {
            let msg = tokio::select! {
                msg = receiver.next() => msg,
                _ = &mut writer => {
                    tracing::debug!(observer = %id, "observer writer finished");
                    break;
                }
            };
            let Some(Ok(msg)) = msg else { break };
            match msg {
                Message::Text(text) => handle_client_message(&state, id, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }

        state.hub.disconnect(id).await;
        writer.abort();
        tracing::debug!(observer = %id, "observer disconnected");
    }
    .instrument(span)
    .await
}

pub(crate) async fn handle_client_message(state: &AppState, id: Uuid, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Register { script_id }) => {
            if script_id.trim().is_empty() {
                tracing::debug!(observer = %id, "ignoring register without a script id");
                return;
            }
            if !state.hub.register(id, script_id.clone()).await {
                return;
            }
            tracing::debug!(observer = %id, script_id = %script_id, "observer registered");
            let status = state.runner.status(&script_id).await;
            state.hub.send_to(id, ServerEvent::status(status)).await;
        }
        Ok(ClientMessage::RequestStatus { script_id }) => {
            let status = state.runner.status(&script_id).await;
            state.hub.send_to(id, ServerEvent::status(status)).await;
        }
        Ok(ClientMessage::Unknown) => {
            tracing::debug!(observer = %id, "ignoring unknown observer message");
        }
        Err(err) => {
            tracing::debug!(observer = %id, error = %err, "ignoring malformed observer message");
        }
    }
}
