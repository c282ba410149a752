use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Informational classification of a script. Has no effect on how it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Frontend,
    Backend,
    #[default]
    Other,
}

/// A user-declared unit of work, as the dashboard client sends it.
///
/// `absolute_path` + `command` form the correlation key used to find an OS
/// process when the agent did not spawn it itself. Fields the agent does not
/// know about are kept in `extra` so the client gets them back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalScript {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ScriptType,
    #[serde(default)]
    pub absolute_path: Option<String>,
    #[serde(default, rename = "script", alias = "command")]
    pub command: Option<String>,
    #[serde(
        default,
        deserialize_with = "optional_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    /// Advisory cache of the last observed state. Never authoritative.
    #[serde(default)]
    pub is_running: bool,
    /// Diagnostic port information attached by status reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_status: Option<PortOccupancy>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogicalScript {
    /// Working directory, if present and non-blank.
    pub fn path(&self) -> Option<&str> {
        self.absolute_path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Command text, if present and non-blank.
    pub fn command_text(&self) -> Option<&str> {
        self.command
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalProject {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub scripts: Vec<LogicalScript>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One row of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsProcess {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub command_line: String,
    /// `None` when the platform cannot resolve it or the lookup failed.
    /// Such a process never matches by path.
    pub working_directory: Option<PathBuf>,
}

/// Point-in-time copy of the process table. Never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSnapshot {
    pub processes: Vec<OsProcess>,
}

impl ProcessSnapshot {
    pub fn new(processes: Vec<OsProcess>) -> Self {
        Self { processes }
    }

    pub fn get(&self, pid: u32) -> Option<&OsProcess> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OsProcess> {
        self.processes.iter()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortOccupancy {
    pub port: u16,
    pub occupied: bool,
    pub owning_pid: Option<u32>,
    pub owning_command: Option<String>,
}

impl PortOccupancy {
    pub fn free(port: u16) -> Self {
        Self {
            port,
            occupied: false,
            owning_pid: None,
            owning_command: None,
        }
    }
}

/// Registry entry for a process the agent spawned itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProcessInfo {
    pub script_id: String,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStatus {
    pub script_id: String,
    pub running: bool,
    pub pid: Option<u32>,
}

impl ScriptStatus {
    pub fn stopped(script_id: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            running: false,
            pid: None,
        }
    }

    pub fn running(script_id: impl Into<String>, pid: u32) -> Self {
        Self {
            script_id: script_id.into(),
            running: true,
            pid: Some(pid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningScript {
    pub script_id: String,
    pub pid: u32,
}

/// Frames pushed from the agent to observer connections.
///
/// Output and exit frames carry the pid of the run that produced them, so a
/// consumer can tell a superseded run's trailing output from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Stdout {
        script_id: String,
        pid: u32,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Stderr {
        script_id: String,
        pid: u32,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Exit {
        script_id: String,
        pid: u32,
        code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        script_id: String,
        running: bool,
        pid: Option<u32>,
    },
    AllRunningScripts { scripts: Vec<RunningScript> },
}

impl ServerEvent {
    pub fn status(status: ScriptStatus) -> Self {
        Self::Status {
            script_id: status.script_id,
            running: status.running,
            pid: status.pid,
        }
    }

    pub fn script_id(&self) -> Option<&str> {
        match self {
            Self::Stdout { script_id, .. }
            | Self::Stderr { script_id, .. }
            | Self::Exit { script_id, .. }
            | Self::Status { script_id, .. } => Some(script_id),
            Self::AllRunningScripts { .. } => None,
        }
    }

    /// Status changes go to every connection; everything else is scoped.
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Status { .. })
    }
}

/// Frames an observer connection may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register { script_id: String },
    #[serde(rename_all = "camelCase")]
    RequestStatus { script_id: String },
    #[serde(other)]
    Unknown,
}

/// Accepts ids sent either as JSON strings or numbers.
pub fn string_or_number<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

// The UI form may send ports as numbers, numeric strings, or empty strings.
fn optional_port<'de, D>(d: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| *v != 0)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid port: {n}"))),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<u16>()
                .ok()
                .filter(|v| *v != 0)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid port: {s}")))
        }
        Some(other) => Err(serde::de::Error::custom(format!("invalid port: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_keeps_unknown_client_fields() {
        let raw = json!({
            "id": "s1",
            "name": "web",
            "type": "frontend",
            "script": "npm run dev",
            "absolutePath": "/tmp/app",
            "port": "3000",
            "isRunning": true,
            "color": "teal"
        });
        let script: LogicalScript = serde_json::from_value(raw).unwrap();
        assert_eq!(script.kind, ScriptType::Frontend);
        assert_eq!(script.port, Some(3000));
        assert_eq!(script.command_text(), Some("npm run dev"));

        let back = serde_json::to_value(&script).unwrap();
        assert_eq!(back["color"], "teal");
        assert_eq!(back["script"], "npm run dev");
        assert!(back.get("portStatus").is_none());
    }

    #[test]
    fn script_with_blank_fields_has_no_correlation_key() {
        let script: LogicalScript = serde_json::from_value(json!({
            "id": 17,
            "script": "   ",
            "port": ""
        }))
        .unwrap();
        assert_eq!(script.id, "17");
        assert_eq!(script.path(), None);
        assert_eq!(script.command_text(), None);
        assert_eq!(script.port, None);
    }

    #[test]
    fn script_rejects_out_of_range_port() {
        let err = serde_json::from_value::<LogicalScript>(json!({"id": "x", "port": 70000}));
        assert!(err.is_err());
    }

    #[test]
    fn status_event_wire_shape() {
        let v = serde_json::to_value(ServerEvent::status(ScriptStatus::stopped("a"))).unwrap();
        assert_eq!(
            v,
            json!({"type": "status", "scriptId": "a", "running": false, "pid": null})
        );

        let v = serde_json::to_value(ServerEvent::AllRunningScripts {
            scripts: vec![RunningScript {
                script_id: "a".to_string(),
                pid: 42,
            }],
        })
        .unwrap();
        assert_eq!(
            v,
            json!({"type": "allRunningScripts", "scripts": [{"scriptId": "a", "pid": 42}]})
        );
    }

    #[test]
    fn only_status_events_are_global() {
        let out = ServerEvent::Stdout {
            script_id: "a".to_string(),
            pid: 1,
            data: "hi".to_string(),
        };
        assert!(!out.is_global());
        assert_eq!(out.script_id(), Some("a"));
        assert!(ServerEvent::status(ScriptStatus::running("a", 1)).is_global());
    }

    #[test]
    fn client_messages_parse() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"register","scriptId":"abc"}"#).unwrap();
        assert_eq!(
            m,
            ClientMessage::Register {
                script_id: "abc".to_string()
            }
        );
        let m: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(m, ClientMessage::Unknown);
    }

    #[test]
    fn snapshot_lookup_by_pid() {
        let snap = ProcessSnapshot::new(vec![OsProcess {
            pid: 7,
            parent_pid: Some(1),
            command_line: "bash".to_string(),
            working_directory: None,
        }]);
        assert_eq!(snap.get(7).map(|p| p.command_line.as_str()), Some("bash"));
        assert!(snap.get(8).is_none());
        assert_eq!(snap.len(), 1);
    }
}
