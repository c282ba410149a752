use std::{net::SocketAddr, time::Duration};

use anyhow::Context;

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:5554";
const DEFAULT_WS_ADDR: &str = "127.0.0.1:3002";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_OBSERVER_QUEUE: usize = 256;
const DEFAULT_OUTPUT_DRAIN_MS: u64 = 2000;

// Dashboard shells: the browser dev build and the desktop webview.
const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost",
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "tauri://localhost",
    "http://tauri.localhost",
];

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub http_addr: SocketAddr,
    /// Dedicated observer listener; `None` when disabled.
    pub ws_addr: Option<SocketAddr>,
    pub allowed_origins: Vec<String>,
    pub probe_timeout: Duration,
    pub observer_queue: usize,
    pub output_drain: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 5554)),
            ws_addr: Some(SocketAddr::from(([127, 0, 0, 1], 3002))),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            observer_queue: DEFAULT_OBSERVER_QUEUE,
            output_drain: Duration::from_millis(DEFAULT_OUTPUT_DRAIN_MS),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let http_raw =
            std::env::var("DEVDECK_HTTP_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
        let http_addr = http_raw
            .trim()
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid DEVDECK_HTTP_ADDR: {http_raw}"))?;

        let ws_raw =
            std::env::var("DEVDECK_WS_ADDR").unwrap_or_else(|_| DEFAULT_WS_ADDR.to_string());
        let ws_addr = parse_optional_addr(&ws_raw)
            .with_context(|| format!("invalid DEVDECK_WS_ADDR: {ws_raw}"))?;

        let allowed_origins = match std::env::var("DEVDECK_ALLOWED_ORIGINS") {
            Ok(raw) => parse_origins(&raw),
            Err(_) => Self::default().allowed_origins,
        };

        Ok(Self {
            http_addr,
            ws_addr,
            allowed_origins,
            probe_timeout: Duration::from_millis(
                env_u64("DEVDECK_PROBE_TIMEOUT_MS")
                    .map(|v| v.clamp(250, 60_000))
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
            ),
            observer_queue: env_usize("DEVDECK_OBSERVER_QUEUE")
                .map(|v| v.clamp(16, 65_536))
                .unwrap_or(DEFAULT_OBSERVER_QUEUE),
            output_drain: Duration::from_millis(
                env_u64("DEVDECK_OUTPUT_DRAIN_MS")
                    .map(|v| v.clamp(0, 30_000))
                    .unwrap_or(DEFAULT_OUTPUT_DRAIN_MS),
            ),
        })
    }
}

fn parse_optional_addr(raw: &str) -> anyhow::Result<Option<SocketAddr>> {
    let raw = raw.trim();
    if raw.is_empty()
        || matches!(
            raw.to_ascii_lowercase().as_str(),
            "off" | "0" | "false" | "no" | "disabled"
        )
    {
        return Ok(None);
    }
    Ok(Some(raw.parse::<SocketAddr>()?))
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
