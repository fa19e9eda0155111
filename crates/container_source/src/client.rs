//! Container runtime control-plane client (Docker-compatible HTTP API over
//! a Unix socket; podman and containerd's CRI shims expose the same
//! surface). Three read-only endpoints: list running containers, subscribe
//! to the lifecycle event stream, and stream one container's combined
//! stdout/stderr log.

use std::path::{
    Path,
    PathBuf,
};

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::wire::UdsResponse;

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Labels", default)]
    pub labels: std::collections::BTreeMap<String, String>,
}

impl ContainerSummary {
    pub fn name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEventKind {
    Start,
    Stop,
    Die,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub id: String,
    pub kind: ContainerEventKind,
}

pub struct DockerRuntimeClient {
    socket_path: PathBuf,
}

impl DockerRuntimeClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn list_running(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        let mut resp = UdsResponse::get(&self.socket_path, "/containers/json").await?;
        let mut body = String::new();
        while let Some(line) = resp.read_line().await? {
            body.push_str(&line);
        }
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }

    /// Streams events onto `tx` until the connection closes (the caller
    /// reconnects, per `spec.md` §4.3's reconnection-backoff model).
    pub async fn stream_events(&self, tx: &mpsc::Sender<ContainerEvent>) -> anyhow::Result<()> {
        let mut resp = UdsResponse::get(&self.socket_path, "/events").await?;
        while let Some(line) = resp.read_line().await? {
            if line.is_empty() {
                continue;
            }
            if let Some(event) = parse_event(&line) {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Opens a combined stdout/stderr log stream and sends every
    /// demultiplexed `(is_stderr, payload)` frame on `tx` until the stream
    /// ends (container stopped and drained, or the connection otherwise
    /// closed).
    pub async fn stream_logs(
        &self,
        container_id: &str,
        stdout: bool,
        stderr: bool,
        follow: bool,
        tx: &mpsc::Sender<(bool, Vec<u8>)>,
    ) -> anyhow::Result<()> {
        let path = format!(
            "/containers/{container_id}/logs?follow={}&stdout={}&stderr={}&timestamps=0",
            follow as u8, stdout as u8, stderr as u8
        );
        let mut resp = UdsResponse::get(&self.socket_path, &path).await?;

        loop {
            let mut header = [0u8; 8];
            if !resp.read_exact_raw(&mut header).await? {
                return Ok(());
            }
            let stream_type = header[0];
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let mut payload = vec![0u8; len];
            if !resp.read_exact_raw(&mut payload).await? {
                return Ok(());
            }
            let is_stderr = stream_type == 2;
            if tx.send((is_stderr, payload)).await.is_err() {
                return Ok(());
            }
        }
    }
}

fn parse_event(line: &str) -> Option<ContainerEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let id = value.get("id").or_else(|| value.get("Actor").and_then(|a| a.get("ID")))?;
    let id = id.as_str()?.to_string();
    let status = value.get("status").or_else(|| value.get("Action"))?.as_str()?;
    let kind = match status {
        "start" => ContainerEventKind::Start,
        "stop" => ContainerEventKind::Stop,
        "die" => ContainerEventKind::Die,
        other => ContainerEventKind::Other(other.to_string()),
    };
    Some(ContainerEvent { id, kind })
}
