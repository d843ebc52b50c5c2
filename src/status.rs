//! Status endpoint renderers.
//!
//! Renderers are looked up by configured path and fed a snapshot of the
//! registry, so they hold no reference into the live server.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::config::{ConfigError, HandlerConfig};
use crate::http::{Request, Response};

/// One client, as seen by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub token: usize,
    pub address: String,
    pub queue_size: usize,
}

/// One source and its clients.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub address: String,
    pub clients: Vec<ClientStatus>,
}

/// A point-in-time view of the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub pid: u32,
    /// mount path → source label → source.
    pub sources: BTreeMap<String, BTreeMap<String, SourceStatus>>,
}

impl StatusSnapshot {
    fn queue_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self
            .sources
            .values()
            .flat_map(|sources| sources.values())
            .flat_map(|source| source.clients.iter().map(|c| c.queue_size))
            .collect();
        sizes.sort_unstable();
        sizes
    }

    pub fn total_clients(&self) -> usize {
        self.sources
            .values()
            .flat_map(|sources| sources.values())
            .map(|source| source.clients.len())
            .sum()
    }
}

pub trait StatusRenderer {
    fn render(&self, snapshot: &StatusSnapshot, req: &Request) -> Response;
}

/// Builds a renderer by its configured name.
pub fn build(handler: &HandlerConfig) -> Result<Box<dyn StatusRenderer>, ConfigError> {
    match handler.handler.as_str() {
        "plain" => Ok(Box::new(PlainStatus)),
        "json" => Ok(Box::new(JsonStatus)),
        "static" => Ok(Box::new(StaticFileStatus {
            path: handler
                .option_str("static_file")
                .unwrap_or_default()
                .to_owned(),
        })),
        name => Err(ConfigError::UnknownHandler {
            kind: "status",
            name: name.to_owned(),
        }),
    }
}

/// `text/plain` pretty-print of the registry.
pub struct PlainStatus;

impl StatusRenderer for PlainStatus {
    fn render(&self, snapshot: &StatusSnapshot, _req: &Request) -> Response {
        Response::new(200, "OK")
            .with_header("Content-Type", "text/plain")
            .with_body(format!("{snapshot:#?}\n"))
    }
}

/// `application/json` status document.
pub struct JsonStatus;

impl StatusRenderer for JsonStatus {
    fn render(&self, snapshot: &StatusSnapshot, _req: &Request) -> Response {
        let total_clients = snapshot.total_clients();
        let mut queue_sizes: Vec<i64> = snapshot.queue_sizes().iter().map(|&s| s as i64).collect();
        if queue_sizes.is_empty() {
            // Sentinel so min/max/median stay well-defined with no clients.
            queue_sizes.push(-1);
        }

        let sum: i64 = queue_sizes.iter().sum();
        let body = json!({
            "total_clients_number": total_clients,
            "pid": snapshot.pid,
            "max_buffer_queue_size": queue_sizes[queue_sizes.len() - 1],
            "min_buffer_queue_size": queue_sizes[0],
            "median_buffer_queue_size": queue_sizes[total_clients / 2],
            "average_buffer_queue_size": sum as f64 / queue_sizes.len() as f64,
            "sources": &snapshot.sources,
        });

        let mut text = serde_json::to_string_pretty(&body).unwrap_or_default();
        text.push('\n');
        Response::new(200, "OK")
            .with_header("Content-Type", "application/json")
            .with_body(text)
    }
}

/// Serves a file from disk, re-read per request.
pub struct StaticFileStatus {
    path: String,
}

impl StatusRenderer for StaticFileStatus {
    fn render(&self, _snapshot: &StatusSnapshot, _req: &Request) -> Response {
        match std::fs::read(&self.path) {
            Ok(body) => Response::new(200, "OK")
                .with_header("Content-Type", "application/octet-stream")
                .with_body(body),
            Err(err) => {
                log::error!("cannot serve static status file {}: {err}", self.path);
                Response::new(500, "Internal Server Error")
                    .with_header("Content-Type", "text/plain")
                    .with_body(&b"Failed to open static status file\n"[..])
            }
        }
    }
}
