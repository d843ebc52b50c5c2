//! Statistics sinks.
//!
//! Every routed request is reported in; every finished handler reports
//! out with its byte count and status. The stock sink is an Apache-style
//! access log line per finished request.

use std::net::SocketAddr;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::config::{ConfigError, HandlerConfig};
use crate::http::Request;

/// What a finished handler remembers about its request, kept after the
/// request itself is gone.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub version: u8,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestInfo {
    pub fn from_request(req: &Request) -> RequestInfo {
        RequestInfo {
            method: req.method.to_string(),
            path: req.path.clone(),
            version: req.version,
            referer: req.header_str("Referer").map(str::to_owned),
            user_agent: req.header_str("User-Agent").map(str::to_owned),
        }
    }
}

pub trait StatsSink {
    fn request_in(&mut self, req: &Request, addr: &SocketAddr);

    #[allow(clippy::too_many_arguments)]
    fn request_out(
        &mut self,
        req: &RequestInfo,
        addr: &SocketAddr,
        bytes_sent: u64,
        connect_time: SystemTime,
        status: u16,
    );
}

/// Builds a sink by its configured name.
pub fn build(handler: &HandlerConfig) -> Result<Box<dyn StatsSink>, ConfigError> {
    match handler.handler.as_str() {
        "access_log" => Ok(Box::new(AccessLog)),
        name => Err(ConfigError::UnknownHandler {
            kind: "statistics",
            name: name.to_owned(),
        }),
    }
}

/// Logs finished requests in Apache combined format through the `log`
/// crate.
pub struct AccessLog;

impl StatsSink for AccessLog {
    fn request_in(&mut self, _req: &Request, _addr: &SocketAddr) {}

    fn request_out(
        &mut self,
        req: &RequestInfo,
        addr: &SocketAddr,
        bytes_sent: u64,
        connect_time: SystemTime,
        status: u16,
    ) {
        let when: DateTime<Utc> = connect_time.into();
        let size = if bytes_sent > 0 {
            bytes_sent.to_string()
        } else {
            "-".to_owned()
        };
        log::info!(
            "{} - - [{}] \"{} {} HTTP/1.{}\" {} {} \"{}\" \"{}\"",
            addr.ip(),
            when.format("%d/%b/%Y:%H:%M:%S %z"),
            req.method,
            req.path,
            req.version,
            status,
            size,
            req.referer.as_deref().unwrap_or("-"),
            req.user_agent.as_deref().unwrap_or("-"),
        );
    }
}
