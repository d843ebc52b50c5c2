//! The authorization chain.
//!
//! Handlers run in configuration order; the first one with an opinion
//! wins. `basic` implements RFC 2617 Basic with separate producer and
//! listener credentials; `token` implements an md5-signed path scheme
//! `<prefix>/<token>/<hex timestamp>/<path>`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};

use crate::config::{Config, ConfigError, HandlerConfig};
use crate::http::{Request, Response};

/// A handler's verdict on one request.
#[derive(Debug)]
pub enum AuthDecision {
    Grant,
    Deny(Response),
    /// No opinion; the chain moves on.
    Pass,
}

pub trait Authorize: std::fmt::Debug {
    fn authorize(&self, addr: &SocketAddr, req: &mut Request, now: SystemTime) -> AuthDecision;
}

/// Builds a handler by its configured name.
pub fn build(
    handler: &HandlerConfig,
    config: &Config,
) -> Result<Box<dyn Authorize>, ConfigError> {
    match handler.handler.as_str() {
        "basic" => Ok(Box::new(BasicAuth::new(handler, config))),
        "token" => Ok(Box::new(TokenAuth::new(handler, config))),
        name => Err(ConfigError::UnknownHandler {
            kind: "auth",
            name: name.to_owned(),
        }),
    }
}

fn unauthorized() -> Response {
    Response::new(401, "Unauthorized").with_header("WWW-Authenticate", "Basic realm=\"spillway\"")
}

fn forbidden() -> Response {
    Response::new(403, "Forbidden")
}

#[derive(Debug, Clone, Default)]
struct Credentials {
    user: Option<String>,
    password: Option<String>,
}

impl Credentials {
    fn is_set(&self) -> bool {
        self.user.is_some() || self.password.is_some()
    }

    /// Checks a `Basic` authorization header value against these
    /// credentials.
    fn check(&self, req: &Request) -> AuthDecision {
        let header = match req.header("Authorization") {
            Some(header) => header,
            None => return AuthDecision::Deny(unauthorized()),
        };
        let encoded = match header.strip_prefix(b"Basic ") {
            Some(encoded) => encoded,
            // Only the Basic scheme is understood.
            None => return AuthDecision::Deny(forbidden()),
        };
        let decoded = match BASE64.decode(encoded) {
            Ok(decoded) => decoded,
            Err(_) => return AuthDecision::Deny(forbidden()),
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(decoded) => decoded,
            Err(_) => return AuthDecision::Deny(forbidden()),
        };
        let (user, password) = match decoded.split_once(':') {
            Some(parts) => parts,
            None => return AuthDecision::Deny(forbidden()),
        };

        if self.user.as_deref().is_some_and(|u| u != user) {
            return AuthDecision::Deny(forbidden());
        }
        if self.password.as_deref().is_some_and(|p| p != password) {
            return AuthDecision::Deny(forbidden());
        }
        AuthDecision::Grant
    }
}

/// Basic auth with per-mount credential overrides; producers and listeners
/// are checked against separate credential sets.
#[derive(Debug)]
pub struct BasicAuth {
    source_default: Credentials,
    client_default: Credentials,
    source_paths: HashMap<String, Credentials>,
    client_paths: HashMap<String, Credentials>,
}

impl BasicAuth {
    fn new(handler: &HandlerConfig, config: &Config) -> BasicAuth {
        let own = |v: Option<&str>| v.map(str::to_owned);
        let source_default = Credentials {
            user: own(handler.option_str("source_user")),
            password: own(handler.option_str("source_password")),
        };
        let client_default = Credentials {
            user: own(handler.option_str("user")),
            password: own(handler.option_str("password")),
        };

        let mut source_paths = HashMap::new();
        let mut client_paths = HashMap::new();
        for mount in &config.mounts {
            source_paths.insert(
                mount.path.clone(),
                Credentials {
                    user: mount.source_user.clone().or(source_default.user.clone()),
                    password: mount
                        .source_password
                        .clone()
                        .or(source_default.password.clone()),
                },
            );
            client_paths.insert(
                mount.path.clone(),
                Credentials {
                    user: mount.user.clone().or(client_default.user.clone()),
                    password: mount.password.clone().or(client_default.password.clone()),
                },
            );
        }

        BasicAuth {
            source_default,
            client_default,
            source_paths,
            client_paths,
        }
    }
}

impl Authorize for BasicAuth {
    fn authorize(&self, _addr: &SocketAddr, req: &mut Request, _now: SystemTime) -> AuthDecision {
        let (paths, default) = if req.method.is_ingest() {
            (&self.source_paths, &self.source_default)
        } else {
            (&self.client_paths, &self.client_default)
        };
        let creds = paths.get(&req.path).unwrap_or(default);
        if !creds.is_set() {
            return AuthDecision::Pass;
        }
        creds.check(req)
    }
}

#[derive(Debug, Clone, Default)]
struct TokenRules {
    secret: Option<String>,
    timeout: Option<u64>,
    prefix: String,
}

/// Token auth: the first path component under the prefix is
/// `md5(secret + "/" + path + timestamp)` in hex, the second a hex
/// timestamp; the remainder is the real mount path.
#[derive(Debug)]
pub struct TokenAuth {
    default: TokenRules,
    paths: HashMap<String, TokenRules>,
}

impl TokenAuth {
    fn new(handler: &HandlerConfig, config: &Config) -> TokenAuth {
        let default = TokenRules {
            secret: handler.option_str("secret").map(str::to_owned),
            timeout: handler.option_u64("timeout"),
            prefix: handler.option_str("prefix").unwrap_or("").to_owned(),
        };

        let mut paths = HashMap::new();
        for mount in &config.mounts {
            paths.insert(
                mount.path.clone(),
                TokenRules {
                    secret: mount.secret.clone().or(default.secret.clone()),
                    timeout: mount.token_timeout.or(default.timeout),
                    prefix: mount
                        .token_prefix
                        .clone()
                        .unwrap_or_else(|| default.prefix.clone()),
                },
            );
        }

        TokenAuth { default, paths }
    }

    fn rules_for(&self, path: &str) -> &TokenRules {
        self.paths.get(path).unwrap_or(&self.default)
    }
}

impl Authorize for TokenAuth {
    fn authorize(&self, _addr: &SocketAddr, req: &mut Request, now: SystemTime) -> AuthDecision {
        let rules = self.rules_for(&req.path).clone();
        let secret = match &rules.secret {
            Some(secret) => secret,
            None => return AuthDecision::Pass,
        };

        let stripped = match req.path.strip_prefix(&rules.prefix) {
            Some(stripped) => stripped.trim_matches('/'),
            // A protected path outside its own prefix is a config problem;
            // deny rather than serve unprotected.
            None => return AuthDecision::Deny(forbidden()),
        };

        let mut parts = stripped.splitn(3, '/');
        let (token, timestamp, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(token), Some(timestamp), Some(path)) => (token, timestamp, path),
            _ => return AuthDecision::Deny(forbidden()),
        };

        let mut hasher = Md5::new();
        hasher.update(secret.as_bytes());
        hasher.update(b"/");
        hasher.update(path.as_bytes());
        hasher.update(timestamp.as_bytes());
        let expected = format!("{:x}", hasher.finalize());
        if token != expected {
            return AuthDecision::Deny(forbidden());
        }

        if let Some(timeout) = rules.timeout {
            let issued = match u64::from_str_radix(timestamp, 16) {
                Ok(issued) => issued,
                Err(_) => return AuthDecision::Deny(forbidden()),
            };
            let now_secs = now
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs();
            if now_secs.saturating_sub(timeout) > issued {
                return AuthDecision::Deny(forbidden());
            }
        }

        // Strip the token components so routing sees the real mount path.
        let rewritten = format!("{}/{}", rules.prefix, path);
        req.path = rewritten;
        AuthDecision::Grant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn request(raw: &[u8]) -> Request {
        Request::parse(raw).unwrap().unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    fn basic_config(doc: &str) -> Config {
        serde_json::from_str(doc).unwrap()
    }

    #[test]
    fn basic_auth_grants_valid_credentials() {
        let config = basic_config(
            r#"{"mounts": [{"path": "/s", "user": "alice", "password": "secret"}]}"#,
        );
        let handler: HandlerConfig = serde_json::from_str(r#"{"handler": "basic"}"#).unwrap();
        let auth = BasicAuth::new(&handler, &config);

        // alice:secret
        let mut req = request(
            b"GET /s HTTP/1.0\r\nAuthorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n",
        );
        assert_matches!(
            auth.authorize(&addr(), &mut req, SystemTime::now()),
            AuthDecision::Grant
        );
    }

    #[test]
    fn basic_auth_challenges_when_missing() {
        let config =
            basic_config(r#"{"mounts": [{"path": "/s", "user": "alice", "password": "pw"}]}"#);
        let handler: HandlerConfig = serde_json::from_str(r#"{"handler": "basic"}"#).unwrap();
        let auth = BasicAuth::new(&handler, &config);

        let mut req = request(b"GET /s HTTP/1.0\r\n\r\n");
        match auth.authorize(&addr(), &mut req, SystemTime::now()) {
            AuthDecision::Deny(resp) => assert_eq!(resp.status, 401),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn basic_auth_denies_wrong_password() {
        let config =
            basic_config(r#"{"mounts": [{"path": "/s", "user": "alice", "password": "pw"}]}"#);
        let handler: HandlerConfig = serde_json::from_str(r#"{"handler": "basic"}"#).unwrap();
        let auth = BasicAuth::new(&handler, &config);

        // alice:wrong
        let mut req =
            request(b"GET /s HTTP/1.0\r\nAuthorization: Basic YWxpY2U6d3Jvbmc=\r\n\r\n");
        match auth.authorize(&addr(), &mut req, SystemTime::now()) {
            AuthDecision::Deny(resp) => assert_eq!(resp.status, 403),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn basic_auth_passes_unprotected_paths() {
        let config = basic_config(r#"{"mounts": [{"path": "/open"}]}"#);
        let handler: HandlerConfig = serde_json::from_str(r#"{"handler": "basic"}"#).unwrap();
        let auth = BasicAuth::new(&handler, &config);

        let mut req = request(b"GET /open HTTP/1.0\r\n\r\n");
        assert_matches!(
            auth.authorize(&addr(), &mut req, SystemTime::now()),
            AuthDecision::Pass
        );
    }

    #[test]
    fn token_auth_accepts_a_signed_path_and_rewrites_it() {
        let handler: HandlerConfig =
            serde_json::from_str(r#"{"handler": "token", "secret": "hunter2"}"#).unwrap();
        let auth = TokenAuth::new(&handler, &Config::default());

        let timestamp = "1a2b3c";
        let path = "stream";
        let mut hasher = Md5::new();
        hasher.update(b"hunter2");
        hasher.update(b"/");
        hasher.update(path.as_bytes());
        hasher.update(timestamp.as_bytes());
        let token = format!("{:x}", hasher.finalize());

        let raw = format!("GET /{token}/{timestamp}/{path} HTTP/1.0\r\n\r\n");
        let mut req = request(raw.as_bytes());
        assert_matches!(
            auth.authorize(&addr(), &mut req, SystemTime::now()),
            AuthDecision::Grant
        );
        assert_eq!(req.path, "/stream");
    }

    #[test]
    fn token_auth_rejects_bad_tokens() {
        let handler: HandlerConfig =
            serde_json::from_str(r#"{"handler": "token", "secret": "hunter2"}"#).unwrap();
        let auth = TokenAuth::new(&handler, &Config::default());

        let mut req = request(b"GET /deadbeef/1a2b3c/stream HTTP/1.0\r\n\r\n");
        assert_matches!(
            auth.authorize(&addr(), &mut req, SystemTime::now()),
            AuthDecision::Deny(_)
        );
    }

    #[test]
    fn token_auth_enforces_expiry() {
        let handler: HandlerConfig = serde_json::from_str(
            r#"{"handler": "token", "secret": "hunter2", "timeout": 60}"#,
        )
        .unwrap();
        let auth = TokenAuth::new(&handler, &Config::default());

        let issued: u64 = 1000;
        let timestamp = format!("{issued:x}");
        let path = "stream";
        let mut hasher = Md5::new();
        hasher.update(b"hunter2");
        hasher.update(b"/");
        hasher.update(path.as_bytes());
        hasher.update(timestamp.as_bytes());
        let token = format!("{:x}", hasher.finalize());

        let raw = format!("GET /{token}/{timestamp}/{path} HTTP/1.0\r\n\r\n");

        // Within the window.
        let mut req = request(raw.as_bytes());
        let now = UNIX_EPOCH + Duration::from_secs(issued + 30);
        assert_matches!(auth.authorize(&addr(), &mut req, now), AuthDecision::Grant);

        // Past it.
        let mut req = request(raw.as_bytes());
        let now = UNIX_EPOCH + Duration::from_secs(issued + 120);
        assert_matches!(auth.authorize(&addr(), &mut req, now), AuthDecision::Deny(_));
    }

    #[test]
    fn token_auth_without_secret_passes() {
        let handler: HandlerConfig = serde_json::from_str(r#"{"handler": "token"}"#).unwrap();
        let auth = TokenAuth::new(&handler, &Config::default());

        let mut req = request(b"GET /anything HTTP/1.0\r\n\r\n");
        assert_matches!(
            auth.authorize(&addr(), &mut req, SystemTime::now()),
            AuthDecision::Pass
        );
    }

    #[test]
    fn registry_rejects_unknown_handlers() {
        let handler: HandlerConfig =
            serde_json::from_str(r#"{"handler": "kerberos"}"#).unwrap();
        assert_matches!(
            build(&handler, &Config::default()),
            Err(ConfigError::UnknownHandler { .. })
        );
    }
}
