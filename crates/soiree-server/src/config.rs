//! Server configuration loaded from environment variables.
//!
//! Everything except the JWT secret has a default suitable for local
//! development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use soiree_shared::constants::{DEFAULT_HTTP_PORT, PRESENCE_IDLE_SECS, PRESENCE_SWEEP_SECS};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8090`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./soiree.db`
    pub database_path: PathBuf,

    /// HS256 secret shared with the service that mints tokens.
    /// Env: `JWT_SECRET`
    /// Default: none, startup fails without it.
    pub jwt_secret: Option<String>,

    /// Origins allowed by CORS.
    /// Env: `CORS_ALLOWED_ORIGINS` (comma separated)
    /// Default: `http://localhost:3000`
    pub cors_origins: Vec<String>,

    /// Push gateway endpoint.
    /// Env: `PUSH_GATEWAY_URL`
    /// Default: none (push notifications disabled).
    pub push_gateway_url: Option<String>,

    /// Bearer key sent to the push gateway.
    /// Env: `PUSH_GATEWAY_KEY`
    pub push_gateway_key: Option<String>,

    /// Heartbeat idle timeout before a user is marked offline.
    /// Env: `PRESENCE_IDLE_SECS`
    /// Default: `240`
    pub presence_idle_secs: u64,

    /// Period of the presence garbage-collection sweep.
    /// Env: `PRESENCE_SWEEP_SECS`
    /// Default: `3600`
    pub presence_sweep_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./soiree.db"),
            jwt_secret: None,
            cors_origins: vec!["http://localhost:3000".to_string()],
            push_gateway_url: None,
            push_gateway_key: None,
            presence_idle_secs: PRESENCE_IDLE_SECS,
            presence_sweep_secs: PRESENCE_SWEEP_SECS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        config.jwt_secret = non_empty_var("JWT_SECRET");

        if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
            let parsed = parse_origins(&origins);
            if parsed.is_empty() {
                tracing::warn!(value = %origins, "Empty CORS_ALLOWED_ORIGINS, using default");
            } else {
                config.cors_origins = parsed;
            }
        }

        config.push_gateway_url = non_empty_var("PUSH_GATEWAY_URL");
        config.push_gateway_key = non_empty_var("PUSH_GATEWAY_KEY");

        if let Some(secs) = positive_secs("PRESENCE_IDLE_SECS") {
            config.presence_idle_secs = secs;
        }
        if let Some(secs) = positive_secs("PRESENCE_SWEEP_SECS") {
            config.presence_sweep_secs = secs;
        }

        config
    }

    pub fn presence_idle(&self) -> Duration {
        Duration::from_secs(self.presence_idle_secs)
    }

    pub fn presence_sweep(&self) -> Duration {
        Duration::from_secs(self.presence_sweep_secs)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("cors_origins", &self.cors_origins)
            .field("push_gateway_url", &self.push_gateway_url)
            .field("push_gateway_key", &self.push_gateway_key.as_ref().map(|_| "<redacted>"))
            .field("presence_idle_secs", &self.presence_idle_secs)
            .field("presence_sweep_secs", &self.presence_sweep_secs)
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive_secs(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(secs),
        _ => {
            tracing::warn!(var = name, value = %raw, "Invalid duration, using default");
            None
        }
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}
