//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNLD_HTTP_PORT`, `TUNLD_CONTROL_PORT`,
//!    `TUNLD_BIND_HOST`, `TUNLD_PUBLIC_DOMAIN`, `TUNLD_PUBLIC_SCHEME`,
//!    `TUNLD_DASHBOARD_ORIGIN`
//! 2. **Config file** — path via `--config <path>`, or `tunld.toml` in CWD
//! 3. **Compiled defaults** — see each field's default below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! bind_host = "0.0.0.0"
//! http_port = 3000
//! control_port = 3001
//! public_domain = "localhost:3000"
//! public_scheme = "http"
//! dashboard_origin = "http://localhost:5173"
//! max_body_bytes = 10485760  # 10 MiB
//!
//! [tunnel]
//! request_timeout_secs = 30
//! heartbeat_interval_secs = 30
//! max_tunnels_per_channel = 10
//!
//! [inspector]
//! max_entries = 1000
//! retention_secs = 3600
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub inspector: InspectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener addresses and public-surface settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host both listeners bind to (default `0.0.0.0`).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Public HTTP port (default 3000).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Control-channel port (default 3001).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Domain requests arrive on; `<subdomain>.<public_domain>` selects a
    /// tunnel. May carry a port (default `localhost:3000`).
    #[serde(default = "default_public_domain")]
    pub public_domain: String,
    /// Scheme used when building `publicUrl` values (default `http`).
    #[serde(default = "default_public_scheme")]
    pub public_scheme: String,
    /// Origin allowed CORS access to `/api` (default: none).
    pub dashboard_origin: Option<String>,
    /// Maximum public request body in bytes (default 10 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Tunnel and control-channel limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Seconds a forwarded request may wait for the agent (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Seconds between liveness ticks on each channel (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Tunnels one channel may own (default 10).
    #[serde(default = "default_max_tunnels_per_channel")]
    pub max_tunnels_per_channel: usize,
}

/// Traffic inspector bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct InspectorConfig {
    /// Exchanges kept globally; each tunnel keeps at most half (default 1000).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Seconds an exchange stays queryable (default 3600).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    3000
}
fn default_control_port() -> u16 {
    3001
}
fn default_public_domain() -> String {
    "localhost:3000".to_string()
}
fn default_public_scheme() -> String {
    "http".to_string()
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_request_timeout() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_max_tunnels_per_channel() -> usize {
    10
}
fn default_max_entries() -> usize {
    1000
}
fn default_retention_secs() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            http_port: default_http_port(),
            control_port: default_control_port(),
            public_domain: default_public_domain(),
            public_scheme: default_public_scheme(),
            dashboard_origin: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_tunnels_per_channel: default_max_tunnels_per_channel(),
        }
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tunnel: TunnelConfig::default(),
            inspector: InspectorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (startup fails on error).
    /// Otherwise looks for `tunld.toml` in the current directory, falling
    /// back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| format!("failed to read config file {p}: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("failed to parse config file {p}: {e}"))?
        } else if Path::new("tunld.toml").exists() {
            let content = std::fs::read_to_string("tunld.toml")
                .map_err(|e| format!("failed to read tunld.toml: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("failed to parse tunld.toml: {e}"))?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(port) = std::env::var("TUNLD_HTTP_PORT") {
            config.server.http_port = port
                .parse()
                .map_err(|_| format!("TUNLD_HTTP_PORT is not a port: {port}"))?;
        }
        if let Ok(port) = std::env::var("TUNLD_CONTROL_PORT") {
            config.server.control_port = port
                .parse()
                .map_err(|_| format!("TUNLD_CONTROL_PORT is not a port: {port}"))?;
        }
        if let Ok(host) = std::env::var("TUNLD_BIND_HOST") {
            config.server.bind_host = host;
        }
        if let Ok(domain) = std::env::var("TUNLD_PUBLIC_DOMAIN") {
            config.server.public_domain = domain;
        }
        if let Ok(scheme) = std::env::var("TUNLD_PUBLIC_SCHEME") {
            config.server.public_scheme = scheme;
        }
        if let Ok(origin) = std::env::var("TUNLD_DASHBOARD_ORIGIN") {
            config.server.dashboard_origin = Some(origin);
        }

        Ok(config)
    }

    /// The public URL a subdomain is reachable at, e.g.
    /// `http://demo1.localhost:3000`.
    #[must_use]
    pub fn public_url(&self, subdomain: &str) -> String {
        format!(
            "{}://{}.{}",
            self.server.public_scheme, subdomain, self.server.public_domain
        )
    }

    /// The public domain with any `:port` suffix removed, for Host matching.
    #[must_use]
    pub fn public_domain_bare(&self) -> &str {
        self.server
            .public_domain
            .split(':')
            .next()
            .unwrap_or(&self.server.public_domain)
    }
}
