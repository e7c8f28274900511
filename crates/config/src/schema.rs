//! Config schema types (server, scaling, applications).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbConfig {
    pub server: ServerConfig,
    pub apps: AppsConfig,
}

/// Listener settings for one broker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Optional path prefix the HTTP/WS surface is mounted under.
    pub path: Option<String>,
    /// Public hostname, when it differs from the bind host.
    pub hostname: Option<String>,
    /// Maximum accepted HTTP request body, in bytes.
    pub max_request_size: usize,
    pub scaling: ScalingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            path: None,
            hostname: None,
            max_request_size: 10_000,
            scaling: ScalingConfig::default(),
        }
    }
}

/// Inter-broker fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// When false the broker runs standalone and no bus is attached.
    pub enabled: bool,
    /// Bus channel shared by the fleet.
    pub channel: String,
    /// Opaque transport settings, interpreted by the configured provider.
    pub transport: HashMap<String, serde_json::Value>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: "reverb".into(),
            transport: HashMap::new(),
        }
    }
}

/// The applications block: a provider tag plus the application records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsConfig {
    /// Application source. Only `config` (inline records) is built in.
    pub provider: String,
    pub apps: Vec<AppConfig>,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            provider: "config".into(),
            apps: Vec::new(),
        }
    }
}

/// One application (tenant) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_id: String,
    pub key: String,
    pub secret: String,
    /// Seconds of silence before the broker pings a connection.
    pub ping_interval: u64,
    /// Seconds after which a pinged, silent connection is considered gone.
    pub activity_timeout: u64,
    /// Ordered origin allowlist; `*` matches everything.
    pub allowed_origins: Vec<String>,
    /// Maximum accepted client frame, in bytes.
    pub max_message_size: usize,
    /// Connection quota; absent means unbounded.
    pub max_connections: Option<u32>,
    /// Free-form per-application options.
    pub options: HashMap<String, serde_json::Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            key: String::new(),
            secret: String::new(),
            ping_interval: 60,
            activity_timeout: 30,
            allowed_origins: vec!["*".into()],
            max_message_size: 10_000,
            max_connections: None,
            options: HashMap::new(),
        }
    }
}
