//! `REVERB_*` environment variable overrides.
//!
//! Applied on top of the loaded file so deployments can configure a broker
//! (including a single inline application) without any config file at all.

use tracing::warn;

use crate::schema::{AppConfig, ReverbConfig};

/// Apply `REVERB_*` environment overrides to `config`.
pub fn apply_env_overrides(config: &mut ReverbConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(
    config: &mut ReverbConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(host) = lookup("REVERB_SERVER_HOST") {
        config.server.host = host;
    }
    if let Some(port) = lookup("REVERB_SERVER_PORT") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => warn!(value = %port, "ignoring unparsable REVERB_SERVER_PORT"),
        }
    }
    if let Some(path) = lookup("REVERB_SERVER_PATH") {
        config.server.path = Some(path);
    }
    if let Some(enabled) = lookup("REVERB_SCALING_ENABLED") {
        config.server.scaling.enabled = parse_bool(&enabled);
    }
    if let Some(channel) = lookup("REVERB_SCALING_CHANNEL") {
        config.server.scaling.channel = channel;
    }

    let app_vars_present = [
        "REVERB_APP_ID",
        "REVERB_APP_KEY",
        "REVERB_APP_SECRET",
        "REVERB_ALLOWED_ORIGINS",
        "REVERB_APP_PING_INTERVAL",
        "REVERB_APP_ACTIVITY_TIMEOUT",
        "REVERB_APP_MAX_CONNECTIONS",
        "REVERB_APP_MAX_MESSAGE_SIZE",
    ]
    .iter()
    .any(|name| lookup(name).is_some());

    if !app_vars_present {
        return;
    }

    // Environment app settings configure the first (usually only) record.
    if config.apps.apps.is_empty() {
        config.apps.apps.push(AppConfig::default());
    }
    let app = &mut config.apps.apps[0];

    if let Some(app_id) = lookup("REVERB_APP_ID") {
        app.app_id = app_id;
    }
    if let Some(key) = lookup("REVERB_APP_KEY") {
        app.key = key;
    }
    if let Some(secret) = lookup("REVERB_APP_SECRET") {
        app.secret = secret;
    }
    if let Some(origins) = lookup("REVERB_ALLOWED_ORIGINS") {
        app.allowed_origins = origins
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
    }
    if let Some(interval) = lookup("REVERB_APP_PING_INTERVAL") {
        match interval.parse() {
            Ok(seconds) => app.ping_interval = seconds,
            Err(_) => warn!(value = %interval, "ignoring unparsable REVERB_APP_PING_INTERVAL"),
        }
    }
    if let Some(timeout) = lookup("REVERB_APP_ACTIVITY_TIMEOUT") {
        match timeout.parse() {
            Ok(seconds) => app.activity_timeout = seconds,
            Err(_) => warn!(value = %timeout, "ignoring unparsable REVERB_APP_ACTIVITY_TIMEOUT"),
        }
    }
    if let Some(limit) = lookup("REVERB_APP_MAX_CONNECTIONS") {
        match limit.parse() {
            Ok(limit) => app.max_connections = Some(limit),
            Err(_) => warn!(value = %limit, "ignoring unparsable REVERB_APP_MAX_CONNECTIONS"),
        }
    }
    if let Some(size) = lookup("REVERB_APP_MAX_MESSAGE_SIZE") {
        match size.parse() {
            Ok(bytes) => app.max_message_size = bytes,
            Err(_) => warn!(value = %size, "ignoring unparsable REVERB_APP_MAX_MESSAGE_SIZE"),
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
