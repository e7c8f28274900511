//! The application registry: an immutable lookup table of tenants.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use reverb_config::{AppConfig, AppsConfig};

/// One credentialed tenant. Built at configuration load and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub app_id: String,
    pub key: String,
    pub secret: String,
    pub ping_interval: u64,
    pub activity_timeout: u64,
    pub allowed_origins: Vec<String>,
    pub max_message_size: usize,
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl From<AppConfig> for Application {
    fn from(config: AppConfig) -> Self {
        Self {
            app_id: config.app_id,
            key: config.key,
            secret: config.secret,
            ping_interval: config.ping_interval,
            activity_timeout: config.activity_timeout,
            allowed_origins: config.allowed_origins,
            max_message_size: config.max_message_size,
            max_connections: config.max_connections,
            options: config.options,
        }
    }
}

impl Application {
    /// Apply the origin allowlist. Requests without an `Origin` header
    /// (server-side clients) always pass; browser origins are matched by
    /// host, case-insensitively, with `*` wildcards.
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let host = origin_host(origin).to_ascii_lowercase();
        self.allowed_origins.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            if pattern == "*" {
                true
            } else if pattern.contains('*') {
                glob_match(&pattern, &host)
            } else {
                pattern == host
            }
        })
    }
}

/// Strip scheme, path and port from an Origin header value.
fn origin_host(origin: &str) -> &str {
    let without_scheme = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let without_path = without_scheme
        .split_once('/')
        .map(|(host, _)| host)
        .unwrap_or(without_scheme);
    without_path
        .split_once(':')
        .map(|(host, _)| host)
        .unwrap_or(without_path)
}

/// Glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                // First segment must match at start
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    // Last segment must match at end (unless pattern ends with *)
    if !parts.last().unwrap_or(&"").is_empty() {
        pos == text.len()
    } else {
        true
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Immutable tenant lookup table, keyed by both `app_id` and `key`.
#[derive(Debug, Default)]
pub struct AppRegistry {
    by_id: HashMap<String, Arc<Application>>,
    by_key: HashMap<String, Arc<Application>>,
}

impl AppRegistry {
    pub fn from_config(config: &AppsConfig) -> Self {
        let mut registry = Self::default();
        for app in &config.apps {
            registry.insert(Application::from(app.clone()));
        }
        registry
    }

    fn insert(&mut self, app: Application) {
        let app = Arc::new(app);
        self.by_id.insert(app.app_id.clone(), Arc::clone(&app));
        self.by_key.insert(app.key.clone(), app);
    }

    pub fn find_by_id(&self, app_id: &str) -> Option<Arc<Application>> {
        self.by_id.get(app_id).cloned()
    }

    pub fn find_by_key(&self, key: &str) -> Option<Arc<Application>> {
        self.by_key.get(key).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Application>> {
        self.by_id.values()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn app_with_origins(origins: &[&str]) -> Application {
        Application {
            app_id: "1".into(),
            key: "k".into(),
            secret: "s".into(),
            ping_interval: 60,
            activity_timeout: 30,
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            max_message_size: 10_000,
            max_connections: None,
            options: HashMap::new(),
        }
    }

    #[test]
    fn wildcard_allows_everything() {
        let app = app_with_origins(&["*"]);
        assert!(app.allows_origin(Some("https://anything.example")));
        assert!(app.allows_origin(None));
    }

    #[test]
    fn exact_host_match_ignores_scheme_and_port() {
        let app = app_with_origins(&["app.example.com"]);
        assert!(app.allows_origin(Some("https://app.example.com")));
        assert!(app.allows_origin(Some("http://app.example.com:8080")));
        assert!(app.allows_origin(Some("App.Example.Com")));
        assert!(!app.allows_origin(Some("https://evil.example.com")));
    }

    #[test]
    fn subdomain_glob() {
        let app = app_with_origins(&["*.example.com"]);
        assert!(app.allows_origin(Some("https://a.example.com")));
        assert!(app.allows_origin(Some("https://deep.a.example.com")));
        assert!(!app.allows_origin(Some("https://example.org")));
    }

    #[test]
    fn missing_origin_always_passes() {
        let app = app_with_origins(&["app.example.com"]);
        assert!(app.allows_origin(None));
    }

    #[test]
    fn registry_finds_by_both_keys() {
        let mut registry = AppRegistry::default();
        registry.insert(app_with_origins(&["*"]));
        assert!(registry.find_by_id("1").is_some());
        assert!(registry.find_by_key("k").is_some());
        assert!(registry.find_by_key("missing").is_none());
    }
}
