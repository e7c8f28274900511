use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::ReverbConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["reverb.toml", "reverb.yaml", "reverb.yml", "reverb.json"];

/// Load config from the given path (format chosen by extension).
pub fn load_config(path: &Path) -> anyhow::Result<ReverbConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<ReverbConfig> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("toml")
        .to_ascii_lowercase();
    let config = match ext.as_str() {
        "toml" => toml::from_str(raw)?,
        "yaml" | "yml" => serde_yaml::from_str(raw)?,
        "json" => serde_json::from_str(raw)?,
        other => anyhow::bail!("unsupported config format: .{other}"),
    };
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./reverb.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/reverb/reverb.{toml,yaml,yml,json}` (user-global)
///
/// Returns `ReverbConfig::default()` if no config file is found.
pub fn discover_and_load() -> ReverbConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(config) => return config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    ReverbConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "reverb") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/reverb/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "reverb").map(|d| d.config_dir().to_path_buf())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverb.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            host = "127.0.0.1"
            port = 6001

            [server.scaling]
            enabled = true
            channel = "fleet-1"

            [[apps.apps]]
            app_id = "100"
            key = "local-key"
            secret = "local-secret"
            allowed_origins = ["example.com"]
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 6001);
        assert!(config.server.scaling.enabled);
        assert_eq!(config.server.scaling.channel, "fleet-1");
        assert_eq!(config.apps.apps[0].allowed_origins, vec!["example.com"]);
    }

    #[test]
    fn loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverb.json");
        std::fs::write(
            &path,
            r#"{"server":{"port":7001},"apps":{"apps":[{"app_id":"1","key":"k","secret":"s"}]}}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.apps.apps.len(), 1);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverb.ini");
        std::fs::write(&path, "whatever").unwrap();
        assert!(load_config(&path).is_err());
    }
}
