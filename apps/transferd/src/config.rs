//! Front-end configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/skyvault/transferd.toml`
//! - Windows: `%APPDATA%/skyvault/transferd.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skyvault_engine::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Principal that owns tasks created from this front end.
    #[serde(default = "default_principal")]
    pub principal: String,

    /// Engine tunables, under `[engine]`.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_principal() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".into())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            principal: default_principal(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Loads `path` (or the default location), writing defaults there if
    /// the file does not exist yet.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Platform-specific default configuration path.
pub fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("skyvault").join("transferd.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("skyvault")
            .join("transferd.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_engine_defaults() {
        let toml_str = r#"
principal = "alice"

[engine]
max_concurrent_transfers = 2

[engine.retry]
max_retries = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.principal, "alice");
        assert_eq!(config.engine.max_concurrent_transfers, 2);
        assert_eq!(config.engine.retry.max_retries, 5);
        assert_eq!(config.engine.retry.initial_delay_ms, 200);
        assert_eq!(config.engine.chunk_size, 10 * 1024 * 1024);
        assert!(config.engine.quota.bytes_per_principal.is_none());
    }

    #[test]
    fn load_writes_defaults_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("transferd.toml");

        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.engine, EngineConfig::default());

        let again = Config::load(Some(&path)).unwrap();
        assert_eq!(again.principal, config.principal);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transferd.toml");

        let mut config = Config {
            principal: "bob".into(),
            ..Config::default()
        };
        config.engine.quota.bytes_per_principal = Some(1 << 30);
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.principal, "bob");
        assert_eq!(loaded.engine.quota.bytes_per_principal, Some(1 << 30));
    }

    #[test]
    fn config_path_names_the_product() {
        assert!(config_path().to_string_lossy().contains("skyvault"));
    }
}
