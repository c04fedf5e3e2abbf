use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

pub const DEFAULT_PORT: u16 = 9222;
pub const DEFAULT_LANGUAGE: &str = "js";
pub const DEFAULT_PORT_FILE: &str = ".nrepl-port";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NreplConfig {
    /// Address the nREPL listener binds to.
    pub host: String,
    /// `0` picks a free port; the discovery file tells clients which one.
    pub port: u16,
    pub port_file: String,
}

impl Default for NreplConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            port_file: DEFAULT_PORT_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Host of the browser's remote debugging endpoint.
    pub host: String,
    pub port: u16,
    /// Tried in order after `host` fails.
    pub fallback_hosts: Vec<String>,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub default_language: String,
    /// Script aliases usable with `inject`, mapped to URLs.
    pub scripts: HashMap<String, String>,
    pub nrepl: NreplConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            fallback_hosts: vec!["localhost".to_string()],
            retries: 3,
            retry_delay_ms: 500,
            connect_timeout_ms: 5000,
            default_language: DEFAULT_LANGUAGE.to_string(),
            scripts: HashMap::new(),
            nrepl: NreplConfig::default(),
        }
    }
}

impl Config {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabeval")
            .join("config.toml")
    }

    /// Load configuration from file, then apply `TABEVAL_HOST` / `TABEVAL_PORT`.
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .unwrap_or_else(Self::default_config_path);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow!("Invalid config file {}: {}", config_path.display(), e))?;
            info!("Loaded configuration from {}", config_path.display());
            config
        } else {
            info!(
                "No config file found at {}, using defaults",
                config_path.display()
            );
            Config::default()
        };

        config.apply_env();

        if config.default_language.trim().is_empty() {
            config.default_language = DEFAULT_LANGUAGE.to_string();
        }

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("TABEVAL_HOST") {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("TABEVAL_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => warn!("Ignoring invalid TABEVAL_PORT value '{}'", port),
            }
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Resolve a script alias to its URL. References that already are URLs
    /// pass through unchanged.
    pub fn resolve_script(&self, reference: &str) -> Result<String> {
        let reference = reference.trim();
        if let Some(url) = self.scripts.get(reference) {
            return Ok(url.clone());
        }
        let is_url = ["http://", "https://", "file://"]
            .iter()
            .any(|scheme| reference.starts_with(scheme));
        if is_url {
            return Ok(reference.to_string());
        }
        Err(anyhow!(
            "Unknown script '{}'. Use a URL or one of the configured aliases",
            reference
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    struct EnvVarGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let previous = env::var(key).ok();
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    fn temp_config_path(temp_dir: &TempDir) -> String {
        temp_dir
            .path()
            .join("config.toml")
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    #[serial]
    async fn load_missing_file_uses_defaults() {
        let _host = EnvVarGuard::set("TABEVAL_HOST", None);
        let _port = EnvVarGuard::set("TABEVAL_PORT", None);
        let temp_dir = TempDir::new().expect("create temp dir");

        let loaded = Config::load(Some(&temp_config_path(&temp_dir)))
            .await
            .expect("load config");

        assert_eq!(loaded, Config::default());
    }

    #[tokio::test]
    #[serial]
    async fn load_merges_partial_file_with_defaults() {
        let _host = EnvVarGuard::set("TABEVAL_HOST", None);
        let _port = EnvVarGuard::set("TABEVAL_PORT", None);
        let temp_dir = TempDir::new().expect("create temp dir");
        let path = temp_config_path(&temp_dir);
        let content = r#"
port = 9333
fallback_hosts = ["localhost", "::1"]
default_language = "cljs"

[scripts]
scittle = "https://cdn.example.com/scittle.js"

[nrepl]
port = 7888
"#;
        fs::write(&path, content).await.expect("write config");

        let loaded = Config::load(Some(&path)).await.expect("load config");

        assert_eq!(loaded.host, "127.0.0.1");
        assert_eq!(loaded.port, 9333);
        assert_eq!(loaded.fallback_hosts, vec!["localhost", "::1"]);
        assert_eq!(loaded.default_language, "cljs");
        assert_eq!(loaded.retries, 3);
        assert_eq!(loaded.nrepl.port, 7888);
        assert_eq!(loaded.nrepl.port_file, DEFAULT_PORT_FILE);
        assert_eq!(
            loaded.resolve_script("scittle").unwrap(),
            "https://cdn.example.com/scittle.js"
        );
    }

    #[tokio::test]
    #[serial]
    async fn env_overrides_file_values() {
        let _host = EnvVarGuard::set("TABEVAL_HOST", Some("10.0.0.5"));
        let _port = EnvVarGuard::set("TABEVAL_PORT", Some("9444"));
        let temp_dir = TempDir::new().expect("create temp dir");
        let path = temp_config_path(&temp_dir);
        fs::write(&path, "host = \"192.168.1.2\"\nport = 9333\n")
            .await
            .expect("write config");

        let loaded = Config::load(Some(&path)).await.expect("load config");

        assert_eq!(loaded.host, "10.0.0.5");
        assert_eq!(loaded.port, 9444);
    }

    #[tokio::test]
    #[serial]
    async fn invalid_file_is_an_error() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let path = temp_config_path(&temp_dir);
        fs::write(&path, "port = \"not a number\"\n")
            .await
            .expect("write config");

        let err = Config::load(Some(&path)).await.unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }

    #[test]
    fn resolve_script_accepts_urls_and_rejects_unknown_names() {
        let config = Config::default();
        assert_eq!(
            config.resolve_script("https://cdn.example.com/x.js").unwrap(),
            "https://cdn.example.com/x.js"
        );
        let err = config.resolve_script("nope").unwrap_err();
        assert!(err.to_string().contains("Unknown script 'nope'"));
    }
}
