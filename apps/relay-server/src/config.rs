//! Relay configuration management.
//!
//! Configuration is stored as TOML at `$TUNNELSHARE_CONFIG`, or
//! `~/.config/tunnelshare/server.toml` when that is unset. The `PORT`
//! environment variable overrides the configured port.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tunnelshare_relay::{HubConfig, MAX_IDENTITY_DIGITS};
use tunnelshare_server::ServerConfig;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port shared by the WebSocket and the download endpoint.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Digits in a freshly allocated identity code.
    #[serde(default = "default_identity_digits")]
    pub identity_digits: usize,

    /// Seconds a tunnel may go without progress before it is aborted
    /// (0 = never).
    #[serde(default = "default_idle_timeout")]
    pub tunnel_idle_timeout_secs: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

fn default_identity_digits() -> usize {
    6
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            identity_digits: default_identity_digits(),
            tunnel_idle_timeout_secs: default_idle_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads configuration from disk and applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&config_path())?;
        config.apply_port_override(std::env::var("PORT").ok().as_deref())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file at `path`, falling back to the defaults if it is missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Writes the default configuration to `path` unless a file is already
    /// there. Returns whether a file was written.
    pub fn write_default_if_missing(path: &Path) -> anyhow::Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        Config::default()
            .save_to(path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(true)
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Replaces the port with `value` when set.
    pub fn apply_port_override(&mut self, value: Option<&str>) -> anyhow::Result<()> {
        if let Some(value) = value {
            self.port = value
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT value {value:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_IDENTITY_DIGITS).contains(&self.identity_digits) {
            anyhow::bail!(
                "identity_digits must be between 1 and {MAX_IDENTITY_DIGITS}, got {}",
                self.identity_digits
            );
        }
        self.bind_addr()?;
        Ok(())
    }

    fn bind_addr(&self) -> anyhow::Result<IpAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.bind))
    }

    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        Ok(ServerConfig {
            bind: self.bind_addr()?,
            port: self.port,
        })
    }

    pub fn hub_config(&self) -> HubConfig {
        let idle = self.tunnel_idle_timeout_secs;
        HubConfig {
            identity_digits: self.identity_digits,
            tunnel_idle_timeout: (idle > 0).then(|| Duration::from_secs(idle)),
        }
    }
}

/// Returns the configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TUNNELSHARE_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("tunnelshare")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.identity_digits, 6);
        assert_eq!(config.tunnel_idle_timeout_secs, 300);
        assert_eq!(config.log_level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn config_partial_toml() {
        // Only specify the port, rest should use defaults.
        let config: Config = toml::from_str("port = 9000").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.identity_digits, 6);
    }

    #[test]
    fn port_override() {
        let mut config = Config::default();
        config.apply_port_override(None).unwrap();
        assert_eq!(config.port, 8080);
        config.apply_port_override(Some("3000")).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.apply_port_override(Some("http")).is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let config = Config {
            identity_digits: 12,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            bind: "not-an-ip".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        let config = Config {
            tunnel_idle_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.hub_config().tunnel_idle_timeout.is_none());
        assert_eq!(
            Config::default().hub_config().tunnel_idle_timeout,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn missing_file_loads_defaults_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("server.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(!path.exists());
    }

    #[test]
    fn default_file_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("server.toml");

        assert!(Config::write_default_if_missing(&path).unwrap());
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        std::fs::write(&path, "port = 9000").unwrap();
        assert!(!Config::write_default_if_missing(&path).unwrap());
        assert_eq!(Config::load_from(&path).unwrap().port, 9000);
    }

    #[test]
    fn unwritable_default_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let path = blocker.join("server.toml");
        assert!(Config::write_default_if_missing(&path).is_err());
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");

        let config = Config {
            port: 4242,
            log_level: "debug".into(),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "port = \"eighty\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn server_config_parses_bind() {
        let config = Config {
            bind: "127.0.0.1".into(),
            port: 0,
            ..Config::default()
        };
        let server = config.server_config().unwrap();
        assert_eq!(server.bind.to_string(), "127.0.0.1");
        assert_eq!(server.port, 0);
    }
}
