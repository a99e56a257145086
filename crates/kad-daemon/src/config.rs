//! Daemon configuration: the external collaborator interface described in
//! spec §6 (`bind_addr`, `bind_port`, `conf_dir`, `max_peers`, `log_type`,
//! `log_level`), loaded from a TOML file, pattern adapted from the
//! teacher's `DaemonConfig`/`#[serde(default = "fn")]` style.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// UDP/TCP listen address, IPv4 or IPv6.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// UDP/TCP listen port.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Directory holding persisted routing state and bootstrap nodes.
    /// `~` is expanded against `HOME`.
    #[serde(default = "default_conf_dir")]
    pub conf_dir: String,
    /// TCP peer cap (ancillary protocol only).
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Logging sink: "stderr" or "file".
    #[serde(default = "default_log_type")]
    pub log_type: String,
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
            conf_dir: default_conf_dir(),
            max_peers: default_max_peers(),
            log_type: default_log_type(),
            log_level: default_log_level(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    6881
}

fn default_conf_dir() -> String {
    "~/.kad".to_string()
}

fn default_max_peers() -> usize {
    256
}

fn default_log_type() -> String {
    "stderr".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from `conf_dir/config.toml` if it exists
    /// (`conf_dir` resolved from `KAD_CONF_DIR` or the compiled-in
    /// default, since the config file's own `conf_dir` can't be consulted
    /// before it's read); otherwise fall back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::bootstrap_conf_dir().join("config.toml");
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// `conf_dir` with `~` expanded against `HOME` (spec §6: "HOME used
    /// for `~` expansion in `conf_dir`; no other variables").
    pub fn conf_dir(&self) -> PathBuf {
        expand_home(&self.conf_dir)
    }

    pub fn routes_path(&self) -> PathBuf {
        self.conf_dir().join("routes.dat")
    }

    pub fn bootstrap_nodes_path(&self) -> PathBuf {
        self.conf_dir().join("nodes.dat")
    }

    fn bootstrap_conf_dir() -> PathBuf {
        std::env::var("KAD_CONF_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| expand_home(&default_conf_dir()))
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|_| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.bind_port, 6881);
        assert_eq!(config.max_peers, 256);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.bind_addr, config.bind_addr);
    }

    #[test]
    fn test_conf_dir_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        let config = DaemonConfig {
            conf_dir: "~/.kad".to_string(),
            ..DaemonConfig::default()
        };
        assert_eq!(config.conf_dir(), PathBuf::from("/home/tester/.kad"));
    }

    #[test]
    fn test_conf_dir_absolute_path_untouched() {
        let config = DaemonConfig {
            conf_dir: "/etc/kad".to_string(),
            ..DaemonConfig::default()
        };
        assert_eq!(config.conf_dir(), PathBuf::from("/etc/kad"));
    }
}
