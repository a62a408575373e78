//! Server configuration: built-in defaults, optionally a TOML file, then
//! command-line overrides.

use crate::cli::DaemonOpts;
use crate::protocol::{timeouts, DEFAULT_MAX_TRANSFER_BYTES, DEFAULT_PORT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub users_root: PathBuf,
    pub inbox_dir: PathBuf,
    pub accounts_path: PathBuf,
    pub console_log: Option<PathBuf>,
    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Unbounded when unset
    pub max_connections: Option<usize>,
    pub max_transfer_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", DEFAULT_PORT),
            users_root: PathBuf::from("users_directories"),
            inbox_dir: PathBuf::from("temp_files"),
            accounts_path: PathBuf::from("accounts.json"),
            console_log: None,
            idle_timeout_secs: timeouts::IDLE_SECS,
            shutdown_grace_secs: timeouts::SHUTDOWN_GRACE_SECS,
            max_connections: None,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid server config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Defaults, then `--config`, then the remaining flags
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut cfg = match &opts.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        cfg.apply_overrides(opts);
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, opts: &DaemonOpts) {
        if let Some(bind) = &opts.bind {
            self.bind = bind.clone();
        }
        if let Some(p) = &opts.users_root {
            self.users_root = p.clone();
        }
        if let Some(p) = &opts.inbox {
            self.inbox_dir = p.clone();
        }
        if let Some(p) = &opts.accounts {
            self.accounts_path = p.clone();
        }
        if let Some(p) = &opts.console_log {
            self.console_log = Some(p.clone());
        }
        if let Some(secs) = opts.idle_timeout_secs {
            self.idle_timeout_secs = secs;
        }
        if let Some(n) = opts.max_connections {
            self.max_connections = Some(n);
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind, "0.0.0.0:4321");
        assert_eq!(cfg.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(cfg.max_connections, None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = ServerConfig::from_toml_str(
            r#"
            bind = "127.0.0.1:5000"
            idle_timeout_secs = 0
            max_connections = 64
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5000");
        assert_eq!(cfg.idle_timeout(), None);
        assert_eq!(cfg.max_connections, Some(64));
        assert_eq!(cfg.users_root, PathBuf::from("users_directories"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(ServerConfig::from_toml_str("bnid = \"x\"").is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let t = tempfile::tempdir().unwrap();
        let path = t.path().join("stash.toml");
        std::fs::write(&path, "bind = \"127.0.0.1:1\"\ninbox_dir = \"drops\"\n").unwrap();
        let opts = DaemonOpts {
            config: Some(path),
            bind: Some("127.0.0.1:2".into()),
            ..Default::default()
        };
        let cfg = ServerConfig::from_opts(&opts).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2");
        assert_eq!(cfg.inbox_dir, PathBuf::from("drops"));
    }
}
