//! Node configuration (`lynx.toml`)
//!
//! Every field has a default so an empty or missing file yields a working
//! node. CLI flags are applied on top by the binaries.

use crate::error::{LynxError, Result};
use crate::net::Timeouts;
use crate::protocol::{timeouts, IDENTITY_FILE, SERVER_PORT, TRACKER_PORT};
use crate::protocol_core::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "lynx.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding one subdirectory per lynk
    pub home: PathBuf,
    pub owner: String,
    /// Address announced to trackers; discovered when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_ip: Option<String>,
    pub peer_port: u16,
    pub tracker_port: u16,
    pub sync_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Sync journal; none disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            owner: default_owner(),
            advertise_ip: None,
            peer_port: SERVER_PORT,
            tracker_port: TRACKER_PORT,
            sync_interval_secs: 10,
            purge_interval_secs: 60,
            max_connections: 64,
            connect_timeout_ms: timeouts::CONNECT_MS,
            io_timeout_ms: timeouts::IO_BASE_MS,
            log_file: None,
        }
    }
}

impl NodeConfig {
    /// Defaults rooted at `home`, used by tests and `--home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    /// Load `path`; a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| LynxError::Format(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| LynxError::Format(format!("serialize config: {e}")))?;
        write_atomic(path, text.as_bytes())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            io: Duration::from_millis(self.io_timeout_ms),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.home.join(IDENTITY_FILE)
    }

    /// IP this node announces to trackers and peers
    pub fn advertised_ip(&self) -> String {
        match &self.advertise_ip {
            Some(ip) if !ip.is_empty() => ip.clone(),
            _ => crate::net::local_ip().to_string(),
        }
    }
}

/// Per-user configuration directory
pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Lynx");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("lynx");
    }
    PathBuf::from(".lynx")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}

fn default_home() -> PathBuf {
    let base = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("Lynx")
}

fn default_owner() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.peer_port, 8080);
        assert_eq!(cfg.tracker_port, 9000);
        assert_eq!(cfg.sync_interval_secs, 10);
        assert_eq!(cfg.max_connections, 64);
        assert!(cfg.home.ends_with("Lynx"));
        assert!(!cfg.owner.is_empty());
    }

    #[test]
    fn partial_file_overrides_fields() {
        let cfg: NodeConfig =
            toml::from_str("peer_port = 7000\nowner = \"max\"\nadvertise_ip = \"10.0.0.5\"\n")
                .unwrap();
        assert_eq!(cfg.peer_port, 7000);
        assert_eq!(cfg.owner, "max");
        assert_eq!(cfg.advertised_ip(), "10.0.0.5");
        assert_eq!(cfg.tracker_port, 9000);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE);
        let mut cfg = NodeConfig::with_home(dir.path().join("home"));
        cfg.log_file = Some(dir.path().join("sync.log"));
        cfg.save(&path).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), cfg);
        assert_eq!(
            NodeConfig::load(&dir.path().join("absent.toml")).unwrap().peer_port,
            SERVER_PORT
        );
    }

    #[test]
    fn bad_toml_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "peer_port = \"many\"").unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(LynxError::Format(_))));
    }
}
