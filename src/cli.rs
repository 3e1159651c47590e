//! Shared CLI helpers and small reusable Clap fragments

use crate::config::{default_config_path, NodeConfig};
use crate::error::Result;
use clap::{ArgAction, Args};
use std::path::PathBuf;

/// Node options shared by `lynx` and `lynxd`; flags override `lynx.toml`
#[derive(Clone, Debug, Args)]
pub struct NodeOpts {
    /// Config file (default: ~/.config/lynx/lynx.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the lynks
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Port of the peer transfer service
    #[arg(long, global = true)]
    pub peer_port: Option<u16>,

    /// Port of the tracker service
    #[arg(long, global = true)]
    pub tracker_port: Option<u16>,

    /// Address announced to trackers (default: discovered)
    #[arg(long, global = true)]
    pub advertise_ip: Option<String>,

    /// Append sync events to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl NodeOpts {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    /// File values with the flags applied on top
    pub fn load_config(&self) -> Result<NodeConfig> {
        let mut cfg = NodeConfig::load(&self.config_path())?;
        if let Some(home) = &self.home {
            cfg.home = home.clone();
        }
        if let Some(port) = self.peer_port {
            cfg.peer_port = port;
        }
        if let Some(port) = self.tracker_port {
            cfg.tracker_port = port;
        }
        if let Some(ip) = &self.advertise_ip {
            cfg.advertise_ip = Some(ip.clone());
        }
        if let Some(path) = &self.log_file {
            cfg.log_file = Some(path.clone());
        }
        Ok(cfg)
    }
}

/// Install the `tracing` subscriber; `RUST_LOG` wins over `-v`
pub fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn,lynx=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        node: NodeOpts,
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lynx.toml");
        std::fs::write(&path, "peer_port = 7000\ntracker_port = 7001\n").unwrap();

        let w = Wrapper::parse_from([
            "lynxd",
            "--config",
            path.to_str().unwrap(),
            "--tracker-port",
            "9100",
            "--home",
            "/srv/lynx",
            "-vv",
        ]);
        let cfg = w.node.load_config().unwrap();
        assert_eq!(cfg.peer_port, 7000);
        assert_eq!(cfg.tracker_port, 9100);
        assert_eq!(cfg.home, PathBuf::from("/srv/lynx"));
        assert_eq!(w.node.verbose, 2);
    }
}
