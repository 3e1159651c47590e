//! Swarm roster (`swarm.info`): the peers currently participating in a lynk

use crate::error::{LynxError, Result};
use crate::protocol::RECORD_SEPARATOR;
use std::fmt;
use std::path::Path;

/// Address and announced key of one swarm member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PeerRef {
    pub ip: String,
    pub port: u16,
    /// Hex X25519 public key; empty when the peer did not announce one
    pub public_key: String,
}

impl PeerRef {
    pub fn new(ip: impl Into<String>, port: u16, public_key: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            public_key: public_key.into(),
        }
    }

    /// `ip:port`, suitable for dialing
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn same_endpoint(&self, other: &PeerRef) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Ordered list of peers, unique by `(ip, port)`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SwarmRoster {
    peers: Vec<PeerRef>,
}

impl SwarmRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> &[PeerRef] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &PeerRef) -> bool {
        self.peers.iter().any(|p| p.same_endpoint(peer))
    }

    /// Register a peer. An already-known endpoint keeps its position; its key
    /// is refreshed when a non-empty one is announced. Returns true if the
    /// roster changed.
    pub fn register(&mut self, peer: PeerRef) -> bool {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.same_endpoint(&peer)) {
            if !peer.public_key.is_empty() && existing.public_key != peer.public_key {
                existing.public_key = peer.public_key;
                return true;
            }
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Remove peers at `ip` (only the one at `port` when given). Returns how
    /// many entries were dropped.
    pub fn remove(&mut self, ip: &str, port: Option<u16>) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|p| !(p.ip == ip && port.map_or(true, |port| p.port == port)));
        before - self.peers.len()
    }

    /// Keep only peers for which `keep` returns true
    pub fn retain(&mut self, keep: impl FnMut(&PeerRef) -> bool) -> usize {
        let before = self.peers.len();
        self.peers.retain(keep);
        before - self.peers.len()
    }

    /// Parse `swarm.info` text: `ip:::port[:::key]` per line
    pub fn parse(text: &str) -> Result<Self> {
        let mut roster = SwarmRoster::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(RECORD_SEPARATOR).collect();
            if fields.len() < 2 || fields.len() > 3 {
                return Err(LynxError::Format(format!(
                    "swarm.info line {}: expected ip{sep}port[{sep}key]",
                    n + 1,
                    sep = RECORD_SEPARATOR
                )));
            }
            let port = fields[1].trim().parse::<u16>().map_err(|e| {
                LynxError::Format(format!("swarm.info line {}: bad port: {e}", n + 1))
            })?;
            roster.register(PeerRef::new(
                fields[0].trim(),
                port,
                fields.get(2).map(|k| k.trim()).unwrap_or_default(),
            ));
        }
        Ok(roster)
    }

    /// Serialize to `swarm.info` text
    pub fn render(&self) -> String {
        let mut out = String::new();
        for p in &self.peers {
            out.push_str(&p.ip);
            out.push_str(RECORD_SEPARATOR);
            out.push_str(&p.port.to_string());
            out.push_str(RECORD_SEPARATOR);
            out.push_str(&p.public_key);
            out.push('\n');
        }
        out
    }

    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LynxError::NotFound(
                format!("swarm roster {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::protocol_core::write_atomic(path, self.render().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster_of(entries: &[(&str, u16)]) -> SwarmRoster {
        let mut r = SwarmRoster::new();
        for (ip, port) in entries {
            r.register(PeerRef::new(*ip, *port, ""));
        }
        r
    }

    #[test]
    fn register_is_unique_by_endpoint() {
        let mut r = SwarmRoster::new();
        assert!(r.register(PeerRef::new("10.0.0.1", 4500, "")));
        assert!(!r.register(PeerRef::new("10.0.0.1", 4500, "")));
        assert!(r.register(PeerRef::new("10.0.0.1", 4501, "")));
        assert_eq!(r.len(), 2);

        // announcing a key later refreshes the existing entry in place
        assert!(r.register(PeerRef::new("10.0.0.1", 4500, "aa")));
        assert_eq!(r.peers()[0].public_key, "aa");
        assert!(!r.register(PeerRef::new("10.0.0.1", 4500, "")));
        assert_eq!(r.peers()[0].public_key, "aa");
    }

    #[test]
    fn remove_with_port_drops_exactly_one_peer() {
        let mut r = roster_of(&[("10.0.0.1", 1), ("10.0.0.1", 2), ("10.0.0.3", 3)]);
        assert_eq!(r.remove("10.0.0.1", Some(2)), 1);
        assert_eq!(r, roster_of(&[("10.0.0.1", 1), ("10.0.0.3", 3)]));
    }

    #[test]
    fn remove_by_ip_drops_every_port_at_that_ip() {
        let mut r = roster_of(&[("10.0.0.1", 1), ("10.0.0.2", 2), ("10.0.0.1", 3)]);
        assert_eq!(r.remove("10.0.0.1", None), 2);
        assert_eq!(r, roster_of(&[("10.0.0.2", 2)]));
        assert_eq!(r.remove("10.9.9.9", None), 0);
    }

    #[test]
    fn parse_accepts_legacy_two_field_lines() {
        let r = SwarmRoster::parse("127.0.0.1:::8080\n\n10.0.0.2:::7500:::beef\n").unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.peers()[0], PeerRef::new("127.0.0.1", 8080, ""));
        assert_eq!(r.peers()[1].public_key, "beef");
    }

    #[test]
    fn parse_rejects_bad_ports() {
        assert!(matches!(
            SwarmRoster::parse("127.0.0.1:::eighty\n"),
            Err(LynxError::Format(_))
        ));
        assert!(SwarmRoster::parse("just-an-ip\n").is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm.info");
        let mut r = roster_of(&[("10.0.0.1", 1), ("10.0.0.2", 2)]);
        r.register(PeerRef::new("10.0.0.3", 3, "cafe"));
        r.save(&path).unwrap();
        assert_eq!(SwarmRoster::load(&path).unwrap(), r);
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SwarmRoster::load(&dir.path().join("swarm.info")),
            Err(LynxError::NotFound(_))
        ));
    }
}
