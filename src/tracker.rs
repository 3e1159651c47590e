//! Tracker role: swarm membership and manifest distribution
//!
//! For every hosted lynk the tracker keeps the authoritative roster and
//! manifest under `<home>/<lynk>/<lynk>_Tracker/`. State is loaded lazily on
//! the first request that names the lynk, so a lynk created by a one-shot CLI
//! command is served by an already running daemon.

use crate::crypto::KeyPair;
use crate::error::{LynxError, Result};
use crate::logger::Logger;
use crate::manifest::Manifest;
use crate::net::{self, Connection, Timeouts};
use crate::protocol::{META_FILE, SWARM_FILE, TRACKER_DIR_SUFFIX};
use crate::protocol_core::{ensure_dir_exists, is_valid_lynk_name, Request};
use crate::swarm::{PeerRef, SwarmRoster};
use crate::transfer::{decode_body, encode_body};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Concurrent deliveries per broadcast
pub const BROADCAST_FANOUT: usize = 16;

/// `<home>/<lynk>/<lynk>_Tracker`
pub fn tracker_dir(home: &Path, lynk: &str) -> PathBuf {
    home.join(lynk).join(format!("{lynk}{TRACKER_DIR_SUFFIX}"))
}

/// Authoritative state of one hosted lynk
#[derive(Debug)]
pub struct TrackerLynk {
    pub roster: SwarmRoster,
    pub manifest: Manifest,
    dir: PathBuf,
}

impl TrackerLynk {
    fn load(home: &Path, lynk: &str) -> Result<Self> {
        let dir = tracker_dir(home, lynk);
        let manifest = Manifest::load(&dir.join(META_FILE), home)?;
        let roster = match SwarmRoster::load(&dir.join(SWARM_FILE)) {
            Ok(r) => r,
            Err(LynxError::NotFound(_)) => SwarmRoster::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            roster,
            manifest,
            dir,
        })
    }

    fn save_roster(&self) -> Result<()> {
        self.roster.save(&self.dir.join(SWARM_FILE))
    }

    fn save_manifest(&self) -> Result<()> {
        self.manifest.save(&self.dir.join(META_FILE))
    }
}

pub struct TrackerService {
    home: PathBuf,
    keys: Arc<KeyPair>,
    timeouts: Timeouts,
    logger: Arc<dyn Logger>,
    hosted: parking_lot::Mutex<HashMap<String, Arc<Mutex<TrackerLynk>>>>,
}

impl TrackerService {
    pub fn new(
        home: impl Into<PathBuf>,
        keys: Arc<KeyPair>,
        timeouts: Timeouts,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            home: home.into(),
            keys,
            timeouts,
            logger,
            hosted: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Start hosting `manifest` with `host` as the first roster member
    pub fn host_lynk(&self, manifest: &Manifest, host: PeerRef) -> Result<()> {
        let dir = tracker_dir(&self.home, &manifest.lynk_name);
        ensure_dir_exists(&dir)?;
        let mut roster = SwarmRoster::new();
        roster.register(host);
        let state = TrackerLynk {
            roster,
            manifest: manifest.anchored_to(self.home.join(&manifest.lynk_name)),
            dir,
        };
        state.save_manifest()?;
        state.save_roster()?;
        self.hosted
            .lock()
            .insert(manifest.lynk_name.clone(), Arc::new(Mutex::new(state)));
        info!(lynk = %manifest.lynk_name, "hosting tracker");
        Ok(())
    }

    /// Hosted state, loaded from disk on first use
    pub fn lynk(&self, name: &str) -> Result<Arc<Mutex<TrackerLynk>>> {
        if let Some(state) = self.hosted.lock().get(name) {
            return Ok(state.clone());
        }
        let loaded = TrackerLynk::load(&self.home, name).map_err(|e| match e {
            LynxError::NotFound(_) => LynxError::NotFound(format!("lynk {name} is not hosted here")),
            other => other,
        })?;
        debug!(lynk = name, peers = loaded.roster.len(), "loaded tracker state");
        Ok(self
            .hosted
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone())
    }

    pub fn hosted_names(&self) -> Vec<String> {
        self.hosted.lock().keys().cloned().collect()
    }

    /// Hosted lynks, loaded or not: everything in memory plus every
    /// `<home>/<name>/<name>_Tracker` holding a manifest
    pub fn known_lynks(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.hosted_names().into_iter().collect();
        if let Ok(entries) = std::fs::read_dir(&self.home) {
            for entry in entries.flatten() {
                let Ok(name) = entry.file_name().into_string() else { continue };
                if is_valid_lynk_name(&name)
                    && tracker_dir(&self.home, &name).join(META_FILE).is_file()
                {
                    names.insert(name);
                }
            }
        }
        names.into_iter().collect()
    }

    /// Accept loop for the tracker port
    pub async fn serve(self: Arc<Self>, listener: TcpListener, max_connections: usize) -> Result<()> {
        let timeouts = self.timeouts;
        net::serve(listener, "tracker", max_connections, timeouts, move |request, conn| {
            let svc = self.clone();
            async move { svc.handle(request, conn).await }
        })
        .await
    }

    pub async fn handle(&self, request: Request, mut conn: Connection) -> Result<()> {
        match request {
            Request::SwarmRequest { peer, lynk } => {
                let reply = self.register(&lynk, peer, |s| s.roster.render()).await?;
                conn.write_all(reply.as_bytes()).await?;
                conn.finish().await
            }
            Request::MetaRequest { peer, lynk } => {
                let reply = self.register(&lynk, peer, |s| s.manifest.render()).await?;
                conn.write_all(reply.as_bytes()).await?;
                conn.finish().await
            }
            Request::MetaPush { lynk } => {
                let body = conn.read_to_end().await?;
                let keys = self.keys.clone();
                let payload = tokio::task::spawn_blocking(move || decode_body(&keys, &body))
                    .await
                    .map_err(|e| LynxError::Transport(format!("decode task failed: {e}")))??;
                let text = String::from_utf8(payload)
                    .map_err(|_| LynxError::Format("pushed manifest is not UTF-8".into()))?;
                let manifest = Manifest::parse(&text, &self.home)?;
                if manifest.lynk_name != lynk {
                    return Err(LynxError::Format(format!(
                        "push for {lynk} carries manifest of {}",
                        manifest.lynk_name
                    )));
                }
                self.apply_push(manifest).await?;
                Ok(())
            }
            Request::Disconnect { ip, port, lynk } => {
                self.disconnect(&lynk, &ip, port).await?;
                Ok(())
            }
            other => Err(LynxError::ProtocolSyntax(format!(
                "{other} is not a tracker request"
            ))),
        }
    }

    async fn register<F>(&self, lynk: &str, peer: PeerRef, reply: F) -> Result<String>
    where
        F: FnOnce(&TrackerLynk) -> String,
    {
        let state = self.lynk(lynk)?;
        let mut state = state.lock().await;
        if state.roster.register(peer.clone()) {
            state.save_roster()?;
            info!(lynk, %peer, "peer registered");
        }
        Ok(reply(&*state))
    }

    /// Replace the stored manifest and broadcast it with the next
    /// generation. Returns how many peers the change was delivered to, `None`
    /// when the push matched the stored manifest. The lynk stays locked until
    /// the fan-out is done, so broadcasts of one lynk never overlap.
    pub async fn apply_push(&self, mut manifest: Manifest) -> Result<Option<usize>> {
        let name = manifest.lynk_name.clone();
        let state = self.lynk(&name)?;
        let mut state = state.lock().await;
        manifest.tracker_key = Some(self.keys.public_hex());
        manifest.generation = state.manifest.generation;
        if manifest.render() == state.manifest.render() {
            debug!(lynk = %name, "push matches stored manifest");
            return Ok(None);
        }
        manifest.generation += 1;
        state.manifest = manifest;
        state.save_manifest()?;
        info!(
            lynk = %name,
            files = state.manifest.files().len(),
            generation = state.manifest.generation,
            "manifest updated"
        );
        let text = state.manifest.render();
        let peers = state.roster.peers().to_vec();
        Ok(Some(self.broadcast(&name, &text, &peers).await))
    }

    /// Seal `manifest_text` to every roster peer and deliver it as a
    /// `Meta_Push`. Best effort: failures are logged and skipped.
    pub async fn broadcast(&self, lynk: &str, manifest_text: &str, peers: &[PeerRef]) -> usize {
        let permits = Arc::new(Semaphore::new(BROADCAST_FANOUT));
        let mut tasks = JoinSet::new();
        for peer in peers {
            if peer.public_key.is_empty() {
                warn!(lynk, %peer, "peer announced no key, skipping broadcast");
                continue;
            }
            let body = match encode_body(&peer.public_key, manifest_text.as_bytes()) {
                Ok(b) => b,
                Err(e) => {
                    warn!(lynk, %peer, error = %e, "cannot seal manifest");
                    continue;
                }
            };
            let permits = permits.clone();
            let peer = peer.clone();
            let request = Request::MetaPush {
                lynk: lynk.to_string(),
            };
            let timeouts = self.timeouts;
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = net::send_with_body(&peer.addr(), &request, &body, timeouts).await;
                (peer, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((peer, Err(e))) => {
                    warn!(lynk, %peer, error = %e, "broadcast delivery failed");
                    self.logger
                        .error("broadcast", lynk, &format!("{peer}: {e}"));
                }
                Err(e) => warn!(lynk, error = %e, "broadcast task failed"),
            }
        }
        info!(lynk, delivered, peers = peers.len(), "broadcast");
        self.logger.broadcast(lynk, delivered, peers.len());
        delivered
    }

    /// Remove the peers matching `ip` (and `port` when given)
    pub async fn disconnect(&self, lynk: &str, ip: &str, port: Option<u16>) -> Result<usize> {
        let state = self.lynk(lynk)?;
        let mut state = state.lock().await;
        let removed = state.roster.remove(ip, port);
        if removed > 0 {
            state.save_roster()?;
            info!(lynk, ip, ?port, removed, "peer disconnected");
        }
        Ok(removed)
    }

    /// Drop roster peers that do not accept a connection. Returns the number
    /// of peers removed across all hosted lynks, including ones not loaded
    /// since start.
    pub async fn purge(&self) -> usize {
        let mut removed = 0;
        for name in self.known_lynks() {
            let state = match self.lynk(&name) {
                Ok(state) => state,
                Err(e) => {
                    warn!(lynk = %name, error = %e, "cannot load tracker state for purge");
                    continue;
                }
            };
            let peers = state.lock().await.roster.peers().to_vec();

            let mut probes = JoinSet::new();
            for peer in peers {
                let timeouts = self.timeouts;
                probes.spawn(async move {
                    let alive = Connection::connect(&peer.addr(), timeouts).await.is_ok();
                    (peer, alive)
                });
            }
            let mut dead = Vec::new();
            while let Some(Ok((peer, alive))) = probes.join_next().await {
                if !alive {
                    dead.push(peer);
                }
            }
            if dead.is_empty() {
                continue;
            }

            let mut state = state.lock().await;
            let n = state.roster.retain(|p| !dead.iter().any(|d| d.same_endpoint(p)));
            if n > 0 {
                if let Err(e) = state.save_roster() {
                    warn!(lynk = %name, error = %e, "cannot persist purged roster");
                }
                info!(lynk = %name, removed = n, "purged unreachable peers");
                removed += n;
            }
        }
        removed
    }

    pub async fn run_purge_loop(self: Arc<Self>, every: std::time::Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.purge().await;
        }
    }
}
