//! Peer role: serves file content and receives manifest broadcasts, plus the
//! client side used to talk to trackers and other peers.

use crate::crypto::KeyPair;
use crate::error::{LynxError, Result};
use crate::logger::Logger;
use crate::lynk::{LynkStore, SyncState};
use crate::manifest::Manifest;
use crate::net::{self, Connection, Timeouts};
use crate::protocol::{reply, RECONN_ATTEMPTS};
use crate::protocol_core::{ensure_parent_exists, normalize_under_root, write_atomic, Request};
use crate::swarm::{PeerRef, SwarmRoster};
use crate::transfer::{decode_body, encode_body};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// What a fetch needs to know about a lynk, taken while holding its lock
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub lynk: String,
    pub tracker: String,
    pub root: PathBuf,
    /// Peers to ask for the tracker address when the tracker is unreachable
    pub known_peers: Vec<PeerRef>,
    pub downloading: Arc<AtomicBool>,
}

impl FetchPlan {
    fn check_cancelled(&self) -> Result<()> {
        if self.downloading.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LynxError::Cancelled(format!("fetch for lynk {}", self.lynk)))
        }
    }
}

pub struct PeerService {
    home: PathBuf,
    keys: Arc<KeyPair>,
    store: Arc<LynkStore>,
    /// How this node announces itself to trackers
    me: PeerRef,
    timeouts: Timeouts,
    logger: Arc<dyn Logger>,
}

impl PeerService {
    pub fn new(
        home: impl Into<PathBuf>,
        keys: Arc<KeyPair>,
        store: Arc<LynkStore>,
        me: PeerRef,
        timeouts: Timeouts,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            home: home.into(),
            keys,
            store,
            me,
            timeouts,
            logger,
        }
    }

    pub fn me(&self) -> &PeerRef {
        &self.me
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    /// Accept loop for the peer port
    pub async fn serve(self: Arc<Self>, listener: TcpListener, max_connections: usize) -> Result<()> {
        let timeouts = self.timeouts;
        net::serve(listener, "peer", max_connections, timeouts, move |request, conn| {
            let svc = self.clone();
            async move { svc.handle(request, conn).await }
        })
        .await
    }

    pub async fn handle(&self, request: Request, mut conn: Connection) -> Result<()> {
        match request {
            Request::HaveFile { lynk, file, key } => {
                match self.file_body(&lynk, &file, key.as_deref()).await {
                    Some(body) => {
                        conn.write_line(reply::YES).await?;
                        conn.write_all(&body).await?;
                    }
                    None => conn.write_line(reply::NO).await?,
                }
                conn.finish().await
            }
            Request::MetaPush { lynk } => {
                let body = conn.read_to_end().await?;
                let keys = self.keys.clone();
                let payload = tokio::task::spawn_blocking(move || decode_body(&keys, &body))
                    .await
                    .map_err(|e| LynxError::Transport(format!("decode task failed: {e}")))??;
                let text = String::from_utf8(payload)
                    .map_err(|_| LynxError::Format("broadcast manifest is not UTF-8".into()))?;
                let manifest = Manifest::parse(&text, &self.home)?;
                if manifest.lynk_name != lynk {
                    return Err(LynxError::Format(format!(
                        "broadcast for {lynk} carries manifest of {}",
                        manifest.lynk_name
                    )));
                }
                self.receive_manifest(manifest).await?;
                Ok(())
            }
            Request::TrackerRequest { lynk } => {
                let tracker = match self.store.get(&lynk) {
                    Some(handle) => Some(handle.lock().await.tracker.clone()),
                    None => None,
                };
                conn.write_line(tracker.as_deref().unwrap_or(reply::NO)).await?;
                conn.finish().await
            }
            other => Err(LynxError::ProtocolSyntax(format!(
                "{other} is not a peer request"
            ))),
        }
    }

    /// Framed body for a file request, `None` when the answer is `NO`
    async fn file_body(&self, lynk: &str, file: &str, key: Option<&str>) -> Option<Vec<u8>> {
        let Some(key) = key else {
            debug!(lynk, file, "file request without a key");
            return None;
        };
        let handle = self.store.get(lynk)?;
        let (root, relative) = {
            let lynk = handle.lock().await;
            let entry = lynk.manifest.file(file)?;
            (lynk.manifest.root.clone(), entry.relative_path.clone())
        };
        let path = match normalize_under_root(&root, Path::new(&relative)) {
            Ok(p) => p,
            Err(e) => {
                warn!(lynk, file, error = %e, "refusing file request");
                return None;
            }
        };
        let bytes = tokio::fs::read(&path).await.ok()?;
        let key = key.to_string();
        match tokio::task::spawn_blocking(move || encode_body(&key, &bytes)).await {
            Ok(Ok(body)) => Some(body),
            Ok(Err(e)) => {
                debug!(lynk, file, error = %e, "cannot frame file for requester");
                None
            }
            Err(e) => {
                warn!(lynk, file, error = %e, "framing task failed");
                None
            }
        }
    }

    /// Apply a broadcast manifest. Returns true if the local manifest changed.
    /// Broadcasts older than the local generation arrived out of order and are
    /// dropped; the echo of this node's own push only updates the generation.
    pub async fn receive_manifest(&self, manifest: Manifest) -> Result<bool> {
        let Some(handle) = self.store.get(&manifest.lynk_name) else {
            debug!(lynk = %manifest.lynk_name, "broadcast for unknown lynk ignored");
            return Ok(false);
        };
        let mut lynk = handle.lock().await;
        if manifest.generation < lynk.manifest.generation {
            debug!(
                lynk = %lynk.name,
                got = manifest.generation,
                have = lynk.manifest.generation,
                "stale broadcast ignored"
            );
            return Ok(false);
        }
        let content = manifest.content();
        if content == lynk.manifest.content() || lynk.pushed_recently(&content) {
            if manifest.generation > lynk.manifest.generation {
                lynk.manifest.generation = manifest.generation;
                lynk.manifest.save(&lynk.meta_path())?;
            }
            return Ok(false);
        }
        manifest.save(&lynk.meta_path())?;
        lynk.set_manifest(manifest);
        lynk.sync_state = SyncState::Unsynced;
        self.store.update_entry(&lynk)?;
        info!(lynk = %lynk.name, files = lynk.manifest.files().len(), "received manifest");
        Ok(true)
    }

    // ---- client side ----

    async fn ask(&self, addr: &str, request: &Request) -> Result<Vec<u8>> {
        let reply = net::request_reply(addr, request, self.timeouts).await?;
        if reply.is_empty() {
            return Err(LynxError::Transport(format!(
                "{addr} closed without answering {}",
                request
            )));
        }
        Ok(reply)
    }

    /// `Swarm_Request`: registers this node and returns the roster
    pub async fn request_roster(&self, tracker: &str, lynk: &str) -> Result<SwarmRoster> {
        let request = Request::SwarmRequest {
            peer: self.me.clone(),
            lynk: lynk.to_string(),
        };
        let reply = self.ask(tracker, &request).await?;
        SwarmRoster::parse(&String::from_utf8_lossy(&reply))
    }

    /// `Meta_Request`: registers this node and returns the tracker's manifest
    pub async fn request_manifest(&self, tracker: &str, lynk: &str) -> Result<Manifest> {
        let request = Request::MetaRequest {
            peer: self.me.clone(),
            lynk: lynk.to_string(),
        };
        let reply = self.ask(tracker, &request).await?;
        Manifest::parse(&String::from_utf8_lossy(&reply), &self.home)
    }

    /// `Tracker_Request` to another peer
    pub async fn ask_tracker(&self, peer: &PeerRef, lynk: &str) -> Result<Option<String>> {
        let request = Request::TrackerRequest {
            lynk: lynk.to_string(),
        };
        let reply = self.ask(&peer.addr(), &request).await?;
        let answer = String::from_utf8_lossy(&reply).trim().to_string();
        if answer == reply::NO || answer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(answer))
        }
    }

    /// Seal `manifest` to its tracker and push it
    pub async fn push_manifest(&self, manifest: &Manifest) -> Result<()> {
        let key = manifest.tracker_key.as_deref().ok_or_else(|| {
            LynxError::Crypto(format!("no tracker key known for lynk {}", manifest.lynk_name))
        })?;
        let body = encode_body(key, manifest.render().as_bytes())?;
        let request = Request::MetaPush {
            lynk: manifest.lynk_name.clone(),
        };
        net::send_with_body(&manifest.tracker, &request, &body, self.timeouts).await?;
        info!(lynk = %manifest.lynk_name, files = manifest.files().len(), "pushed manifest");
        self.logger.pushed(&manifest.lynk_name, manifest.files().len());
        Ok(())
    }

    /// Leave the swarm of `lynk`
    pub async fn disconnect(&self, tracker: &str, lynk: &str) -> Result<()> {
        let request = Request::Disconnect {
            ip: self.me.ip.clone(),
            port: Some(self.me.port),
            lynk: lynk.to_string(),
        };
        net::send_with_body(tracker, &request, &[], self.timeouts).await
    }

    /// Ask one peer for a file. `None` means it answered `NO`.
    pub async fn request_file(&self, peer: &PeerRef, lynk: &str, file: &str) -> Result<Option<Vec<u8>>> {
        let request = Request::HaveFile {
            lynk: lynk.to_string(),
            file: file.to_string(),
            key: Some(self.keys.public_hex()),
        };
        let reply = self.ask(&peer.addr(), &request).await?;
        let (status, body) = match reply.iter().position(|b| *b == b'\n') {
            Some(i) => (&reply[..i], &reply[i + 1..]),
            None => (&reply[..], &[][..]),
        };
        match std::str::from_utf8(status).map(str::trim) {
            Ok(reply::YES) => {
                let keys = self.keys.clone();
                let body = body.to_vec();
                let payload = tokio::task::spawn_blocking(move || decode_body(&keys, &body))
                    .await
                    .map_err(|e| LynxError::Transport(format!("decode task: {e}")))??;
                Ok(Some(payload))
            }
            Ok(reply::NO) => Ok(None),
            _ => Err(LynxError::ProtocolSyntax(format!(
                "unexpected reply from {peer} to file request"
            ))),
        }
    }

    /// Roster for `plan`, falling back to tracker discovery through known
    /// peers. Returns the roster and the tracker address that answered.
    pub async fn roster_for(&self, plan: &FetchPlan) -> Result<(SwarmRoster, String)> {
        let err = match self.request_roster(&plan.tracker, &plan.lynk).await {
            Ok(roster) => return Ok((roster, plan.tracker.clone())),
            Err(e) => e,
        };
        warn!(lynk = %plan.lynk, tracker = %plan.tracker, error = %err, "tracker unreachable, asking peers");
        for peer in plan.known_peers.iter().filter(|p| !p.same_endpoint(&self.me)) {
            let Ok(Some(addr)) = self.ask_tracker(peer, &plan.lynk).await else {
                continue;
            };
            if addr == plan.tracker {
                continue;
            }
            if let Ok(roster) = self.request_roster(&addr, &plan.lynk).await {
                info!(lynk = %plan.lynk, tracker = %addr, "tracker found through peer {peer}");
                return Ok((roster, addr));
            }
        }
        Err(err)
    }

    /// One walk over the roster. Writes the file atomically under the lynk
    /// root and returns its size.
    pub async fn fetch_file(&self, plan: &FetchPlan, file: &str, length: u64) -> Result<u64> {
        plan.check_cancelled()?;
        let target = normalize_under_root(&plan.root, Path::new(file))?;
        let (roster, _) = self.roster_for(plan).await?;

        for peer in roster.peers().iter().filter(|p| !p.same_endpoint(&self.me)) {
            plan.check_cancelled()?;
            match self.request_file(peer, &plan.lynk, file).await {
                Ok(Some(bytes)) if bytes.len() as u64 == length => {
                    plan.check_cancelled()?;
                    ensure_parent_exists(&target)?;
                    write_atomic(&target, &bytes)?;
                    debug!(lynk = %plan.lynk, file, bytes = bytes.len(), from = %peer, "fetched");
                    self.logger
                        .fetched(&plan.lynk, file, bytes.len() as u64, &peer.to_string());
                    return Ok(bytes.len() as u64);
                }
                Ok(Some(bytes)) => debug!(
                    lynk = %plan.lynk, file, got = bytes.len(), want = length, from = %peer,
                    "peer has a different version"
                ),
                Ok(None) => debug!(lynk = %plan.lynk, file, from = %peer, "peer does not have file"),
                Err(e) => debug!(lynk = %plan.lynk, file, from = %peer, error = %e, "request failed"),
            }
        }
        Err(LynxError::FileNotAvailable {
            lynk: plan.lynk.clone(),
            file: file.to_string(),
        })
    }

    /// [`PeerService::fetch_file`] repeated up to `RECONN_ATTEMPTS` times
    pub async fn fetch_with_retry(&self, plan: &FetchPlan, file: &str, length: u64) -> Result<u64> {
        let mut last = None;
        for attempt in 1..=RECONN_ATTEMPTS {
            match self.fetch_file(plan, file, length).await {
                Ok(n) => return Ok(n),
                Err(e @ LynxError::Cancelled(_)) => return Err(e),
                Err(e) if e.is_recoverable() || matches!(e, LynxError::FileNotAvailable { .. }) => {
                    debug!(lynk = %plan.lynk, file, attempt, error = %e, "fetch attempt failed");
                    last = Some(e);
                    if attempt < RECONN_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        let err = last.unwrap_or_else(|| LynxError::FileNotAvailable {
            lynk: plan.lynk.clone(),
            file: file.to_string(),
        });
        self.logger.error("fetch", &plan.lynk, &err.to_string());
        Err(err)
    }
}
