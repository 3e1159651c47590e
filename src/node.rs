//! A Lynx node: the tracker and peer roles, the lynk store and the sync loop
//! behind one handle. One-shot commands use [`Node::open`]; long-running
//! processes use [`Node::start`], which also binds the listeners and spawns
//! the background tasks.

use crate::config::NodeConfig;
use crate::crypto::KeyPair;
use crate::error::{LynxError, Result};
use crate::fs_enum::enumerate_lynk;
use crate::logger::{Logger, NoopLogger, TextLogger};
use crate::lynk::{Lynk, LynkStore, SyncState};
use crate::manifest::{FileStat, Manifest};
use crate::net;
use crate::peer::PeerService;
use crate::protocol::META_FILE;
use crate::protocol_core::{ensure_dir_exists, is_valid_lynk_name, normalize_under_root};
use crate::swarm::PeerRef;
use crate::sync::{SyncEngine, SyncReport};
use crate::tracker::TrackerService;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// One row of `lynx status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LynkStatus {
    pub name: String,
    pub owner: String,
    pub tracker: String,
    pub state: SyncState,
    pub files: usize,
    pub bytes: u64,
    pub push_pending: bool,
}

pub struct Node {
    config: NodeConfig,
    keys: Arc<KeyPair>,
    store: Arc<LynkStore>,
    tracker: Arc<TrackerService>,
    peer: Arc<PeerService>,
    sync: Arc<SyncEngine>,
}

impl Node {
    /// Load identity, index and manifests from `config.home`
    pub fn open(config: NodeConfig) -> Result<Self> {
        ensure_dir_exists(&config.home)?;
        let keys = Arc::new(KeyPair::load_or_generate(&config.identity_path())?);
        let logger: Arc<dyn Logger> = match &config.log_file {
            Some(path) => Arc::new(TextLogger::new(path)?),
            None => Arc::new(NoopLogger),
        };
        let store = Arc::new(LynkStore::open(&config.home)?);
        let me = PeerRef::new(config.advertised_ip(), config.peer_port, keys.public_hex());
        let timeouts = config.timeouts();
        let tracker = Arc::new(TrackerService::new(
            &config.home,
            keys.clone(),
            timeouts,
            logger.clone(),
        ));
        let peer = Arc::new(PeerService::new(
            &config.home,
            keys.clone(),
            store.clone(),
            me,
            timeouts,
            logger,
        ));
        let sync = Arc::new(SyncEngine::new(store.clone(), peer.clone()));
        Ok(Self {
            config,
            keys,
            store,
            tracker,
            peer,
            sync,
        })
    }

    /// Bind both listeners (port 0 picks a free port), then open the node and
    /// spawn the listeners, the sync loop and the purge loop.
    pub async fn start(mut config: NodeConfig) -> Result<NodeHandle> {
        let peer_listener = net::bind(&format!("0.0.0.0:{}", config.peer_port)).await?;
        let tracker_listener = net::bind(&format!("0.0.0.0:{}", config.tracker_port)).await?;
        let peer_addr = peer_listener.local_addr()?;
        let tracker_addr = tracker_listener.local_addr()?;
        config.peer_port = peer_addr.port();
        config.tracker_port = tracker_addr.port();

        let node = Arc::new(Node::open(config)?);
        let max = node.config.max_connections;
        let mut tasks = JoinSet::new();
        let peer = node.peer.clone();
        tasks.spawn(async move {
            if let Err(e) = peer.serve(peer_listener, max).await {
                error!(error = %e, "peer listener stopped");
            }
        });
        let tracker = node.tracker.clone();
        tasks.spawn(async move {
            if let Err(e) = tracker.serve(tracker_listener, max).await {
                error!(error = %e, "tracker listener stopped");
            }
        });
        tasks.spawn(node.sync.clone().run(node.config.sync_interval()));
        tasks.spawn(
            node.tracker
                .clone()
                .run_purge_loop(node.config.purge_interval()),
        );
        info!(
            home = %node.config.home.display(),
            peer = %peer_addr,
            tracker = %tracker_addr,
            key = %node.keys.public_hex(),
            "node started"
        );
        Ok(NodeHandle {
            node,
            peer_addr,
            tracker_addr,
            tasks,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LynkStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<TrackerService> {
        &self.tracker
    }

    pub fn peer(&self) -> &Arc<PeerService> {
        &self.peer
    }

    pub fn public_key(&self) -> String {
        self.keys.public_hex()
    }

    /// Tracker address this node announces for lynks it creates
    pub fn tracker_address(&self) -> String {
        format!("{}:{}", self.peer.me().ip, self.config.tracker_port)
    }

    fn lynk_root(&self, name: &str) -> PathBuf {
        self.config.home.join(name)
    }

    fn handle(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<Lynk>>> {
        self.store
            .get(name)
            .ok_or_else(|| LynxError::NotFound(format!("lynk {name}")))
    }

    /// `"<lynk>/<file>"` is listed in a local manifest and present on disk
    pub async fn have_file(&self, spec: &str) -> bool {
        let Some((name, file)) = spec.split_once('/') else {
            return false;
        };
        let Some(handle) = self.store.get(name) else {
            return false;
        };
        let lynk = handle.lock().await;
        match lynk.manifest.file(file) {
            Some(entry) => lynk.manifest.path_of(entry).is_file(),
            None => false,
        }
    }

    pub async fn get_tracker(&self, name: &str) -> Option<String> {
        let handle = self.store.get(name)?;
        let tracker = handle.lock().await.tracker.clone();
        Some(tracker)
    }

    /// Scan `<home>/<name>` into a manifest announcing this node as tracker
    /// and save it as the lynk's `meta.info`
    pub fn create_meta(&self, name: &str) -> Result<Manifest> {
        check_name(name)?;
        let root = self.lynk_root(name);
        ensure_dir_exists(&root)?;
        let listing = enumerate_lynk(&root, name)?;
        let mut manifest = Manifest::new(name, &self.config.owner, self.tracker_address(), &root)
            .rebuilt(&listing);
        manifest.tracker_key = Some(self.keys.public_hex());
        manifest.save(&root.join(META_FILE))?;
        Ok(manifest)
    }

    /// New lynk from `<home>/<name>`, tracked by this node
    pub fn create_lynk(&self, name: &str) -> Result<()> {
        check_name(name)?;
        if self.store.contains(name) {
            return Err(LynxError::Duplicate(format!("lynk {name}")));
        }
        let manifest = self.create_meta(name)?;
        self.tracker.host_lynk(&manifest, self.peer.me().clone())?;
        let files = manifest.files().len();
        self.store
            .insert(Lynk::from_manifest(manifest, SyncState::Synced))?;
        info!(lynk = name, files, "lynk created");
        Ok(())
    }

    /// Join the lynk described by a `meta.info` obtained out of band
    pub async fn join_lynk(&self, manifest_path: &Path) -> Result<SyncReport> {
        let manifest = Manifest::load(manifest_path, &self.config.home)?;
        self.join_remote(&manifest.tracker, &manifest.lynk_name).await
    }

    /// Register with `tracker`, fetch its manifest and pull every file
    pub async fn join_remote(&self, tracker: &str, name: &str) -> Result<SyncReport> {
        check_name(name)?;
        if self.store.contains(name) {
            return Err(LynxError::Duplicate(format!("lynk {name}")));
        }
        let roster = self.peer.request_roster(tracker, name).await?;
        let manifest = self.peer.request_manifest(tracker, name).await?;
        if manifest.lynk_name != name {
            return Err(LynxError::Format(format!(
                "tracker {tracker} answered with lynk {}",
                manifest.lynk_name
            )));
        }
        ensure_dir_exists(&manifest.root)?;
        manifest.save(&manifest.root.join(META_FILE))?;

        let mut lynk = Lynk::from_manifest(manifest, SyncState::Unsynced);
        lynk.peers = roster.peers().to_vec();
        let handle = self.store.insert(lynk)?;
        info!(lynk = name, %tracker, peers = roster.len(), "joined lynk");
        self.sync.reconcile(&handle).await
    }

    /// Leave a lynk: forget it, drop its `meta.info` and tell the tracker.
    /// The files themselves stay on disk.
    pub async fn delete_lynk(&self, name: &str) -> Result<()> {
        let handle = self
            .store
            .remove(name)?
            .ok_or_else(|| LynxError::NotFound(format!("lynk {name}")))?;
        let lynk = handle.lock().await;
        match std::fs::remove_file(lynk.meta_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.peer.disconnect(&lynk.tracker, name).await {
            warn!(lynk = name, tracker = %lynk.tracker, error = %e, "tracker not told about leaving");
        }
        info!(lynk = name, "lynk deleted");
        Ok(())
    }

    /// Add a file to a lynk, copying it into the lynk directory when it lives
    /// elsewhere, then push the new manifest
    pub async fn add_file(&self, name: &str, path: &Path) -> Result<FileStat> {
        let handle = self.handle(name)?;
        let mut lynk = handle.lock().await;
        let root = lynk.root().to_path_buf();
        ensure_dir_exists(&root)?;
        let canon_root = root.canonicalize()?;
        let source = path.canonicalize()?;

        let inside = source.starts_with(&canon_root);
        let target = if inside {
            source.clone()
        } else {
            let file_name = source
                .file_name()
                .ok_or_else(|| LynxError::NotFound(format!("{} is not a file", path.display())))?;
            canon_root.join(file_name)
        };
        let stat = FileStat {
            name: crate::manifest::rel_to_name(
                target
                    .strip_prefix(&canon_root)
                    .map_err(|_| LynxError::NotFound(format!("{} is outside the lynk", target.display())))?,
            ),
            length: std::fs::metadata(&source)?.len(),
        };
        if lynk.manifest.contains(&stat.name) {
            return Err(LynxError::Duplicate(format!("{} already in lynk {name}", stat.name)));
        }
        if !inside {
            if target.exists() {
                return Err(LynxError::Duplicate(format!(
                    "{} already exists in lynk {name}",
                    target.display()
                )));
            }
            std::fs::copy(&source, &target)?;
        }
        let stat = FileStat::from_path(&canon_root, &target)?;

        lynk.manifest.add_file(&stat)?;
        lynk.manifest.save(&lynk.meta_path())?;
        if let Err(e) = self.sync.push(&mut lynk).await {
            warn!(lynk = name, error = %e, "push failed, will retry");
        }
        info!(lynk = name, file = %stat.name, "file added");
        Ok(stat)
    }

    /// Remove a file from a lynk and from disk, then push. Returns false when
    /// the name was not listed.
    pub async fn remove_file(&self, name: &str, file: &str) -> Result<bool> {
        let handle = self.handle(name)?;
        let mut lynk = handle.lock().await;
        let Some(entry) = lynk.manifest.file(file).cloned() else {
            return Ok(false);
        };
        let path = normalize_under_root(lynk.root(), Path::new(&entry.relative_path))?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        lynk.manifest.remove_file(file);
        lynk.missing.remove(file);
        lynk.manifest.save(&lynk.meta_path())?;
        if let Err(e) = self.sync.push(&mut lynk).await {
            warn!(lynk = name, error = %e, "push failed, will retry");
        }
        info!(lynk = name, file, "file removed");
        Ok(true)
    }

    pub async fn sync_once(&self) -> SyncReport {
        self.sync.sync_once().await
    }

    pub async fn status(&self) -> Vec<LynkStatus> {
        let mut out = Vec::new();
        for name in self.store.names() {
            let Some(handle) = self.store.get(&name) else { continue };
            let lynk = handle.lock().await;
            out.push(LynkStatus {
                name: lynk.name.clone(),
                owner: lynk.owner.clone(),
                tracker: lynk.tracker.clone(),
                state: lynk.sync_state,
                files: lynk.manifest.files().len(),
                bytes: lynk.manifest.files().iter().map(|f| f.length).sum(),
                push_pending: lynk.push_pending,
            });
        }
        out
    }
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_lynk_name(name) {
        Ok(())
    } else {
        Err(LynxError::Format(format!("invalid lynk name {name:?}")))
    }
}

/// A started node and its background tasks
pub struct NodeHandle {
    pub node: Arc<Node>,
    pub peer_addr: SocketAddr,
    pub tracker_addr: SocketAddr,
    tasks: JoinSet<()>,
}

impl NodeHandle {
    /// Resolves when a background task ends, which only happens on failure
    pub async fn wait(&mut self) {
        if let Some(Err(e)) = self.tasks.join_next().await {
            error!(error = %e, "background task failed");
        }
    }

    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
        info!("node stopped");
    }
}
