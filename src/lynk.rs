//! Client-side lynk state and the per-node `LynkStore`
//!
//! The store maps lynk names to `Arc<tokio::sync::Mutex<Lynk>>` so every
//! mutation of one lynk is serialized while different lynks proceed in
//! parallel. The set of lynks is mirrored in `<home>/lynks.txt`
//! (`name:::owner:::tracker` per line) which the sync loop re-reads on every
//! tick.

use crate::error::{LynxError, Result};
use crate::fs_enum::enumerate_lynk;
use crate::manifest::Manifest;
use crate::peer::FetchPlan;
use crate::protocol::{LYNK_INDEX_FILE, META_FILE, RECORD_SEPARATOR};
use crate::protocol_core::{is_valid_lynk_name, write_atomic};
use crate::swarm::PeerRef;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Whether the local directory reflects the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    /// A received manifest is not applied yet
    Unsynced,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Synced => f.write_str("synced"),
            SyncState::Unsynced => f.write_str("unsynced"),
        }
    }
}

#[derive(Debug)]
pub struct Lynk {
    pub name: String,
    pub owner: String,
    /// Tracker `host:port`
    pub tracker: String,
    pub sync_state: SyncState,
    /// Cleared to cancel in-flight fetches for this lynk
    pub downloading: Arc<AtomicBool>,
    pub manifest: Manifest,
    /// Last roster seen from the tracker, used for tracker discovery
    pub peers: Vec<PeerRef>,
    /// The local manifest was saved but the tracker has not accepted it yet
    pub push_pending: bool,
    /// Manifest entries applied but not fetched yet; retried every pass and
    /// counted as present by drift detection
    pub missing: BTreeSet<String>,
    recent_pushes: VecDeque<String>,
}

/// Pushed manifests remembered so their echo broadcast is not re-applied
const RECENT_PUSHES: usize = 4;

impl Lynk {
    pub fn from_manifest(manifest: Manifest, sync_state: SyncState) -> Self {
        Self {
            name: manifest.lynk_name.clone(),
            owner: manifest.owner.clone(),
            tracker: manifest.tracker.clone(),
            sync_state,
            downloading: Arc::new(AtomicBool::new(true)),
            manifest,
            peers: Vec::new(),
            push_pending: false,
            missing: BTreeSet::new(),
            recent_pushes: VecDeque::new(),
        }
    }

    /// A lynk read back from its `meta.info`. It starts `Synced`: listed files
    /// absent on disk are fetched, local extras count as edits.
    pub fn from_disk(manifest: Manifest) -> Self {
        let missing = match enumerate_lynk(&manifest.root, &manifest.lynk_name) {
            Ok(listing) => manifest
                .files()
                .iter()
                .filter(|f| !listing.iter().any(|s| s.name == f.name && s.length == f.length))
                .map(|f| f.name.clone())
                .collect(),
            Err(_) => manifest.files().iter().map(|f| f.name.clone()).collect(),
        };
        let mut lynk = Self::from_manifest(manifest, SyncState::Synced);
        lynk.missing = missing;
        lynk
    }

    pub fn root(&self) -> &Path {
        &self.manifest.root
    }

    pub fn meta_path(&self) -> PathBuf {
        self.manifest.root.join(META_FILE)
    }

    /// Replace the manifest, keeping the header fields in step
    pub fn set_manifest(&mut self, manifest: Manifest) {
        self.owner = manifest.owner.clone();
        self.tracker = manifest.tracker.clone();
        self.manifest = manifest;
        self.missing.clear();
    }

    pub fn record_push(&mut self, rendered: String) {
        if self.recent_pushes.len() == RECENT_PUSHES {
            self.recent_pushes.pop_front();
        }
        self.recent_pushes.push_back(rendered);
    }

    /// True if `rendered` is a manifest this node pushed itself
    pub fn pushed_recently(&self, rendered: &str) -> bool {
        self.recent_pushes.iter().any(|p| p == rendered)
    }

    pub fn fetch_plan(&self) -> FetchPlan {
        FetchPlan {
            lynk: self.name.clone(),
            tracker: self.tracker.clone(),
            root: self.manifest.root.clone(),
            known_peers: self.peers.clone(),
            downloading: self.downloading.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !self.downloading.load(Ordering::SeqCst)
    }

    fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            name: self.name.clone(),
            owner: self.owner.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

/// One line of `lynks.txt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub owner: String,
    pub tracker: String,
}

pub fn parse_index(text: &str) -> Result<Vec<IndexEntry>> {
    let mut out: Vec<IndexEntry> = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(RECORD_SEPARATOR).map(str::trim).collect();
        if fields.len() != 3 || !is_valid_lynk_name(fields[0]) {
            return Err(LynxError::Format(format!(
                "{LYNK_INDEX_FILE} line {}: expected name{sep}owner{sep}tracker",
                n + 1,
                sep = RECORD_SEPARATOR
            )));
        }
        if out.iter().any(|e| e.name == fields[0]) {
            continue;
        }
        out.push(IndexEntry {
            name: fields[0].to_string(),
            owner: fields[1].to_string(),
            tracker: fields[2].to_string(),
        });
    }
    Ok(out)
}

pub fn render_index(entries: &[IndexEntry]) -> String {
    let sep = RECORD_SEPARATOR;
    entries
        .iter()
        .map(|e| format!("{}{sep}{}{sep}{}\n", e.name, e.owner, e.tracker))
        .collect()
}

struct Slot {
    entry: IndexEntry,
    downloading: Arc<AtomicBool>,
    lynk: Arc<Mutex<Lynk>>,
}

impl Slot {
    fn new(entry: IndexEntry, lynk: Lynk) -> Self {
        Self {
            entry,
            downloading: lynk.downloading.clone(),
            lynk: Arc::new(Mutex::new(lynk)),
        }
    }

    // the lynk itself may be locked by a long fetch
    fn cancel(&self) {
        self.downloading.store(false, Ordering::SeqCst);
    }
}

/// All lynks this node participates in
pub struct LynkStore {
    home: PathBuf,
    slots: RwLock<BTreeMap<String, Slot>>,
    // held across a memory change and the matching index write
    index_lock: parking_lot::Mutex<()>,
}

impl LynkStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            slots: RwLock::new(BTreeMap::new()),
            index_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Store populated from the index and manifests under `home`
    pub fn open(home: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(home);
        store.reload()?;
        Ok(store)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn index_path(&self) -> PathBuf {
        self.home.join(LYNK_INDEX_FILE)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<Lynk>>> {
        self.slots.read().get(name).map(|s| s.lynk.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.slots.read().values().map(|s| s.entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Register a lynk and persist the index; a known name is `Duplicate`
    pub fn insert(&self, lynk: Lynk) -> Result<Arc<Mutex<Lynk>>> {
        let _index = self.index_lock.lock();
        let handle = {
            let mut slots = self.slots.write();
            if slots.contains_key(&lynk.name) {
                return Err(LynxError::Duplicate(format!("lynk {}", lynk.name)));
            }
            let slot = Slot::new(lynk.index_entry(), lynk);
            let handle = slot.lynk.clone();
            slots.insert(slot.entry.name.clone(), slot);
            handle
        };
        self.save_index()?;
        Ok(handle)
    }

    /// Drop a lynk from the store and the index, cancelling its fetches
    pub fn remove(&self, name: &str) -> Result<Option<Arc<Mutex<Lynk>>>> {
        let _index = self.index_lock.lock();
        let removed = self.slots.write().remove(name);
        if let Some(slot) = &removed {
            slot.cancel();
            self.save_index()?;
        }
        Ok(removed.map(|s| s.lynk))
    }

    /// Refresh the index line of a lynk after its header changed
    pub fn update_entry(&self, lynk: &Lynk) -> Result<()> {
        let _index = self.index_lock.lock();
        let changed = {
            let mut slots = self.slots.write();
            match slots.get_mut(&lynk.name) {
                Some(slot) if slot.entry != lynk.index_entry() => {
                    slot.entry = lynk.index_entry();
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.save_index()?;
        }
        Ok(())
    }

    pub fn save_index(&self) -> Result<()> {
        write_atomic(&self.index_path(), render_index(&self.entries()).as_bytes())
    }

    /// Bring the in-memory set in line with `lynks.txt`: load lynks that were
    /// added by another process, drop those that were removed. Returns the
    /// number of lynks added plus removed.
    pub fn reload(&self) -> Result<usize> {
        let _index = self.index_lock.lock();
        let entries = match std::fs::read_to_string(self.index_path()) {
            Ok(text) => parse_index(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut changes = 0;
        let stale: Vec<String> = self
            .names()
            .into_iter()
            .filter(|n| !entries.iter().any(|e| &e.name == n))
            .collect();
        for name in stale {
            if let Some(slot) = self.slots.write().remove(&name) {
                slot.cancel();
                info!(lynk = %name, "lynk removed from index");
                changes += 1;
            }
        }

        for entry in entries {
            if self.contains(&entry.name) {
                continue;
            }
            let meta = self.home.join(&entry.name).join(META_FILE);
            let manifest = match Manifest::load(&meta, &self.home) {
                Ok(m) => m,
                Err(e) => {
                    warn!(lynk = %entry.name, error = %e, "skipping indexed lynk without a usable manifest");
                    continue;
                }
            };
            let lynk = Lynk::from_disk(manifest);
            self.slots
                .write()
                .entry(entry.name.clone())
                .or_insert_with(|| Slot::new(entry, lynk));
            changes += 1;
        }
        Ok(changes)
    }
}
