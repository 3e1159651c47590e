//! Periodic synchronization
//!
//! Each pass visits every lynk in the store. An `Unsynced` lynk has received
//! a manifest that is not applied yet: extra local files are pruned once and
//! missing ones fetched. A `Synced` lynk retries files that could not be
//! fetched, then is scanned for local drift, which rebuilds the manifest and
//! pushes it to the tracker.

use crate::error::{LynxError, Result};
use crate::fs_enum::enumerate_lynk;
use crate::lynk::{Lynk, LynkStore, SyncState};
use crate::manifest::FileStat;
use crate::peer::{FetchPlan, PeerService};
use crate::protocol_core::{ensure_dir_exists, normalize_under_root};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub fetched: usize,
    pub pruned: usize,
    pub failed: usize,
    /// Received manifests fully applied
    pub applied: usize,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.pushed += other.pushed;
        self.fetched += other.fetched;
        self.pruned += other.pruned;
        self.failed += other.failed;
        self.applied += other.applied;
    }
}

pub struct SyncEngine {
    store: Arc<LynkStore>,
    peer: Arc<PeerService>,
}

impl SyncEngine {
    pub fn new(store: Arc<LynkStore>, peer: Arc<PeerService>) -> Self {
        Self { store, peer }
    }

    /// One pass over every lynk; per-lynk failures are logged and skipped
    pub async fn sync_once(&self) -> SyncReport {
        if let Err(e) = self.store.reload() {
            warn!(error = %e, "cannot reload lynk index");
        }
        let mut report = SyncReport::default();
        for name in self.store.names() {
            let Some(handle) = self.store.get(&name) else { continue };
            match self.sync_lynk(&handle).await {
                Ok(r) => report.merge(r),
                Err(LynxError::Cancelled(_)) => debug!(lynk = %name, "sync cancelled"),
                Err(e) => {
                    warn!(lynk = %name, error = %e, "sync failed");
                    self.peer.logger().error("sync", &name, &e.to_string());
                }
            }
        }
        report
    }

    pub async fn sync_lynk(&self, handle: &Arc<Mutex<Lynk>>) -> Result<SyncReport> {
        let state = handle.lock().await.sync_state;
        match state {
            SyncState::Unsynced => self.reconcile(handle).await,
            SyncState::Synced => {
                let mut report = self.fetch_missing(handle).await?;
                report.merge(self.detect_drift(handle).await?);
                Ok(report)
            }
        }
    }

    /// Apply a received manifest once: prune extras, fetch what is missing or
    /// has the wrong length, then mark the lynk `Synced`. Files no peer could
    /// serve stay in `Lynk::missing` and are retried on later passes, so local
    /// files created meanwhile are never pruned against this manifest again.
    /// Fetches run without the lynk lock.
    pub async fn reconcile(&self, handle: &Arc<Mutex<Lynk>>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let (mut plan, content, wanted) = {
            let lynk = handle.lock().await;
            ensure_dir_exists(lynk.root())?;
            let listing = enumerate_lynk(lynk.root(), &lynk.name)?;
            for stat in listing.iter().filter(|s| !lynk.manifest.contains(&s.name)) {
                match prune(lynk.root(), &stat.name) {
                    Ok(path) => {
                        info!(lynk = %lynk.name, file = %stat.name, "pruned");
                        self.peer.logger().pruned(&lynk.name, &path);
                        report.pruned += 1;
                    }
                    Err(e) => warn!(lynk = %lynk.name, file = %stat.name, error = %e, "cannot prune"),
                }
            }
            let wanted: Vec<(String, u64)> = lynk
                .manifest
                .files()
                .iter()
                .filter(|f| !listing.iter().any(|s| s.name == f.name && s.length == f.length))
                .map(|f| (f.name.clone(), f.length))
                .collect();
            (lynk.fetch_plan(), lynk.manifest.content(), wanted)
        };

        if !wanted.is_empty() {
            if let Ok((roster, tracker)) = self.peer.roster_for(&plan).await {
                let mut lynk = handle.lock().await;
                lynk.peers = roster.peers().to_vec();
                if tracker != lynk.tracker {
                    info!(lynk = %lynk.name, %tracker, "tracker moved");
                    lynk.tracker = tracker.clone();
                    plan.tracker = tracker;
                }
            }
        }

        let failed = self.fetch_all(&plan, &wanted, &mut report).await?;

        let mut lynk = handle.lock().await;
        // a newer manifest may have arrived while fetching; it is applied next pass
        if lynk.manifest.content() == content {
            lynk.sync_state = SyncState::Synced;
            lynk.missing = failed;
            report.applied = 1;
            if lynk.missing.is_empty() {
                info!(lynk = %lynk.name, fetched = report.fetched, pruned = report.pruned, "lynk synced");
            } else {
                warn!(
                    lynk = %lynk.name,
                    missing = lynk.missing.len(),
                    "manifest applied, some files not available yet"
                );
            }
        }
        Ok(report)
    }

    /// Retry the files a previous reconcile could not fetch
    pub async fn fetch_missing(&self, handle: &Arc<Mutex<Lynk>>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let (plan, content, wanted) = {
            let lynk = handle.lock().await;
            if lynk.missing.is_empty() || lynk.is_cancelled() {
                return Ok(report);
            }
            let wanted: Vec<(String, u64)> = lynk
                .missing
                .iter()
                .filter_map(|name| lynk.manifest.file(name))
                .map(|f| (f.name.clone(), f.length))
                .collect();
            (lynk.fetch_plan(), lynk.manifest.content(), wanted)
        };

        let failed = self.fetch_all(&plan, &wanted, &mut report).await?;

        let mut lynk = handle.lock().await;
        if lynk.manifest.content() == content {
            lynk.missing = failed;
        }
        Ok(report)
    }

    /// Fetch each file in turn; returns the names that could not be fetched
    async fn fetch_all(
        &self,
        plan: &FetchPlan,
        files: &[(String, u64)],
        report: &mut SyncReport,
    ) -> Result<BTreeSet<String>> {
        let mut failed = BTreeSet::new();
        for (file, length) in files {
            match self.peer.fetch_with_retry(plan, file, *length).await {
                Ok(_) => report.fetched += 1,
                Err(e @ LynxError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(lynk = %plan.lynk, file = %file, error = %e, "fetch failed");
                    report.failed += 1;
                    failed.insert(file.clone());
                }
            }
        }
        Ok(failed)
    }

    /// Rebuild and push the manifest when the directory changed. Entries still
    /// waiting to be fetched count as present.
    pub async fn detect_drift(&self, handle: &Arc<Mutex<Lynk>>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut guard = handle.lock().await;
        let lynk = &mut *guard;
        if lynk.is_cancelled() {
            return Ok(report);
        }
        let mut listing = match enumerate_lynk(lynk.root(), &lynk.name) {
            Ok(l) => l,
            Err(LynxError::NotFound(_)) => {
                warn!(lynk = %lynk.name, root = %lynk.root().display(), "lynk directory missing, skipping");
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        // a pending file that showed up with the right length is no longer missing
        let manifest = &lynk.manifest;
        lynk.missing.retain(|name| {
            let Some(entry) = manifest.file(name) else { return false };
            !listing.iter().any(|s| &s.name == name && s.length == entry.length)
        });
        listing.retain(|s| !lynk.missing.contains(&s.name));
        listing.extend(
            lynk.missing
                .iter()
                .filter_map(|name| lynk.manifest.file(name))
                .map(|f| FileStat {
                    name: f.name.clone(),
                    length: f.length,
                }),
        );

        if lynk.manifest.differs_from(&listing) {
            let rebuilt = lynk.manifest.rebuilt(&listing);
            rebuilt.save(&lynk.meta_path())?;
            info!(lynk = %lynk.name, files = rebuilt.files().len(), "local change detected");
            let missing = std::mem::take(&mut lynk.missing);
            lynk.set_manifest(rebuilt);
            lynk.missing = missing;
            lynk.push_pending = true;
        }
        if lynk.push_pending {
            match self.push(lynk).await {
                Ok(()) => report.pushed = 1,
                Err(e) => {
                    warn!(lynk = %lynk.name, error = %e, "push failed, will retry");
                    self.peer.logger().error("push", &lynk.name, &e.to_string());
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Push the lynk's current manifest; on failure it stays pending
    pub async fn push(&self, lynk: &mut Lynk) -> Result<()> {
        lynk.push_pending = true;
        lynk.record_push(lynk.manifest.content());
        self.peer.push_manifest(&lynk.manifest).await?;
        lynk.push_pending = false;
        Ok(())
    }

    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.sync_once().await;
            if report != SyncReport::default() {
                debug!(?report, "sync pass");
            }
        }
    }
}

/// Delete a file that is no longer part of the lynk
fn prune(root: &Path, name: &str) -> Result<std::path::PathBuf> {
    let path = normalize_under_root(root, Path::new(name))?;
    std::fs::remove_file(&path)?;
    Ok(path)
}
