use anyhow::Result;
use lynx::config::NodeConfig;
use lynx::lynk::SyncState;
use lynx::crypto::KeyPair;
use lynx::manifest::{FileStat, Manifest};
use lynx::net::{self, Timeouts};
use lynx::peer::FetchPlan;
use lynx::protocol::{META_FILE, RECONN_ATTEMPTS};
use lynx::protocol_core::Request;
use lynx::swarm::PeerRef;
use lynx::tracker::tracker_dir;
use lynx::{LynxError, Node, NodeHandle};
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let buf: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    f.write_all(&buf)?;
    Ok(())
}

async fn start_node(base: &Path, name: &str) -> Result<NodeHandle> {
    let mut cfg = NodeConfig::with_home(base.join(name));
    cfg.owner = name.to_string();
    cfg.peer_port = 0;
    cfg.tracker_port = 0;
    cfg.advertise_ip = Some("127.0.0.1".into());
    cfg.sync_interval_secs = 3600;
    cfg.purge_interval_secs = 3600;
    cfg.log_file = Some(base.join(format!("{name}.log")));
    Ok(Node::start(cfg).await?)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100u32 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn tracker_has(node: &Node, lynk: &str, file: &str) -> bool {
    match node.tracker().lynk(lynk) {
        Ok(state) => state.lock().await.manifest.contains(file),
        Err(_) => false,
    }
}

async fn state_of(node: &Node, lynk: &str) -> Option<SyncState> {
    let handle = node.store().get(lynk)?;
    let state = handle.lock().await.sync_state;
    Some(state)
}

fn broadcasts_logged(base: &Path, node: &str) -> usize {
    std::fs::read_to_string(base.join(format!("{node}.log")))
        .unwrap_or_default()
        .lines()
        .filter(|l| l.contains("BROADCAST lynk=Docs"))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn docs_create_join_fetch() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    let b = start_node(tmp.path(), "bob").await?;

    write_file(&tmp.path().join("alice/Docs/a.txt"), 100)?;
    a.node.create_lynk("Docs")?;
    let tracker = a.node.tracker_address();
    assert_eq!(a.node.get_tracker("Docs").await, Some(tracker.clone()));
    assert!(a.node.have_file("Docs/a.txt").await);
    assert!(matches!(a.node.create_lynk("Docs"), Err(LynxError::Duplicate(_))));

    let report = b.node.join_remote(&tracker, "Docs").await?;
    assert_eq!(report.failed, 0);
    assert_eq!(
        std::fs::read(tmp.path().join("bob/Docs/a.txt"))?,
        std::fs::read(tmp.path().join("alice/Docs/a.txt"))?
    );
    assert!(b.node.have_file("Docs/a.txt").await);
    assert_eq!(state_of(&b.node, "Docs").await, Some(SyncState::Synced));

    // meta.info on the joiner is anchored to its own home
    let meta = Manifest::load(&tmp.path().join("bob/Docs").join(META_FILE), &tmp.path().join("bob"))?;
    assert_eq!(meta.root, tmp.path().join("bob/Docs"));
    assert_eq!(meta.file("a.txt").map(|f| f.length), Some(100));

    // the joiner can point others at the tracker
    let alice_peer = a.node.peer().me().clone();
    assert_eq!(
        b.node.peer().ask_tracker(&alice_peer, "Docs").await?,
        Some(tracker.clone())
    );
    assert_eq!(b.node.peer().ask_tracker(&alice_peer, "Nope").await?, None);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removal_is_pruned_on_other_peer_and_push_is_idempotent() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    let b = start_node(tmp.path(), "bob").await?;

    write_file(&tmp.path().join("alice/Docs/a.txt"), 100)?;
    write_file(&tmp.path().join("alice/Docs/b.txt"), 40)?;
    a.node.create_lynk("Docs")?;
    b.node.join_remote(&a.node.tracker_address(), "Docs").await?;
    assert!(tmp.path().join("bob/Docs/b.txt").exists());

    std::fs::remove_file(tmp.path().join("alice/Docs/b.txt"))?;
    let report = a.node.sync_once().await;
    assert_eq!(report.pushed, 1);

    eventually("bob to receive the broadcast", || async {
        state_of(&b.node, "Docs").await == Some(SyncState::Unsynced)
    })
    .await;
    // alice ignores the echo of her own push
    assert_eq!(state_of(&a.node, "Docs").await, Some(SyncState::Synced));

    let report = b.node.sync_once().await;
    assert_eq!(report.pruned, 1);
    assert!(!tmp.path().join("bob/Docs/b.txt").exists());
    assert!(tmp.path().join("bob/Docs/a.txt").exists());
    assert_eq!(state_of(&b.node, "Docs").await, Some(SyncState::Synced));

    // nothing changed: no push, and a repeated push is not re-broadcast
    assert_eq!(a.node.sync_once().await.pushed, 0);
    let stored = tracker_dir(&tmp.path().join("alice"), "Docs").join(META_FILE);
    let before = std::fs::read(&stored)?;
    eventually("the broadcast to be logged", || async {
        broadcasts_logged(tmp.path(), "alice") == 1
    })
    .await;
    let broadcasts = broadcasts_logged(tmp.path(), "alice");

    let manifest = {
        let handle = a.node.store().get("Docs").unwrap();
        let lynk = handle.lock().await;
        lynk.manifest.clone()
    };
    a.node.peer().push_manifest(&manifest).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(std::fs::read(&stored)?, before);
    assert_eq!(broadcasts_logged(tmp.path(), "alice"), broadcasts);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_walks_roster_until_a_peer_has_the_file() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    let b = start_node(tmp.path(), "bob").await?;
    let c = start_node(tmp.path(), "carol").await?;
    let d = start_node(tmp.path(), "dave").await?;

    write_file(&tmp.path().join("alice/Docs/a.txt"), 100)?;
    a.node.create_lynk("Docs")?;
    let tracker = a.node.tracker_address();
    b.node.join_remote(&tracker, "Docs").await?;
    c.node.join_remote(&tracker, "Docs").await?;

    // only carol holds this file; alice and bob answer NO
    write_file(&tmp.path().join("carol/outside/only_c.txt"), 5000)?;
    c.node
        .add_file("Docs", &tmp.path().join("carol/outside/only_c.txt"))
        .await?;
    eventually("the tracker to accept carol's push", || {
        tracker_has(&a.node, "Docs", "only_c.txt")
    })
    .await;

    let report = d.node.join_remote(&tracker, "Docs").await?;
    assert_eq!(report.failed, 0);
    assert_eq!(
        std::fs::read(tmp.path().join("dave/Docs/only_c.txt"))?,
        std::fs::read(tmp.path().join("carol/Docs/only_c.txt"))?
    );

    // a file nobody has is reported after every peer was asked
    let plan = FetchPlan {
        lynk: "Docs".into(),
        tracker: tracker.clone(),
        root: tmp.path().join("dave/Docs"),
        known_peers: vec![],
        downloading: Arc::new(AtomicBool::new(true)),
    };
    match d.node.peer().fetch_file(&plan, "ghost.txt", 1).await {
        Err(LynxError::FileNotAvailable { lynk, file }) => {
            assert_eq!((lynk.as_str(), file.as_str()), ("Docs", "ghost.txt"));
        }
        other => panic!("expected FileNotAvailable, got {other:?}"),
    }
    assert!(!tmp.path().join("dave/Docs/ghost.txt").exists());

    for h in [a, b, c, d] {
        h.shutdown().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_removes_exactly_the_leaving_peer() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    let b = start_node(tmp.path(), "bob").await?;
    let c = start_node(tmp.path(), "carol").await?;

    write_file(&tmp.path().join("alice/Docs/a.txt"), 10)?;
    a.node.create_lynk("Docs")?;
    let tracker = a.node.tracker_address();
    b.node.join_remote(&tracker, "Docs").await?;
    c.node.join_remote(&tracker, "Docs").await?;

    let bob = b.node.peer().me().clone();
    b.node.delete_lynk("Docs").await?;
    assert!(b.node.store().get("Docs").is_none());
    assert!(!tmp.path().join("bob/Docs").join(META_FILE).exists());
    // leaving keeps the files
    assert!(tmp.path().join("bob/Docs/a.txt").exists());
    assert!(matches!(
        b.node.delete_lynk("Docs").await,
        Err(LynxError::NotFound(_))
    ));

    eventually("the tracker to drop bob", || async {
        let state = a.node.tracker().lynk("Docs").unwrap();
        let state = state.lock().await;
        !state.roster.contains(&bob)
    })
    .await;

    let roster = c.node.peer().request_roster(&tracker, "Docs").await?;
    assert!(!roster.contains(&bob));
    assert!(roster.contains(a.node.peer().me()));
    assert!(roster.contains(c.node.peer().me()));
    assert_eq!(roster.len(), 2);

    for h in [a, b, c] {
        h.shutdown().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_requests_leave_listeners_running() -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    write_file(&tmp.path().join("alice/Docs/a.txt"), 10)?;
    a.node.create_lynk("Docs")?;

    for port in [a.tracker_addr.port(), a.peer_addr.port()] {
        for garbage in [
            "lol:fake.txt\n",
            "Swarm_Request:813.444.555.111:7500\n",
            "Meta_Request:127.0.0.1:0:Docs\n",
            "Do_You_Have_FileName:Docs/../../etc/passwd:abcd\n",
        ] {
            let mut s = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
            s.write_all(garbage.as_bytes()).await?;
            s.shutdown().await?;
            let mut reply = Vec::new();
            s.read_to_end(&mut reply).await?;
            assert!(
                reply.is_empty() || reply == b"NO\n",
                "unexpected reply {reply:?} to {garbage:?}"
            );
        }
    }

    // both roles still answer
    let stranger = PeerRef::new("127.0.0.1", 1, "");
    let roster = a
        .node
        .peer()
        .request_roster(&a.node.tracker_address(), "Docs")
        .await?;
    assert!(roster.contains(a.node.peer().me()));
    assert!(!roster.contains(&stranger));
    assert_eq!(
        a.node.peer().ask_tracker(a.node.peer().me(), "Docs").await?,
        Some(a.node.tracker_address())
    );

    a.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_files_survive_a_manifest_with_an_unavailable_entry() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    let b = start_node(tmp.path(), "bob").await?;

    write_file(&tmp.path().join("alice/Docs/a.txt"), 100)?;
    a.node.create_lynk("Docs")?;
    b.node.join_remote(&a.node.tracker_address(), "Docs").await?;

    // the tracker announces a file nobody holds
    let mut with_ghost = {
        let state = a.node.tracker().lynk("Docs")?;
        let state = state.lock().await;
        state.manifest.clone()
    };
    with_ghost.add_file(&FileStat {
        name: "ghost.txt".into(),
        length: 4,
    })?;
    assert!(a.node.tracker().apply_push(with_ghost).await?.is_some());
    eventually("bob to receive the ghost entry", || async {
        state_of(&b.node, "Docs").await == Some(SyncState::Unsynced)
    })
    .await;

    let report = b.node.sync_once().await;
    assert_eq!(report.failed, 1);
    assert_eq!(state_of(&b.node, "Docs").await, Some(SyncState::Synced));

    write_file(&tmp.path().join("bob/Docs/mine.txt"), 12)?;
    let report = b.node.sync_once().await;
    assert_eq!(report.pruned, 0);
    assert_eq!(report.pushed, 1);
    assert!(tmp.path().join("bob/Docs/mine.txt").exists());
    assert!(tmp.path().join("bob/Docs/a.txt").exists());
    eventually("the tracker to accept bob's file", || {
        tracker_has(&a.node, "Docs", "mine.txt")
    })
    .await;
    assert!(tracker_has(&a.node, "Docs", "ghost.txt").await);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_tracker_is_found_through_a_known_peer() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    let b = start_node(tmp.path(), "bob").await?;

    write_file(&tmp.path().join("alice/Docs/a.txt"), 100)?;
    a.node.create_lynk("Docs")?;
    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0")?;
        format!("127.0.0.1:{}", l.local_addr()?.port())
    };

    let plan = FetchPlan {
        lynk: "Docs".into(),
        tracker: dead,
        root: tmp.path().join("bob/Docs"),
        known_peers: vec![b.node.peer().me().clone(), a.node.peer().me().clone()],
        downloading: Arc::new(AtomicBool::new(true)),
    };
    let (roster, tracker) = b.node.peer().roster_for(&plan).await?;
    assert_eq!(tracker, a.node.tracker_address());
    assert!(roster.contains(b.node.peer().me()));

    assert_eq!(b.node.peer().fetch_file(&plan, "a.txt", 100).await?, 100);
    assert_eq!(
        std::fs::read(tmp.path().join("bob/Docs/a.txt"))?,
        std::fs::read(tmp.path().join("alice/Docs/a.txt"))?
    );

    // nobody to ask: the tracker error is reported
    let alone = FetchPlan {
        known_peers: vec![],
        ..plan
    };
    assert!(b.node.peer().roster_for(&alone).await.is_err());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_with_retry_walks_the_roster_once_per_attempt() -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let tmp = tempfile::tempdir()?;
    let a = start_node(tmp.path(), "alice").await?;
    let b = start_node(tmp.path(), "bob").await?;
    write_file(&tmp.path().join("alice/Docs/a.txt"), 10)?;
    a.node.create_lynk("Docs")?;
    let tracker = a.node.tracker_address();

    // a roster member that never has anything and counts the questions
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let asked = Arc::new(AtomicUsize::new(0));
    let counter = asked.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                let mut line = String::new();
                if stream.read_line(&mut line).await.is_ok() && line.starts_with("Do_You_Have_FileName:") {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = stream.get_mut().write_all(b"NO\n").await;
                }
            });
        }
    });
    let key = KeyPair::generate()?.public_hex();
    net::request_reply(
        &tracker,
        &Request::SwarmRequest {
            peer: PeerRef::new("127.0.0.1", port, key),
            lynk: "Docs".into(),
        },
        Timeouts::default(),
    )
    .await?;

    let plan = FetchPlan {
        lynk: "Docs".into(),
        tracker,
        root: tmp.path().join("bob/Docs"),
        known_peers: vec![],
        downloading: Arc::new(AtomicBool::new(true)),
    };
    let err = b.node.peer().fetch_with_retry(&plan, "ghost.txt", 1).await.unwrap_err();
    assert!(matches!(err, LynxError::FileNotAvailable { .. }));
    assert_eq!(asked.load(Ordering::SeqCst), RECONN_ATTEMPTS);
    assert!(!tmp.path().join("bob/Docs/ghost.txt").exists());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
