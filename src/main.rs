//! lynx - create, join and share lynks from the command line
//!
//! `lynx serve` runs a node in the foreground. The other subcommands act on
//! the node home directly and exit; a running node picks their changes up on
//! its next sync pass.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use lynx::cli::{setup_logging, NodeOpts};
use lynx::config::NodeConfig;
use lynx::Node;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Lynx - peer-to-peer directory synchronization"
)]
struct Args {
    #[command(flatten)]
    node: NodeOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tracker, peer service and sync loop until interrupted
    Serve,
    /// Share <home>/<NAME> as a new lynk tracked by this node
    Create { name: String },
    /// Join a lynk from its meta.info, or from TRACKER and --name
    Join {
        /// Path to a meta.info, or a tracker host:port when --name is given
        source: String,
        /// Lynk name to request from the tracker
        #[arg(long)]
        name: Option<String>,
    },
    /// Leave a lynk (files stay on disk)
    Remove { name: String },
    /// Add a file to a lynk and push the change
    Add { lynk: String, path: PathBuf },
    /// Remove a file from a lynk and from disk, then push
    Rm { lynk: String, file: String },
    /// Run one sync pass
    Sync,
    /// List lynks and their state
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print this node's announced public key
    Key,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.node.verbose);
    let config = args.node.load_config().context("Failed to load configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        match args.command {
            Command::Serve => serve(config).await,
            command => run_once(config, command).await,
        }
    })
}

async fn serve(config: NodeConfig) -> Result<()> {
    let mut handle = Node::start(config).await.context("Failed to start node")?;
    println!(
        "Lynx node: peer {} tracker {}",
        handle.peer_addr, handle.tracker_addr
    );
    tokio::select! {
        _ = tokio::signal::ctrl_c() => eprintln!("\nInterrupted, shutting down"),
        _ = handle.wait() => eprintln!("A background task stopped, shutting down"),
    }
    handle.shutdown().await;
    Ok(())
}

async fn run_once(config: NodeConfig, command: Command) -> Result<()> {
    let node = Node::open(config).context("Failed to open node home")?;
    match command {
        Command::Serve => {}
        Command::Create { name } => {
            node.create_lynk(&name)
                .with_context(|| format!("Failed to create lynk {name}"))?;
            println!("Created {name}, tracker {}", node.tracker_address());
        }
        Command::Join { source, name } => {
            let report = match name {
                Some(name) => node.join_remote(&source, &name).await,
                None => node.join_lynk(Path::new(&source)).await,
            }
            .with_context(|| format!("Failed to join {source}"))?;
            println!(
                "Joined: {} fetched, {} pending",
                report.fetched, report.failed
            );
        }
        Command::Remove { name } => {
            node.delete_lynk(&name)
                .await
                .with_context(|| format!("Failed to remove lynk {name}"))?;
            println!("Left {name}");
        }
        Command::Add { lynk, path } => {
            let stat = node
                .add_file(&lynk, &path)
                .await
                .with_context(|| format!("Failed to add {} to {lynk}", path.display()))?;
            println!("Added {} ({} bytes)", stat.name, stat.length);
        }
        Command::Rm { lynk, file } => {
            let removed = node
                .remove_file(&lynk, &file)
                .await
                .with_context(|| format!("Failed to remove {file} from {lynk}"))?;
            if !removed {
                println!("{file} is not part of {lynk}");
            }
        }
        Command::Sync => {
            let r = node.sync_once().await;
            println!(
                "pushed {} fetched {} pruned {} failed {}",
                r.pushed, r.fetched, r.pruned, r.failed
            );
        }
        Command::Status { json } => {
            let rows = node.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{:<20} {:<10} {:>6} {:>12}  TRACKER", "LYNK", "STATE", "FILES", "BYTES");
                for r in rows {
                    println!(
                        "{:<20} {:<10} {:>6} {:>12}  {}{}",
                        r.name,
                        r.state.to_string(),
                        r.files,
                        r.bytes,
                        r.tracker,
                        if r.push_pending { " (push pending)" } else { "" }
                    );
                }
            }
        }
        Command::Key => println!("{}", node.public_key()),
    }
    Ok(())
}
