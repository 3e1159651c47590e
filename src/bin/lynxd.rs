use anyhow::{Context, Result};
use clap::Parser;

use lynx::cli::{setup_logging, NodeOpts};
use lynx::protocol_core::ensure_dir_exists;
use lynx::Node;

/// Lynx daemon: tracker, peer service and sync loop
#[derive(Parser, Debug)]
#[command(author, version)]
struct Opts {
    #[command(flatten)]
    node: NodeOpts,

    /// Write the effective configuration back to the config file and exit
    #[arg(long)]
    write_config: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    setup_logging(opts.node.verbose);
    let config = opts.node.load_config().context("Failed to load configuration")?;

    if opts.write_config {
        let path = opts.node.config_path();
        config
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    ensure_dir_exists(&config.home)
        .with_context(|| format!("Failed to create home directory: {}", config.home.display()))?;
    if !config.home.is_dir() {
        anyhow::bail!("Error: Home path is not a directory: {}", config.home.display());
    }

    println!("Starting Lynx daemon:");
    println!("  Home: {}", config.home.display());
    println!("  Owner: {}", config.owner);
    println!("  Announce: {}", config.advertised_ip());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        // a bind failure ends the process with a non-zero status
        let mut handle = Node::start(config).await.context("Failed to start node")?;
        println!("  Peer port: {}", handle.peer_addr.port());
        println!("  Tracker port: {}", handle.tracker_addr.port());
        println!("  Key: {}", handle.node.public_key());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => eprintln!("\nInterrupted by user, shutting down"),
            _ = handle.wait() => eprintln!("A background task stopped, shutting down"),
        }
        handle.shutdown().await;
        Ok(())
    })
}
