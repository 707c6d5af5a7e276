use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rstc::download::Downloader;
use rstc::torrent::Metainfo;
use rstc::tracker::{Client as TrackerClient, Event};
use rstc::{DEFAULT_PORT, PROBE_CANDIDATES};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstc", version, about = "A BitTorrent download client core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print metainfo details for a .torrent file.
    Info {
        /// Path to the .torrent file.
        metainfo: PathBuf,
    },
    /// Download a torrent's content to disk.
    Download {
        /// Path to the .torrent file.
        metainfo: PathBuf,
        /// Directory to write the downloaded content into.
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Maximum number of peers to connect to concurrently.
        #[arg(long, default_value_t = rstc::MAX_ACTIVE_PEERS)]
        max_peers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Info { metainfo } => run_info(&metainfo),
        Command::Download { metainfo, output_dir, max_peers } => {
            run_download(&metainfo, &output_dir, max_peers).await
        }
    }
}

fn run_info(path: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let metainfo = Metainfo::from_bytes(&bytes).context("parsing metainfo")?;

    println!("name:        {}", metainfo.info.name);
    println!("announce:    {}", metainfo.announce);
    println!("info hash:   {}", hex::encode(metainfo.info_hash));
    println!("piece len:   {}", metainfo.info.piece_length);
    println!("pieces:      {}", metainfo.num_pieces());
    println!("total size:  {} bytes", metainfo.total_length());
    println!("multi-file:  {}", metainfo.is_multi_file());
    if !metainfo.comment.is_empty() {
        println!("comment:     {}", metainfo.comment);
    }
    if !metainfo.created_by.is_empty() {
        println!("created by:  {}", metainfo.created_by);
    }

    Ok(())
}

async fn run_download(path: &PathBuf, output_dir: &PathBuf, max_peers: usize) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let metainfo = Metainfo::from_bytes(&bytes).context("parsing metainfo")?;

    let tracker = TrackerClient::new(DEFAULT_PORT).context("creating tracker client")?;
    let our_peer_id = tracker.peer_id();

    let announce = tracker
        .announce(&metainfo, Event::Started)
        .await
        .context("announcing to tracker")?;

    // Probe up to PROBE_CANDIDATES peers the tracker returned; at most
    // max_peers of those ever hold an open connection at once (enforced
    // inside Downloader::run), per spec §5's probe-then-cap model.
    let candidates: Vec<SocketAddr> = announce
        .peers
        .iter()
        .take(PROBE_CANDIDATES)
        .map(|p| SocketAddr::new(p.ip, p.port))
        .collect();

    tracing::info!(candidates = candidates.len(), max_peers, "starting download");

    let downloader = Downloader::new(metainfo, our_peer_id);
    downloader.run(candidates, output_dir.clone(), max_peers).await?;

    let (completed, total) = downloader.progress().await;
    println!("done: {completed}/{total} pieces");

    Ok(())
}
