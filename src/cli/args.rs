//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// CLI arguments for the torrent downloader
#[derive(Debug, Parser)]
#[command(name = "torrent-fetch")]
#[command(about = "Download a torrent from a .torrent file, URL or magnet link", long_about = None)]
pub struct CliArgs {
    /// Path to a .torrent file, an http(s) URL serving one, or a magnet URI
    #[arg(short, long, value_name = "SOURCE")]
    pub torrent: String,

    /// Download directory (defaults to the current directory)
    #[arg(short, long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Peer to connect to in addition to tracker results (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Maximum number of peer connections
    #[arg(long, default_value_t = 30)]
    pub max_peers: usize,

    /// Port reported to trackers
    #[arg(long, default_value_t = 6881)]
    pub port: u16,

    /// Do not contact the torrent's trackers
    #[arg(long)]
    pub no_trackers: bool,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
