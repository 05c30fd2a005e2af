//! CLI configuration module
//!
//! Turns parsed arguments into engine configuration and add options.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::cli::args::CliArgs;
use crate::config::{AddOptions, EngineConfig};
use crate::error::TorrentError;
use crate::torrent::TorrentSource;

/// Everything the binary needs to start one download
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the torrent comes from
    pub source: TorrentSource,
    pub engine: EngineConfig,
    pub add: AddOptions,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Build configuration from CLI arguments. Relative paths are
    /// resolved against `cwd`.
    pub fn from_args(args: &CliArgs, cwd: &Path) -> Result<Self> {
        let source = match TorrentSource::parse(&args.torrent)? {
            TorrentSource::Path(path) if path.is_relative() => TorrentSource::Path(cwd.join(path)),
            other => other,
        };

        let output_directory = match &args.out_dir {
            Some(dir) if dir.is_relative() => cwd.join(dir),
            Some(dir) => dir.clone(),
            None => cwd.to_path_buf(),
        };
        if output_directory.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("Output directory cannot be empty", "out_dir").into());
        }

        let engine = EngineConfig {
            max_peers: args.max_peers,
            listen_port: args.port,
            ..EngineConfig::default()
        };
        engine.validate()?;

        let mut add = AddOptions::new(output_directory).with_trackers(!args.no_trackers);
        for peer in &args.peers {
            add = add.with_peer(*peer);
        }

        Ok(Self { source, engine, add, quiet: args.quiet })
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.add.output_directory
    }
}
