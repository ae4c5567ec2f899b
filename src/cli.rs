use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

use crate::config::Config;

/// Frees memory by closing browser tabs you have stopped using
#[derive(Debug, Parser)]
#[command(name = "ram-sentinel", version, about)]
pub struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Where purged tabs are archived
    #[arg(long, global = true)]
    pub archive_dir: Option<PathBuf>,

    /// Remote-debugging endpoint of a running browser
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan tabs and purge the ones that have gone cold
    Optimize {
        /// Keep scanning on an interval until interrupted
        #[arg(long)]
        auto: bool,
        /// With --auto, stop after the first cycle
        #[arg(long)]
        once: bool,
        /// Report what would be purged without closing anything
        #[arg(long)]
        dry_run: bool,
        /// Show the browser window if one has to be launched
        #[arg(long)]
        visible: bool,
        /// Seconds between scans in --auto mode
        #[arg(long)]
        interval: Option<u64>,
        /// Baseline inactivity threshold in minutes
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// List open tabs
    Tabs {
        #[arg(long)]
        visible: bool,
    },
    /// Manage the RAM-disk vault
    #[command(group(ArgGroup::new("action").required(true).args(["mount", "unmount", "panic"])))]
    Vault {
        #[arg(long)]
        mount: bool,
        #[arg(long)]
        unmount: bool,
        /// Emergency detach
        #[arg(long)]
        panic: bool,
        /// Vault size, e.g. 500M
        #[arg(long)]
        size: Option<String>,
        /// Drive letter (Windows) or path (Unix)
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },
    /// Close every tab and detach the vault
    Panic,
}

impl Cli {
    /// Overlay command-line settings on `config`
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = dir.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.debug_endpoint = endpoint.clone();
        }
        match &self.command {
            Command::Optimize {
                interval,
                threshold,
                ..
            } => {
                if let Some(secs) = interval {
                    config.scan_interval_secs = *secs;
                }
                if let Some(minutes) = threshold {
                    config.inactive_threshold_minutes = *minutes;
                }
            }
            Command::Vault {
                size, mount_point, ..
            } => {
                if let Some(size) = size {
                    config.vault_size = size.clone();
                }
                if let Some(mount_point) = mount_point {
                    config.vault_mount_point = mount_point.clone();
                }
            }
            Command::Tabs { .. } | Command::Panic => {}
        }
        config
    }
}
