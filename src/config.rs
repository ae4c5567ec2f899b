use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration. Built once in `main` and shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Baseline idle midpoint of the confidence curve, before fingerprint scaling
    pub inactive_threshold_minutes: f64,
    /// Where purged tabs are archived
    pub archive_dir: PathBuf,
    /// Remote-debugging endpoint of an already running browser
    pub debug_endpoint: String,
    /// Pause between scans in continuous mode
    pub scan_interval_secs: u64,
    /// Upper bound on any single page call (install, read, close)
    pub page_timeout_ms: u64,
    /// Pause between injecting trackers and reading them back
    pub settle_delay_ms: u64,
    pub vault_size: String,
    pub vault_mount_point: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inactive_threshold_minutes: 30.0,
            archive_dir: default_archive_dir(),
            debug_endpoint: "http://127.0.0.1:9222".to_string(),
            scan_interval_secs: 60,
            page_timeout_ms: 5_000,
            settle_delay_ms: 1_000,
            vault_size: "500M".to_string(),
            vault_mount_point: default_mount_point(),
        }
    }
}

fn default_archive_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("RAM_Sentinel_ReadLater")
}

fn default_mount_point() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("R:")
    } else {
        PathBuf::from("/mnt/ram_vault")
    }
}

impl Config {
    /// Defaults overlaid with the user's config file, if one exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/ram-sentinel/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ram-sentinel").join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings under which fresh tabs would be purged on sight or
    /// every page call would time out.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.inactive_threshold_minutes;
        if !threshold.is_finite() || threshold <= 0.0 {
            bail!("inactive_threshold_minutes must be a positive number, got {threshold}");
        }
        if self.page_timeout_ms == 0 {
            bail!("page_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
