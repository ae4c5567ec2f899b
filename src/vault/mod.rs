mod unix;
mod windows;

pub use unix::UnixVault;
pub use windows::WindowsVault;

use std::path::Path;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;

/// Sizes like `512`, `500M`, `2G`
static RE_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[KMGkmg]?$").unwrap());

/// RAM-disk vault, one implementation per host OS. Every call shells out
/// synchronously and reports success as a bool; failures are logged.
pub trait Vault: Send + Sync {
    /// Create and mount a volatile volume of `size` at `mount_point`
    fn mount(&self, size: &str, mount_point: &Path) -> bool;

    fn unmount(&self, mount_point: &Path) -> bool;

    /// Force the configured vault off immediately. Best effort.
    fn panic(&self) -> bool;
}

/// The vault for the OS we are running on
pub fn platform_vault(config: &Config) -> Box<dyn Vault> {
    if cfg!(windows) {
        Box::new(WindowsVault::new(config.vault_mount_point.clone()))
    } else {
        Box::new(UnixVault::new(config.vault_mount_point.clone()))
    }
}

pub fn is_valid_size(size: &str) -> bool {
    RE_SIZE.is_match(size)
}

/// Run `argv`, returning whether it exited successfully.
fn run(argv: &[String]) -> bool {
    let Some((program, args)) = argv.split_first() else {
        return false;
    };

    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            tracing::error!(command = %argv.join(" "), detail = %detail.trim(), "vault command failed");
            false
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!(%program, "executable not found in PATH");
            false
        }
        Err(e) => {
            tracing::error!(command = %argv.join(" "), error = %e, "vault command could not run");
            false
        }
    }
}
