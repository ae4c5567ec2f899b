use std::path::{Path, PathBuf};

use super::{is_valid_size, run, Vault};

/// tmpfs-backed vault for Linux and macOS
pub struct UnixVault {
    /// Mount point `panic` detaches
    mount_point: PathBuf,
}

impl UnixVault {
    pub fn new(mount_point: PathBuf) -> Self {
        Self { mount_point }
    }

    pub fn mount_command(&self, size: &str, mount_point: &Path) -> Vec<String> {
        vec![
            "mount".to_string(),
            "-t".to_string(),
            "tmpfs".to_string(),
            "-o".to_string(),
            format!("size={size}"),
            "tmpfs".to_string(),
            mount_point.display().to_string(),
        ]
    }

    pub fn unmount_command(&self, mount_point: &Path) -> Vec<String> {
        vec!["umount".to_string(), mount_point.display().to_string()]
    }

    /// Lazy detach on Linux, forced unmount elsewhere
    pub fn panic_command(&self) -> Vec<String> {
        let flag = if cfg!(target_os = "linux") { "-l" } else { "-f" };
        vec![
            "umount".to_string(),
            flag.to_string(),
            self.mount_point.display().to_string(),
        ]
    }
}

impl Vault for UnixVault {
    fn mount(&self, size: &str, mount_point: &Path) -> bool {
        if !is_valid_size(size) {
            tracing::error!(%size, "invalid vault size");
            return false;
        }
        if let Err(e) = std::fs::create_dir_all(mount_point) {
            tracing::error!(path = %mount_point.display(), error = %e, "cannot create mount point");
            return false;
        }

        tracing::info!(%size, path = %mount_point.display(), "mounting vault");
        let ok = run(&self.mount_command(size, mount_point));
        if ok {
            tracing::info!("vault mounted");
        }
        ok
    }

    fn unmount(&self, mount_point: &Path) -> bool {
        tracing::info!(path = %mount_point.display(), "unmounting vault");
        let ok = run(&self.unmount_command(mount_point));
        if ok {
            tracing::info!("vault unmounted");
        }
        ok
    }

    fn panic(&self) -> bool {
        tracing::warn!(path = %self.mount_point.display(), "vault panic: forcing detach");
        run(&self.panic_command())
    }
}
