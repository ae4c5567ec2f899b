use std::path::{Path, PathBuf};

use super::{is_valid_size, run, Vault};

/// ImDisk-backed vault
pub struct WindowsVault {
    /// Drive letter `panic` detaches, e.g. `R:`
    mount_point: PathBuf,
}

impl WindowsVault {
    pub fn new(mount_point: PathBuf) -> Self {
        Self { mount_point }
    }

    pub fn create_command(&self, size: &str, mount_point: &Path) -> Vec<String> {
        vec![
            "imdisk".to_string(),
            "-a".to_string(),
            "-s".to_string(),
            size.to_string(),
            "-m".to_string(),
            mount_point.display().to_string(),
        ]
    }

    /// Quick NTFS format, confirmation piped in
    pub fn format_command(&self, mount_point: &Path) -> Vec<String> {
        vec![
            "cmd".to_string(),
            "/C".to_string(),
            format!(
                "echo Y | format {} /FS:NTFS /Q /V:GhostDrive",
                mount_point.display()
            ),
        ]
    }

    /// Forced detach
    pub fn detach_command(&self, mount_point: &Path) -> Vec<String> {
        vec![
            "imdisk".to_string(),
            "-D".to_string(),
            "-m".to_string(),
            mount_point.display().to_string(),
        ]
    }
}

impl Vault for WindowsVault {
    fn mount(&self, size: &str, mount_point: &Path) -> bool {
        if !is_valid_size(size) {
            tracing::error!(%size, "invalid vault size");
            return false;
        }

        // Clear any stale device on this letter; failure just means none existed
        let _ = run(&self.detach_command(mount_point));

        tracing::info!(%size, drive = %mount_point.display(), "creating RAM disk");
        if !run(&self.create_command(size, mount_point)) {
            return false;
        }

        tracing::info!("formatting vault");
        if !run(&self.format_command(mount_point)) {
            let _ = self.unmount(mount_point);
            return false;
        }

        tracing::info!("vault mounted");
        true
    }

    fn unmount(&self, mount_point: &Path) -> bool {
        tracing::info!(drive = %mount_point.display(), "unmounting vault");
        let ok = run(&self.detach_command(mount_point));
        if ok {
            tracing::info!("vault unmounted");
        }
        ok
    }

    fn panic(&self) -> bool {
        tracing::warn!(drive = %self.mount_point.display(), "vault panic: forcing detach");
        self.unmount(&self.mount_point)
    }
}
