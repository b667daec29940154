use std::path::PathBuf;
use std::sync::Mutex;

use sysinfo::{Disks, System};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::resource::{ResourceProvider, ResourceSnapshot};

/// Reads CPU, memory and disk figures from the host via `sysinfo`.
///
/// CPU usage is measured between consecutive calls, so the first snapshot
/// after construction may report zero.
pub struct SystemResourceProvider {
    system: Mutex<System>,
    local_dirs: Vec<PathBuf>,
}

impl SystemResourceProvider {
    pub fn new(local_dirs: Vec<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            local_dirs,
        }
    }

    /// Provider checking the configured local directories.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.local_dirs.clone())
    }
}

impl ResourceProvider for SystemResourceProvider {
    fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let (disk_total_bytes, disk_free_bytes) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, free), disk| {
                (total + disk.total_space(), free + disk.available_space())
            });

        let num_cpus = u16::try_from(system.cpus().len()).ok().filter(|n| *n > 0);
        let cpu_usage_percent = num_cpus.map(|_| system.global_cpu_info().cpu_usage());

        ResourceSnapshot {
            num_cpus,
            cpu_usage_percent,
            total_memory_bytes: system.total_memory(),
            available_memory_bytes: system.available_memory(),
            disk_total_bytes,
            disk_free_bytes,
        }
    }

    fn check_local_dirs(&self) -> Result<()> {
        for dir in &self.local_dirs {
            let metadata = std::fs::metadata(dir)
                .map_err(|e| AgentError::DiskError(format!("{}: {}", dir.display(), e)))?;
            if !metadata.is_dir() {
                return Err(AgentError::DiskError(format!(
                    "{}: not a directory",
                    dir.display()
                )));
            }
            if metadata.permissions().readonly() {
                return Err(AgentError::DiskError(format!("{}: read-only", dir.display())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_memory() {
        let provider = SystemResourceProvider::new(Vec::new());
        let snap = provider.snapshot();
        assert!(snap.total_memory_bytes > 0);
        assert!(snap.available_memory_bytes <= snap.total_memory_bytes);
    }

    #[test]
    fn existing_dir_passes_check() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SystemResourceProvider::new(vec![dir.path().to_path_buf()]);
        assert!(provider.check_local_dirs().is_ok());
    }

    #[test]
    fn missing_dir_is_a_disk_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let provider = SystemResourceProvider::new(vec![missing]);
        assert!(matches!(
            provider.check_local_dirs(),
            Err(AgentError::DiskError(_))
        ));
    }

    #[test]
    fn configured_local_dirs_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::default()
            .with_local_dir(dir.path())
            .with_local_dir(dir.path().join("missing"));
        let provider = SystemResourceProvider::from_config(&config);
        assert!(matches!(
            provider.check_local_dirs(),
            Err(AgentError::DiskError(msg)) if msg.contains("missing")
        ));

        let healthy = AgentConfig::default().with_local_dir(dir.path());
        assert!(SystemResourceProvider::from_config(&healthy)
            .check_local_dirs()
            .is_ok());
    }

    #[test]
    fn file_instead_of_dir_is_a_disk_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let provider = SystemResourceProvider::new(vec![file.path().to_path_buf()]);
        assert!(matches!(
            provider.check_local_dirs(),
            Err(AgentError::DiskError(_))
        ));
    }
}
