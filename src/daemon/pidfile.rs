//! PID file owned by the daemon process.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::DaemonError;

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

fn is_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

impl PidFile {
    /// Write the current process id to `path`.
    ///
    /// Fails when the file names another live process.
    pub fn create(path: &Path) -> Result<Self, DaemonError> {
        let io_error = |source: io::Error| DaemonError::PidFile {
            path: path.to_path_buf(),
            source,
        };

        let own = std::process::id();
        if let Ok(content) = fs::read_to_string(path) {
            if let Ok(pid) = content.trim().parse::<u32>() {
                if pid != own && is_running(pid) {
                    return Err(DaemonError::AlreadyRunning(pid));
                }
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, format!("{}\n", own)).map_err(io_error)?;
        tracing::debug!("PID file {} created", path.display());

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refresh the file modification time.
    pub fn touch(&self) -> io::Result<()> {
        File::options()
            .append(true)
            .open(&self.path)?
            .set_modified(SystemTime::now())
    }

    pub fn remove(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("can't remove PID file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pidfile_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("glpi-agent.pid");

        let pidfile = PidFile::create(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        let old = SystemTime::now() - Duration::from_secs(3600);
        File::options().append(true).open(&path).unwrap().set_modified(old).unwrap();
        pidfile.touch().unwrap();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(modified > old + Duration::from_secs(1800));

        pidfile.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pidfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        fs::write(&path, "4294967290\n").unwrap();

        let pidfile = PidFile::create(&path).unwrap();
        assert_eq!(pidfile.path(), path.as_path());
    }

    #[test]
    fn test_running_instance_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        // PID 1 always exists on Linux
        fs::write(&path, "1\n").unwrap();

        let err = PidFile::create(&path).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(1)));
    }
}
