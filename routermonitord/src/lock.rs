use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use fs2::FileExt;

/// Exclusive advisory lock keeping a second process away from the inventory.
/// Released when dropped.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
}

impl InstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let holder = std::fs::read_to_string(path).unwrap_or_default();
            bail!(
                "another routermonitord instance holds {} ({})",
                path.display(),
                holder.trim().replace('\n', ", ")
            );
        }

        let owner = format!(
            "pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(owner.as_bytes())?;
        file.flush()?;

        tracing::debug!("Holding instance lock {}", path.display());
        Ok(Self { file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("routermonitor.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("another routermonitord instance"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&format!("pid={}", std::process::id())));

        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
