/// Run-scoped scratch directories for sandbox executions.
///
/// Every run gets a uuid-named directory under the scratch root; no two
/// runs can collide, and the directory is removed on every exit path,
/// including timeout and panic unwinds, via Drop.
use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::types::{HarnessError, Result};

pub struct ScratchDir {
    run_id: String,
    dir: PathBuf,
}

impl ScratchDir {
    pub fn new(root: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let dir = root.join(&run_id);
        fs::create_dir_all(&dir).map_err(|e| {
            HarnessError::Execution(format!(
                "failed to create scratch directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { run_id, dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write a file under the scratch dir, creating parent directories.
    pub fn write_file(&self, relative: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).map_err(|e| {
            HarnessError::Execution(format!("failed to write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    pub fn create_dir(&self, relative: &str) -> Result<PathBuf> {
        let path = self.dir.join(relative);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                log::warn!(
                    "failed to remove scratch directory {}: {}",
                    self.dir.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_dir_created_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let kept_path;
        {
            let scratch = ScratchDir::new(root.path()).unwrap();
            kept_path = scratch.path().to_path_buf();
            assert!(kept_path.exists());
            assert!(!scratch.run_id().is_empty());
        }
        assert!(!kept_path.exists());
    }

    #[test]
    fn test_write_file_creates_parents() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();
        let path = scratch.write_file("code/strategy.py", b"pass").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"pass");
    }

    #[test]
    fn test_two_scratch_dirs_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let a = ScratchDir::new(root.path()).unwrap();
        let b = ScratchDir::new(root.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
