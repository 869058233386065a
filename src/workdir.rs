//! Scoped temporary working directory, grounded on
//! `Utils.h::createTemporaryDirectory`: a judge run gets an isolated
//! `/tmp/<prefix>-XXXXXX` directory that is removed when the run ends,
//! successfully or not.

use std::path::{Path, PathBuf};

use nix::unistd::mkdtemp;

use crate::error::{EngineError, Result};

pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Creates a fresh directory under `/tmp` named `<prefix>-XXXXXX`,
    /// with the trailing `X`s replaced by `mkdtemp`'s random suffix.
    pub fn new(prefix: &str) -> Result<WorkDir> {
        let template = format!("/tmp/{prefix}-XXXXXX");
        let path = mkdtemp(template.as_str()).map_err(|errno| EngineError::system("mkdtemp", errno))?;
        Ok(WorkDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_removes_directory() {
        let dir = WorkDir::new("judgebox-test").expect("mkdtemp should succeed");
        let path = dir.path().to_path_buf();
        assert!(path.is_dir());
        drop(dir);
        assert!(!path.exists());
    }
}
