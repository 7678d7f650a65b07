//! Per-run staging directories holding the submitted source file.

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::StagingError;
use crate::language::Language;

/// Directory a session's run of `language` is staged into.
///
/// Only one run per session is active at a time and its directory is removed before the
/// session's run slot is released, so the mapping never hands the same path to two live runs.
pub fn staging_path(root: &Path, session_id: &str, language: Language) -> PathBuf {
    root.join(format!("{}-{}", session_id, language.as_str()))
}

/// An isolated directory containing exactly one source file.
#[derive(Debug)]
pub struct StagedDir {
    path: PathBuf,
    entry: &'static str,
    removed: bool,
}

impl StagedDir {
    /// Create a fresh directory for the run and write `code` into the language's entry file.
    pub async fn create(
        root: &Path,
        session_id: &str,
        language: Language,
        code: &str,
    ) -> Result<Self, StagingError> {
        let path = staging_path(root, session_id, language);

        // Leftovers from an interrupted run must never leak into this one.
        if fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "Removing stale staging directory");
            if let Err(e) = fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), "Failed to remove stale staging directory: {}", e);
            }
        }

        fs::create_dir_all(root)
            .await
            .map_err(|source| StagingError::CreateDir { path: root.to_path_buf(), source })?;
        fs::create_dir(&path)
            .await
            .map_err(|source| StagingError::CreateDir { path: path.clone(), source })?;
        if let Err(e) = fs::set_permissions(&path, Permissions::from_mode(0o755)).await {
            warn!(path = %path.display(), "Failed to set staging directory permissions: {}", e);
        }

        let mut staged = StagedDir {
            path,
            entry: language.entry_file(),
            removed: false,
        };

        let file = staged.entry_path();
        if let Err(source) = write_source(&file, code).await {
            staged.removed = true;
            if let Err(e) = fs::remove_dir_all(&staged.path).await {
                warn!(path = %staged.path.display(), "Failed to remove partial staging directory: {}", e);
            }
            return Err(StagingError::WriteSource { path: file, source });
        }

        debug!(path = %staged.path.display(), bytes = code.len(), "Staged source");
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_file(&self) -> &'static str {
        self.entry
    }

    pub fn entry_path(&self) -> PathBuf {
        self.path.join(self.entry)
    }

    /// Remove the directory and everything the run produced in it.
    pub async fn remove(mut self) {
        self.removed = true;
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed staging directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove staging directory: {}", e),
        }
    }
}

impl Drop for StagedDir {
    fn drop(&mut self) {
        if !self.removed {
            match std::fs::remove_dir_all(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), "Failed to remove staging directory: {}", e),
            }
        }
    }
}

async fn write_source(file: &Path, code: &str) -> io::Result<()> {
    fs::write(file, code).await?;
    fs::set_permissions(file, Permissions::from_mode(0o644)).await
}

/// Remove everything under the staging root left behind by a previous process.
pub async fn purge(root: &Path) -> io::Result<usize> {
    fs::create_dir_all(root).await?;
    let mut entries = fs::read_dir(root).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                info!("Cleaned up: {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Error cleaning up {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_entry_file_for_language() {
        let root = tempfile::tempdir().unwrap();
        let staged = StagedDir::create(root.path(), "s1", Language::Java, "class Main {}")
            .await
            .unwrap();

        assert_eq!(staged.path(), root.path().join("s1-java"));
        let written = std::fs::read_to_string(staged.path().join("Main.java")).unwrap();
        assert_eq!(written, "class Main {}");
        staged.remove().await;
    }

    #[tokio::test]
    async fn replaces_stale_directory() {
        let root = tempfile::tempdir().unwrap();
        let stale = staging_path(root.path(), "s1", Language::Python);
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("leftover.txt"), "old").unwrap();

        let staged = StagedDir::create(root.path(), "s1", Language::Python, "print(1)")
            .await
            .unwrap();

        assert!(!staged.path().join("leftover.txt").exists());
        assert!(staged.entry_path().exists());
        staged.remove().await;
    }

    #[tokio::test]
    async fn unremovable_stale_entry_fails_staging() {
        let root = tempfile::tempdir().unwrap();
        let stale = staging_path(root.path(), "s1", Language::Python);
        std::fs::write(&stale, "not a directory").unwrap();

        let err = StagedDir::create(root.path(), "s1", Language::Python, "print(1)")
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::CreateDir { ref path, .. } if *path == stale));
        assert!(stale.is_file());
    }

    #[tokio::test]
    async fn remove_deletes_directory_and_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let staged = StagedDir::create(root.path(), "s2", Language::Cpp, "int main(){}")
            .await
            .unwrap();
        std::fs::write(staged.path().join("a.out"), "bin").unwrap();
        let path = staged.path().to_path_buf();

        staged.remove().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropping_without_remove_still_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let staged = StagedDir::create(root.path(), "s3", Language::Python, "")
            .await
            .unwrap();
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn fails_when_root_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let err = StagedDir::create(&blocker, "s1", Language::Python, "print(1)")
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::CreateDir { .. }));
    }

    #[tokio::test]
    async fn purge_empties_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("old-python")).unwrap();
        std::fs::write(root.path().join("old-python/Main.py"), "x").unwrap();
        std::fs::write(root.path().join("stray"), "x").unwrap();

        let removed = purge(root.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
