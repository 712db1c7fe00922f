//! Blob store port and its filesystem implementation.

use crate::{BlobPath, FilesError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Storage for opaque blobs addressed by [`BlobPath`].
///
/// Implementations must make `put` write-once: storing to an occupied path is an error, never
/// an overwrite.
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    fn put(&self, path: &BlobPath, bytes: &[u8]) -> Result<(), FilesError>;

    fn get(&self, path: &BlobPath) -> Result<Vec<u8>, FilesError>;

    /// Removes the blob. Returns `false` if nothing was stored at `path`.
    fn delete(&self, path: &BlobPath) -> Result<bool, FilesError>;

    fn exists(&self, path: &BlobPath) -> Result<bool, FilesError>;
}

/// Filesystem-backed [`BlobStore`] rooted at a single directory.
#[derive(Debug)]
pub struct FsBlobStore {
    root_directory: PathBuf,
}

impl FsBlobStore {
    /// Opens a blob store rooted at `root_directory`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidRootDirectory` if the path exists but is not a directory or
    /// cannot be canonicalised.
    pub fn new(root_directory: &Path) -> Result<Self, FilesError> {
        if root_directory.exists() && !root_directory.is_dir() {
            return Err(FilesError::InvalidRootDirectory(format!(
                "Path is not a directory: {}",
                root_directory.display()
            )));
        }

        fs::create_dir_all(root_directory).map_err(|e| {
            FilesError::InvalidRootDirectory(format!(
                "Cannot create {}: {}",
                root_directory.display(),
                e
            ))
        })?;

        let root_directory = root_directory.canonicalize().map_err(|e| {
            FilesError::InvalidRootDirectory(format!(
                "Cannot canonicalize path {}: {}",
                root_directory.display(),
                e
            ))
        })?;

        Ok(Self { root_directory })
    }

    pub fn root_directory(&self) -> &Path {
        &self.root_directory
    }

    fn resolve(&self, path: &BlobPath) -> PathBuf {
        path.segments()
            .fold(self.root_directory.clone(), |acc, seg| acc.join(seg))
    }

    /// Removes now-empty parent directories up to (not including) the root.
    fn prune_empty_parents(&self, from: &Path) {
        let mut current = from.parent();
        while let Some(dir) = current {
            if dir == self.root_directory {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, path: &BlobPath, bytes: &[u8]) -> Result<(), FilesError> {
        let target = self.resolve(path);

        if target.exists() {
            return Err(FilesError::BlobAlreadyExists(path.to_string()));
        }

        let parent = target
            .parent()
            .ok_or_else(|| FilesError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(parent)?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FilesError::InvalidPath(path.to_string()))?;
        let temp = parent.join(format!(".{}.partial", file_name));

        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp);
            return Err(FilesError::Io(e));
        }

        // hard_link fails if the target appeared in the meantime, keeping put write-once
        match fs::hard_link(&temp, &target) {
            Ok(()) => {
                let _ = fs::remove_file(&temp);
                tracing::debug!("stored blob {} ({} bytes)", path, bytes.len());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp);
                Err(FilesError::BlobAlreadyExists(path.to_string()))
            }
            Err(_) => {
                // some filesystems do not support hard links
                fs::rename(&temp, &target).map_err(FilesError::Io)
            }
        }
    }

    fn get(&self, path: &BlobPath) -> Result<Vec<u8>, FilesError> {
        let target = self.resolve(path);
        match fs::read(&target) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FilesError::BlobNotFound(path.to_string()))
            }
            Err(e) => Err(FilesError::Io(e)),
        }
    }

    fn delete(&self, path: &BlobPath) -> Result<bool, FilesError> {
        let target = self.resolve(path);
        match fs::remove_file(&target) {
            Ok(()) => {
                self.prune_empty_parents(&target);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FilesError::Io(e)),
        }
    }

    fn exists(&self, path: &BlobPath) -> Result<bool, FilesError> {
        Ok(self.resolve(path).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsBlobStore) {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(&temp.path().join("blobs")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_new_rejects_file_root() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();

        assert!(matches!(
            FsBlobStore::new(&file),
            Err(FilesError::InvalidRootDirectory(_))
        ));
    }

    #[test]
    fn test_put_get_and_exists() {
        let (_temp, store) = store();
        let path = BlobPath::new("documents/p/d/v1.enc").unwrap();

        assert!(!store.exists(&path).unwrap());
        store.put(&path, &[0, 1, 2, 255]).unwrap();

        assert!(store.exists(&path).unwrap());
        assert_eq!(store.get(&path).unwrap(), vec![0, 1, 2, 255]);
        assert!(store.root_directory().join("documents/p/d/v1.enc").is_file());
    }

    #[test]
    fn test_put_is_write_once() {
        let (_temp, store) = store();
        let path = BlobPath::new("documents/p/d/v1.enc").unwrap();

        store.put(&path, b"first").unwrap();
        let second = store.put(&path, b"second");

        assert!(matches!(second, Err(FilesError::BlobAlreadyExists(_))));
        assert_eq!(store.get(&path).unwrap(), b"first");
    }

    #[test]
    fn test_put_leaves_no_partial_files() {
        let (_temp, store) = store();
        let path = BlobPath::new("documents/p/d/v1.enc").unwrap();
        store.put(&path, b"bytes").unwrap();

        let dir = store.root_directory().join("documents/p/d");
        let names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["v1.enc".to_string()]);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_temp, store) = store();
        let path = BlobPath::new("documents/none.enc").unwrap();
        assert!(matches!(store.get(&path), Err(FilesError::BlobNotFound(_))));
    }

    #[test]
    fn test_delete_prunes_empty_directories() {
        let (_temp, store) = store();
        let path = BlobPath::new("documents/p/d/v1.enc").unwrap();
        store.put(&path, b"bytes").unwrap();

        assert!(store.delete(&path).unwrap());
        assert!(!store.delete(&path).unwrap());
        assert!(!store.root_directory().join("documents").exists());
        assert!(store.root_directory().exists());
    }
}
