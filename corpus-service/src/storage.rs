//! Content-addressed object storage on the local filesystem.
//!
//! Objects live under `<root>/files/<first two hex chars>/<sha256>.<ext>`, so
//! storing the same bytes twice yields the same path.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{ServiceResult, StorageError};

/// Compute SHA-256 hash of a byte slice, returning a hex string.
pub fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Stored object location plus the hash it was derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Path relative to the store root
    pub path: String,
    pub content_hash: String,
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store bytes under their content hash. Idempotent.
    pub async fn store(&self, bytes: &[u8], extension: &str) -> ServiceResult<StoredObject> {
        let content_hash = compute_content_hash(bytes);
        let extension = extension
            .trim_start_matches('.')
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        let file_name = if extension.is_empty() {
            content_hash.clone()
        } else {
            format!("{}.{}", content_hash, extension)
        };
        let relative = format!("files/{}/{}", &content_hash[..2], file_name);
        let full = self.root.join(&relative);

        if tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Ok(StoredObject {
                path: relative,
                content_hash,
            });
        }

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&relative, e))?;
        }

        // Write to a temp name first so readers never see a partial object
        let partial = full.with_extension("partial");
        tokio::fs::write(&partial, bytes)
            .await
            .map_err(|e| io_error(&relative, e))?;
        tokio::fs::rename(&partial, &full)
            .await
            .map_err(|e| io_error(&relative, e))?;

        tracing::debug!(path = %relative, size = bytes.len(), "Stored object");

        Ok(StoredObject {
            path: relative,
            content_hash,
        })
    }

    /// Read a stored object
    pub async fn read(&self, path: &str) -> ServiceResult<Vec<u8>> {
        let full = self.resolve(path)?;

        let bytes = tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::Missing {
                    path: path.to_string(),
                }
            } else {
                io_error(path, e)
            }
        })?;

        Ok(bytes)
    }

    /// Map a relative object path into the root, rejecting anything that escapes it
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

        if path.is_empty() || escapes {
            return Err(StorageError::InvalidPath {
                path: path.to_string(),
            });
        }

        Ok(self.root.join(relative))
    }
}

fn io_error(path: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use tempfile::TempDir;

    #[test]
    fn test_compute_content_hash() {
        assert_eq!(
            compute_content_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_store_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let first = store.store(b"hello world", ".TXT").await.unwrap();
        let second = store.store(b"hello world", "txt").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.path,
            "files/b9/b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9.txt"
        );
        assert_eq!(store.read(&first.path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_read_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        for path in ["../etc/passwd", "/etc/passwd", ""] {
            let err = store.read(path).await.unwrap_err();
            assert!(
                matches!(err, ServiceError::Storage(StorageError::InvalidPath { .. })),
                "{path}"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_object_is_not_transient() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let err = store.read("files/aa/nothing.txt").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Storage(StorageError::Missing { .. })
        ));
        assert!(!err.is_transient());
    }
}
