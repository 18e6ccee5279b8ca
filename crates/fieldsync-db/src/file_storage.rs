//! Attachment-owned binary storage.
//!
//! Captured binaries are copied out of the camera/picker location into a
//! directory the subsystem owns, so the source can be reclaimed by the OS at
//! any time without losing a queued upload.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldsync_db::file_storage::{FilesystemBackend, StorageBackend};
//!
//! let backend = FilesystemBackend::new("/var/fieldsync/attachments");
//! backend.validate().await?;
//! let path = backend.write("0192f0c4-7a1e-7c3d-9e4f-5a6b7c8d9e0f.jpg", &data).await?;
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use fieldsync_core::Result;

/// Storage backend for attachment-owned binaries.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `data` under `name` and return the full path of the stored copy.
    async fn write(&self, name: &str, data: &[u8]) -> Result<PathBuf>;

    /// Read a stored binary.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Delete a stored binary. Returns `false` if it was already gone.
    async fn release(&self, path: &Path) -> Result<bool>;

    /// Check whether a stored binary exists.
    async fn exists(&self, path: &Path) -> Result<bool>;
}

/// Filesystem storage backend.
///
/// Path format: `{base_path}/{attachment-id}.{ext}`
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given base directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Validate that the storage directory can write, read, and delete files.
    ///
    /// Performs a full round-trip at startup so permission errors or a
    /// missing volume surface before the first capture instead of during it.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let test_file = self.base_path.join(".health-check");

        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", self.base_path, e))?;

        let data = b"storage-health-check";
        fs::write(&test_file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", test_file, e))?;

        let read_data = fs::read(&test_file)
            .await
            .map_err(|e| format!("read({:?}): {}", test_file, e))?;
        if read_data != data {
            return Err("read-back mismatch".to_string());
        }

        fs::remove_file(&test_file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", test_file, e))?;

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn write(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let full_path = self.full_path(name);
        debug!(name, full_path = %full_path.display(), size = data.len(), "file_storage: write");

        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            warn!(base_path = %self.base_path.display(), error = %e, "file_storage: create_dir_all failed");
            e
        })?;

        // Atomic write: temp file + rename
        let temp_path = self.full_path(&format!(".{name}.tmp"));
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "file_storage: File::create failed");
            e
        })?;
        if let Err(e) = file.write_all(data).await {
            warn!(error = %e, "file_storage: write_all failed");
            drop(file);
            discard_temp(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = file.sync_all().await {
            warn!(error = %e, "file_storage: sync_all failed");
            drop(file);
            discard_temp(&temp_path).await;
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "file_storage: rename failed");
            discard_temp(&temp_path).await;
            return Err(e.into());
        }

        // rw-r--r--, never executable
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(full_path)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path).await?)
    }

    async fn release(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "file_storage: released");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(path).await?)
    }
}

/// Compute BLAKE3 hash of data with "blake3:" prefix.
///
/// Returns a string in the format: `blake3:{64-char-hex}`
pub fn compute_content_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("blake3:{}", hash.to_hex())
}

/// Remove a temp file left by a failed write.
async fn discard_temp(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(temp_path = %temp_path.display(), error = %e, "file_storage: temp file cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_format() {
        let hash = compute_content_hash(b"hello");
        assert!(hash.starts_with("blake3:"));
        assert_eq!(hash.len(), "blake3:".len() + 64);
        assert_eq!(hash, compute_content_hash(b"hello"));
        assert_ne!(hash, compute_content_hash(b"hello!"));
    }

    #[tokio::test]
    async fn test_write_read_release() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("attachments"));

        let path = backend.write("a.jpg", b"jpeg-bytes").await.unwrap();
        assert_eq!(path, dir.path().join("attachments").join("a.jpg"));
        assert!(backend.exists(&path).await.unwrap());
        assert_eq!(backend.read(&path).await.unwrap(), b"jpeg-bytes");

        assert!(backend.release(&path).await.unwrap());
        assert!(!backend.exists(&path).await.unwrap());
        assert!(!backend.release(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        backend.write("b.png", b"png").await.unwrap();

        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["b.png".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        // A non-empty directory where the binary should land.
        let blocker = dir.path().join("c.jpg");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        assert!(backend.write("c.jpg", b"jpeg").await.is_err());
        assert!(!dir.path().join(".c.jpg.tmp").exists());
        assert!(blocker.join("keep").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_written_file_is_not_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let path = backend.write("c.jpg", b"x").await.unwrap();
        let mode = fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_validate_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("nested/attachments"));
        backend.validate().await.unwrap();
        assert!(dir.path().join("nested/attachments").is_dir());
    }
}
