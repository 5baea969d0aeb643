use accessguard_core::store::{SecretStore, StoreError};
use async_trait::async_trait;
use log::debug;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use zeroize::Zeroizing;

/// Secret store keeping one file per key under a base directory.
///
/// File names are the hex SHA-256 of the key, so guard ids never reach the
/// filesystem. A write creates a private temporary file and renames it into
/// place on a blocking task, so it runs to completion even if the caller
/// stops waiting.
pub struct FileSecretStore {
    base_dir: PathBuf,
    seq: AtomicU64,
}

impl FileSecretStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|err| map_io_error("failed to create keystore directory", err))?;
        restrict_dir(&base_dir).await?;
        Ok(Self::with_base_dir(base_dir))
    }

    /// Use `base_dir` as is; it must already exist.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.base_dir.join(format!("{}.secret", hex::encode(digest)))
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("tmp.{}.{seq}", std::process::id()))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.file_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_io_error("failed to read secret file", err)),
        }
    }

    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.file_path(key);
        let temp_path = self.temp_path(&path);
        let value = Zeroizing::new(value.to_vec());

        tokio::task::spawn_blocking(move || replace_file(&temp_path, &path, &value))
            .await
            .map_err(|err| StoreError::transient(format!("secret write task failed: {err}")))?
    }

    async fn delete_secret(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io_error("failed to delete secret file", err)),
        }
    }
}

/// Write `value` to `temp_path` with owner-only permissions, then rename it
/// over `path`. The temporary file is removed on any failure.
fn replace_file(temp_path: &Path, path: &Path, value: &[u8]) -> Result<(), StoreError> {
    let outcome = write_private(temp_path, value).and_then(|()| {
        std::fs::rename(temp_path, path)
            .map_err(|err| map_io_error("failed to move secret file into place", err))
    });
    match outcome {
        Ok(()) => {
            debug!("wrote secret file {}", path.display());
            Ok(())
        }
        Err(err) => {
            let _ = std::fs::remove_file(temp_path);
            Err(err)
        }
    }
}

fn write_private(path: &Path, value: &[u8]) -> Result<(), StoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|err| map_io_error("failed to create secret temp file", err))?;
    file.write_all(value)
        .and_then(|()| file.sync_all())
        .map_err(|err| map_io_error("failed to write secret temp file", err))
}

async fn restrict_dir(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|err| map_io_error("failed to restrict keystore directory", err))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Retrying cannot fix a missing permission or a broken path.
fn map_io_error(context: &str, err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::InvalidData
        | io::ErrorKind::Unsupported => StoreError::permanent(format!("{context}: {err}")),
        _ => StoreError::transient(format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accessguard_core::store::StoreErrorKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn roundtrip_stores_and_loads() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.set_secret("accessguard:v1:app", b"secret").await.unwrap();
        let loaded = store.get_secret("accessguard:v1:app").await.unwrap();
        assert_eq!(loaded, Some(b"secret".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        assert!(store.get_secret("accessguard:v1:none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_contents_without_leftovers() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.set_secret("k", b"first").await.unwrap();
        store.set_secret("k", b"second").await.unwrap();
        assert_eq!(store.get_secret("k").await.unwrap(), Some(b"second".to_vec()));

        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.set_secret("k", b"value").await.unwrap();
        store.delete_secret("k").await.unwrap();
        assert!(store.get_secret("k").await.unwrap().is_none());
        store.delete_secret("k").await.unwrap();
    }

    #[tokio::test]
    async fn file_names_do_not_leak_keys() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.set_secret("accessguard:v1:diary", b"x").await.unwrap();

        let name = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .file_name()
            .into_string()
            .unwrap();
        assert!(!name.contains("diary"));
        assert_eq!(name.len(), 64 + ".secret".len());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secret_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.set_secret("k", b"value").await.unwrap();

        let mode = std::fs::metadata(store.file_path("k"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn abandoned_write_still_lands_whole() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(FileSecretStore::open(dir.path()).await.unwrap());
        store.set_secret("k", b"old").await.unwrap();

        let value = vec![7u8; 64 * 1024];
        let writing = {
            let store = store.clone();
            let value = value.clone();
            tokio::spawn(async move { store.set_secret("k", &value).await })
        };
        tokio::task::yield_now().await;
        writing.abort();
        let _ = writing.await;

        let mut landed = None;
        for _ in 0..200 {
            let current = store.get_secret("k").await.unwrap().unwrap();
            if current != b"old" {
                landed = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // either the task never started or its file arrived complete
        if let Some(current) = landed {
            assert_eq!(current, value);
        }
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn failed_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        std::fs::create_dir(store.file_path("k")).unwrap();
        std::fs::write(store.file_path("k").join("occupied"), b"x").unwrap();

        assert!(store.set_secret("k", b"value").await.is_err());
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn permission_errors_are_permanent() {
        let err = map_io_error(
            "read",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), StoreErrorKind::Permanent);

        let err = map_io_error("read", io::Error::new(io::ErrorKind::Interrupted, "again"));
        assert_eq!(err.kind(), StoreErrorKind::Transient);
    }
}
