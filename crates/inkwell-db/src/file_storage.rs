//! Blob storage for uploaded page images.
//!
//! Blobs are flat files named `<uuid>.<ext>` under the upload directory.
//! Storage mode only changes how public URLs are formed; the bytes always
//! live on the local filesystem.
//!
//! ```rust,ignore
//! use inkwell_db::file_storage::{FilesystemBlobStore, StorageConfig};
//!
//! let store = FilesystemBlobStore::new(StorageConfig::from_env()?);
//! let blob = store.put(&bytes, "jpg").await?;
//! println!("{}", store.url_for(&blob));
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use inkwell_core::defaults::{LOCAL_URL_PREFIX, UPLOAD_DIR};
use inkwell_core::{BlobRef, BlobStore, Error, Result};

/// Where public URLs for stored blobs point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Served by the application under `/uploads`.
    #[default]
    Local,
    /// Served from an external base URL (bucket, CDN).
    Remote,
}

impl FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StorageMode::Local),
            "remote" | "s3" => Ok(StorageMode::Remote),
            other => Err(Error::Config(format!("Unknown STORAGE_MODE: {}", other))),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub mode: StorageMode,
    /// Directory the bytes are written to.
    pub upload_dir: PathBuf,
    /// Base URL for `Remote` mode.
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            upload_dir: PathBuf::from(UPLOAD_DIR),
            public_base_url: None,
        }
    }
}

impl StorageConfig {
    /// Load from `STORAGE_MODE`, `UPLOAD_DIR`, and `PUBLIC_BASE_URL`.
    ///
    /// Remote mode without a base URL is a configuration error.
    pub fn from_env() -> Result<Self> {
        let mode = match std::env::var("STORAGE_MODE") {
            Ok(v) if !v.trim().is_empty() => v.trim().parse()?,
            _ => StorageMode::Local,
        };
        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(UPLOAD_DIR));
        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Self {
            mode,
            upload_dir,
            public_base_url,
        }
        .validated()
    }

    /// Local storage rooted at `dir`.
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Switch to remote URLs under `base_url`.
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.mode = StorageMode::Remote;
        self.public_base_url = Some(base_url.into());
        self
    }

    fn validated(self) -> Result<Self> {
        if self.mode == StorageMode::Remote && self.public_base_url.is_none() {
            return Err(Error::Config(
                "STORAGE_MODE=remote requires PUBLIC_BASE_URL".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Filesystem implementation of BlobStore.
pub struct FilesystemBlobStore {
    config: StorageConfig,
}

impl FilesystemBlobStore {
    /// Create a new store; the upload directory is created on first write.
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Resolve a reference to a path, rejecting anything but a flat file name.
    fn full_path(&self, blob: &BlobRef) -> Result<PathBuf> {
        let name = blob.as_str();
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.starts_with('.')
        {
            return Err(Error::InvalidInput(format!("Invalid blob reference: {}", name)));
        }
        Ok(self.config.upload_dir.join(name))
    }

    /// Validate that the storage directory can be written, read, and cleaned.
    ///
    /// Run at startup so permission problems surface before the first upload.
    pub async fn validate(&self) -> Result<()> {
        let check_blob = BlobRef::new(format!("health-check-{}.bin", Uuid::new_v4()));
        let data = b"storage-health-check";

        self.write_atomic(&check_blob, data).await?;
        let read_back = self.get(&check_blob).await?;
        self.delete(&check_blob).await?;

        if read_back != data {
            return Err(Error::Internal("Storage read-back mismatch".to_string()));
        }
        Ok(())
    }

    async fn write_atomic(&self, blob: &BlobRef, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(blob)?;
        debug!(blob = %blob, full_path = %full_path.display(), size = data.len(), "file_storage: write");

        fs::create_dir_all(&self.config.upload_dir)
            .await
            .map_err(|e| {
                warn!(dir = %self.config.upload_dir.display(), error = %e, "file_storage: create_dir_all failed");
                e
            })?;

        // Atomic write: temp file + rename
        let temp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "file_storage: File::create failed");
            e
        })?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "file_storage: rename failed");
            e
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, data: &[u8], extension: &str) -> Result<BlobRef> {
        let blob = BlobRef::new(format!("{}.{}", Uuid::new_v4(), extension));
        self.write_atomic(&blob, data).await?;
        Ok(blob)
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let full_path = self.full_path(blob)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Blob {}", blob)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn url_for(&self, blob: &BlobRef) -> String {
        match (self.config.mode, &self.config.public_base_url) {
            (StorageMode::Remote, Some(base)) => {
                format!("{}/{}", base.trim_end_matches('/'), blob)
            }
            _ => format!("{}/{}", LOCAL_URL_PREFIX, blob),
        }
    }

    async fn delete(&self, blob: &BlobRef) -> Result<()> {
        let full_path = self.full_path(blob)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
