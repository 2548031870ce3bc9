//! Blob storage for generated artifacts and caller uploads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Unknown upload: {0}")]
    UnknownUpload(String),

    #[error("Uploads are not supported by this storage")]
    UploadsUnsupported,

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// URI scheme of uploaded inputs.
pub const UPLOAD_URI_PREFIX: &str = "mediarun://uploads/";

/// Where a caller sends an input file before referencing it in a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSlot {
    pub id: String,
    pub upload_url: String,
    /// Form fields the upload request must carry. Empty for local storage.
    pub fields: BTreeMap<String, String>,
    /// URI to put in task inputs once the upload completed.
    pub uri: String,
}

/// Where generated bytes end up.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` under `name` and return a location the caller can fetch.
    async fn store(&self, bytes: Vec<u8>, name: &str) -> Result<String, StorageError>;

    /// Issue a slot for uploading `filename`.
    fn upload_slot(&self, _filename: &str) -> Result<UploadSlot, StorageError> {
        Err(StorageError::UploadsUnsupported)
    }

    /// Accept the bytes of a previously issued slot and return its URI.
    async fn receive_upload(&self, _name: &str, _bytes: Vec<u8>) -> Result<String, StorageError> {
        Err(StorageError::UploadsUnsupported)
    }
}

fn check_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Writes artifacts into a local directory served under a public URL prefix.
///
/// Uploads land in an `uploads` subdirectory and are sent to the API's own
/// `/v1/uploads/{name}` route.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
    public_base_url: String,
    api_base_url: String,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        let public_base_url = public_base_url.into().trim_end_matches('/').to_string();
        let api_base_url = public_base_url
            .strip_suffix("/outputs")
            .unwrap_or(&public_base_url)
            .to_string();
        Self {
            dir: dir.into(),
            public_base_url,
            api_base_url,
        }
    }

    async fn write(&self, dir: PathBuf, name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// Whether `name` has the `<uuid>[.<ext>]` shape of an issued slot.
fn is_upload_name(name: &str) -> bool {
    let (id, ext) = name.split_once('.').unwrap_or((name, ""));
    uuid::Uuid::parse_str(id).is_ok() && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

#[async_trait]
impl BlobStorage for LocalStorage {
    async fn store(&self, bytes: Vec<u8>, name: &str) -> Result<String, StorageError> {
        check_name(name)?;
        let path = self.write(self.dir.clone(), name, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "Stored artifact");
        Ok(format!("{}/{}", self.public_base_url, name))
    }

    fn upload_slot(&self, filename: &str) -> Result<UploadSlot, StorageError> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let id = uuid::Uuid::new_v4().to_string();
        let name = format!("{id}{ext}");

        Ok(UploadSlot {
            upload_url: format!("{}/v1/uploads/{name}", self.api_base_url),
            fields: BTreeMap::new(),
            uri: format!("{UPLOAD_URI_PREFIX}{name}"),
            id,
        })
    }

    async fn receive_upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        check_name(name)?;
        if !is_upload_name(name) {
            return Err(StorageError::UnknownUpload(name.to_string()));
        }
        let path = self.write(self.dir.join("uploads"), name, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "Stored upload");
        Ok(format!("{UPLOAD_URI_PREFIX}{name}"))
    }
}
