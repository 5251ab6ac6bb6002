//! Granule object storage
//!
//! Uploads granule files to `<prefix>-l2p-granules` with server-side
//! encryption. Object keys are the bare filename or `<dataset>/<filename>`.

use crate::error::{Result, UploaderError};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;
use clap::ValueEnum;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// How object keys are derived from filenames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum KeyLayout {
    /// `<filename>`
    #[default]
    Bare,
    /// `<dataset>/<filename>`
    DatasetPrefixed,
}

/// Server-side encryption applied to uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Encryption {
    /// SSE-KMS with the bucket's key
    #[default]
    Kms,
    /// SSE-S3
    Aes256,
}

impl From<Encryption> for ServerSideEncryption {
    fn from(encryption: Encryption) -> Self {
        match encryption {
            Encryption::Kms => ServerSideEncryption::AwsKms,
            Encryption::Aes256 => ServerSideEncryption::Aes256,
        }
    }
}

/// Where granules are uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Target bucket
    pub bucket: String,
    /// Dataset, used by [`KeyLayout::DatasetPrefixed`]
    pub dataset: String,
    /// Key layout
    pub layout: KeyLayout,
    /// Encryption mode
    pub encryption: Encryption,
}

impl Destination {
    /// Granule bucket for an environment prefix
    pub fn for_prefix(prefix: &str, dataset: impl Into<String>) -> Self {
        Self {
            bucket: format!("{prefix}-l2p-granules"),
            dataset: dataset.into(),
            layout: KeyLayout::default(),
            encryption: Encryption::default(),
        }
    }

    /// Set key layout
    pub fn with_layout(mut self, layout: KeyLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set encryption mode
    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = encryption;
        self
    }

    /// Object key for a local file
    pub fn key_for(&self, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UploaderError::config(format!("no filename in {}", path.display())))?;

        Ok(match self.layout {
            KeyLayout::Bare => name.to_string(),
            KeyLayout::DatasetPrefixed => format!("{}/{}", self.dataset, name),
        })
    }

    /// `s3://` URI for a key
    pub fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

/// Object storage used for granule uploads
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Upload a local file to `bucket/key`
    async fn upload(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        encryption: Encryption,
    ) -> Result<()>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Create a store from an S3 client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create a store from AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        encryption: Encryption,
    ) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| UploaderError::ObjectStore(format!("{}: {}", path.display(), e)))?;

        let response = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .server_side_encryption(encryption.into())
            .body(body)
            .send()
            .await
            .map_err(UploaderError::from_s3)?;

        debug!(
            bucket = %bucket,
            key = %key,
            etag = ?response.e_tag(),
            "Object written"
        );
        Ok(())
    }
}

/// In-memory object store for testing
///
/// Uploads of paths registered with [`MemoryObjectStore::fail_on`] fail.
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failing: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make uploads of `path` fail
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.into());
    }

    /// Stored `bucket/key` entries, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        _encryption: Encryption,
    ) -> Result<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(path)
        {
            return Err(UploaderError::ObjectStore(format!(
                "AccessDenied: {}",
                path.display()
            )));
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| UploaderError::io(path, e))?;
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(format!("{bucket}/{key}"), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name() {
        let destination = Destination::for_prefix("gen-sit", "aqua");
        assert_eq!(destination.bucket, "gen-sit-l2p-granules");
        assert_eq!(destination.encryption, Encryption::Kms);
    }

    #[test]
    fn test_key_layouts() {
        let path = Path::new("/data/out/granule.nc");
        let bare = Destination::for_prefix("p", "aqua");
        let prefixed = bare.clone().with_layout(KeyLayout::DatasetPrefixed);

        assert_eq!(bare.key_for(path).unwrap(), "granule.nc");
        assert_eq!(prefixed.key_for(path).unwrap(), "aqua/granule.nc");
        assert_eq!(prefixed.uri("aqua/granule.nc"), "s3://p-l2p-granules/aqua/granule.nc");
    }

    #[test]
    fn test_encryption_mapping() {
        assert_eq!(ServerSideEncryption::from(Encryption::Kms), ServerSideEncryption::AwsKms);
        assert_eq!(
            ServerSideEncryption::from(Encryption::Aes256),
            ServerSideEncryption::Aes256
        );
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let dir = tempfile::TempDir::new().unwrap();
        let ok = dir.path().join("ok.nc");
        let bad = dir.path().join("bad.nc");
        std::fs::write(&ok, b"a").unwrap();
        std::fs::write(&bad, b"b").unwrap();

        let store = MemoryObjectStore::new();
        store.fail_on(&bad);

        assert!(store.upload(&ok, "bkt", "ok.nc", Encryption::Kms).await.is_ok());
        assert!(store.upload(&bad, "bkt", "bad.nc", Encryption::Kms).await.is_err());
        assert_eq!(store.keys(), vec!["bkt/ok.nc".to_string()]);
    }
}
