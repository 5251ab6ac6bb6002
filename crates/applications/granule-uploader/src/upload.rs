//! Upload and publish pipeline
//!
//! ```text
//! Located granules
//!     │
//!     ├── 1. Upload every file (data and checksum independently)
//!     │      failures are recorded, the batch continues
//!     │
//!     └── 2. For each uploaded data file, build a CNM message and
//!            publish it to the provider topic
//!            failures are recorded, remaining publishes continue
//! ```
//!
//! Checksum sidecars are uploaded but never announced on their own; they
//! travel inside their data file's CNM message.

use crate::bus::MessageBus;
use crate::cnm::CnmMessage;
use crate::error::{Result, UploaderError};
use crate::locator::GranulePair;
use crate::naming::DatasetProduct;
use crate::object_store::{Destination, ObjectStore};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// State of one file's upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    /// Not attempted yet
    Pending,
    /// Stored at the given URI
    Uploaded {
        /// Object URI
        uri: String,
    },
    /// Upload failed
    Failed {
        /// Failure description
        reason: String,
    },
}

/// Which file of a granule an upload record covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// NetCDF data file
    Data,
    /// MD5 sidecar
    Checksum,
}

/// One file's upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    /// Index into the granule list
    pub granule: usize,
    /// Data or checksum
    pub role: FileRole,
    /// Local path
    pub path: PathBuf,
    /// Upload state
    pub state: UploadState,
}

impl UploadRecord {
    /// URI if uploaded
    pub fn uri(&self) -> Option<&str> {
        match &self.state {
            UploadState::Uploaded { uri } => Some(uri),
            _ => None,
        }
    }
}

/// Outcome of uploading a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// One record per file, in upload order
    pub records: Vec<UploadRecord>,
}

impl UploadReport {
    /// URIs of uploaded files, in upload order
    pub fn uploaded_uris(&self) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|r| r.uri().map(str::to_string))
            .collect()
    }

    /// Paths that failed to upload, in upload order
    pub fn failed(&self) -> Vec<PathBuf> {
        self.records
            .iter()
            .filter(|r| matches!(r.state, UploadState::Failed { .. }))
            .map(|r| r.path.clone())
            .collect()
    }

    /// Uploaded data files with their granule index and URI
    pub fn uploaded_data(&self) -> impl Iterator<Item = (usize, &str)> {
        self.records
            .iter()
            .filter(|r| r.role == FileRole::Data)
            .filter_map(|r| r.uri().map(|uri| (r.granule, uri)))
    }
}

/// Uploads granules and announces them
pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    bus: Arc<dyn MessageBus>,
    destination: Destination,
    product: &'static DatasetProduct,
    trace: String,
    provider_topic_arn: String,
}

impl UploadPipeline {
    /// Create a pipeline
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bus: Arc<dyn MessageBus>,
        destination: Destination,
        product: &'static DatasetProduct,
        trace: impl Into<String>,
        provider_topic_arn: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            destination,
            product,
            trace: trace.into(),
            provider_topic_arn: provider_topic_arn.into(),
        }
    }

    /// Upload every file of every granule
    ///
    /// Never fails as a whole: each file's failure is recorded in the report.
    pub async fn upload_all(&self, pairs: &[GranulePair]) -> UploadReport {
        let mut records: Vec<UploadRecord> = pairs
            .iter()
            .enumerate()
            .flat_map(|(granule, pair)| {
                [
                    (granule, FileRole::Data, pair.data.clone()),
                    (granule, FileRole::Checksum, pair.checksum.clone()),
                ]
            })
            .map(|(granule, role, path)| UploadRecord {
                granule,
                role,
                path,
                state: UploadState::Pending,
            })
            .collect();

        for record in &mut records {
            record.state = match self.upload_file(&record.path).await {
                Ok(uri) => {
                    info!(file = %file_name(&record.path), uri = %uri, "File uploaded");
                    UploadState::Uploaded { uri }
                }
                Err(e) => {
                    error!(path = %record.path.display(), error = %e, "Failed to upload to S3");
                    UploadState::Failed {
                        reason: e.to_string(),
                    }
                }
            };
        }

        UploadReport { records }
    }

    async fn upload_file(&self, path: &Path) -> Result<String> {
        let key = self.destination.key_for(path)?;
        self.store
            .upload(path, &self.destination.bucket, &key, self.destination.encryption)
            .await?;
        Ok(self.destination.uri(&key))
    }

    /// Publish one CNM message per uploaded data file
    ///
    /// Returns the identifiers whose publish failed. Errors building a message
    /// (unreadable granule files) abort the run, as does a `report` that was
    /// not built from `pairs`.
    pub async fn publish_notifications(
        &self,
        pairs: &[GranulePair],
        report: &UploadReport,
    ) -> Result<Vec<String>> {
        let mut failed = Vec::new();

        for (granule, uri) in report.uploaded_data() {
            let pair = pairs.get(granule).ok_or_else(|| {
                UploaderError::config(format!(
                    "upload report refers to granule {granule} but only {} were given",
                    pairs.len()
                ))
            })?;
            let message = CnmMessage::for_granule(self.product, &self.trace, pair, uri, Utc::now())?;
            let body = message.to_json()?;

            match self.bus.publish(&self.provider_topic_arn, &body, None).await {
                Ok(()) => info!(
                    identifier = %message.identifier,
                    topic = %self.provider_topic_arn,
                    "Message published to SNS topic"
                ),
                Err(e) => {
                    error!(
                        identifier = %message.identifier,
                        topic = %self.provider_topic_arn,
                        error = %e,
                        "Failed to publish to SNS topic"
                    );
                    failed.push(message.identifier);
                }
            }
        }

        Ok(failed)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
