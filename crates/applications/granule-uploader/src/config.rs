//! Run configuration
//!
//! The CLI collects raw arguments; this module turns them into typed,
//! validated settings. Environment lookups are passed in rather than read
//! here so resolution stays testable.

use crate::error::{Result, UploaderError};
use crate::lock::AcquireOptions;
use crate::naming::{DatasetProduct, ProcessingType};
use crate::object_store::{Destination, Encryption, KeyLayout};
use std::path::PathBuf;
use std::time::Duration;

/// Job index that means "read the AWS Batch array index"
pub const BATCH_INDEX_SENTINEL: i64 = -235;

/// Last-job index for single (non-array) jobs
pub const SINGLE_JOB: i64 = -1;

/// Environment variable AWS Batch sets on array jobs
pub const BATCH_INDEX_ENV: &str = "AWS_BATCH_JOB_ARRAY_INDEX";

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-west-2";

/// Resolve the job index, replacing the sentinel with the batch array index
pub fn resolve_job_index(job_index: i64, batch_index: Option<&str>) -> Result<i64> {
    if job_index != BATCH_INDEX_SENTINEL {
        return Ok(job_index);
    }

    let raw = batch_index.ok_or_else(|| {
        UploaderError::config(format!("job index {BATCH_INDEX_SENTINEL} requires {BATCH_INDEX_ENV}"))
    })?;
    raw.trim()
        .parse()
        .map_err(|_| UploaderError::config(format!("{BATCH_INDEX_ENV} is not an integer: {raw:?}")))
}

/// Whether this job is the one that returns licenses for the batch
///
/// Single jobs always are; array jobs only when their array index equals
/// `last_job_index`. An unset or unparsable array index counts as `-1`.
pub fn is_terminating_job(last_job_index: i64, batch_index: Option<&str>) -> bool {
    let batch_index = batch_index
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(SINGLE_JOB);
    last_job_index == SINGLE_JOB || last_job_index == batch_index
}

/// Hold flag polling settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Seconds between polls
    pub poll_secs: u64,
    /// Give up after this many seconds
    pub timeout_secs: Option<u64>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            poll_secs: 3,
            timeout_secs: None,
        }
    }
}

impl LockSettings {
    /// Acquisition options for the lock
    pub fn acquire_options(&self) -> AcquireOptions {
        let options =
            AcquireOptions::default().with_poll_interval(Duration::from_secs(self.poll_secs));
        match self.timeout_secs {
            Some(secs) => options.with_max_wait(Duration::from_secs(secs)),
            None => options,
        }
    }
}

/// License return settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseSettings {
    /// Run id the licenses were reserved under
    pub unique_id: String,
    /// Whether this job is the last of its batch
    pub terminating: bool,
    /// Hold flag polling
    pub lock: LockSettings,
}

/// Everything an upload run needs
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Environment prefix
    pub prefix: String,
    /// Venue (sit, uat, ops)
    pub venue: String,
    /// AWS region
    pub region: String,
    /// Resolved job index
    pub job_index: i64,
    /// Input JSON mapping job index to timestamps
    pub input_json: PathBuf,
    /// Processor data directory
    pub data_dir: PathBuf,
    /// Quicklook or refined
    pub processing: ProcessingType,
    /// Dataset product
    pub product: &'static DatasetProduct,
    /// Upload destination
    pub destination: Destination,
    /// Token identifying the alert topic
    pub alert_topic: Option<String>,
    /// License return, if this run holds licenses
    pub license: Option<LicenseSettings>,
}

impl UploadConfig {
    /// Build and validate an upload configuration
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prefix: String,
        venue: String,
        region: String,
        job_index: i64,
        input_json: PathBuf,
        data_dir: PathBuf,
        processing: ProcessingType,
        dataset: &str,
    ) -> Result<Self> {
        if prefix.trim().is_empty() {
            return Err(UploaderError::config("prefix must not be empty"));
        }
        if venue.trim().is_empty() {
            return Err(UploaderError::config("venue must not be empty"));
        }

        let product = DatasetProduct::lookup(dataset)?;
        let destination = Destination::for_prefix(&prefix, product.name);

        Ok(Self {
            prefix,
            venue,
            region,
            job_index,
            input_json,
            data_dir,
            processing,
            product,
            destination,
            alert_topic: None,
            license: None,
        })
    }

    /// Set object key layout and encryption
    pub fn with_storage(mut self, layout: KeyLayout, encryption: Encryption) -> Self {
        self.destination = self.destination.with_layout(layout).with_encryption(encryption);
        self
    }

    /// Set alert topic token
    pub fn with_alert_topic(mut self, token: Option<String>) -> Self {
        self.alert_topic = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Set license return settings
    pub fn with_license(mut self, license: Option<LicenseSettings>) -> Self {
        self.license = license;
        self
    }

    /// Parameter holding the cross-account id of the provider topic
    pub fn cross_account_key(&self) -> String {
        format!("{}-cumulus-account", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploadConfig {
        UploadConfig::new(
            "gen-sit".into(),
            "sit".into(),
            DEFAULT_REGION.into(),
            0,
            "/in.json".into(),
            "/data".into(),
            ProcessingType::Quicklook,
            "viirs",
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_job_index() {
        assert_eq!(resolve_job_index(4, None).unwrap(), 4);
        assert_eq!(resolve_job_index(BATCH_INDEX_SENTINEL, Some("12")).unwrap(), 12);
        assert!(resolve_job_index(BATCH_INDEX_SENTINEL, None).is_err());
        assert!(resolve_job_index(BATCH_INDEX_SENTINEL, Some("x")).is_err());
    }

    #[test]
    fn test_terminating_job() {
        assert!(is_terminating_job(SINGLE_JOB, None));
        assert!(is_terminating_job(SINGLE_JOB, Some("3")));
        assert!(is_terminating_job(3, Some("3")));
        assert!(!is_terminating_job(3, Some("2")));
        assert!(!is_terminating_job(3, None));
    }

    #[test]
    fn test_lock_settings() {
        let options = LockSettings::default().acquire_options();
        assert_eq!(options.poll_interval, Duration::from_secs(3));
        assert_eq!(options.max_wait, None);

        let bounded = LockSettings {
            poll_secs: 1,
            timeout_secs: Some(60),
        }
        .acquire_options();
        assert_eq!(bounded.max_wait, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_upload_config() {
        let config = config()
            .with_storage(KeyLayout::DatasetPrefixed, Encryption::Aes256)
            .with_alert_topic(Some("  ".into()));

        assert_eq!(config.destination.bucket, "gen-sit-l2p-granules");
        assert_eq!(config.destination.dataset, "viirs");
        assert_eq!(config.destination.layout, KeyLayout::DatasetPrefixed);
        assert_eq!(config.alert_topic, None);
        assert_eq!(config.cross_account_key(), "gen-sit-cumulus-account");
    }

    #[test]
    fn test_upload_config_rejects_unknown_dataset() {
        let result = UploadConfig::new(
            "gen".into(),
            "sit".into(),
            DEFAULT_REGION.into(),
            0,
            "/in.json".into(),
            "/data".into(),
            ProcessingType::Refined,
            "landsat",
        );
        assert!(matches!(result, Err(UploaderError::Config(_))));
    }
}
