//! One upload run, end to end
//!
//! ```text
//! resolve provider topic ──► locate ──► upload ──► publish CNM
//!                                                      │
//!                       any failures? ──yes──► failure report (run fails)
//!                            │
//!                            no
//!                            │
//!                 last job of batch? ──yes──► return licenses
//! ```
//!
//! The cross-account id behind the provider topic is resolved before any file
//! is touched, so a misconfigured environment fails without side effects.

use crate::bus::{provider_topic_arn, MessageBus};
use crate::config::UploadConfig;
use crate::error::Result;
use crate::license::{LicenseKeys, LicenseReturn, PoolUpdate};
use crate::locator::{load_timestamps, GranuleLocator};
use crate::object_store::ObjectStore;
use crate::report::{FailureReporter, RunErrorSummary};
use crate::store::ParameterStore;
use crate::upload::UploadPipeline;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Remote dependencies of a run
#[derive(Clone)]
pub struct Services {
    /// Parameter store
    pub store: Arc<dyn ParameterStore>,
    /// Granule object store
    pub objects: Arc<dyn ObjectStore>,
    /// Message bus
    pub bus: Arc<dyn MessageBus>,
}

impl Services {
    /// AWS-backed services
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            store: Arc::new(crate::store::SsmParameterStore::from_config(config)),
            objects: Arc::new(crate::object_store::S3ObjectStore::from_config(config)),
            bus: Arc::new(crate::bus::SnsMessageBus::from_config(config)),
        }
    }
}

/// Summary of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Complete granules found
    pub granules: usize,
    /// URIs of uploaded files
    pub uploaded: Vec<String>,
    /// CNM messages published
    pub published: usize,
    /// Pool state after license return, if this job returned licenses
    pub licenses: Option<PoolUpdate>,
}

/// Uploads one job's granules
pub struct UploadRun {
    config: UploadConfig,
    services: Services,
}

impl UploadRun {
    /// Create a run
    pub fn new(config: UploadConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Execute the run
    ///
    /// Returns [`UploaderError::RunFailed`](crate::error::UploaderError::RunFailed)
    /// after reporting if any granule failed, and other errors when a remote
    /// dependency or required input is unavailable.
    pub async fn execute(&self) -> Result<RunOutcome> {
        let start = Instant::now();
        let config = &self.config;

        let account = match self.services.store.require(&config.cross_account_key()).await {
            Ok(parameter) => parameter.value,
            Err(e) => {
                error!(error = %e, "Failed to obtain cross account identifier for Cumulus topic");
                return Err(e);
            }
        };
        let topic_arn = provider_topic_arn(&config.region, &account, &config.venue);

        let timestamps = load_timestamps(&config.input_json, config.job_index)?;
        info!(
            job_index = config.job_index,
            timestamps = timestamps.len(),
            dataset = %config.product.name,
            "Loaded job timestamps"
        );

        let located = GranuleLocator::new(&config.data_dir, config.product, config.processing)
            .locate(&timestamps);

        let pipeline = UploadPipeline::new(
            Arc::clone(&self.services.objects),
            Arc::clone(&self.services.bus),
            config.destination.clone(),
            config.product,
            &config.prefix,
            &topic_arn,
        );
        let report = pipeline.upload_all(&located.found).await;
        let publish_failures = pipeline
            .publish_notifications(&located.found, &report)
            .await?;

        let summary = RunErrorSummary {
            missing_checksum: located.missing.clone(),
            upload: report.failed(),
            publish: publish_failures,
        };
        if !summary.is_empty() {
            let reporter =
                FailureReporter::new(Arc::clone(&self.services.bus), config.alert_topic.clone());
            return Err(reporter.report(&summary).await);
        }

        let uploaded = report.uploaded_uris();
        let published = report.uploaded_data().count();
        let licenses = self.return_licenses().await?;

        info!(elapsed = ?start.elapsed(), "Total execution time");

        Ok(RunOutcome {
            granules: located.found.len(),
            uploaded,
            published,
            licenses,
        })
    }

    async fn return_licenses(&self) -> Result<Option<PoolUpdate>> {
        let Some(license) = &self.config.license else {
            return Ok(None);
        };

        if !license.terminating {
            info!("Not the last job of the batch, licenses stay reserved");
            return Ok(None);
        }

        let service = LicenseReturn::new(
            Arc::clone(&self.services.store),
            LicenseKeys::new(&self.config.prefix, self.config.product.name),
        )
        .with_lock_options(license.lock.acquire_options());

        service.return_licenses(&license.unique_id).await.map(Some)
    }
}
