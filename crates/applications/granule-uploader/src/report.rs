//! End-of-run failure reporting
//!
//! Missing checksums, failed uploads and failed publishes are collected over
//! the whole run and sent as one operational alert. Reporting always ends
//! the run with an error: [`FailureReporter::report`] returns
//! [`UploaderError::RunFailed`] when the alert went out, or the error that
//! prevented it.

use crate::bus::MessageBus;
use crate::error::UploaderError;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Failures accumulated over one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunErrorSummary {
    /// Data files without a checksum sidecar
    pub missing_checksum: Vec<PathBuf>,
    /// Files that failed to upload
    pub upload: Vec<PathBuf>,
    /// Granule identifiers whose notification failed to publish
    pub publish: Vec<String>,
}

impl RunErrorSummary {
    /// Total number of failed items
    pub fn len(&self) -> usize {
        self.missing_checksum.len() + self.upload.len() + self.publish.len()
    }

    /// Whether the run had no failures
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Alert body, one section per non-empty category
    pub fn render(&self) -> String {
        let mut message = String::new();

        if !self.missing_checksum.is_empty() {
            message.push_str("\n\nThe following L2P granule files are missing checksums...\n");
            message.push_str(&join_paths(&self.missing_checksum));
        }

        if !self.upload.is_empty() {
            message.push_str(
                "\n\nThe following L2P granule files failed to upload to S3 bucket...\n",
            );
            message.push_str(&join_paths(&self.upload));
        }

        if !self.publish.is_empty() {
            message.push_str(
                "\n\nThe following L2P granule NetCDF and checksum files failed to be \
                 published to the Cumulus Topic...\n",
            );
            message.push_str(&self.publish.join("\n"));
        }

        message
    }

    /// Terminal error for this summary
    pub fn to_error(&self) -> UploaderError {
        UploaderError::RunFailed {
            missing_checksum: self.missing_checksum.len(),
            upload: self.upload.len(),
            publish: self.publish.len(),
        }
    }

    fn log(&self) {
        for path in &self.missing_checksum {
            error!(path = %path.display(), "Missing checksum file");
        }
        for path in &self.upload {
            error!(path = %path.display(), "Failed to upload to S3");
        }
        for identifier in &self.publish {
            error!(identifier = %identifier, "Failed to publish to cumulus topic");
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Alert subject for a report sent at `now`
pub fn alert_subject(now: DateTime<Utc>) -> String {
    format!(
        "UPLOADER: L2P granule failures {}",
        now.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Sends the end-of-run failure alert
pub struct FailureReporter {
    bus: Arc<dyn MessageBus>,
    topic_token: Option<String>,
}

impl FailureReporter {
    /// Create a reporter that alerts the first topic containing `topic_token`
    pub fn new(bus: Arc<dyn MessageBus>, topic_token: Option<String>) -> Self {
        Self { bus, topic_token }
    }

    /// Log and publish the summary, then hand back the error that ends the run
    pub async fn report(&self, summary: &RunErrorSummary) -> UploaderError {
        summary.log();

        let Some(token) = self.topic_token.as_deref() else {
            error!("No alert topic configured, failure report not sent");
            return UploaderError::config("alert topic token is not set (TOPIC)");
        };

        let topic_arn = match self.bus.find_topic(token).await {
            Ok(arn) => arn,
            Err(e) => {
                error!(token = %token, error = %e, "Could not resolve alert topic");
                return e;
            }
        };

        let subject = alert_subject(Utc::now());
        if let Err(e) = self
            .bus
            .publish(&topic_arn, &summary.render(), Some(&subject))
            .await
        {
            error!(topic = %topic_arn, error = %e, "Failed to publish to SNS topic");
            return e;
        }

        info!(topic = %topic_arn, "Message published to SNS topic");
        summary.to_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryMessageBus;
    use chrono::TimeZone;

    const ALERTS: &str = "arn:aws:sns:us-west-2:1:gen-batch-job-failure";

    fn summary() -> RunErrorSummary {
        RunErrorSummary {
            missing_checksum: vec![PathBuf::from("/d/a.nc")],
            upload: vec![PathBuf::from("/d/b.nc"), PathBuf::from("/d/b.nc.md5")],
            publish: vec!["c".to_string()],
        }
    }

    #[test]
    fn test_render_sections() {
        let body = summary().render();
        let expected = "\n\nThe following L2P granule files are missing checksums...\n/d/a.nc\
            \n\nThe following L2P granule files failed to upload to S3 bucket...\n/d/b.nc\n/d/b.nc.md5\
            \n\nThe following L2P granule NetCDF and checksum files failed to be published to the Cumulus Topic...\nc";
        assert_eq!(body, expected);
    }

    #[test]
    fn test_render_skips_empty_sections() {
        let only_upload = RunErrorSummary {
            upload: vec![PathBuf::from("/d/b.nc")],
            ..Default::default()
        };
        let body = only_upload.render();
        assert!(!body.contains("missing checksums"));
        assert!(!body.contains("Cumulus Topic"));
        assert!(body.ends_with("/d/b.nc"));
        assert_eq!(only_upload.len(), 1);
    }

    #[test]
    fn test_subject() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        assert_eq!(alert_subject(now), "UPLOADER: L2P granule failures 2024-03-09 04:05:06");
    }

    #[tokio::test]
    async fn test_report_publishes_and_fails_run() {
        let bus = MemoryMessageBus::with_topics(["arn:aws:sns:us-west-2:1:unrelated", ALERTS]);
        let reporter = FailureReporter::new(Arc::new(bus.clone()), Some("batch-job-failure".into()));

        let err = reporter.report(&summary()).await;

        assert!(matches!(
            err,
            UploaderError::RunFailed {
                missing_checksum: 1,
                upload: 2,
                publish: 1
            }
        ));
        let sent = bus.published_to(ALERTS);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.as_deref().unwrap().starts_with("UPLOADER: L2P granule failures"));
    }

    #[tokio::test]
    async fn test_report_without_matching_topic() {
        let bus = MemoryMessageBus::with_topics(["arn:aws:sns:us-west-2:1:unrelated"]);
        let reporter = FailureReporter::new(Arc::new(bus.clone()), Some("batch-job-failure".into()));

        let err = reporter.report(&summary()).await;

        assert!(matches!(err, UploaderError::TopicNotFound(_)));
        assert!(err.is_fatal());
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_report_publish_failure() {
        let bus = MemoryMessageBus::with_topics([ALERTS]);
        bus.fail_when_contains("missing checksums");
        let reporter = FailureReporter::new(Arc::new(bus.clone()), Some("batch-job-failure".into()));

        let err = reporter.report(&summary()).await;
        assert!(matches!(err, UploaderError::MessageBus(_)));
    }

    #[tokio::test]
    async fn test_report_without_token() {
        let bus = MemoryMessageBus::with_topics([ALERTS]);
        let reporter = FailureReporter::new(Arc::new(bus), None);

        assert!(matches!(reporter.report(&summary()).await, UploaderError::Config(_)));
    }
}
