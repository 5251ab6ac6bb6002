//! Message bus (SNS)

use crate::error::{Result, UploaderError};
use async_trait::async_trait;
use aws_sdk_sns::Client as SnsClient;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Publishes messages to topics
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish `message` to `topic_arn`
    async fn publish(&self, topic_arn: &str, message: &str, subject: Option<&str>) -> Result<()>;

    /// ARNs of all topics visible to the caller
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// First topic whose ARN contains `token`
    async fn find_topic(&self, token: &str) -> Result<String> {
        self.list_topics()
            .await?
            .into_iter()
            .find(|arn| arn.contains(token))
            .ok_or_else(|| UploaderError::TopicNotFound(token.to_string()))
    }
}

/// ARN of the cross-account provider input topic for a venue
pub fn provider_topic_arn(region: &str, account: &str, venue: &str) -> String {
    format!(
        "arn:aws:sns:{region}:{account}:{}",
        provider_topic_name(venue)
    )
}

/// Name of the provider input topic for a venue
pub fn provider_topic_name(venue: &str) -> String {
    format!("podaac-{venue}-cumulus-throttled-provider-input-sns")
}

/// SNS-backed message bus
pub struct SnsMessageBus {
    client: SnsClient,
}

impl SnsMessageBus {
    /// Create a bus from an SNS client
    pub fn new(client: SnsClient) -> Self {
        Self { client }
    }

    /// Create a bus from AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(SnsClient::new(config))
    }
}

#[async_trait]
impl MessageBus for SnsMessageBus {
    async fn publish(&self, topic_arn: &str, message: &str, subject: Option<&str>) -> Result<()> {
        let response = self
            .client
            .publish()
            .topic_arn(topic_arn)
            .message(message)
            .set_subject(subject.map(str::to_string))
            .send()
            .await
            .map_err(UploaderError::from_sns)?;

        debug!(topic = %topic_arn, message_id = ?response.message_id(), "Message published");
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_topics()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(UploaderError::from_sns)?;

            arns.extend(
                response
                    .topics()
                    .iter()
                    .filter_map(|t| t.topic_arn().map(str::to_string)),
            );

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(arns)
    }
}

/// A message captured by [`MemoryMessageBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target topic
    pub topic_arn: String,
    /// Message body
    pub message: String,
    /// Optional subject
    pub subject: Option<String>,
}

/// In-memory message bus for testing
///
/// Publishes whose body contains a registered marker fail.
#[derive(Debug, Default, Clone)]
pub struct MemoryMessageBus {
    topics: Arc<Mutex<Vec<String>>>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    fail_markers: Arc<Mutex<Vec<String>>>,
}

impl MemoryMessageBus {
    /// Create a bus with the given topics
    pub fn with_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bus = Self::default();
        bus.topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(topics.into_iter().map(Into::into));
        bus
    }

    /// Fail any publish whose body contains `marker`
    pub fn fail_when_contains(&self, marker: impl Into<String>) {
        self.fail_markers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(marker.into());
    }

    /// Messages published so far
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Messages published to `topic_arn`
    pub fn published_to(&self, topic_arn: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic_arn == topic_arn)
            .collect()
    }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn publish(&self, topic_arn: &str, message: &str, subject: Option<&str>) -> Result<()> {
        let rejected = self
            .fail_markers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|marker| message.contains(marker.as_str()));
        if rejected {
            return Err(UploaderError::MessageBus(format!(
                "AuthorizationError: publish to {topic_arn} denied"
            )));
        }

        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PublishedMessage {
                topic_arn: topic_arn.to_string(),
                message: message.to_string(),
                subject: subject.map(str::to_string),
            });
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self.topics.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}
