//! Notification sinks.
//!
//! Notifications are best effort: the caller logs a failed publish and moves
//! on, nothing is retried.

use crate::config::AwsConfig;
use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::Client as SnsClient;
use thiserror::Error;
use tracing::{debug, info};

/// SNS rejects subjects longer than this
pub const MAX_SUBJECT_LEN: usize = 100;

/// Errors raised while publishing a notification
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },
}

/// A destination for audit notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish one message
    async fn publish(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Publishes notifications to an SNS topic
pub struct SnsNotifier {
    client: SnsClient,
    topic_arn: String,
}

impl SnsNotifier {
    /// Create a notifier for `topic_arn`
    pub async fn new(config: &AwsConfig, topic_arn: impl Into<String>) -> Self {
        let sdk_config = config.load_sdk_config().await;
        let topic_arn = topic_arn.into();

        info!(topic_arn = %topic_arn, region = %config.region, "SNS notifier initialized");

        Self {
            client: SnsClient::new(&sdk_config),
            topic_arn,
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn publish(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(sns_subject(subject))
            .message(body)
            .send()
            .await
            .map_err(|e| NotifyError::Publish {
                topic: self.topic_arn.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(
            topic_arn = %self.topic_arn,
            message_id = ?response.message_id(),
            "Notification published"
        );
        Ok(())
    }
}

/// Writes notifications to the log instead of publishing them. Used when no
/// topic is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(subject = %subject, body = %body, "Notification");
        Ok(())
    }
}

/// Clamp a subject to what SNS accepts: printable ASCII on a single line, at
/// most [`MAX_SUBJECT_LEN`] characters.
pub fn sns_subject(subject: &str) -> String {
    subject
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { ' ' })
        .take(MAX_SUBJECT_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}
