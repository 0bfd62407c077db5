//! The `email` and `notification` strategies.
//!
//! Both are delivered through a [`Messenger`]. [`LogMessenger`] only records the message, which
//! is enough for development and for deployments where delivery happens elsewhere.
//! [`WebhookMessenger`] forwards each message to an HTTP endpoint.
use async_trait::async_trait;
use serde::Serialize;

use super::{ExecutionError, Perform};
use crate::job::config::{EmailConfig, NotificationConfig};

const CHANNEL_EMAIL: &str = "email";
const CHANNEL_NOTIFICATION: &str = "notification";

/// Delivers the messages described by `email` and `notification` jobs.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_email(&self, email: &EmailConfig) -> Result<(), ExecutionError>;

    async fn send_notification(
        &self,
        notification: &NotificationConfig,
    ) -> Result<(), ExecutionError>;
}

#[async_trait]
impl<M> Perform<EmailConfig> for M
where
    M: Messenger,
{
    async fn perform(&self, config: &EmailConfig) -> Result<(), ExecutionError> {
        self.send_email(config).await
    }
}

#[async_trait]
impl<M> Perform<NotificationConfig> for M
where
    M: Messenger,
{
    async fn perform(&self, config: &NotificationConfig) -> Result<(), ExecutionError> {
        self.send_notification(config).await
    }
}

/// Records messages in the log without delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send_email(&self, email: &EmailConfig) -> Result<(), ExecutionError> {
        tracing::info!(
            to = %email.to,
            subject = email.subject.as_deref().unwrap_or_default(),
            "Sending email to {}",
            email.to
        );
        Ok(())
    }

    async fn send_notification(
        &self,
        notification: &NotificationConfig,
    ) -> Result<(), ExecutionError> {
        tracing::info!(
            channel = notification.channel.as_deref().unwrap_or_default(),
            "Sending notification: {}",
            notification.message
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    kind: &'static str,
    #[serde(flatten)]
    message: &'a T,
}

/// Posts every message as JSON to a single endpoint.
///
/// The request body is the message's config with an added `kind` field of either `"email"` or
/// `"notification"`. Anything other than a 2xx response is a delivery failure.
#[derive(Debug, Clone)]
pub struct WebhookMessenger {
    client: reqwest::Client,
    url: String,
}

impl WebhookMessenger {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn deliver<T>(&self, channel: &'static str, message: &T) -> Result<(), ExecutionError>
    where
        T: Serialize + Sync,
    {
        let delivery_failed = |message: String| ExecutionError::Delivery { channel, message };

        let response = self
            .client
            .post(&self.url)
            .json(&Envelope {
                kind: channel,
                message,
            })
            .send()
            .await
            .map_err(|err| delivery_failed(crate::error::to_display_string(&err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(delivery_failed(format!(
                "{} responded with status {}",
                self.url,
                status.as_u16()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for WebhookMessenger {
    async fn send_email(&self, email: &EmailConfig) -> Result<(), ExecutionError> {
        self.deliver(CHANNEL_EMAIL, email).await
    }

    async fn send_notification(
        &self,
        notification: &NotificationConfig,
    ) -> Result<(), ExecutionError> {
        self.deliver(CHANNEL_NOTIFICATION, notification).await
    }
}
