//! Performing the side effect a job describes.
//!
//! An [`Executor`] takes a [`Job`] and reports success or an [`ExecutionError`]. It never
//! touches the job record itself; recording the outcome is the lifecycle controller's job.
//!
//! [`JobExecutor`] is the default implementation. It decodes the job's config and hands it to
//! the strategy registered for the job's type:
//!
//! - `http_request` → [`http::HttpExecutor`],
//! - `function_call` → [`function::FunctionRegistry`],
//! - `email` and `notification` → a [`messaging::Messenger`].
//!
//! A job whose type has no registered strategy fails with
//! [`ExecutionError::UnsupportedJobType`].
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    error::render_payload,
    job::{
        config::{
            ConfigError, EmailConfig, FunctionCallConfig, HttpRequestConfig, JobConfig,
            NotificationConfig,
        },
        Job, JobType,
    },
};

pub mod function;
pub mod http;
pub mod messaging;

use function::FunctionRegistry;
use http::HttpExecutor;
use messaging::{LogMessenger, Messenger};

const ERROR_TYPE_CONFIG: &str = "config";
const ERROR_TYPE_HTTP: &str = "http";
const ERROR_TYPE_UNKNOWN_FUNCTION: &str = "unknown_function";
const ERROR_TYPE_FUNCTION: &str = "function";
const ERROR_TYPE_DELIVERY: &str = "delivery";
const ERROR_TYPE_TIMEOUT: &str = "timeout";
const ERROR_TYPE_UNSUPPORTED: &str = "unsupported_job_type";
const ERROR_TYPE_PANIC: &str = "panic";

/// Why an execution attempt failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Invalid job config: {0}")]
    Config(#[from] ConfigError),
    #[error("HTTP request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP request to {url} returned status {status}{}", .body.as_ref().map(|body| format!(": {}", render_payload(body))).unwrap_or_default())]
    HttpStatus {
        url: String,
        status: u16,
        body: Option<serde_json::Value>,
    },
    #[error("No function registered under the name `{0}`")]
    UnknownFunction(String),
    #[error("Function `{name}` failed")]
    Function {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Failed to deliver {channel}: {message}")]
    Delivery {
        channel: &'static str,
        message: String,
    },
    #[error("Job failed to complete within timeout: {0:?}")]
    Timeout(Duration),
    #[error("Unsupported job type: {0}")]
    UnsupportedJobType(JobType),
    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// A short, stable identifier of the kind of failure, for logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => ERROR_TYPE_CONFIG,
            Self::Http { .. } | Self::HttpStatus { .. } => ERROR_TYPE_HTTP,
            Self::UnknownFunction(_) => ERROR_TYPE_UNKNOWN_FUNCTION,
            Self::Function { .. } => ERROR_TYPE_FUNCTION,
            Self::Delivery { .. } => ERROR_TYPE_DELIVERY,
            Self::Timeout(_) => ERROR_TYPE_TIMEOUT,
            Self::UnsupportedJobType(_) => ERROR_TYPE_UNSUPPORTED,
            Self::Panicked(_) => ERROR_TYPE_PANIC,
        }
    }
}

impl From<tokio::task::JoinError> for ExecutionError {
    fn from(value: tokio::task::JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panicked(message)
    }
}

/// Runs a job's side effect.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), ExecutionError>;

    /// The longest a single execution of `job` may take.
    ///
    /// When this returns [`None`] the scheduler's default timeout applies.
    fn timeout(&self, job: &Job) -> Option<Duration> {
        job.typed_config().ok().and_then(|config| config.timeout())
    }
}

#[async_trait]
impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    async fn execute(&self, job: &Job) -> Result<(), ExecutionError> {
        (**self).execute(job).await
    }

    fn timeout(&self, job: &Job) -> Option<Duration> {
        (**self).timeout(job)
    }
}

/// Performs one kind of external effect described by a config of type `C`.
#[async_trait]
pub trait Perform<C>: Send + Sync {
    async fn perform(&self, config: &C) -> Result<(), ExecutionError>;
}

/// The default [`Executor`], dispatching on the job's type.
#[derive(Clone, Default)]
pub struct JobExecutor {
    http: Option<Arc<dyn Perform<HttpRequestConfig>>>,
    functions: Option<Arc<dyn Perform<FunctionCallConfig>>>,
    email: Option<Arc<dyn Perform<EmailConfig>>>,
    notification: Option<Arc<dyn Perform<NotificationConfig>>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("http", &self.http.is_some())
            .field("functions", &self.functions.is_some())
            .field("email", &self.email.is_some())
            .field("notification", &self.notification.is_some())
            .finish()
    }
}

impl JobExecutor {
    /// An executor supporting every job type: HTTP via [`HttpExecutor`], functions from
    /// `functions`, and email and notifications recorded by [`LogMessenger`].
    pub fn new(functions: FunctionRegistry) -> Self {
        let messenger = Arc::new(LogMessenger);
        Self::empty()
            .with_http(HttpExecutor::default())
            .with_functions(functions)
            .with_messenger(messenger)
    }

    /// An executor with no strategies registered.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_http(self, http: impl Perform<HttpRequestConfig> + 'static) -> Self {
        Self {
            http: Some(Arc::new(http)),
            ..self
        }
    }

    pub fn with_functions(self, functions: impl Perform<FunctionCallConfig> + 'static) -> Self {
        Self {
            functions: Some(Arc::new(functions)),
            ..self
        }
    }

    /// Use `messenger` for both email and notification jobs.
    pub fn with_messenger<M>(self, messenger: Arc<M>) -> Self
    where
        M: Messenger + 'static,
    {
        Self {
            email: Some(messenger.clone()),
            notification: Some(messenger),
            ..self
        }
    }

    pub fn with_email(self, email: impl Perform<EmailConfig> + 'static) -> Self {
        Self {
            email: Some(Arc::new(email)),
            ..self
        }
    }

    pub fn with_notification(
        self,
        notification: impl Perform<NotificationConfig> + 'static,
    ) -> Self {
        Self {
            notification: Some(Arc::new(notification)),
            ..self
        }
    }
}

#[async_trait]
impl Executor for JobExecutor {
    async fn execute(&self, job: &Job) -> Result<(), ExecutionError> {
        let unsupported = || ExecutionError::UnsupportedJobType(job.job_type);
        match job.typed_config()? {
            JobConfig::HttpRequest(config) => {
                self.http.as_ref().ok_or_else(unsupported)?.perform(&config).await
            }
            JobConfig::FunctionCall(config) => {
                self.functions
                    .as_ref()
                    .ok_or_else(unsupported)?
                    .perform(&config)
                    .await
            }
            JobConfig::Email(config) => {
                self.email.as_ref().ok_or_else(unsupported)?.perform(&config).await
            }
            JobConfig::Notification(config) => {
                self.notification
                    .as_ref()
                    .ok_or_else(unsupported)?
                    .perform(&config)
                    .await
            }
        }
    }
}
