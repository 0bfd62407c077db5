use serde_json::{json, Value};

use crate::{Scheduler, SchedulerError};

use super::{Job, JobType, NewJob};

/// Builds the definition of a new job.
///
/// ```
/// # use jobtick::prelude::*;
/// let job = JobBuilder::http_request("backup", "0 2 * * *", "https://example.com/backup")
///     .with_description("Nightly backup")
///     .with_max_retries(5)
///     .build();
///
/// assert_eq!(job.job_type, JobType::HttpRequest);
/// assert_eq!(job.config["url"], "https://example.com/backup");
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    name: String,
    description: Option<String>,
    cron_expression: String,
    job_type: JobType,
    config: Value,
    is_active: Option<bool>,
    max_retries: Option<u16>,
}

impl JobBuilder {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        job_type: JobType,
        config: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            cron_expression: cron_expression.into(),
            job_type,
            config,
            is_active: None,
            max_retries: None,
        }
    }

    /// A `GET` request to `url`. Use [`JobBuilder::with_config`] for anything more elaborate.
    pub fn http_request(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            cron_expression,
            JobType::HttpRequest,
            json!({ "url": url.into() }),
        )
    }

    pub fn function_call(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        function_name: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self::new(
            name,
            cron_expression,
            JobType::FunctionCall,
            json!({ "functionName": function_name.into(), "parameters": parameters }),
        )
    }

    pub fn email(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            cron_expression,
            JobType::Email,
            json!({ "to": to.into() }),
        )
    }

    pub fn notification(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            cron_expression,
            JobType::Notification,
            json!({ "message": message.into() }),
        )
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }

    /// Replace the whole config.
    pub fn with_config(self, config: Value) -> Self {
        Self { config, ..self }
    }

    /// Set a single config key.
    pub fn with_config_value(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Value::Object(config) = &mut self.config {
            config.insert(key.into(), value);
        }
        self
    }

    pub fn with_max_retries(self, max_retries: u16) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    /// Create the job switched off.
    pub fn inactive(self) -> Self {
        Self {
            is_active: Some(false),
            ..self
        }
    }

    pub fn build(self) -> NewJob {
        NewJob {
            name: self.name,
            description: self.description,
            cron_expression: self.cron_expression,
            job_type: self.job_type,
            config: self.config,
            is_active: self.is_active,
            max_retries: self.max_retries,
        }
    }

    /// Validate and store the job with `scheduler`.
    pub async fn create(self, scheduler: &Scheduler) -> Result<Job, SchedulerError> {
        scheduler.create(self.build()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{job::JobStatus, store::memory::InMemoryJobStore, testing::StubExecutor};

    #[test]
    fn function_call_uses_wire_names() {
        let job = JobBuilder::function_call("cleanup", "0 * * * *", "purge", json!({"days": 7}))
            .with_config_value("note", json!("weekly"))
            .inactive()
            .build();

        assert_eq!(
            job.config,
            json!({"functionName": "purge", "parameters": {"days": 7}, "note": "weekly"})
        );
        assert_eq!(job.is_active, Some(false));
        assert_eq!(job.max_retries, None);
    }

    #[tokio::test]
    async fn create() {
        let scheduler = Scheduler::new(InMemoryJobStore::new(), Arc::new(StubExecutor::succeeding()));

        let job = JobBuilder::email("report", "30 8 * * 1", "ops@example.com")
            .with_max_retries(1)
            .create(&scheduler)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, 1);
        assert!(job.next_execution_at.is_some());
    }
}
