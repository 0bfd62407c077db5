//! Typed job configurations.
//!
//! A job's config is persisted as JSON text. Before execution it is decoded into the
//! [`JobConfig`] variant matching the job's [`JobType`], so a config of the wrong shape fails
//! with a [`ConfigError`] instead of surfacing deep inside an execution strategy.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::JobType;

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("config must be a JSON object, found {found}")]
    NotAMapping { found: &'static str },
    #[error("config does not match job type {job_type}: {source}")]
    Shape {
        job_type: JobType,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported HTTP method `{0}`")]
    HttpMethod(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, alias = "data")]
    pub body: Option<Value>,
    /// Timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
}

fn default_method() -> String {
    "GET".to_owned()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

impl HttpRequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallConfig {
    #[serde(alias = "function_name")]
    pub function_name: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub to: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub message: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A decoded job config, one variant per [`JobType`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobConfig {
    HttpRequest(HttpRequestConfig),
    FunctionCall(FunctionCallConfig),
    Email(EmailConfig),
    Notification(NotificationConfig),
}

impl JobConfig {
    /// Decode stored config text for the given job type.
    pub fn parse(job_type: JobType, raw: &str) -> Result<Self, ConfigError> {
        Self::from_mapping(job_type, parse_mapping(raw)?)
    }

    /// Decode an in-memory config value for the given job type.
    pub fn from_value(job_type: JobType, value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(mapping) => Self::from_mapping(job_type, mapping),
            other => Err(ConfigError::NotAMapping {
                found: kind(&other),
            }),
        }
    }

    fn from_mapping(job_type: JobType, mapping: Map<String, Value>) -> Result<Self, ConfigError> {
        let value = Value::Object(mapping);
        let shape = |source| ConfigError::Shape { job_type, source };
        Ok(match job_type {
            JobType::HttpRequest => Self::HttpRequest(serde_json::from_value(value).map_err(shape)?),
            JobType::FunctionCall => {
                Self::FunctionCall(serde_json::from_value(value).map_err(shape)?)
            }
            JobType::Email => Self::Email(serde_json::from_value(value).map_err(shape)?),
            JobType::Notification => {
                Self::Notification(serde_json::from_value(value).map_err(shape)?)
            }
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::HttpRequest(_) => JobType::HttpRequest,
            Self::FunctionCall(_) => JobType::FunctionCall,
            Self::Email(_) => JobType::Email,
            Self::Notification(_) => JobType::Notification,
        }
    }

    /// The execution timeout requested by the config, if it carries one.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::HttpRequest(config) => Some(config.timeout()),
            _ => None,
        }
    }
}

/// Parse stored config text, requiring a JSON object.
pub(crate) fn parse_mapping(raw: &str) -> Result<Map<String, Value>, ConfigError> {
    match serde_json::from_str(raw).map_err(ConfigError::Malformed)? {
        Value::Object(mapping) => Ok(mapping),
        other => Err(ConfigError::NotAMapping {
            found: kind(&other),
        }),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
