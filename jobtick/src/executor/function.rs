//! The `function_call` strategy: named, in-process handlers.
use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::{ExecutionError, Perform};
use crate::job::config::FunctionCallConfig;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A function a `function_call` job can invoke by name.
///
/// Implemented for any async closure taking the job's `parameters`:
///
/// ```
/// # use jobtick::executor::function::{FunctionRegistry, HandlerError};
/// let registry = FunctionRegistry::new().register("purge_cache", |params: serde_json::Value| async move {
///     let _region = params["region"].as_str().unwrap_or("all");
///     Ok::<_, HandlerError>(())
/// });
/// assert!(registry.contains("purge_cache"));
/// ```
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, parameters: Value) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> FunctionHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn call(&self, parameters: Value) -> Result<(), HandlerError> {
        (self)(parameters).await
    }
}

/// The set of functions available to `function_call` jobs.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any handler already registered there.
    pub fn register(
        mut self,
        name: impl Into<String>,
        handler: impl FunctionHandler + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

#[async_trait]
impl Perform<FunctionCallConfig> for FunctionRegistry {
    async fn perform(&self, config: &FunctionCallConfig) -> Result<(), ExecutionError> {
        let handler = self
            .handlers
            .get(&config.function_name)
            .ok_or_else(|| ExecutionError::UnknownFunction(config.function_name.clone()))?;

        tracing::debug!(function = %config.function_name, "Executing function {}", config.function_name);

        handler
            .call(config.parameters.clone())
            .await
            .map_err(|source| ExecutionError::Function {
                name: config.function_name.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::error::to_display_string;

    fn call(name: &str, parameters: Value) -> FunctionCallConfig {
        FunctionCallConfig {
            function_name: name.to_owned(),
            parameters,
        }
    }

    #[tokio::test]
    async fn invokes_registered_handler_with_parameters() {
        let total = Arc::new(AtomicU64::new(0));
        let registry = FunctionRegistry::new().register("add", {
            let total = total.clone();
            move |params: Value| {
                let total = total.clone();
                async move {
                    total.fetch_add(params["n"].as_u64().unwrap_or(0), Ordering::SeqCst);
                    Ok::<_, HandlerError>(())
                }
            }
        });

        registry.perform(&call("add", json!({"n": 4}))).await.unwrap();
        registry.perform(&call("add", json!({"n": 3}))).await.unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn unknown_function() {
        let registry = FunctionRegistry::new();

        assert_matches!(
            registry.perform(&call("missing", Value::Null)).await,
            Err(ExecutionError::UnknownFunction(name)) if name == "missing"
        );
    }

    #[tokio::test]
    async fn handler_failure_keeps_its_message() {
        let registry = FunctionRegistry::new().register("explode", |_: Value| async {
            Err::<(), HandlerError>("disk on fire".into())
        });

        let error = registry
            .perform(&call("explode", Value::Null))
            .await
            .unwrap_err();

        assert_eq!(
            to_display_string(&error),
            "Function `explode` failed: disk on fire"
        );
    }
}
