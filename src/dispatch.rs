//! The asynchronous task dispatcher.
//!
//! Application code registers plain functions in a [`TaskRegistry`] at
//! process start, then asks the [`Dispatcher`] to run one out of band.
//! Outside the managed runtime the task simply runs in-process and returns
//! its value, which keeps the whole code path testable on a laptop. Inside
//! the runtime the dispatcher serializes a [`TaskEnvelope`] and either
//! re-invokes the deployed function directly (fire and forget) or
//! publishes to the task topic; the second invocation lands back in the
//! event normalizer, which recognizes the envelope tag and routes it here
//! instead of the HTTP leg.
//!
//! The dispatcher provides no deduplication. Some transports redeliver
//! at-least-once; tasks that need exactly-once semantics must be
//! idempotent themselves.

use lambda_runtime::tracing;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::capture::{CaptureStatus, CaptureStore, CAPTURE_TTL_SECONDS};
use crate::error::BridgeError;
use crate::event::{TaskEnvelope, TASK_COMMAND};
use crate::settings::{AsyncTransport, Settings};

/// Serialized envelope ceiling for both transports, in bytes. Validated
/// before any transport interaction; an oversized dispatch fails fast and
/// is never partially sent.
pub const PAYLOAD_LIMIT: usize = 256_000;

/// Positional and named arguments for one task call. Event-driven
/// invocations arrive as `args = [raw event]`, `kwargs = {}`.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        TaskArgs {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn event(payload: Value) -> Self {
        Self::positional(vec![payload])
    }
}

/// A registrable task: a plain function pointer, no closures or bound
/// state, so every key resolves identically in every process.
pub type TaskFn = fn(TaskArgs) -> anyhow::Result<Value>;

/// Stable string key -> task function, populated once at process start.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, task: TaskFn) -> &mut Self {
        self.tasks.insert(key.into(), task);
        self
    }

    pub fn get(&self, key: &str) -> Option<TaskFn> {
        self.tasks.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }
}

/// Where this process is executing. Threaded through as a value so tests
/// can exercise both modes deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    /// No managed runtime detected; dispatch degenerates to a synchronous
    /// in-process call.
    Local,
    /// Running inside Lambda as the named function.
    Lambda { function_name: String },
}

impl ExecutionContext {
    /// Detect from the standard runtime environment.
    pub fn detect() -> Self {
        match std::env::var("AWS_LAMBDA_FUNCTION_NAME") {
            Ok(function_name) => ExecutionContext::Lambda { function_name },
            Err(_) => ExecutionContext::Local,
        }
    }
}

/// Per-call dispatch options.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Override the settings-level transport.
    pub transport: Option<AsyncTransport>,
    /// Send to a different deployed function than our own.
    pub remote_function: Option<String>,
    /// Record the task's result in the capture store.
    pub capture_response: bool,
}

/// What a dispatch call produced.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Local mode: the task ran synchronously; here is its value.
    Completed(Value),
    /// Remote mode: the envelope left the building.
    Dispatched {
        /// Set when capture was requested and configured; poll the capture
        /// store with this.
        response_id: Option<String>,
        /// The topic message id, for the topic transport.
        message_id: Option<String>,
    },
}

pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    settings: Arc<Settings>,
    execution: ExecutionContext,
    lambda: Option<aws_sdk_lambda::Client>,
    sns: Option<aws_sdk_sns::Client>,
    capture: Option<Arc<dyn CaptureStore>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        settings: Arc<Settings>,
        execution: ExecutionContext,
        lambda: Option<aws_sdk_lambda::Client>,
        sns: Option<aws_sdk_sns::Client>,
        capture: Option<Arc<dyn CaptureStore>>,
    ) -> Self {
        Dispatcher {
            registry,
            settings,
            execution,
            lambda,
            sns,
            capture,
        }
    }

    pub fn capture_store(&self) -> Option<&Arc<dyn CaptureStore>> {
        self.capture.as_ref()
    }

    /// Request out-of-band execution of a registered task.
    pub async fn dispatch(
        &self,
        task_path: &str,
        args: TaskArgs,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome, BridgeError> {
        if !self.registry.contains(task_path) {
            return Err(BridgeError::UnknownTask(task_path.to_owned()));
        }

        let function_name = match &self.execution {
            ExecutionContext::Local => {
                // Same code path as the remote callee, minus the transport.
                let envelope = self.build_envelope(task_path, args, &options)?;
                let value = self.run_envelope(&envelope).await?;
                return Ok(DispatchOutcome::Completed(value));
            }
            ExecutionContext::Lambda { function_name } => function_name.clone(),
        };

        let envelope = self.build_envelope(task_path, args, &options)?;
        let payload = serde_json::to_vec(&envelope)?;
        if payload.len() > PAYLOAD_LIMIT {
            return Err(BridgeError::PayloadTooLarge {
                size: payload.len(),
                limit: PAYLOAD_LIMIT,
            });
        }

        let transport = options.transport.unwrap_or(self.settings.async_transport);
        let target = options.remote_function.unwrap_or(function_name);

        let message_id = match transport {
            AsyncTransport::Lambda => {
                self.send_direct(&target, payload).await?;
                None
            }
            AsyncTransport::Sns => Some(self.send_topic(payload).await?),
        };

        Ok(DispatchOutcome::Dispatched {
            response_id: envelope.response_id,
            message_id,
        })
    }

    /// Callee side: run the task named by an envelope, recording progress
    /// in the capture store when asked to.
    pub async fn run_envelope(&self, envelope: &TaskEnvelope) -> Result<Value, BridgeError> {
        let task = self
            .registry
            .get(&envelope.task_path)
            .ok_or_else(|| BridgeError::UnknownTask(envelope.task_path.clone()))?;

        let capture = match (&envelope.response_id, &self.capture) {
            (Some(id), Some(store)) if envelope.capture_response => Some((id.clone(), store)),
            _ => None,
        };

        if let Some((id, store)) = &capture {
            store
                .put(id, CaptureStatus::InProgress, &Value::from("N/A"), CAPTURE_TTL_SECONDS)
                .await?;
        }

        let args = TaskArgs {
            args: envelope.args.clone(),
            kwargs: envelope.kwargs.clone(),
        };

        match task(args) {
            Ok(value) => {
                if let Some((id, store)) = &capture {
                    store
                        .put(id, CaptureStatus::Complete, &value, CAPTURE_TTL_SECONDS)
                        .await?;
                }
                Ok(value)
            }
            Err(error) => {
                tracing::error!(task = %envelope.task_path, error = format!("{error:#}"), "task failed");
                if let Some((id, store)) = &capture {
                    store
                        .put(
                            id,
                            CaptureStatus::Error,
                            &Value::from(format!("{error:#}")),
                            CAPTURE_TTL_SECONDS,
                        )
                        .await?;
                }
                Err(BridgeError::App(error))
            }
        }
    }

    fn build_envelope(
        &self,
        task_path: &str,
        args: TaskArgs,
        options: &DispatchOptions,
    ) -> Result<TaskEnvelope, BridgeError> {
        let response_id = if options.capture_response {
            if self.settings.async_response_table.is_none() && self.capture.is_none() {
                tracing::warn!(
                    "capture requested but no capture store is configured; \
                     the response will not be recorded"
                );
                None
            } else {
                Some(Uuid::new_v4().to_string())
            }
        } else {
            None
        };

        Ok(TaskEnvelope {
            command: TASK_COMMAND.to_owned(),
            task_path: task_path.to_owned(),
            args: args.args,
            kwargs: args.kwargs,
            capture_response: options.capture_response && response_id.is_some(),
            response_id,
        })
    }

    async fn send_direct(&self, target: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let client = self
            .lambda
            .as_ref()
            .ok_or_else(|| BridgeError::Transport("no lambda client configured".to_owned()))?;

        let result = client
            .invoke()
            .function_name(target)
            .invocation_type(aws_sdk_lambda::types::InvocationType::Event)
            .payload(aws_sdk_lambda::primitives::Blob::new(payload))
            .send()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        // Event-type invokes acknowledge with 202.
        if result.status_code() != 202 {
            return Err(BridgeError::Transport(format!(
                "unexpected invoke status {}",
                result.status_code()
            )));
        }

        Ok(())
    }

    async fn send_topic(&self, payload: Vec<u8>) -> Result<String, BridgeError> {
        let client = self
            .sns
            .as_ref()
            .ok_or_else(|| BridgeError::Transport("no sns client configured".to_owned()))?;

        let topic = self
            .settings
            .task_topic_arn
            .as_ref()
            .ok_or_else(|| BridgeError::Transport("task_topic_arn is not configured".to_owned()))?;

        let message = String::from_utf8(payload)
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        let result = client
            .publish()
            .target_arn(topic.as_str())
            .message(message)
            .send()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        result
            .message_id()
            .map(str::to_owned)
            .ok_or_else(|| BridgeError::Transport("publish returned no message id".to_owned()))
    }
}
