//! Run ordinary request/response web applications on AWS Lambda.
//!
//! Lambda doesn't speak your application's synchronous request-handling
//! interface; it delivers one structured event per invocation and wants a
//! structured response back within the same call. This crate is the
//! bridge: it classifies the inbound event, builds the call frame your
//! [`WebApp`] expects, invokes it exactly once, and re-packs the result
//! into the envelope API Gateway (or an ALB) will accept — including the
//! compensations for the integration layer's historical constraints
//! around multi-value headers, cookies on redirects, and status routing.
//!
//! It also ships a task dispatcher: register plain functions at startup
//! and ask for them to run out of band, via a direct re-invocation or an
//! SNS topic, with an optional DynamoDB side channel for fetching results
//! later. Outside Lambda the same dispatch call just runs the task
//! in-process, so the whole path works on a laptop.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lambda_http::http::StatusCode;
//! use portico::{AppResponse, Bridge, CallFrame, Settings, TaskRegistry, WebApp};
//!
//! struct Hello;
//!
//! #[portico::async_trait]
//! impl WebApp for Hello {
//!     async fn call(&self, frame: CallFrame) -> anyhow::Result<AppResponse> {
//!         Ok(AppResponse::new(StatusCode::OK)
//!             .with_header("content-type", "text/plain")
//!             .with_body(format!("hello from {}", frame.path)))
//!     }
//! }
//!
//! fn nightly_report(_args: portico::TaskArgs) -> anyhow::Result<serde_json::Value> {
//!     Ok(serde_json::Value::Null)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lambda_runtime::Error> {
//!     let mut tasks = TaskRegistry::new();
//!     tasks.register("nightly_report", nightly_report);
//!
//!     let bridge = Bridge::init(Settings::load()?, tasks)
//!         .await?
//!         .with_app(Arc::new(Hello));
//!     portico::run(bridge).await
//! }
//! ```
//!
//! Responses are buffered, never streamed: buffered Lambdas are cheaper
//! and the gateway's response limit fits comfortably in memory. The size
//! guard turns anything bigger into a 413 rather than corrupting it.

use lambda_runtime::{service_fn, tracing, Context, Error, LambdaEvent};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

pub mod app;
pub mod capture;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod frame;
pub mod response;
pub mod settings;

pub use app::{AppResponse, ExceptionHandler, WebApp};
pub use async_trait::async_trait;
pub use capture::{
    CaptureStatus, CaptureStore, CapturedResponse, DynamoCaptureStore, MemoryCaptureStore,
};
pub use dispatch::{
    DispatchOptions, DispatchOutcome, Dispatcher, ExecutionContext, TaskArgs, TaskRegistry,
};
pub use error::BridgeError;
pub use event::{classify, HttpSource, InboundEvent, RequestDescriptor, TaskEnvelope};
pub use frame::CallFrame;
pub use response::ResponseEnvelope;
pub use settings::{AsyncTransport, Settings};

static TRACING: OnceCell<()> = OnceCell::new();

fn init_tracing() {
    TRACING.get_or_init(|| {
        tracing_log::LogTracer::init().ok();
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false) // don't print the module name
            .without_time() // don't print time (CloudWatch has it)
            .try_init()
            .ok();
    });
}

/// Everything one deployed function needs to service invocations: the
/// hosted application, the task registry, the resolved settings, and the
/// dispatcher with its AWS clients. Built once at process start; shared
/// read-only by every invocation that lands on the warm process.
pub struct Bridge {
    app: Option<Arc<dyn WebApp>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    settings: Arc<Settings>,
    registry: Arc<TaskRegistry>,
    dispatcher: Dispatcher,
}

impl Bridge {
    /// Set up the bridge for a real deployment: AWS config from the
    /// environment, SDK clients, execution-context detection.
    pub async fn init(settings: Settings, registry: TaskRegistry) -> Result<Self, Error> {
        init_tracing();

        let config = aws_config::load_from_env().await;
        let settings = Arc::new(settings);
        let registry = Arc::new(registry);

        let capture: Option<Arc<dyn CaptureStore>> =
            settings.async_response_table.as_ref().map(|table| {
                Arc::new(DynamoCaptureStore::new(
                    aws_sdk_dynamodb::Client::new(&config),
                    table.clone(),
                )) as Arc<dyn CaptureStore>
            });

        let dispatcher = Dispatcher::new(
            registry.clone(),
            settings.clone(),
            ExecutionContext::detect(),
            Some(aws_sdk_lambda::Client::new(&config)),
            Some(aws_sdk_sns::Client::new(&config)),
            capture,
        );

        Ok(Bridge {
            app: None,
            exception_handler: None,
            settings,
            registry,
            dispatcher,
        })
    }

    /// Set up a bridge with no AWS clients: dispatch runs in-process and
    /// capture goes to memory. The same code path as production, minus
    /// the transports, which is what makes local testing honest.
    pub fn init_local(settings: Settings, registry: TaskRegistry) -> Self {
        init_tracing();

        let settings = Arc::new(settings);
        let registry = Arc::new(registry);

        let dispatcher = Dispatcher::new(
            registry.clone(),
            settings.clone(),
            ExecutionContext::Local,
            None,
            None,
            Some(Arc::new(MemoryCaptureStore::new())),
        );

        Bridge {
            app: None,
            exception_handler: None,
            settings,
            registry,
            dispatcher,
        }
    }

    pub fn with_app(mut self, app: Arc<dyn WebApp>) -> Self {
        self.app = Some(app);
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Service one invocation.
    ///
    /// HTTP-origin events always produce a well-formed envelope, whatever
    /// goes wrong inside — the gateway must never see a malformed payload.
    /// Non-HTTP events re-raise failures so Lambda's own retry/DLQ policy
    /// can apply, unless the configured exception handler suppresses that.
    pub async fn handle(&self, event: Value, context: Context) -> Result<Value, Error> {
        let inbound = match classify(&event) {
            Ok(inbound) => inbound,
            Err(error) => return self.fail(error, &event, &context).await,
        };

        match inbound {
            InboundEvent::Http(descriptor) => {
                let envelope = self.handle_http(descriptor, &event, &context).await;
                Ok(serde_json::to_value(envelope)?)
            }

            InboundEvent::Task(envelope) => {
                match self.dispatcher.run_envelope(&envelope).await {
                    Ok(value) => Ok(value),
                    Err(error) => self.fail(error, &event, &context).await,
                }
            }

            InboundEvent::Scheduled { resource } => {
                let key = event::scheduled_task_key(resource.as_deref(), &self.settings);
                match key.filter(|k| self.registry.contains(k)) {
                    Some(key) => {
                        self.run_task(&key, TaskArgs::event(event.clone()), &event, &context)
                            .await
                    }
                    None => {
                        // A schedule with no task attached is a keep-warm
                        // ping; nothing to do is success.
                        tracing::debug!("scheduled event with no mapped task");
                        Ok(json!({}))
                    }
                }
            }

            InboundEvent::Records { records } => {
                let Some(first) = records.first() else {
                    return self
                        .fail(BridgeError::UnrecognizedEventKind, &event, &context)
                        .await;
                };

                // Topic-transport task envelopes ride inside SNS records.
                if let Some(envelope) = event::record_task_envelope(first) {
                    return match self.dispatcher.run_envelope(&envelope).await {
                        Ok(value) => Ok(value),
                        Err(error) => self.fail(error, &event, &context).await,
                    };
                }

                match event::record_task_key(first, &self.settings) {
                    Some(key) => {
                        self.run_task(&key, TaskArgs::event(event.clone()), &event, &context)
                            .await
                    }
                    None => {
                        tracing::error!("no task mapped for the triggering event source");
                        self.fail(
                            BridgeError::UnknownTask("<unmapped event source>".to_owned()),
                            &event,
                            &context,
                        )
                        .await
                    }
                }
            }

            InboundEvent::Direct { function, payload } => {
                self.run_task(&function, TaskArgs::event(payload), &event, &context)
                    .await
            }

            InboundEvent::KeepWarm => Ok(json!({})),
        }
    }

    async fn handle_http(
        &self,
        descriptor: RequestDescriptor,
        raw_event: &Value,
        context: &Context,
    ) -> ResponseEnvelope {
        let started = Instant::now();
        let source = descriptor.source;
        let method = descriptor.method.clone();
        let path = descriptor.path.clone();

        let outcome = match frame::build_frame(&descriptor, &self.settings) {
            Err(error) => Err(error),
            Ok(frame) => match &self.app {
                None => Err(BridgeError::App(anyhow::anyhow!(
                    "no application is configured on this bridge"
                ))),
                Some(app) => app::invoke(app.as_ref(), frame).await,
            },
        };

        let envelope = match outcome {
            Ok(app_response) => response::encode(app_response, source, &self.settings),
            Err(error) => {
                // Consulted for observability only: the envelope is
                // returned regardless, so there is nothing to suppress.
                self.process_exception(&error, raw_event, context).await;
                response::error_envelope(&error, source, &self.settings)
            }
        };

        tracing::info!(
            %method,
            %path,
            status = envelope.status_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request complete"
        );

        envelope
    }

    /// Run a registry task for a non-HTTP event.
    async fn run_task(
        &self,
        key: &str,
        args: TaskArgs,
        raw_event: &Value,
        context: &Context,
    ) -> Result<Value, Error> {
        let Some(task) = self.registry.get(key) else {
            return self
                .fail(BridgeError::UnknownTask(key.to_owned()), raw_event, context)
                .await;
        };

        match task(args) {
            Ok(value) => {
                tracing::debug!(task = %key, "task complete");
                Ok(value)
            }
            Err(error) => self.fail(BridgeError::App(error), raw_event, context).await,
        }
    }

    /// Route a non-HTTP failure through the exception handler, then either
    /// swallow it (the handler said so) or re-raise it to the runtime.
    async fn fail(
        &self,
        error: BridgeError,
        event: &Value,
        context: &Context,
    ) -> Result<Value, Error> {
        tracing::error!(error = %error, "invocation failed");

        if self.process_exception(&error, event, context).await {
            return Ok(Value::Null);
        }

        Err(error.into())
    }

    async fn process_exception(
        &self,
        error: &BridgeError,
        event: &Value,
        context: &Context,
    ) -> bool {
        match &self.exception_handler {
            Some(handler) => handler.handle(error, event, context).await,
            None => false,
        }
    }
}

/// Hand the bridge to the Lambda runtime and serve invocations until the
/// process is reaped.
pub async fn run(bridge: Bridge) -> Result<(), Error> {
    let bridge = &bridge;

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        let (payload, context) = event.into_parts();
        bridge.handle(payload, context).await
    }))
    .await
}
