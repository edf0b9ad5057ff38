//! The event normalizer.
//!
//! Lambda hands us one opaque JSON payload per invocation, and the shape of
//! that payload depends entirely on who invoked us: API Gateway's proxy
//! integration, an ALB target group, a CloudWatch schedule, an event-source
//! record batch, our own task dispatcher, or somebody running `aws lambda
//! invoke` by hand. Everything downstream pattern-matches on the
//! [`InboundEvent`] union built here, instead of probing the raw JSON for
//! key presence over and over.
//!
//! Classification is a pure mapping with no side effects. Fingerprints are
//! checked in a fixed priority order; the shapes are mutually exclusive in
//! practice, so the order only matters for garbage input, which ends up as
//! `UnrecognizedEventKind`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::BridgeError;
use crate::settings::Settings;

/// Wire tag marking an invocation as dispatcher-originated. The normalizer
/// accepts exactly this value; any other `command` is an unknown task.
pub const TASK_COMMAND: &str = "portico.tasks.run";

/// Which HTTP front end produced a request. ALB events carry single-value
/// header maps and want `statusDescription` on the way out, so the encoder
/// needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpSource {
    Gateway,
    Alb,
}

/// Canonical, source-agnostic view of an HTTP invocation. Built fresh per
/// invocation and owned by the current call stack; never persisted.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub source: HttpSource,
    pub method: String,
    pub path: String,
    /// Multi-value aware, per-key value order preserved.
    pub query: Vec<(String, String)>,
    /// Multi-value aware, per-name value order preserved.
    pub headers: Vec<(String, Vec<String>)>,
    pub body: Option<String>,
    pub is_base64_encoded: bool,
    pub source_ip: Option<String>,
    pub stage_variables: BTreeMap<String, String>,
    pub authorizer: Map<String, Value>,
    /// Authorizer principal or caller ARN, when an authorizer is attached.
    pub remote_user: Option<String>,
}

/// The serialized envelope a dispatched task travels in, for both the
/// direct-invoke and topic transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub command: String,
    pub task_path: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub capture_response: bool,
    #[serde(default)]
    pub response_id: Option<String>,
}

/// One inbound invocation, classified.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Http(RequestDescriptor),
    Task(TaskEnvelope),
    Scheduled {
        /// The triggering rule ARN, when present.
        resource: Option<String>,
    },
    Records {
        records: Vec<Value>,
    },
    Direct {
        function: String,
        payload: Value,
    },
    /// An empty `{}` payload: a keep-warm ping. Acknowledged without
    /// touching the application.
    KeepWarm,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpEventShape {
    http_method: String,
    path: String,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    multi_value_headers: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    query_string_parameters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    multi_value_query_string_parameters: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    is_base64_encoded: bool,
    #[serde(default)]
    request_context: RequestContextShape,
    #[serde(default)]
    stage_variables: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RequestContextShape {
    #[serde(default)]
    elb: Option<Value>,
    #[serde(default)]
    authorizer: Option<Map<String, Value>>,
    #[serde(default)]
    identity: Option<IdentityShape>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct IdentityShape {
    #[serde(default)]
    source_ip: Option<String>,
    #[serde(default)]
    user_arn: Option<String>,
}

/// Classify a raw invocation payload.
pub fn classify(event: &Value) -> Result<InboundEvent, BridgeError> {
    let Some(obj) = event.as_object() else {
        return Err(BridgeError::UnrecognizedEventKind);
    };

    // Dispatcher envelope. Any other `command` value is somebody else's
    // protocol; refuse it rather than guessing.
    if let Some(command) = obj.get("command").and_then(Value::as_str) {
        if command != TASK_COMMAND {
            return Err(BridgeError::UnknownTask(command.to_owned()));
        }
        let envelope: TaskEnvelope = serde_json::from_value(event.clone())?;
        return Ok(InboundEvent::Task(envelope));
    }

    // Scheduled rule firing (also the keep-warm vehicle in real
    // deployments).
    let detail_type = obj.get("detail-type").and_then(Value::as_str);
    let source = obj.get("source").and_then(Value::as_str);
    if detail_type == Some("Scheduled Event") || source == Some("aws.events") {
        let resource = obj
            .get("resources")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .map(str::to_owned);
        return Ok(InboundEvent::Scheduled { resource });
    }

    // Event-source record batch (S3, SNS, SQS, DynamoDB streams, Kinesis).
    if let Some(records) = obj.get("Records").and_then(Value::as_array) {
        return Ok(InboundEvent::Records {
            records: records.clone(),
        });
    }

    // HTTP call, proxied by API Gateway or an ALB.
    if obj.contains_key("httpMethod") {
        let shape: HttpEventShape = serde_json::from_value(event.clone())
            .map_err(|_| BridgeError::UnrecognizedEventKind)?;
        return Ok(InboundEvent::Http(descriptor_from_shape(shape)));
    }

    // Direct invocation of a named function with an arbitrary payload.
    if let Some(function) = obj.get("function").and_then(Value::as_str) {
        let payload = obj.get("payload").cloned().unwrap_or(Value::Null);
        return Ok(InboundEvent::Direct {
            function: function.to_owned(),
            payload,
        });
    }

    if obj.is_empty() {
        return Ok(InboundEvent::KeepWarm);
    }

    Err(BridgeError::UnrecognizedEventKind)
}

/// Merge the single-value and multi-value maps into one ordered,
/// multi-value-aware sequence. The multi-value map wins for names present
/// in both, since its value lists are a superset; values beyond the first
/// are never dropped.
fn merge_multi(
    single: Option<BTreeMap<String, String>>,
    multi: Option<BTreeMap<String, Vec<String>>>,
) -> Vec<(String, Vec<String>)> {
    let mut merged: Vec<(String, Vec<String>)> = Vec::new();
    let single = single.unwrap_or_default();
    let mut multi = multi.unwrap_or_default();

    for (name, value) in single {
        match multi.remove(&name) {
            Some(values) => merged.push((name, values)),
            None => merged.push((name, vec![value])),
        }
    }

    for (name, values) in multi {
        merged.push((name, values));
    }

    merged
}

fn descriptor_from_shape(shape: HttpEventShape) -> RequestDescriptor {
    let source = if shape.request_context.elb.is_some() {
        HttpSource::Alb
    } else {
        HttpSource::Gateway
    };

    let headers = merge_multi(shape.headers, shape.multi_value_headers);

    let query = merge_multi(
        shape.query_string_parameters,
        shape.multi_value_query_string_parameters,
    )
    .into_iter()
    .flat_map(|(name, values)| values.into_iter().map(move |v| (name.clone(), v)))
    .collect();

    let authorizer = shape
        .request_context
        .authorizer
        .clone()
        .unwrap_or_default();

    // Prefer the authorizer's principal; fall back to the caller identity.
    let remote_user = authorizer
        .get("principalId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            shape
                .request_context
                .identity
                .as_ref()
                .and_then(|i| i.user_arn.clone())
        });

    let source_ip = shape
        .request_context
        .identity
        .as_ref()
        .and_then(|i| i.source_ip.clone());

    RequestDescriptor {
        source,
        method: shape.http_method,
        path: shape.path,
        query,
        headers,
        body: shape.body,
        is_base64_encoded: shape.is_base64_encoded,
        source_ip,
        stage_variables: shape.stage_variables.unwrap_or_default(),
        authorizer,
        remote_user,
    }
}

/// Pull a task envelope out of an SNS record, if it carries one. Topic-
/// transport dispatches arrive this way: the envelope rides in the record's
/// `Message` field.
pub fn record_task_envelope(record: &Value) -> Option<TaskEnvelope> {
    let message = record.get("Sns")?.get("Message")?.as_str()?;
    let envelope: TaskEnvelope = serde_json::from_str(message).ok()?;
    (envelope.command == TASK_COMMAND).then_some(envelope)
}

/// Resolve the task key a record batch maps to, using the configured
/// event-source mappings. S3 notifications use the configuration-id suffix
/// convention; everything else goes by source ARN.
pub fn record_task_key(record: &Value, settings: &Settings) -> Option<String> {
    if let Some(s3) = record.get("s3") {
        if let Some(config_id) = s3.get("configurationId").and_then(Value::as_str) {
            if let Some((_, key)) = config_id.rsplit_once(':') {
                return Some(key.to_owned());
            }
        }
        if let Some(arn) = s3
            .get("bucket")
            .and_then(|b| b.get("arn"))
            .and_then(Value::as_str)
        {
            return settings.event_mappings.get(arn).cloned();
        }
    }

    let arn = if let Some(sns) = record.get("Sns") {
        sns.get("TopicArn").and_then(Value::as_str)
    } else {
        record.get("eventSourceARN").and_then(Value::as_str)
    };

    arn.and_then(|arn| settings.event_mappings.get(arn).cloned())
}

/// Resolve the task key a scheduled rule maps to. Explicit mappings win;
/// otherwise the trailing dash-segment of the rule name is tried, which is
/// how the deployment tooling names per-task rules.
pub fn scheduled_task_key(resource: Option<&str>, settings: &Settings) -> Option<String> {
    let resource = resource?;

    if let Some(key) = settings.event_mappings.get(resource) {
        return Some(key.clone());
    }

    let rule_name = resource.rsplit('/').next()?;
    rule_name.rsplit('-').next().map(str::to_owned)
}
