//! The resolved deployment configuration consumed by the bridge.
//!
//! How these values get *produced* — settings files, CLI flags, remote
//! overrides — is the deployment tooling's problem. By the time a Lambda
//! process starts, everything has been flattened into one JSON document
//! that we read exactly once and then share read-only across every
//! invocation that lands on the warm process.

use serde::Deserialize;
use std::collections::HashMap;

/// Environment variable naming the settings source: either a path to a
/// JSON file or an inline JSON document (detected by a leading `{`).
pub const SETTINGS_ENV_VAR: &str = "PORTICO_SETTINGS";

/// Transport used for fire-and-forget task dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncTransport {
    /// Direct `Invoke(InvocationType=Event)` on the target function.
    Lambda,
    /// Publish to the function's task topic.
    Sns,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// Render error detail into response bodies. Off in production so a 500
    /// never leaks internals.
    pub debug: bool,

    /// The API Gateway stage this deployment is mounted on.
    pub api_stage: String,

    /// Custom domain, if one is configured. When absent, requests arrive on
    /// the bare `*.amazonaws.com` host and the stage becomes part of the
    /// visible path.
    pub domain: Option<String>,

    /// Base path prefix to strip before the application sees the path.
    pub base_path: Option<String>,

    /// Trust the forwarded-for chain for client addresses. Leave off unless
    /// the gateway is the trust boundary.
    pub trust_forwarded_for: bool,

    /// Master switch for binary request/response handling.
    pub binary_support: bool,

    /// MIME types treated as binary on the response side. Supports
    /// `type/*` wildcards.
    pub binary_media_types: Vec<String>,

    /// The integration supports native `multiValueHeaders`. When set, the
    /// cookie-packing compensation is skipped entirely.
    pub multi_value_headers: bool,

    /// Private delimiter for the cookie-packing scheme.
    pub cookie_delimiter: String,

    /// Legacy compensation: smuggle the real status code through the body
    /// and pin the outward status to `smuggle_sentinel_status`.
    pub status_in_body: bool,

    /// Outward status used when `status_in_body` is on. The gateway-side
    /// mapping back to the real status is an external contract.
    pub smuggle_sentinel_status: u16,

    /// Hard cap on the outward body, in bytes. Larger bodies become a 413.
    pub max_response_bytes: usize,

    /// Frame header name -> authorizer-context key. Selected authorizer
    /// fields become header-like frame metadata under these names.
    pub context_header_mappings: HashMap<String, String>,

    /// Default transport for task dispatch.
    pub async_transport: AsyncTransport,

    /// DynamoDB table for captured task responses. Capture requests are
    /// ignored (with a warning) when unset.
    pub async_response_table: Option<String>,

    /// SNS topic receiving task envelopes for the `sns` transport.
    pub task_topic_arn: Option<String>,

    /// Event-source ARN (or S3 configuration id) -> task key, for record
    /// batches and scheduled rules.
    pub event_mappings: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            debug: false,
            api_stage: "production".to_owned(),
            domain: None,
            base_path: None,
            trust_forwarded_for: false,
            binary_support: true,
            binary_media_types: vec![
                "application/octet-stream".to_owned(),
                "application/pdf".to_owned(),
                "application/zip".to_owned(),
                "audio/*".to_owned(),
                "font/*".to_owned(),
                "image/*".to_owned(),
                "video/*".to_owned(),
            ],
            multi_value_headers: false,
            cookie_delimiter: "\u{1f}".to_owned(),
            status_in_body: false,
            smuggle_sentinel_status: 200,
            max_response_bytes: 6 * 1024 * 1024,
            context_header_mappings: HashMap::new(),
            async_transport: AsyncTransport::Lambda,
            async_response_table: None,
            task_topic_arn: None,
            event_mappings: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from the `PORTICO_SETTINGS` environment variable,
    /// falling back to the defaults when it is unset.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(SETTINGS_ENV_VAR) {
            Err(_) => Ok(Settings::default()),
            Ok(source) => Self::from_source(&source),
        }
    }

    fn from_source(source: &str) -> anyhow::Result<Self> {
        let text = if source.trim_start().starts_with('{') {
            source.to_owned()
        } else {
            std::fs::read_to_string(source)?
        };

        Ok(serde_json::from_str(&text)?)
    }

    /// Decide whether a declared content type is binary under the
    /// configured MIME policy. Deterministic given `(content_type, self)`.
    pub fn is_binary(&self, content_type: Option<&str>) -> bool {
        if !self.binary_support {
            return false;
        }

        let Some(content_type) = content_type else {
            return false;
        };

        // Parameters like `; charset=utf-8` don't participate.
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();

        self.binary_media_types.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                essence
                    .split('/')
                    .next()
                    .map(|t| t.eq_ignore_ascii_case(prefix))
                    .unwrap_or(false)
            } else {
                essence == pattern.to_ascii_lowercase()
            }
        })
    }
}
