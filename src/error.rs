//! The bridge error taxonomy.
//!
//! Everything that can go wrong between the raw invocation payload and the
//! response envelope is funneled into [`BridgeError`] so the encoder never
//! has to reason about error propagation: HTTP-path failures are converted
//! into well-formed envelopes before they reach the runtime, while
//! non-HTTP-path failures are re-raised so Lambda's own retry/DLQ policy
//! can apply.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The invocation payload matched none of the known event fingerprints.
    #[error("unrecognized event kind")]
    UnrecognizedEventKind,

    /// A body that declared itself base64-encoded failed to decode.
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    /// A response or dispatch payload exceeds the integration limit.
    #[error("payload is {size} bytes but the limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The hosted application returned an error from its handler.
    #[error("application error: {0}")]
    App(#[source] anyhow::Error),

    /// No task is registered under the requested key.
    #[error("no task registered under `{0}`")]
    UnknownTask(String),

    /// Task arguments could not be serialized for the wire.
    #[error("task arguments failed to serialize: {0}")]
    DispatchSerialization(#[from] serde_json::Error),

    /// The dispatch transport refused or failed the send.
    #[error("dispatch transport: {0}")]
    Transport(String),

    /// The response capture store failed a put or get.
    #[error("capture store: {0}")]
    Capture(String),
}

impl BridgeError {
    /// The outward HTTP status this error maps to on the HTTP path.
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::PayloadTooLarge { .. } => 413,
            _ => 500,
        }
    }
}
