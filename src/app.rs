//! The application seam and the invoker boundary.
//!
//! The hosted application implements [`WebApp`]; the bridge calls it
//! exactly once per invocation. Retries, if any, belong to the Lambda
//! runtime and are none of our business. Whatever comes back — a response
//! or an error — is converted into a typed outcome *here*, so the encoder
//! downstream never has to reason about error propagation.

use async_trait::async_trait;
use lambda_http::http::header::{HeaderMap, HeaderName, HeaderValue};
use lambda_http::http::StatusCode;
use lambda_runtime::{tracing, Context};
use serde_json::Value;

use crate::error::BridgeError;
use crate::frame::CallFrame;

/// The raw `(status, headers, body)` an application produces.
#[derive(Debug, Clone)]
pub struct AppResponse {
    pub status: StatusCode,
    /// Case-insensitive, multi-value aware; `append` preserves the order
    /// of repeated names like `Set-Cookie`.
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl AppResponse {
    pub fn new(status: StatusCode) -> Self {
        AppResponse {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header, keeping any values already present for the name.
    /// Invalid names or values are ignored rather than panicking inside an
    /// application handler.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }
}

/// A hosted request/response web application.
///
/// `call` receives one fully-built [`CallFrame`] per invocation and must
/// produce the complete response; the bridge never streams to the gateway,
/// so buffering the body is the right move.
#[async_trait]
pub trait WebApp: Send + Sync {
    async fn call(&self, frame: CallFrame) -> anyhow::Result<AppResponse>;
}

/// Optional collaborator consulted when an invocation fails.
///
/// Returning `true` suppresses re-raising to the runtime on non-HTTP
/// paths, which in turn prevents Lambda's automatic retry of the event.
#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    async fn handle(&self, error: &BridgeError, event: &Value, context: &Context) -> bool;
}

/// Call the application exactly once, converting any failure into the
/// typed [`BridgeError::App`] variant.
pub async fn invoke(app: &dyn WebApp, frame: CallFrame) -> Result<AppResponse, BridgeError> {
    let method = frame.method.clone();
    let path = frame.path.clone();

    match app.call(frame).await {
        Ok(response) => Ok(response),
        Err(error) => {
            tracing::error!(%method, %path, error = format!("{error:#}"), "application handler failed");
            Err(BridgeError::App(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{HttpSource, RequestDescriptor};
    use crate::frame::build_frame;
    use crate::settings::Settings;
    use anyhow::anyhow;
    use std::collections::BTreeMap;

    struct Fixed(StatusCode);

    #[async_trait]
    impl WebApp for Fixed {
        async fn call(&self, _frame: CallFrame) -> anyhow::Result<AppResponse> {
            Ok(AppResponse::new(self.0).with_body("ok"))
        }
    }

    struct Failing;

    #[async_trait]
    impl WebApp for Failing {
        async fn call(&self, _frame: CallFrame) -> anyhow::Result<AppResponse> {
            Err(anyhow!("boom"))
        }
    }

    fn frame() -> CallFrame {
        let desc = RequestDescriptor {
            source: HttpSource::Gateway,
            method: "GET".to_owned(),
            path: "/".to_owned(),
            query: vec![],
            headers: vec![],
            body: None,
            is_base64_encoded: false,
            source_ip: None,
            stage_variables: BTreeMap::new(),
            authorizer: serde_json::Map::new(),
            remote_user: None,
        };
        build_frame(&desc, &Settings::default()).unwrap()
    }

    #[tokio::test]
    async fn success_passes_through() {
        let resp = invoke(&Fixed(StatusCode::OK), frame()).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"ok");
    }

    #[tokio::test]
    async fn failure_becomes_typed_app_error() {
        let err = invoke(&Failing, frame()).await.unwrap_err();
        assert!(matches!(err, BridgeError::App(_)));
    }

    #[test]
    fn repeated_headers_accumulate() {
        let resp = AppResponse::new(StatusCode::OK)
            .with_header("set-cookie", "a=1")
            .with_header("set-cookie", "b=2");
        assert_eq!(resp.headers.get_all("set-cookie").iter().count(), 2);
    }
}
