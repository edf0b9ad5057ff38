//! The call-frame builder.
//!
//! Takes the canonical [`RequestDescriptor`] and produces the
//! [`CallFrame`] the hosted application actually sees: normalized header
//! casing, decoded body bytes, a resolved client address, and a path
//! relative to the application's own root regardless of where the gateway
//! mounted it. Derivation is deterministic and 1:1; nothing here is
//! shared or persisted.

use lambda_http::http::header::{HeaderMap, HeaderName, HeaderValue};
use lambda_http::http::Method;
use lambda_runtime::tracing;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::BridgeError;
use crate::event::RequestDescriptor;
use crate::settings::Settings;

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// The request representation handed to the application's handler.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub method: Method,
    /// Percent-decoded path, relative to the application root.
    pub path: String,
    /// Ordered query pairs, multi-value aware.
    pub query: Vec<(String, String)>,
    /// Lowercased names; duplicate names keep all values in arrival order.
    pub headers: HeaderMap,
    /// Decoded body bytes.
    pub body: Vec<u8>,
    /// Resolved client address (see the trust-boundary rules).
    pub remote_addr: String,
    /// Authorizer principal or caller identity, when present.
    pub remote_user: Option<String>,
    /// The prefix stripped from the incoming path, if any.
    pub mount: String,
    /// Always `https` on this substrate.
    pub scheme: &'static str,
    pub server_port: String,
    pub stage_variables: BTreeMap<String, String>,
}

impl CallFrame {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    /// First value for a header name, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Build the call frame for one HTTP invocation.
pub fn build_frame(desc: &RequestDescriptor, settings: &Settings) -> Result<CallFrame, BridgeError> {
    let method = Method::from_bytes(desc.method.as_bytes())
        .map_err(|_| BridgeError::UnrecognizedEventKind)?;

    let mut headers = HeaderMap::new();
    for (name, values) in &desc.headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = %name, "dropping malformed header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.append(header_name.clone(), v);
                }
                Err(_) => {
                    tracing::warn!(header = %name, "dropping malformed header value");
                }
            }
        }
    }

    // Selected authorizer-context values become header-like metadata under
    // configured names, so the application can make authorization decisions
    // without re-parsing the raw event.
    for (header_name, context_key) in &settings.context_header_mappings {
        let Some(value) = context_value(&desc.authorizer, context_key) else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header_name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.append(name, value);
        }
    }

    let (path, mount) = resolve_path(desc, settings, &headers);

    let body = decode_body(desc)?;

    let remote_addr = resolve_remote_addr(desc, settings, &headers);

    let server_port = headers
        .get("x-forwarded-port")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("443")
        .to_owned();

    Ok(CallFrame {
        method,
        path,
        query: desc.query.clone(),
        headers,
        body,
        remote_addr,
        remote_user: desc.remote_user.clone(),
        mount,
        scheme: "https",
        server_port,
        stage_variables: desc.stage_variables.clone(),
    })
}

/// Percent-decode then strip the mount prefix. When no custom domain is
/// configured and the request arrived on the bare amazonaws.com host, the
/// visible URL includes the API stage, so the stage acts as the mount.
fn resolve_path(
    desc: &RequestDescriptor,
    settings: &Settings,
    headers: &HeaderMap,
) -> (String, String) {
    let path = percent_decode(&desc.path);

    let mut mount = String::new();

    if let Some(base_path) = &settings.base_path {
        let prefix = if base_path.starts_with('/') {
            base_path.clone()
        } else {
            format!("/{base_path}")
        };
        if let Some(rest) = path.strip_prefix(&prefix) {
            let rest = if rest.starts_with('/') {
                rest.to_owned()
            } else {
                format!("/{rest}")
            };
            return (rest, prefix);
        }
    }

    if settings.domain.is_none() {
        let host = headers.get("host").and_then(|v| v.to_str().ok());
        if host.map(|h| h.contains("amazonaws.com")).unwrap_or(false) {
            // The event path excludes the stage, but URLs generated by the
            // application must include it. Expose it as the mount.
            mount = format!("/{}", settings.api_stage);
        }
    }

    (path, mount)
}

/// Client address resolution. The forwarded-for chain is attacker-supplied
/// unless the gateway is explicitly trusted as a proxy, in which case the
/// second-from-last hop is the real client (the last is the gateway's own
/// edge).
fn resolve_remote_addr(
    desc: &RequestDescriptor,
    settings: &Settings,
    headers: &HeaderMap,
) -> String {
    if settings.trust_forwarded_for {
        if let Some(chain) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let hops: Vec<&str> = chain.split(',').map(str::trim).filter(|h| !h.is_empty()).collect();
            if hops.len() >= 2 {
                return hops[hops.len() - 2].to_owned();
            }
            if let Some(first) = hops.first() {
                return (*first).to_owned();
            }
        }
    }

    desc.source_ip.clone().unwrap_or_else(|| "127.0.0.1".to_owned())
}

fn decode_body(desc: &RequestDescriptor) -> Result<Vec<u8>, BridgeError> {
    match (&desc.body, desc.is_base64_encoded) {
        (None, _) => Ok(Vec::new()),
        (Some(body), false) => Ok(body.clone().into_bytes()),
        (Some(body), true) => STANDARD
            .decode(body.as_bytes())
            .map_err(|e| BridgeError::MalformedBody(e.to_string())),
    }
}

/// Look up a possibly-dotted key in the authorizer context.
fn context_value(authorizer: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    let mut current = authorizer.get(key.split('.').next()?)?;
    for segment in key.split('.').skip(1) {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HttpSource;

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor {
            source: HttpSource::Gateway,
            method: "POST".to_owned(),
            path: "/users/7".to_owned(),
            query: vec![("tag".to_owned(), "a".to_owned()), ("tag".to_owned(), "b".to_owned())],
            headers: vec![
                ("Content-Type".to_owned(), vec!["application/json".to_owned()]),
                ("X-Thing".to_owned(), vec!["one".to_owned(), "two".to_owned()]),
            ],
            body: Some(r#"{"n": 1}"#.to_owned()),
            is_base64_encoded: false,
            source_ip: Some("203.0.113.9".to_owned()),
            stage_variables: BTreeMap::new(),
            authorizer: serde_json::Map::new(),
            remote_user: None,
        }
    }

    #[test]
    fn multi_value_headers_round_trip_in_order() {
        let frame = build_frame(&descriptor(), &Settings::default()).unwrap();
        let values: Vec<_> = frame
            .headers
            .get_all("x-thing")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[test]
    fn body_and_derived_fields() {
        let frame = build_frame(&descriptor(), &Settings::default()).unwrap();
        assert_eq!(frame.method, Method::POST);
        assert_eq!(frame.content_type(), Some("application/json"));
        assert_eq!(frame.content_length(), 8);
        assert_eq!(frame.body, br#"{"n": 1}"#);
    }

    #[test]
    fn base64_body_decodes() {
        let mut desc = descriptor();
        desc.body = Some(STANDARD.encode(b"\x00\x01binary"));
        desc.is_base64_encoded = true;
        let frame = build_frame(&desc, &Settings::default()).unwrap();
        assert_eq!(frame.body, b"\x00\x01binary");
    }

    #[test]
    fn invalid_base64_is_malformed_body() {
        let mut desc = descriptor();
        desc.body = Some("not-base64!!!".to_owned());
        desc.is_base64_encoded = true;
        assert!(matches!(
            build_frame(&desc, &Settings::default()),
            Err(BridgeError::MalformedBody(_))
        ));
    }

    #[test]
    fn base_path_is_stripped() {
        let mut desc = descriptor();
        desc.path = "/prod/users/7".to_owned();
        let settings = Settings {
            base_path: Some("/prod".to_owned()),
            ..Settings::default()
        };
        let frame = build_frame(&desc, &settings).unwrap();
        assert_eq!(frame.path, "/users/7");
        assert_eq!(frame.mount, "/prod");
    }

    #[test]
    fn stage_becomes_mount_on_bare_host() {
        let mut desc = descriptor();
        desc.headers.push((
            "Host".to_owned(),
            vec!["abc123.execute-api.us-east-1.amazonaws.com".to_owned()],
        ));
        let settings = Settings {
            api_stage: "production".to_owned(),
            ..Settings::default()
        };
        let frame = build_frame(&desc, &settings).unwrap();
        assert_eq!(frame.mount, "/production");
        assert_eq!(frame.path, "/users/7");
    }

    #[test]
    fn percent_encoded_paths_decode() {
        let mut desc = descriptor();
        desc.path = "/files/a%20b%2Fc".to_owned();
        let frame = build_frame(&desc, &Settings::default()).unwrap();
        assert_eq!(frame.path, "/files/a b/c");
    }

    #[test]
    fn forged_forwarded_for_is_ignored_by_default() {
        let mut desc = descriptor();
        desc.headers.push((
            "X-Forwarded-For".to_owned(),
            vec!["6.6.6.6, 198.51.100.1, 10.0.0.1".to_owned()],
        ));
        let frame = build_frame(&desc, &Settings::default()).unwrap();
        assert_eq!(frame.remote_addr, "203.0.113.9");
    }

    #[test]
    fn forwarded_for_honored_when_trusted() {
        let mut desc = descriptor();
        desc.headers.push((
            "X-Forwarded-For".to_owned(),
            vec!["6.6.6.6, 198.51.100.1, 10.0.0.1".to_owned()],
        ));
        let settings = Settings {
            trust_forwarded_for: true,
            ..Settings::default()
        };
        let frame = build_frame(&desc, &settings).unwrap();
        // Second-from-last hop: the last entry is the gateway's own edge.
        assert_eq!(frame.remote_addr, "198.51.100.1");
    }

    #[test]
    fn authorizer_context_maps_to_headers() {
        let mut desc = descriptor();
        desc.authorizer
            .insert("scope".to_owned(), Value::String("admin".to_owned()));
        let mut settings = Settings::default();
        settings
            .context_header_mappings
            .insert("x-auth-scope".to_owned(), "scope".to_owned());
        let frame = build_frame(&desc, &settings).unwrap();
        assert_eq!(frame.header("x-auth-scope"), Some("admin"));
    }
}
