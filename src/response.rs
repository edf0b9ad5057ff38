//! The response encoder.
//!
//! Re-packs the application's `(status, headers, body)` into the envelope
//! the integration layer will actually accept. Nearly all of the
//! protocol-compensation complexity lives here, because restrictive
//! integration configurations historically allow only one value per header
//! name, can't set headers on a 301/302, and route status codes through a
//! single fixed mapping. Each compensation below exists to survive one of
//! those constraints; when the integration advertises native multi-value
//! support we skip the lossy ones entirely.

use lambda_http::http::header::{HeaderMap, SET_COOKIE};
use lambda_http::http::StatusCode;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::app::AppResponse;
use crate::error::BridgeError;
use crate::event::HttpSource;
use crate::settings::Settings;

/// The structured response returned to the Lambda runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_value_headers: Option<BTreeMap<String, Vec<String>>>,
    pub body: String,
    pub is_base64_encoded: bool,
}

/// Encode one application response for the wire.
pub fn encode(response: AppResponse, source: HttpSource, settings: &Settings) -> ResponseEnvelope {
    // In restrictive (single-value) mode a redirect can't carry cookies,
    // so materialize it client-side first.
    let response = if settings.multi_value_headers {
        response
    } else {
        materialize_redirect(response)
    };

    let status = response.status.as_u16();
    let content_type = response
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let (status_code, body, is_base64_encoded) = if settings.status_in_body {
        let smuggled = smuggle_status(status, &response.body);
        (settings.smuggle_sentinel_status, smuggled, true)
    } else {
        let (body, is_base64_encoded) =
            encode_body(&response.body, content_type.as_deref(), settings);
        (status, body, is_base64_encoded)
    };

    if body.len() > settings.max_response_bytes {
        return payload_too_large(body.len(), source, settings);
    }

    let mut envelope = ResponseEnvelope {
        status_code,
        status_description: None,
        headers: None,
        multi_value_headers: None,
        body,
        is_base64_encoded,
    };

    if settings.multi_value_headers {
        envelope.multi_value_headers = Some(multi_value_header_map(&response.headers));
    } else {
        envelope.headers = Some(single_value_header_map(&response.headers, settings));
    }

    if source == HttpSource::Alb {
        envelope.status_description = Some(status_description(response.status));
    }

    envelope
}

/// Encode a bridge failure as a well-formed envelope. The gateway must
/// never receive a malformed payload, whatever went wrong inside.
pub fn error_envelope(
    error: &BridgeError,
    source: HttpSource,
    settings: &Settings,
) -> ResponseEnvelope {
    let status = error.status_code();

    let mut payload = json!({
        "message": "An uncaught exception happened while servicing this request."
    });
    if settings.debug {
        payload["detail"] = json!(format!("{error}"));
    }
    let body_bytes = payload.to_string().into_bytes();

    let (status_code, body, is_base64_encoded) = if settings.status_in_body {
        (
            settings.smuggle_sentinel_status,
            smuggle_status(status, &body_bytes),
            true,
        )
    } else {
        (status, String::from_utf8_lossy(&body_bytes).into_owned(), false)
    };

    let content_type = ("Content-Type".to_owned(), "application/json".to_owned());

    let mut envelope = ResponseEnvelope {
        status_code,
        status_description: None,
        headers: None,
        multi_value_headers: None,
        body,
        is_base64_encoded,
    };

    if settings.multi_value_headers {
        envelope.multi_value_headers =
            Some(BTreeMap::from([(content_type.0, vec![content_type.1])]));
    } else {
        envelope.headers = Some(BTreeMap::from([content_type]));
    }

    if source == HttpSource::Alb {
        envelope.status_description = StatusCode::from_u16(status)
            .ok()
            .map(status_description);
    }

    envelope
}

fn payload_too_large(size: usize, source: HttpSource, settings: &Settings) -> ResponseEnvelope {
    // Truncating would corrupt binary payloads; refuse instead.
    error_envelope(
        &BridgeError::PayloadTooLarge {
            size,
            limit: settings.max_response_bytes,
        },
        source,
        settings,
    )
}

/// A 301/302 that also sets cookies is rewritten to a 200 whose HTML body
/// performs the redirect client-side, because restrictive integrations
/// can't attach a cookie header to a redirect status. Only the
/// HTML-negotiated path is affected; binary and API responses pass
/// through. Idempotent: the rewritten response is a 200 and won't match
/// again.
pub fn materialize_redirect(response: AppResponse) -> AppResponse {
    let is_redirect = matches!(
        response.status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
    );
    if !is_redirect {
        return response;
    }

    if response.headers.get_all(SET_COOKIE).iter().next().is_none() {
        return response;
    }

    let html_negotiated = response
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/html"))
        // Redirects typically carry no body and no content type.
        .unwrap_or(true);
    if !html_negotiated {
        return response;
    }

    let Some(location) = response
        .headers
        .get("location")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return response;
    };

    let target = html_escape(&location);
    let body = format!(
        "<!DOCTYPE html>\n<html><head>\
         <meta http-equiv=\"refresh\" content=\"0;url={target}\">\
         </head><body>\
         <script>window.location.replace(\"{target}\");</script>\
         <a href=\"{target}\">Continue</a>\
         </body></html>"
    );

    let mut rewritten = AppResponse::new(StatusCode::OK).with_body(body);
    for (name, value) in response.headers.iter() {
        if matches!(name.as_str(), "content-type" | "location") {
            continue;
        }
        rewritten.headers.append(name.clone(), value.clone());
    }
    rewritten = rewritten.with_header("content-type", "text/html");
    rewritten
}

fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

/// Pack N cookie values into one header value: an integer count prefix, the
/// values joined by the private delimiter, base64 over the whole payload so
/// the delimiter may be any byte. Lossless and reversible given the same
/// delimiter.
pub fn pack_cookies(values: &[String], delimiter: &str) -> String {
    let joined = values.join(delimiter);
    let payload = format!("{}:{}", values.len(), joined);
    STANDARD.encode(payload.as_bytes())
}

/// Inverse of [`pack_cookies`].
pub fn unpack_cookies(packed: &str, delimiter: &str) -> Result<Vec<String>, BridgeError> {
    let decoded = STANDARD
        .decode(packed.as_bytes())
        .map_err(|e| BridgeError::MalformedBody(e.to_string()))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| BridgeError::MalformedBody(e.to_string()))?;

    let (count, joined) = text
        .split_once(':')
        .ok_or_else(|| BridgeError::MalformedBody("missing cookie count prefix".to_owned()))?;
    let count: usize = count
        .parse()
        .map_err(|_| BridgeError::MalformedBody("bad cookie count prefix".to_owned()))?;

    let values: Vec<String> = joined.split(delimiter).map(str::to_owned).collect();
    if values.len() != count {
        return Err(BridgeError::MalformedBody(format!(
            "cookie count mismatch: prefix says {count}, found {}",
            values.len()
        )));
    }

    Ok(values)
}

/// Prefix the body with the real status as three ASCII digits and base64
/// the result. The outward status is pinned to the configured sentinel;
/// mapping back is the gateway's regex contract, external to this crate.
pub fn smuggle_status(status: u16, body: &[u8]) -> String {
    let mut prefixed = format!("{status:03}").into_bytes();
    prefixed.extend_from_slice(body);
    STANDARD.encode(&prefixed)
}

/// Inverse of [`smuggle_status`], for tests and for integrations that
/// terminate the compensation themselves.
pub fn extract_smuggled_status(body: &str) -> Result<(u16, Vec<u8>), BridgeError> {
    let decoded = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| BridgeError::MalformedBody(e.to_string()))?;
    if decoded.len() < 3 {
        return Err(BridgeError::MalformedBody(
            "smuggled body shorter than the status prefix".to_owned(),
        ));
    }
    let status = std::str::from_utf8(&decoded[..3])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BridgeError::MalformedBody("bad smuggled status prefix".to_owned()))?;
    Ok((status, decoded[3..].to_vec()))
}

fn encode_body(body: &[u8], content_type: Option<&str>, settings: &Settings) -> (String, bool) {
    if settings.is_binary(content_type) {
        return (STANDARD.encode(body), true);
    }

    match std::str::from_utf8(body) {
        Ok(text) => (text.to_owned(), false),
        // Not declared binary but not valid text either; base64 is the
        // only lossless way out.
        Err(_) => (STANDARD.encode(body), true),
    }
}

fn multi_value_header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();
        map.insert(name.as_str().to_owned(), values);
    }
    map
}

/// Single-value emission. Cookies fold into one packed value; other
/// repeated names comma-join, which HTTP defines as equivalent.
fn single_value_header_map(headers: &HeaderMap, settings: &Settings) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();

        let value = if *name == SET_COOKIE && values.len() > 1 {
            pack_cookies(&values, &settings.cookie_delimiter)
        } else {
            values.join(", ")
        };
        map.insert(name.as_str().to_owned(), value);
    }
    map
}

fn status_description(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambda_http::http::StatusCode;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn text_response_passes_through() {
        let resp = AppResponse::new(StatusCode::OK)
            .with_header("content-type", "text/plain")
            .with_body("hello");
        let env = encode(resp, HttpSource::Gateway, &settings());
        assert_eq!(env.status_code, 200);
        assert_eq!(env.body, "hello");
        assert!(!env.is_base64_encoded);
        assert!(env.multi_value_headers.is_none());
    }

    #[test]
    fn binary_response_is_base64() {
        let resp = AppResponse::new(StatusCode::OK)
            .with_header("content-type", "image/png")
            .with_body(vec![0u8, 159, 146, 150]);
        let env = encode(resp, HttpSource::Gateway, &settings());
        assert!(env.is_base64_encoded);
        assert_eq!(STANDARD.decode(env.body).unwrap(), vec![0u8, 159, 146, 150]);
    }

    #[test]
    fn cookie_packing_round_trips() {
        let cookies = vec![
            "session=abc; Path=/".to_owned(),
            "theme=dark".to_owned(),
            "csrf=123; HttpOnly".to_owned(),
        ];
        let delim = "\u{1f}";
        let packed = pack_cookies(&cookies, delim);
        assert_eq!(unpack_cookies(&packed, delim).unwrap(), cookies);
    }

    #[test]
    fn single_value_mode_packs_cookies() {
        let resp = AppResponse::new(StatusCode::OK)
            .with_header("set-cookie", "a=1")
            .with_header("set-cookie", "b=2")
            .with_body("ok");
        let env = encode(resp, HttpSource::Gateway, &settings());
        let headers = env.headers.unwrap();
        let packed = headers.get("set-cookie").unwrap();
        assert_eq!(
            unpack_cookies(packed, &settings().cookie_delimiter).unwrap(),
            vec!["a=1", "b=2"]
        );
    }

    #[test]
    fn multi_value_mode_emits_natively() {
        let resp = AppResponse::new(StatusCode::OK)
            .with_header("set-cookie", "a=1")
            .with_header("set-cookie", "b=2")
            .with_body("ok");
        let cfg = Settings {
            multi_value_headers: true,
            ..settings()
        };
        let env = encode(resp, HttpSource::Gateway, &cfg);
        assert!(env.headers.is_none());
        let multi = env.multi_value_headers.unwrap();
        assert_eq!(multi.get("set-cookie").unwrap(), &vec!["a=1", "b=2"]);
    }

    #[test]
    fn redirect_with_cookie_materializes() {
        let resp = AppResponse::new(StatusCode::FOUND)
            .with_header("location", "/x")
            .with_header("set-cookie", "a=b");
        let rewritten = materialize_redirect(resp);
        assert_eq!(rewritten.status, StatusCode::OK);
        let body = String::from_utf8(rewritten.body.clone()).unwrap();
        assert!(body.contains("url=/x"));
        assert!(body.contains("window.location.replace"));
        assert!(rewritten.headers.get("set-cookie").is_some());

        // Idempotent: a second application is a no-op.
        let again = materialize_redirect(rewritten.clone());
        assert_eq!(again.status, StatusCode::OK);
        assert_eq!(again.body, rewritten.body);
    }

    #[test]
    fn cookieless_redirect_is_untouched() {
        let resp = AppResponse::new(StatusCode::FOUND).with_header("location", "/x");
        let rewritten = materialize_redirect(resp);
        assert_eq!(rewritten.status, StatusCode::FOUND);
        assert!(rewritten.body.is_empty());
    }

    #[test]
    fn binary_redirect_is_untouched() {
        let resp = AppResponse::new(StatusCode::FOUND)
            .with_header("location", "/x")
            .with_header("set-cookie", "a=b")
            .with_header("content-type", "application/json");
        let rewritten = materialize_redirect(resp);
        assert_eq!(rewritten.status, StatusCode::FOUND);
    }

    #[test]
    fn status_smuggling_round_trips() {
        let encoded = smuggle_status(404, b"not found");
        let (status, body) = extract_smuggled_status(&encoded).unwrap();
        assert_eq!(status, 404);
        assert_eq!(body, b"not found");
    }

    #[test]
    fn smuggling_mode_pins_the_sentinel() {
        let resp = AppResponse::new(StatusCode::NOT_FOUND)
            .with_header("content-type", "text/plain")
            .with_body("gone");
        let cfg = Settings {
            status_in_body: true,
            ..settings()
        };
        let env = encode(resp, HttpSource::Gateway, &cfg);
        assert_eq!(env.status_code, 200);
        assert!(env.is_base64_encoded);
        let (status, body) = extract_smuggled_status(&env.body).unwrap();
        assert_eq!(status, 404);
        assert_eq!(body, b"gone");
    }

    #[test]
    fn oversized_body_becomes_413() {
        let cfg = Settings {
            max_response_bytes: 16,
            ..settings()
        };
        let resp = AppResponse::new(StatusCode::OK)
            .with_header("content-type", "text/plain")
            .with_body("x".repeat(64));
        let env = encode(resp, HttpSource::Gateway, &cfg);
        assert_eq!(env.status_code, 413);
    }

    #[test]
    fn alb_gets_status_description() {
        let resp = AppResponse::new(StatusCode::OK).with_body("ok");
        let env = encode(resp, HttpSource::Alb, &settings());
        assert_eq!(env.status_description.as_deref(), Some("200 OK"));
    }

    #[test]
    fn error_envelope_is_well_formed() {
        let env = error_envelope(
            &BridgeError::MalformedBody("bad".to_owned()),
            HttpSource::Gateway,
            &settings(),
        );
        assert_eq!(env.status_code, 500);
        let parsed: serde_json::Value = serde_json::from_str(&env.body).unwrap();
        assert!(parsed["message"].is_string());
        // No detail without debug.
        assert!(parsed.get("detail").is_none());

        let debug_cfg = Settings {
            debug: true,
            ..settings()
        };
        let env = error_envelope(
            &BridgeError::MalformedBody("bad".to_owned()),
            HttpSource::Gateway,
            &debug_cfg,
        );
        let parsed: serde_json::Value = serde_json::from_str(&env.body).unwrap();
        assert!(parsed["detail"].as_str().unwrap().contains("bad"));
    }
}
