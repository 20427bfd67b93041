// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interpretation of handler response bodies.

use asya_core::{ErrorCode, ErrorDetails};
use serde_json::Value;

/// What a handler's single response frame means to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResponse {
    /// One next payload (or, in envelope mode, one full envelope).
    Single(Value),
    /// Fan-out: one fresh envelope per element.
    FanOut(Vec<Value>),
    /// `null` or `[]`: abort with success, route to happy-end unadvanced.
    Abort,
    /// Categorized failure, routed to error-end.
    Error(ErrorDetails),
}

/// Encode an error response body: the details plus `"status":"error"`.
///
/// Inverse of the error arm of [`HandlerResponse::interpret`].
pub fn error_body(details: &ErrorDetails) -> Vec<u8> {
    let mut value = serde_json::to_value(details).unwrap_or_else(|_| {
        serde_json::json!({
            "error": "server_error",
            "message": "failed to encode error details",
        })
    });
    if let Some(map) = value.as_object_mut() {
        map.insert("status".into(), serde_json::Value::String("error".into()));
    }
    // Serializing a Value cannot fail.
    serde_json::to_vec(&value).unwrap_or_default()
}

impl HandlerResponse {
    /// Interpret a decoded response value.
    ///
    /// Accepts both the bare result and the wrapped
    /// `{"status":"ok","result":<...>}` form; the wrapper is unwrapped
    /// before interpretation. An object carrying `"status":"error"` is an
    /// error even when it also carries routing fields; error wins the
    /// tie-break.
    pub fn interpret(value: Value) -> HandlerResponse {
        // Error takes precedence over everything else in the object.
        if let Some(details) = Self::as_error(&value) {
            return HandlerResponse::Error(details);
        }
        let value = Self::unwrap_ok(value);
        match value {
            Value::Null => HandlerResponse::Abort,
            Value::Array(items) if items.is_empty() => HandlerResponse::Abort,
            Value::Array(items) => HandlerResponse::FanOut(items),
            other => HandlerResponse::Single(other),
        }
    }

    /// Decode raw frame bytes, classifying unparseable bodies.
    pub fn from_bytes(bytes: &[u8]) -> HandlerResponse {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::interpret(value),
            Err(e) => HandlerResponse::Error(ErrorDetails::new(
                ErrorCode::InvalidJson,
                format!("response frame is not valid JSON: {e}"),
            )),
        }
    }

    fn unwrap_ok(value: Value) -> Value {
        match value {
            Value::Object(mut map) if map.get("status").and_then(Value::as_str) == Some("ok") => {
                map.remove("result").unwrap_or(Value::Null)
            }
            other => other,
        }
    }

    fn as_error(value: &Value) -> Option<ErrorDetails> {
        let map = value.as_object()?;
        if map.get("status").and_then(Value::as_str) != Some("error") {
            return None;
        }
        match serde_json::from_value::<ErrorDetails>(value.clone()) {
            Ok(details) => Some(details),
            // An error-shaped object with an unknown code still fails the
            // envelope; fold it into server_error rather than guessing.
            Err(_) => Some(ErrorDetails::new(
                ErrorCode::Server,
                map.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("handler returned a malformed error object")
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_is_single() {
        let r = HandlerResponse::interpret(json!({"n": 2}));
        assert_eq!(r, HandlerResponse::Single(json!({"n": 2})));
    }

    #[test]
    fn scalar_is_single() {
        let r = HandlerResponse::interpret(json!(42));
        assert_eq!(r, HandlerResponse::Single(json!(42)));
    }

    #[test]
    fn array_is_fanout() {
        let r = HandlerResponse::interpret(json!([{"v": 10}, {"v": 20}]));
        assert_eq!(r, HandlerResponse::FanOut(vec![json!({"v": 10}), json!({"v": 20})]));
    }

    #[test]
    fn null_and_empty_array_abort() {
        assert_eq!(HandlerResponse::interpret(json!(null)), HandlerResponse::Abort);
        assert_eq!(HandlerResponse::interpret(json!([])), HandlerResponse::Abort);
    }

    #[test]
    fn wrapped_ok_is_unwrapped() {
        let r = HandlerResponse::interpret(json!({"status": "ok", "result": {"n": 2}}));
        assert_eq!(r, HandlerResponse::Single(json!({"n": 2})));
    }

    #[test]
    fn wrapped_ok_null_aborts() {
        let r = HandlerResponse::interpret(json!({"status": "ok", "result": null}));
        assert_eq!(r, HandlerResponse::Abort);
        let r = HandlerResponse::interpret(json!({"status": "ok"}));
        assert_eq!(r, HandlerResponse::Abort);
    }

    #[test]
    fn wrapped_ok_array_fans_out() {
        let r = HandlerResponse::interpret(json!({"status": "ok", "result": [1, 2]}));
        assert_eq!(r, HandlerResponse::FanOut(vec![json!(1), json!(2)]));
    }

    #[test]
    fn error_object_parses() {
        let r = HandlerResponse::interpret(json!({
            "status": "error",
            "error": "validation_error",
            "message": "bad input",
            "type": "ValueError",
        }));
        match r {
            HandlerResponse::Error(d) => {
                assert_eq!(d.error, ErrorCode::Validation);
                assert_eq!(d.message, "bad input");
                assert_eq!(d.kind.as_deref(), Some("ValueError"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn error_wins_over_route_fields() {
        let r = HandlerResponse::interpret(json!({
            "status": "error",
            "error": "processing_error",
            "message": "boom",
            "route": {"steps": ["a"], "current": 0},
        }));
        assert!(matches!(r, HandlerResponse::Error(_)));
    }

    #[test]
    fn malformed_error_object_degrades_to_server_error() {
        let r = HandlerResponse::interpret(json!({
            "status": "error",
            "error": "not_a_known_code",
            "message": "whatever",
        }));
        match r {
            HandlerResponse::Error(d) => assert_eq!(d.error, ErrorCode::Server),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn status_field_on_plain_payload_is_not_special() {
        // A payload that happens to carry status:"done" is just a payload.
        let r = HandlerResponse::interpret(json!({"status": "done", "n": 1}));
        assert_eq!(r, HandlerResponse::Single(json!({"status": "done", "n": 1})));
    }

    #[test]
    fn error_body_roundtrips_through_interpret() {
        let details = ErrorDetails::new(ErrorCode::Timeout, "deadline exceeded");
        let body = error_body(&details);
        match HandlerResponse::from_bytes(&body) {
            HandlerResponse::Error(d) => assert_eq!(d, details),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_bytes_become_invalid_json() {
        let r = HandlerResponse::from_bytes(b"{nope");
        match r {
            HandlerResponse::Error(d) => assert_eq!(d.error, ErrorCode::InvalidJson),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
