// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Request/response schema carried inside frames.
//!
//! Host → subprocess:
//!
//! ```json
//! {"id": 42, "command": "execute_program", "args": {...}, "timestamp": "..."}
//! ```
//!
//! Subprocess → host:
//!
//! ```json
//! {"id": 42, "success": true, "result": {...}, "timestamp": "..."}
//! {"id": 42, "success": false, "error": {"type": "...", "message": "..."}, "timestamp": "..."}
//! ```
//!
//! Request id `0` is reserved for the init handshake. Response id `-1` marks
//! a spontaneous log frame, which the host routes to the worker's stderr
//! ring buffer instead of the pending mailbox.
//!
//! Responses coming off the wire are untrusted: [`parse_response`] validates
//! the required fields and the result/error pairing, so the reader loop can
//! log and drop malformed frames without tearing down the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id reserved for the init handshake sent right after spawn.
pub const INIT_REQUEST_ID: u64 = 0;

/// Response id used by spontaneous log frames.
pub const LOG_FRAME_ID: i64 = -1;

/// Canonical command names the protocol itself relies on.
///
/// Everything else is runtime-defined and opaque to the pool.
pub mod commands {
    /// Init handshake, sent with [`super::INIT_REQUEST_ID`].
    pub const INIT: &str = "init";
    /// Liveness probe used by health checks.
    pub const PING: &str = "ping";
}

/// One request frame, host → subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub command: String,
    pub args: Value,
    pub timestamp: DateTime<Utc>,
}

impl WireRequest {
    /// Creates a request stamped with the current time.
    pub fn new(id: u64, command: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            command: command.into(),
            args,
            timestamp: Utc::now(),
        }
    }

    /// The init handshake request (id 0).
    pub fn init(args: Value) -> Self {
        Self::new(INIT_REQUEST_ID, commands::INIT, args)
    }
}

/// The `error` body of a failure response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WireError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }
}

/// One response frame, subprocess → host.
///
/// Exactly one of `result` / `error` is present, keyed by `success`. The
/// serde derive is used for the *encode* direction (worker binaries); the
/// decode direction goes through [`parse_response`] so that malformed frames
/// produce a precise reason instead of a generic deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub timestamp: DateTime<Utc>,
}

impl WireResponse {
    /// A success response carrying `result`.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id: i64::try_from(id).unwrap_or(i64::MAX),
            success: true,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A failure response carrying `error`.
    pub fn err(id: u64, error: WireError) -> Self {
        Self {
            id: i64::try_from(id).unwrap_or(i64::MAX),
            success: false,
            result: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    /// A spontaneous log frame (id `-1`).
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            id: LOG_FRAME_ID,
            success: true,
            result: Some(Value::String(message.into())),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_log_frame(&self) -> bool {
        self.id == LOG_FRAME_ID
    }

    /// The request id this response answers, when it answers one at all.
    pub fn request_id(&self) -> Option<u64> {
        u64::try_from(self.id).ok()
    }
}

/// Why a response frame was rejected by [`parse_response`].
///
/// Per the protocol contract these frames are logged and dropped; the worker
/// stays up unless malformed frames repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedResponse {
    #[error("response frame is missing an integer `id` field")]
    MissingId,
    #[error("response frame is missing a boolean `success` field")]
    MissingSuccess,
    #[error("success response carries no `result` field")]
    MissingResult,
    #[error("failure response carries no `error` field")]
    MissingError,
    #[error("response `error` body lacks string `type` and `message` fields")]
    BadErrorBody,
}

/// Validates a decoded frame as a response.
///
/// Unknown fields are ignored. A missing timestamp is tolerated (the host
/// stamps arrival time anyway); missing `id`, `success`, or the
/// result/error body keyed by `success` is not.
///
/// # Errors
///
/// Returns the specific [`MalformedResponse`] reason, which the caller logs
/// before dropping the frame.
pub fn parse_response(value: &Value) -> Result<WireResponse, MalformedResponse> {
    let object = value.as_object().ok_or(MalformedResponse::MissingId)?;

    let id = object
        .get("id")
        .and_then(Value::as_i64)
        .ok_or(MalformedResponse::MissingId)?;

    let success = object
        .get("success")
        .and_then(Value::as_bool)
        .ok_or(MalformedResponse::MissingSuccess)?;

    let result = object.get("result").cloned();
    let error = match object.get("error") {
        None | Some(Value::Null) => None,
        Some(body) => {
            let body = body.as_object().ok_or(MalformedResponse::BadErrorBody)?;
            let kind = body
                .get("type")
                .and_then(Value::as_str)
                .ok_or(MalformedResponse::BadErrorBody)?;
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .ok_or(MalformedResponse::BadErrorBody)?;
            Some(WireError {
                kind: kind.to_owned(),
                message: message.to_owned(),
                details: body.get("details").cloned(),
            })
        }
    };

    if success && result.is_none() {
        return Err(MalformedResponse::MissingResult);
    }
    if !success && error.is_none() {
        return Err(MalformedResponse::MissingError);
    }

    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |parsed| parsed.with_timezone(&Utc));

    Ok(WireResponse {
        id,
        success,
        result,
        error,
        timestamp,
    })
}

/// Extracts a human-readable message from a log frame's payload.
pub fn log_frame_message(response: &WireResponse) -> String {
    match &response.result {
        Some(Value::String(message)) => message.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_serializes_with_rfc3339_timestamp() {
        let request = WireRequest::new(42, "ping", json!({}));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["command"], "ping");
        // chrono's serde rendition of DateTime<Utc> is RFC3339.
        let raw = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(raw).is_ok());
    }

    #[test]
    fn init_request_uses_reserved_id() {
        let request = WireRequest::init(json!({"pool": "default"}));
        assert_eq!(request.id, INIT_REQUEST_ID);
        assert_eq!(request.command, commands::INIT);
    }

    #[test]
    fn success_response_omits_error_field() {
        let response = WireResponse::ok(7, json!({"status": "ok"}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], true);
        assert!(value.get("error").is_none());
        assert_eq!(value["result"]["status"], "ok");
    }

    #[test]
    fn parse_accepts_well_formed_success() {
        let frame = json!({
            "id": 3,
            "success": true,
            "result": {"status": "ok"},
            "timestamp": "2025-06-01T12:00:00Z",
            "an_unknown_field": "is ignored"
        });
        let response = parse_response(&frame).unwrap();
        assert_eq!(response.request_id(), Some(3));
        assert!(response.success);
        assert_eq!(response.result.unwrap()["status"], "ok");
    }

    #[test]
    fn parse_accepts_well_formed_failure() {
        let frame = json!({
            "id": 4,
            "success": false,
            "error": {"type": "value_error", "message": "nope", "details": {"arg": 1}},
        });
        let response = parse_response(&frame).unwrap();
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "value_error");
        assert_eq!(error.message, "nope");
        assert_eq!(error.details.unwrap()["arg"], 1);
    }

    #[test]
    fn parse_rejects_missing_required_fields() {
        assert_eq!(
            parse_response(&json!({"success": true, "result": {}})),
            Err(MalformedResponse::MissingId)
        );
        assert_eq!(
            parse_response(&json!({"id": 1, "result": {}})),
            Err(MalformedResponse::MissingSuccess)
        );
        assert_eq!(
            parse_response(&json!({"id": 1, "success": true})),
            Err(MalformedResponse::MissingResult)
        );
        assert_eq!(
            parse_response(&json!({"id": 1, "success": false})),
            Err(MalformedResponse::MissingError)
        );
        assert_eq!(
            parse_response(&json!({"id": 1, "success": false, "error": {"type": "x"}})),
            Err(MalformedResponse::BadErrorBody)
        );
    }

    #[test]
    fn parse_rejects_non_integer_id() {
        assert_eq!(
            parse_response(&json!({"id": "one", "success": true, "result": {}})),
            Err(MalformedResponse::MissingId)
        );
    }

    #[test]
    fn log_frames_are_recognized_and_extracted() {
        let response = WireResponse::log("worker warming up");
        assert!(response.is_log_frame());
        assert_eq!(response.request_id(), None);
        assert_eq!(log_frame_message(&response), "worker warming up");

        let parsed = parse_response(&json!({
            "id": -1,
            "success": true,
            "result": "spontaneous",
        }))
        .unwrap();
        assert!(parsed.is_log_frame());
        assert_eq!(log_frame_message(&parsed), "spontaneous");
    }
}
