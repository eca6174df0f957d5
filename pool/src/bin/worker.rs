// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Reference worker: a blocking stdio loop over the framed protocol.
//!
//! This binary is what the integration suite spawns and what a deployment
//! gets out of the box before pointing `worker.exec_path` at its own runtime
//! host. It reads one frame at a time from stdin, dispatches to a small
//! built-in command set, and writes one response frame to stdout. All
//! diagnostics go to stderr, which the pool captures into its ring buffer.
//!
//! Built-in commands:
//!
//! | command | behavior |
//! |---|---|
//! | `init`  | handshake (id 0); replies `{status: "ok", worker: {...}}` |
//! | `ping`  | liveness; replies `{status: "ok", ...}` |
//! | `echo`  | replies `args` verbatim |
//! | `sleep` | sleeps `args.duration_ms`, then replies |
//! | `fail`  | replies a runtime-defined error built from `args` |
//! | `crash` | exits the process with `args.code` (default 1) |
//!
//! An injected `session_id` in `args` is carried through untouched and never
//! interpreted. EOF on stdin is the drain signal: the worker exits cleanly.

use serde_json::{Value, json};
use std::{io::Write, process::ExitCode};

use scriptpool_protocol::{DEFAULT_MAX_FRAME_BYTES, WireError, WireResponse,
                          encode_frame, read_frame_blocking, write_frame_blocking};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    tracing::info!(pid = std::process::id(), "worker starting");

    // Simulated runtime warm-up, for benchmarking startup behavior. A real
    // runtime host spends this time booting its interpreter.
    if let Some(delay_ms) = std::env::var("SCRIPTPOOL_WORKER_STARTUP_DELAY_MS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
    {
        tracing::debug!(delay_ms, "warm-up delay");
        std::thread::sleep(std::time::Duration::from_millis(delay_ms));
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();

    loop {
        match read_frame_blocking(&mut reader, DEFAULT_MAX_FRAME_BYTES) {
            Ok(Some(frame)) => {
                let Some(response) = handle_frame(&frame) else {
                    continue;
                };
                if let Err(error) = write_response(&mut writer, &response) {
                    tracing::error!(%error, "stdout write failed, exiting");
                    return ExitCode::FAILURE;
                }
            }
            Ok(None) => {
                tracing::info!("stdin closed, exiting cleanly");
                return ExitCode::SUCCESS;
            }
            Err(error) => {
                tracing::error!(%error, "stdin framing failure, exiting");
                return ExitCode::FAILURE;
            }
        }
    }
}

fn write_response(writer: &mut impl Write, response: &WireResponse) -> std::io::Result<()> {
    let frame = encode_frame(response, DEFAULT_MAX_FRAME_BYTES)
        .map_err(|error| std::io::Error::other(error.to_string()))?;
    write_frame_blocking(writer, &frame)
        .map_err(|error| std::io::Error::other(error.to_string()))?;
    Ok(())
}

/// Dispatches one request frame. Returns `None` when the frame is so
/// malformed that no addressable reply exists (no integer id).
fn handle_frame(frame: &Value) -> Option<WireResponse> {
    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        tracing::warn!("request without an integer id, dropped");
        return None;
    };
    let Some(command) = frame.get("command").and_then(Value::as_str) else {
        return Some(WireResponse::err(
            id,
            WireError::new("protocol_error", "request is missing `command`"),
        ));
    };
    let args = frame.get("args").cloned().unwrap_or_else(|| json!({}));

    tracing::debug!(id, command, "handling request");
    Some(dispatch(id, command, &args))
}

fn dispatch(id: u64, command: &str, args: &Value) -> WireResponse {
    match command {
        "init" => WireResponse::ok(
            id,
            json!({
                "status": "ok",
                "worker": {
                    "pid": std::process::id(),
                    "runtime": "builtin",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => WireResponse::ok(
            id,
            json!({
                "status": "ok",
                "pid": std::process::id(),
                "echo": args,
            }),
        ),
        "echo" => WireResponse::ok(id, args.clone()),
        "sleep" => {
            let duration_ms = args.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis(duration_ms));
            WireResponse::ok(id, json!({ "slept_ms": duration_ms }))
        }
        "fail" => {
            let kind = args
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("runtime_error");
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            let mut error = WireError::new(kind, message);
            error.details = args.get("details").cloned();
            WireResponse::err(id, error)
        }
        "crash" => {
            let code = args
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|raw| i32::try_from(raw).ok())
                .unwrap_or(1);
            tracing::error!(code, "crash requested, exiting hard");
            // No response frame: the pool must observe this as worker death.
            std::process::exit(code);
        }
        other => WireResponse::err(
            id,
            WireError::new(
                "unknown_command",
                format!("command `{other}` is not part of the built-in runtime"),
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn init_replies_ok_with_worker_metadata() {
        let response = dispatch(0, "init", &json!({"pool": "default"}));
        assert_eq!(response.id, 0);
        assert!(response.success);
        let result = response.result.unwrap();
        assert_eq!(result["status"], "ok");
        assert!(result["worker"]["pid"].is_u64());
    }

    #[test]
    fn echo_round_trips_args_including_session_id() {
        let args = json!({"x": [1, 2, 3], "session_id": "s1"});
        let response = dispatch(7, "echo", &args);
        assert!(response.success);
        assert_eq!(response.result.unwrap(), args);
    }

    #[test]
    fn fail_builds_a_runtime_defined_error() {
        let response = dispatch(
            9,
            "fail",
            &json!({"type": "value_error", "message": "bad input", "details": {"k": 1}}),
        );
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "value_error");
        assert_eq!(error.message, "bad input");
        assert_eq!(error.details.unwrap()["k"], 1);
    }

    #[test]
    fn unknown_command_is_an_error_not_a_crash() {
        let response = dispatch(3, "definitely_not_a_command", &json!({}));
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, "unknown_command");
    }

    #[test]
    fn frames_without_an_id_are_dropped() {
        assert!(handle_frame(&json!({"command": "ping"})).is_none());
    }

    #[test]
    fn frames_without_a_command_get_a_protocol_error() {
        let response = handle_frame(&json!({"id": 4})).unwrap();
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, "protocol_error");
    }
}
