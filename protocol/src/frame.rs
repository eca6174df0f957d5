// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Length-prefixed JSON frame codec.
//!
//! Wire format: a 4-byte big-endian unsigned length, then exactly that many
//! bytes of UTF-8 JSON. Nothing else is valid on the stream. Partial reads
//! are buffered internally by the read loops; a stream that ends in the
//! middle of a frame (prefix or payload) is a fatal [`FrameError::Truncated`]
//! error, while a stream that ends cleanly on a frame boundary is ordinary
//! EOF and yields `None`.
//!
//! Two renditions of the same format live here:
//!
//! - [`read_frame`] / [`write_frame`] over tokio's [`AsyncRead`] /
//!   [`AsyncWrite`], used by the pool host on worker stdio pipes.
//! - [`read_frame_blocking`] / [`write_frame_blocking`] over [`std::io`],
//!   used by worker binaries whose event loop is a plain blocking
//!   read-dispatch-write cycle.
//!
//! Both enforce the same `max_frame_bytes` bound on encode and decode, so an
//! oversize payload is rejected before it crosses the pipe in either
//! direction.

use serde::Serialize;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the big-endian length prefix that precedes every frame payload.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default upper bound on a single frame's JSON payload (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Errors produced by the frame codec.
///
/// `Truncated`, `OversizeFrame`, and `InvalidJson` are all fatal to the
/// stream they occur on: once framing is lost there is no way to resync, so
/// the owner of the stream (the worker's reader loop) treats any of these as
/// a terminal condition for the subprocess.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload length exceeds the configured `max_frame_bytes` bound.
    #[error("frame payload is {len} bytes which exceeds the {max} byte limit")]
    OversizeFrame { len: usize, max: usize },

    /// The stream ended in the middle of a frame.
    #[error("byte stream ended mid-frame while reading the {context}")]
    Truncated { context: &'static str },

    /// The payload bytes are not valid JSON.
    #[error("frame payload is not valid JSON")]
    InvalidJson(#[source] serde_json::Error),

    /// The payload could not be serialized to JSON (encode side).
    #[error("payload could not be serialized to JSON")]
    Serialize(#[source] serde_json::Error),

    /// An underlying I/O failure on the stream.
    #[error("frame I/O failed")]
    Io(#[from] std::io::Error),
}

/// Serializes `payload` to JSON and prepends the 4-byte big-endian length.
///
/// # Errors
///
/// Returns [`FrameError::OversizeFrame`] if the serialized payload exceeds
/// `max_frame_bytes` (or `u32::MAX`, the largest length the prefix can
/// carry), and [`FrameError::Serialize`] if serialization itself fails.
pub fn encode_frame<T: Serialize>(
    payload: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(payload).map_err(FrameError::Serialize)?;

    let hard_cap = max_frame_bytes.min(u32::MAX as usize);
    if body.len() > hard_cap {
        return Err(FrameError::OversizeFrame {
            len: body.len(),
            max: hard_cap,
        });
    }

    let mut bytes = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    #[allow(clippy::cast_possible_truncation)]
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Reads one frame and parses its payload as JSON.
///
/// Returns `Ok(None)` on clean EOF (the stream ended exactly on a frame
/// boundary). Looping over this function yields the stream's frames one at a
/// time, never splitting or coalescing payloads.
///
/// # Errors
///
/// - [`FrameError::Truncated`] if the stream ends inside the prefix or
///   payload.
/// - [`FrameError::OversizeFrame`] if the prefix announces more than
///   `max_frame_bytes`.
/// - [`FrameError::InvalidJson`] if the payload bytes are not JSON.
/// - [`FrameError::Io`] for underlying read failures.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<serde_json::Value>, FrameError> {
    // Read the length prefix byte by byte so that a clean EOF before the
    // first byte is distinguishable from a truncated prefix.
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_BYTES {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                context: "length prefix",
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_bytes {
        return Err(FrameError::OversizeFrame {
            len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated { context: "payload" }
        } else {
            FrameError::Io(error)
        }
    })?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(FrameError::InvalidJson)
}

/// Writes one already-encoded frame (see [`encode_frame`]) and flushes.
///
/// # Errors
///
/// Returns [`FrameError::Io`] if the write or flush fails.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_bytes: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(frame_bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking twin of [`read_frame`], for worker binaries reading stdin.
///
/// # Errors
///
/// Same failure modes as [`read_frame`].
pub fn read_frame_blocking<R: Read>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<serde_json::Value>, FrameError> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_BYTES {
        let n = reader.read(&mut prefix[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                context: "length prefix",
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_bytes {
        return Err(FrameError::OversizeFrame {
            len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|error| {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated { context: "payload" }
        } else {
            FrameError::Io(error)
        }
    })?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(FrameError::InvalidJson)
}

/// Blocking twin of [`write_frame`], for worker binaries writing stdout.
///
/// # Errors
///
/// Returns [`FrameError::Io`] if the write or flush fails.
pub fn write_frame_blocking<W: Write>(
    writer: &mut W,
    frame_bytes: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(frame_bytes)?;
    writer.flush()?;
    Ok(())
}
