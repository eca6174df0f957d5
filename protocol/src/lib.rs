// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Wire protocol shared by the scriptpool host and its worker subprocesses.
//!
//! Every message on a worker's stdin or stdout is one *frame*: a 4-byte
//! big-endian unsigned length followed by exactly that many bytes of UTF-8
//! JSON. The [`frame`] module implements the codec (an async rendition for
//! the host, a blocking rendition for worker binaries); the [`message`]
//! module defines the request/response schema carried inside frames and the
//! validation that separates well-formed responses from malformed ones.
//!
//! This crate is a shared dependency: the host library (`scriptpool`) and
//! any worker implementation both speak the types defined here, so the wire
//! format only has to be right in one place.

pub mod frame;
pub mod message;

pub use frame::{DEFAULT_MAX_FRAME_BYTES, FrameError, LENGTH_PREFIX_BYTES, encode_frame,
                read_frame, read_frame_blocking, write_frame, write_frame_blocking};
pub use message::{INIT_REQUEST_ID, LOG_FRAME_ID, MalformedResponse, WireError,
                  WireRequest, WireResponse, commands, log_frame_message,
                  parse_response};
