//! Decoding of terminal control request payloads.
//!
//! `pty-req` and `window-change` carry their terminal geometry as packed
//! big-endian fields:
//!
//! ```text
//! pty-req:        u32 len | term[len] | u32 cols | u32 rows | u32 px_w | u32 px_h | modes...
//! window-change:  u32 cols | u32 rows | u32 px_w | u32 px_h
//! ```
//!
//! Every read is bounds-checked; short payloads produce a [`DecodeError`]
//! instead of a panic.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Number of bytes occupied by the four dimension fields.
const DIMENSIONS_LEN: usize = 16;

/// Errors produced while decoding a control request payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload ended before a field could be read.
    #[error("payload truncated: needed {needed} bytes for {field}, {available} available")]
    Truncated {
        /// Field being decoded
        field: &'static str,
        /// Bytes required by the field
        needed: usize,
        /// Bytes left in the payload
        available: usize,
    },

    /// The terminal name is not valid UTF-8.
    #[error("terminal name is not valid UTF-8")]
    InvalidTerm,
}

/// Terminal window geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Width in character cells.
    pub cols: u32,
    /// Height in character cells.
    pub rows: u32,
    /// Width in pixels (0 when unknown).
    pub pixel_width: u32,
    /// Height in pixels (0 when unknown).
    pub pixel_height: u32,
}

impl WindowSize {
    /// Geometry with unknown pixel dimensions.
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// A decoded `pty-req` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value of the client's `TERM`.
    pub term: String,
    /// Requested window geometry.
    pub size: WindowSize,
}

/// Decode a `pty-req` payload.
///
/// Trailing encoded terminal modes are ignored.
pub fn decode_pty_request(mut payload: &[u8]) -> Result<PtyRequest, DecodeError> {
    let term_len = read_u32(&mut payload, "terminal name length")? as usize;
    ensure(payload, term_len, "terminal name")?;
    let term = std::str::from_utf8(&payload[..term_len])
        .map_err(|_| DecodeError::InvalidTerm)?
        .to_string();
    payload.advance(term_len);
    let size = read_dimensions(&mut payload)?;
    Ok(PtyRequest { term, size })
}

/// Decode a `window-change` payload.
pub fn decode_window_change(mut payload: &[u8]) -> Result<WindowSize, DecodeError> {
    read_dimensions(&mut payload)
}

/// Encode a `pty-req` payload with an empty terminal mode list.
pub fn encode_pty_request(term: &str, size: WindowSize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + term.len() + DIMENSIONS_LEN + 4);
    buf.put_u32(term.len() as u32);
    buf.put_slice(term.as_bytes());
    put_dimensions(&mut buf, size);
    buf.put_u32(0);
    buf
}

/// Encode a `window-change` payload.
pub fn encode_window_change(size: WindowSize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(DIMENSIONS_LEN);
    put_dimensions(&mut buf, size);
    buf
}

/// Encode an `env` payload.
pub fn encode_env(name: &str, value: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + name.len() + value.len());
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
    buf
}

fn put_dimensions(buf: &mut BytesMut, size: WindowSize) {
    buf.put_u32(size.cols);
    buf.put_u32(size.rows);
    buf.put_u32(size.pixel_width);
    buf.put_u32(size.pixel_height);
}

fn read_dimensions(payload: &mut &[u8]) -> Result<WindowSize, DecodeError> {
    ensure(payload, DIMENSIONS_LEN, "dimensions")?;
    Ok(WindowSize {
        cols: payload.get_u32(),
        rows: payload.get_u32(),
        pixel_width: payload.get_u32(),
        pixel_height: payload.get_u32(),
    })
}

fn read_u32(payload: &mut &[u8], field: &'static str) -> Result<u32, DecodeError> {
    ensure(payload, 4, field)?;
    Ok(payload.get_u32())
}

fn ensure(payload: &[u8], needed: usize, field: &'static str) -> Result<(), DecodeError> {
    if payload.len() < needed {
        return Err(DecodeError::Truncated {
            field,
            needed,
            available: payload.len(),
        });
    }
    Ok(())
}
