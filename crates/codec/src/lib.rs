//! ## Control-channel frame codec
//!
//! The control channel between a relay and a client carries a sequence of
//! frames over a plain TCP byte stream. Each frame is a single line of UTF-8
//! JSON terminated by `\n`; there are no intra-frame newlines, and response
//! and request bodies are carried as base64 text inside the JSON object
//! rather than as raw bytes on the wire. This keeps the protocol readable
//! with `nc`/`tail -f` and lets [`serde_json`] do the heavy lifting for
//! parsing and validation.
//!
//! [`FrameCodec`] implements [`tokio_util::codec::Decoder`] and
//! [`tokio_util::codec::Encoder`] so it can drive a
//! [`tokio_util::codec::Framed`] directly over a `TcpStream`.

use std::collections::HashMap;

use base64::Engine;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum size of one frame, including its body, in bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Json(serde_json::Error),
    FrameTooLarge(usize),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Json(e) => write!(f, "malformed frame: {}", e),
            Self::FrameTooLarge(len) => write!(f, "frame of {} bytes exceeds max frame length", len),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// One control-channel frame.
///
/// Serialized as a JSON object with a `kind` discriminant, matching the
/// dynamically-typed frames of the wire protocol while keeping each
/// variant's fields strongly typed on the Rust side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    Register {
        token: String,
        #[serde(rename = "targetPort")]
        target_port: u16,
    },
    Registered {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Request {
        id: u64,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        /// base64-encoded body.
        body: String,
        #[serde(rename = "remoteAddr")]
        remote_addr: String,
    },
    Response {
        id: u64,
        status: u16,
        headers: HashMap<String, String>,
        /// base64-encoded body.
        body: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: String,
        message: String,
    },
    Ping {
        ts: u64,
    },
    Pong {
        ts: u64,
    },
}

impl Frame {
    /// The frame's `id`, for the kinds that carry one.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
            _ => None,
        }
    }

    pub fn registered_ok() -> Self {
        Self::Registered {
            ok: true,
            code: None,
            message: None,
        }
    }

    pub fn registered_err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Registered {
            ok: false,
            code: Some(code.into()),
            message: Some(message.into()),
        }
    }

    pub fn error(id: Option<u64>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// base64-encode a request/response body for embedding in a [`Frame`].
pub fn encode_body(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a [`Frame`] body back into raw bytes.
pub fn decode_body(body: &str) -> Result<Vec<u8>, Error> {
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|_| Error::Json(serde::de::Error::custom("invalid base64 body")))
}

/// Length-delimited, newline-terminated JSON framing over a byte stream.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use tokio_util::codec::{Decoder, Encoder};
/// use tunnel_relay_codec::{Frame, FrameCodec};
///
/// let mut codec = FrameCodec::default();
/// let mut buf = BytesMut::new();
///
/// codec.encode(Frame::Ping { ts: 42 }, &mut buf).unwrap();
/// assert_eq!(buf.last(), Some(&b'\n'));
///
/// let frame = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(frame, Frame::Ping { ts: 42 });
/// assert!(buf.is_empty());
/// ```
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            let Some(newline_offset) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_frame_len {
                    return Err(Error::FrameTooLarge(src.len()));
                }
                return Ok(None);
            };

            if newline_offset > self.max_frame_len {
                return Err(Error::FrameTooLarge(newline_offset));
            }

            let mut line = src.split_to(newline_offset + 1);
            line.truncate(newline_offset);

            if line.is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_slice(&line)?));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > self.max_frame_len {
            return Err(Error::FrameTooLarge(json.len()));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// # Test
///
/// ```
/// use tunnel_relay_codec::{decode_body, encode_body};
///
/// let body = b"hello world";
/// let encoded = encode_body(body);
/// assert_eq!(decode_body(&encoded).unwrap(), body);
/// ```
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversize_frame() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Frame::Ping { ts: 1234567890123 }, &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(_)));
    }

    #[test]
    fn decode_skips_blank_lines() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"\n\n{\"kind\":\"pong\",\"ts\":7}\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Pong { ts: 7 });
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"kind\":\"pong\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn register_roundtrips_through_json() {
        let frame = Frame::Register {
            token: "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6".into(),
            target_port: 3000,
        };

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }
}
