//! JSON frame codec for tokio.
//!
//! Wraps [`LineCodec`] and (de)serializes one JSON object per line.

use std::marker::PhantomData;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{self, ProtocolError};
use crate::line::LineCodec;
use crate::message::{ClientMessage, ServerMessage};

/// Codec used by the broker: reads [`ClientMessage`], writes [`ServerMessage`].
pub type ServerCodec = JsonCodec<ClientMessage, ServerMessage>;

/// Codec used by clients: reads [`ServerMessage`], writes [`ClientMessage`].
pub type ClientCodec = JsonCodec<ServerMessage, ClientMessage>;

/// Tokio codec decoding `In` frames and encoding `Out` frames as JSON lines.
///
/// Decoding yields `Result<In, ProtocolError>` items so a single malformed
/// object does not tear down the framed stream; framing errors (over-long
/// lines, bad UTF-8) are still returned as codec errors.
pub struct JsonCodec<In, Out> {
    inner: LineCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> std::fmt::Debug for JsonCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec").field("inner", &self.inner).finish()
    }
}

impl<In, Out> Default for JsonCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> JsonCodec<In, Out> {
    /// Create a codec with the default line length limit.
    pub fn new() -> Self {
        Self::with_max_len(crate::line::DEFAULT_MAX_LINE_LEN)
    }

    /// Create a codec with a custom max line length.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            inner: LineCodec::with_max_len(max_len),
            _marker: PhantomData,
        }
    }
}

/// Parse a single text frame.
pub fn parse_frame<T: DeserializeOwned>(text: &str) -> error::Result<T> {
    Ok(serde_json::from_str(text.trim())?)
}

impl<In: DeserializeOwned, Out> Decoder for JsonCodec<In, Out> {
    type Item = Result<In, ProtocolError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> error::Result<Option<Self::Item>> {
        loop {
            match self.inner.decode(src)? {
                // Blank keepalive lines carry nothing.
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(parse_frame(&line))),
                None => return Ok(None),
            }
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonCodec<In, Out> {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Out, dst: &mut BytesMut) -> error::Result<()> {
        let line = serde_json::to_string(&msg)?;
        self.inner.encode(line, dst)
    }
}
