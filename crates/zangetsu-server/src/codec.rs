//! Wire frame codec
//!
//! One duplex connection carries two kinds of frames:
//! - a newline-terminated JSON object, or
//! - a raw binary payload of a length announced by the preceding JSON
//!   frame.
//!
//! The codec is stateful: after [`WireCodec::expect_payload`] the next
//! decode consumes exactly that many raw bytes instead of looking for a
//! JSON line. Reads and writes never interleave inside a frame.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{Error, Result};

/// Upper bound on a single JSON line (not on payloads, whose size is
/// validated by the command handlers).
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// One frame on the wire.
#[derive(Debug)]
pub enum Frame {
    /// A newline-terminated JSON object
    Message(serde_json::Value),

    /// Raw payload bytes
    Payload(Bytes),
}

/// Stateful line-JSON / binary-payload codec.
#[derive(Debug, Default)]
pub struct WireCodec {
    pending_payload: Option<usize>,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next decoded frame will be exactly `size` raw payload bytes.
    pub fn expect_payload(&mut self, size: usize) {
        self.pending_payload = Some(size);
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(size) = self.pending_payload {
            if src.len() < size {
                src.reserve(size - src.len());
                return Ok(None);
            }
            self.pending_payload = None;
            return Ok(Some(Frame::Payload(src.split_to(size).freeze())));
        }

        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_LINE_LENGTH {
                return Err(Error::InvalidJson("line exceeds maximum length".to_string()));
            }
            return Ok(None);
        };

        let line = src.split_to(newline + 1);
        let value = serde_json::from_slice(&line[..newline])
            .map_err(|e| Error::InvalidJson(e.to_string()))?;
        Ok(Some(Frame::Message(value)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.pending_payload.is_some() || !src.is_empty() => Err(Error::Truncated),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        match item {
            Frame::Message(value) => {
                let line =
                    serde_json::to_vec(&value).map_err(|e| Error::InvalidJson(e.to_string()))?;
                dst.reserve(line.len() + 1);
                dst.extend_from_slice(&line);
                dst.extend_from_slice(b"\n");
            }
            Frame::Payload(bytes) => dst.extend_from_slice(&bytes),
        }
        Ok(())
    }
}

/// Typed wrapper over a framed transport.
pub struct Connection<S> {
    framed: Framed<S, WireCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(io: S) -> Self {
        Self {
            framed: Framed::new(io, WireCodec::new()),
        }
    }

    /// Read the next JSON frame; `Ok(None)` on a clean close.
    pub async fn read_value(&mut self) -> Result<Option<serde_json::Value>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Ok(Frame::Message(value))) => Ok(Some(value)),
            Some(Ok(Frame::Payload(_))) => Err(Error::UnexpectedFrame),
            Some(Err(e)) => Err(e),
        }
    }

    /// Read the next JSON frame and deserialize it; a close mid-dialogue
    /// is an error here.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let value = self.read_value().await?.ok_or(Error::ConnectionClosed)?;
        serde_json::from_value(value).map_err(|e| Error::InvalidCommand(e.to_string()))
    }

    /// Read exactly `size` payload bytes.
    pub async fn read_payload(&mut self, size: usize) -> Result<Bytes> {
        self.framed.codec_mut().expect_payload(size);
        match self.framed.next().await {
            None => Err(Error::Truncated),
            Some(Ok(Frame::Payload(bytes))) => Ok(bytes),
            Some(Ok(Frame::Message(_))) => Err(Error::UnexpectedFrame),
            Some(Err(e)) => Err(e),
        }
    }

    pub async fn send_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let value =
            serde_json::to_value(message).map_err(|e| Error::InvalidJson(e.to_string()))?;
        self.framed.send(Frame::Message(value)).await
    }

    pub async fn send_payload(&mut self, payload: Bytes) -> Result<()> {
        self.framed.send(Frame::Payload(payload)).await
    }
}
