//! Framed codec for the host control channel.
//!
//! Uses LinesCodec for framing + serde_json for serialization: one JSON value
//! per newline-terminated line. Works over any AsyncRead/AsyncWrite.
//!
//! A bad line is reported as an item-level [`FrameError`] rather than a stream
//! error, so the reader keeps going with the next line.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Default upper bound for a single inbound line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// A single line that could not be turned into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid JSON message")]
    Json(#[source] serde_json::Error),

    #[error("message exceeds {max} bytes")]
    TooLong { max: usize },

    #[error("message is not valid UTF-8")]
    Utf8,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec that frames messages by newline and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization. Blank lines are
/// skipped on decode.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    max_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
            _phantom: PhantomData,
        }
    }

    fn next_frame(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> io::Result<Option<Result<T, FrameError>>>
    where
        T: DeserializeOwned,
    {
        loop {
            let next = if eof {
                self.inner.decode_eof(src)
            } else {
                self.inner.decode(src)
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(max = self.max_length, "Discarding oversized line");
                    return Ok(Some(Err(FrameError::TooLong {
                        max: self.max_length,
                    })));
                }
                // The offending line is already consumed, so the stream can continue.
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Ok(Some(Err(FrameError::Utf8)));
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            tracing::trace!(line_bytes = line.len(), "Decoding frame");
            return Ok(Some(serde_json::from_str(line).map_err(FrameError::Json)));
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, FrameError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_frame(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_frame(src, true)
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Compact JSON never contains a raw newline, so one value is one line.
        let json = serde_json::to_vec(&item)?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
