//! Outbound frame writer shared by the read loop and background tasks.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{CodecError, JsonLinesCodec};
use crate::bridge::protocol::{Notice, Outbound, Response};
use crate::version::VersionInfo;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
type FrameSink = FramedWrite<BoxedWriter, JsonLinesCodec<Outbound>>;

/// Handle for writing frames to the host.
///
/// Cheap to clone. Every emit holds the sink lock across encode, write and
/// flush, so frames from concurrent callers never interleave.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<Mutex<FrameSink>>,
}

impl Emitter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            sink: Arc::new(Mutex::new(FramedWrite::new(writer, JsonLinesCodec::new()))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Write one frame and flush.
    ///
    /// A frame that fails to serialize is replaced by an `error` notice
    /// describing the failure; only I/O errors are returned.
    pub async fn emit(&self, frame: impl Into<Outbound>) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.send(frame.into()).await {
            Ok(()) => Ok(()),
            Err(CodecError::Serialize(e)) => {
                tracing::warn!(error = %e, "Failed to serialize outbound frame");
                let notice = Notice::Error {
                    error: e.to_string(),
                };
                sink.send(notice.into()).await.map_err(into_io)
            }
            Err(CodecError::Io(e)) => {
                tracing::error!(error = %e, "Failed to write to control channel");
                Err(e)
            }
        }
    }

    pub async fn respond(&self, response: Response) -> io::Result<()> {
        self.emit(response).await
    }

    pub async fn event(&self, name: impl Into<String>, data: Value) -> io::Result<()> {
        self.emit(Notice::Event {
            name: name.into(),
            data,
        })
        .await
    }

    pub async fn ready(&self, message: impl Into<String>, version: VersionInfo) -> io::Result<()> {
        self.emit(Notice::Ready {
            message: message.into(),
            version,
        })
        .await
    }
}

fn into_io(e: CodecError) -> io::Error {
    match e {
        CodecError::Io(e) => e,
        CodecError::Serialize(e) => io::Error::new(io::ErrorKind::InvalidData, e),
    }
}
