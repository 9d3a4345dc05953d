//! Duplex connection to the peer: serialized frame writes, a single frame
//! reader, and the lifecycle state both sides observe.
//!
//! State machine: `Connecting -> Ready -> Closing -> Closed`. Writes are only
//! accepted in `Ready`; no transition skips `Closing`.

use std::io;
use std::pin::Pin;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FrameCodec, JsonCodec, LengthPrefixOrder};
use crate::bridge::protocol::Request;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn accepts_requests(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing parameters shared by both directions.
#[derive(Debug, Clone, Copy)]
pub struct FrameSettings {
    pub order: LengthPrefixOrder,
    pub max_frame_length: usize,
}

impl FrameSettings {
    fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_frame_length(self.order, self.max_frame_length)
    }
}

/// Read side of the connection. Owned by the reader loop, nobody else.
pub struct FrameReader {
    inner: FramedRead<BoxedReader, FrameCodec>,
}

impl FrameReader {
    /// Next whole frame; `None` on clean end of stream.
    ///
    /// Cancel-safe: partially read frames stay buffered.
    pub async fn read_frame(&mut self) -> Option<io::Result<BytesMut>> {
        self.inner.next().await
    }
}

pub(crate) type FrameWriter = FramedWrite<BoxedWriter, JsonCodec<Request>>;

/// Write side plus lifecycle state.
///
/// The writer sits behind an async mutex so one request frame is written in
/// full before the next caller gets the stream. It becomes `None` once the
/// write side is closed.
pub struct Connection {
    writer: Mutex<Option<FrameWriter>>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Wrap a duplex stream pair. Returns the connection and the reader half
    /// to hand to the reader loop.
    pub fn open<R, W>(reader: R, writer: W, settings: FrameSettings) -> (Self, FrameReader)
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let reader: BoxedReader = Box::pin(reader);
        let writer: BoxedWriter = Box::pin(writer);
        let frames = FrameReader {
            inner: FramedRead::new(reader, settings.codec()),
        };
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let connection = Self {
            writer: Mutex::new(Some(FramedWrite::new(
                writer,
                JsonCodec::new(settings.codec()),
            ))),
            state,
        };
        (connection, frames)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `Connecting -> Ready`. Returns false from any other state.
    pub fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// `Connecting | Ready -> Closing`. Returns whether this call made the transition.
    pub fn begin_closing(&self) -> bool {
        let changed = self.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Ready => {
                *state = ConnectionState::Closing;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        });
        if changed {
            tracing::debug!("Connection closing");
        }
        changed
    }

    /// Move to `Closed`, passing through `Closing` if needed.
    pub fn mark_closed(&self) {
        self.begin_closing();
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closing {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!("Connection closed");
        }
    }

    /// Exclusive access to the write side for one request.
    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, Option<FrameWriter>> {
        self.writer.lock().await
    }

    /// Flush and drop the write side so the peer sees end of input.
    ///
    /// Dropping matters: child stdin pipes only signal EOF once closed.
    /// Idempotent.
    pub async fn close_write(&self) -> io::Result<()> {
        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => {
                tracing::debug!("Closing write side");
                writer.close().await
            }
            None => Ok(()),
        }
    }
}
