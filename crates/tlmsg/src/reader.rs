//! Reader loop: the only task that reads from the peer.
//!
//! Decodes frames, classifies them, and routes them through the pending
//! table. Malformed messages and unknown ids are logged and dropped. On EOF,
//! framing error, or cancellation the loop moves the connection to
//! `Closing`, fails every pending request, and marks it `Closed`.

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{InboundMessage, ResponseOutcome};
use crate::connection::{Connection, FrameReader};
use crate::error::ClientError;
use crate::pending::{PendingTable, RouteOutcome};

/// Why the reader loop stopped.
#[derive(Debug)]
pub enum ReaderExit {
    /// The peer closed its output between frames.
    Eof,
    /// Cancelled from our side.
    Cancelled,
    /// Truncated frame, oversized length, or read failure.
    Framing(io::Error),
}

impl ReaderExit {
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Framing(_))
    }
}

impl std::fmt::Display for ReaderExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eof => f.write_str("end of stream"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Framing(e) => write!(f, "framing error: {e}"),
        }
    }
}

pub(crate) async fn run_reader_loop(
    mut frames: FrameReader,
    table: Arc<PendingTable>,
    connection: Arc<Connection>,
    cancel: CancellationToken,
) -> ReaderExit {
    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break ReaderExit::Cancelled,

            frame = frames.read_frame() => match frame {
                Some(Ok(frame)) => dispatch_frame(&table, &frame),
                Some(Err(e)) => break ReaderExit::Framing(e),
                None => break ReaderExit::Eof,
            },
        }
    };

    match &exit {
        ReaderExit::Eof => tracing::info!("Peer closed its output"),
        ReaderExit::Cancelled => tracing::debug!("Reader loop cancelled"),
        ReaderExit::Framing(e) => {
            tracing::error!(error = %e, "Framing error, closing connection");
        }
    }

    connection.begin_closing();
    let drained = table.drain_all(|| ClientError::ConnectionClosed);
    if drained > 0 {
        tracing::warn!(drained, "Failing pending requests: connection closed");
    }
    connection.mark_closed();

    tracing::debug!(%exit, "Reader loop exiting");
    exit
}

fn dispatch_frame(table: &PendingTable, frame: &[u8]) {
    let message = match InboundMessage::from_slice(frame) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, frame_len = frame.len(), "Dropping unrecognized message");
            return;
        }
    };

    match message {
        InboundMessage::Response { id, outcome } => {
            let result = match outcome {
                ResponseOutcome::Success(data) => Ok(data),
                ResponseOutcome::Failure(error) => Err(ClientError::Remote(error)),
                ResponseOutcome::Invalid(reason) => {
                    tracing::warn!(request_id = %id, %reason, "Malformed terminal response");
                    Err(ClientError::ProtocolViolation(reason))
                }
            };
            match table.route_terminal(id, result) {
                RouteOutcome::Delivered => tracing::debug!(request_id = %id, "Request settled"),
                RouteOutcome::Detached => {
                    tracing::debug!(request_id = %id, "Request settled after caller detached");
                }
                RouteOutcome::UnknownId => {
                    tracing::trace!(request_id = %id, "Dropping response for unknown request");
                }
            }
        }
        InboundMessage::Progress { id, update } => match table.route_progress(id, update) {
            RouteOutcome::Delivered => tracing::trace!(request_id = %id, "Progress update"),
            RouteOutcome::Detached | RouteOutcome::UnknownId => {
                tracing::trace!(request_id = %id, "Dropping progress for untracked request");
            }
        },
    }
}
