//! tlmsg: multiplexing client for length-prefixed JSON peers.
//!
//! Spawns a peer process (translateLocally in native-messaging mode by
//! default), speaks `[4-byte length][JSON]` frames over its stdio, and lets
//! any number of callers issue requests concurrently. Each request gets a
//! fresh id; responses and progress updates are routed back by id in
//! whatever order the peer produces them.

pub mod bridge;
pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod pending;
pub mod process;
mod reader;

pub use bridge::codec::LengthPrefixOrder;
pub use bridge::protocol::RequestId;
pub use client::{Client, ResponseHandle, ShutdownReport};
pub use commands::{
    Command, DownloadProgress, ModelInfo, TranslateLocally, TranslateRequest, TranslateRoute,
};
pub use config::{ClientConfig, ConfigError};
pub use connection::ConnectionState;
pub use error::ClientError;
pub use pending::ProgressSink;
pub use process::{CommandSpawner, PeerProcess, PeerSpawner, SpawnError};
pub use reader::ReaderExit;
