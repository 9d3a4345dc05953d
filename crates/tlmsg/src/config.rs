//! Client configuration.
//!
//! Built with `ClientConfig::new(program)` and `with_*` setters, or from
//! the environment:
//!
//! | Variable                  | Meaning                                  |
//! |---------------------------|------------------------------------------|
//! | `TLMSG_PEER`              | peer executable (default `translateLocally`) |
//! | `TLMSG_SHUTDOWN_GRACE_MS` | grace period per stop step               |
//! | `TLMSG_LENGTH_ORDER`      | `little`, `big` or `native`              |
//! | `TLMSG_MAX_FRAME_LENGTH`  | largest accepted frame in bytes          |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, LengthPrefixOrder};
use crate::connection::FrameSettings;
use crate::process::{CommandSpawner, PeerSpawner};

pub const DEFAULT_PEER_PROGRAM: &str = "translateLocally";

/// Argument that switches the peer into its message-loop mode.
pub const NATIVE_MESSAGING_ARG: &str = "-p";

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub length_prefix_order: LengthPrefixOrder,
    pub max_frame_length: usize,
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn PeerSpawner>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("length_prefix_order", &self.length_prefix_order)
            .field("max_frame_length", &self.max_frame_length)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_PROGRAM)
    }
}

impl ClientConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![NATIVE_MESSAGING_ARG.to_string()],
            length_prefix_order: LengthPrefixOrder::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            spawner: Arc::new(CommandSpawner),
        }
    }

    /// Defaults overridden by `TLMSG_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("TLMSG_PEER") {
            Some(program) if !program.is_empty() => Self::new(program),
            _ => Self::default(),
        };

        if let Some(value) = lookup("TLMSG_SHUTDOWN_GRACE_MS") {
            let millis = value.parse::<u64>().map_err(|e| ConfigError {
                var: "TLMSG_SHUTDOWN_GRACE_MS",
                value: value.clone(),
                reason: e.to_string(),
            })?;
            config.shutdown_grace = Duration::from_millis(millis);
        }

        if let Some(value) = lookup("TLMSG_LENGTH_ORDER") {
            config.length_prefix_order = value.parse().map_err(|reason| ConfigError {
                var: "TLMSG_LENGTH_ORDER",
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(value) = lookup("TLMSG_MAX_FRAME_LENGTH") {
            let max = value
                .parse::<usize>()
                .map_err(|e| e.to_string())
                .and_then(|max| {
                    if max == 0 {
                        Err("must be greater than zero".to_string())
                    } else {
                        Ok(max)
                    }
                })
                .map_err(|reason| ConfigError {
                    var: "TLMSG_MAX_FRAME_LENGTH",
                    value: value.clone(),
                    reason,
                })?;
            config.max_frame_length = max;
        }

        Ok(config)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_length_prefix_order(mut self, order: LengthPrefixOrder) -> Self {
        self.length_prefix_order = order;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn PeerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub(crate) fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            order: self.length_prefix_order,
            max_frame_length: self.max_frame_length,
        }
    }
}
