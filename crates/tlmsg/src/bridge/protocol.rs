//! Wire message types for the native-messaging protocol.
//!
//! Outbound: `{"command", "id", "data"}`.
//! Inbound, recognized shapes only:
//! - terminal success `{"id", "success": true, "data"}`
//! - terminal failure `{"id", "success": false, "error"}`
//! - progress update `{"id", "update"}`
//!
//! Anything else is reported as [`UnrecognizedMessage`] and dropped by the
//! reader loop.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Correlation id linking a request to its progress updates and response.
///
/// Allocated from a per-client counter starting at 1; never 0, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    pub id: RequestId,
    pub data: Value,
}

/// Terminal outcome carried by a response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Success(Value),
    Failure(String),
    /// `success` was present but the matching `data`/`error` field was not.
    Invalid(String),
}

/// A recognized inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response {
        id: RequestId,
        outcome: ResponseOutcome,
    },
    Progress {
        id: RequestId,
        update: Value,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UnrecognizedMessage {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no integer id")]
    MissingId,
    #[error("message {id} is neither a response nor a progress update")]
    UnknownShape { id: RequestId },
}

/// Field-level view of an inbound object. Absent and `null` are kept apart
/// for `data`/`update`, since `null` is a legitimate payload.
#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, deserialize_with = "present")]
    update: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl InboundMessage {
    /// Parse and classify one frame body.
    pub fn from_slice(frame: &[u8]) -> Result<Self, UnrecognizedMessage> {
        let raw: RawInbound = serde_json::from_slice(frame)?;
        Self::classify(raw)
    }

    pub fn id(&self) -> RequestId {
        match self {
            Self::Response { id, .. } | Self::Progress { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    fn classify(raw: RawInbound) -> Result<Self, UnrecognizedMessage> {
        let id = RequestId::new(raw.id.ok_or(UnrecognizedMessage::MissingId)?);

        if let Some(success) = raw.success {
            let outcome = match (success, raw.data, raw.error) {
                (true, Some(data), _) => ResponseOutcome::Success(data),
                (true, None, _) => {
                    ResponseOutcome::Invalid("success response without `data`".to_string())
                }
                (false, _, Some(error)) => ResponseOutcome::Failure(error),
                (false, _, None) => {
                    ResponseOutcome::Invalid("failure response without `error`".to_string())
                }
            };
            return Ok(Self::Response { id, outcome });
        }

        match raw.update {
            Some(update) => Ok(Self::Progress { id, update }),
            None => Err(UnrecognizedMessage::UnknownShape { id }),
        }
    }
}
