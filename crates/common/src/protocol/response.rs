// Outbound frames: request responses, protocol rejects and live notifications.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Id used for frames rejected before a request exists.
pub const REJECT_ID: &str = "onReject";

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Open,
    Failed,
    Closed,
}

impl RequestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Open => "open",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// The response envelope for a request.
///
/// `part` is omitted on the first frame of a request and counts from 2 on
/// every further frame. `reason` and `data` are set on failures and rejects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: String,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<u32>,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Answer to a frame that could not be turned into a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reject {
    pub id: String,
    pub reason: String,
    pub data: Value,
    pub time: i64,
}

impl Reject {
    pub fn new(reason: impl Into<String>, data: Value, time: i64) -> Self {
        Self { id: REJECT_ID.to_owned(), reason: reason.into(), data, time }
    }
}

/// Server-initiated frames that are not tied to a request of the receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum Notification {
    /// A document change made by another connection.
    Sync {
        repo: String,
        path: String,
        op: String,
        args: Value,
        origin: String,
        version: u64,
        time: i64,
    },

    /// The receiver's role on a repository changed.
    Role {
        repo: String,
        role: String,
        origin: String,
        time: i64,
    },
}

/// Anything the server writes to a socket.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Outbound {
    Response(Response),
    Reject(Reject),
    Notification(Notification),
}

impl Outbound {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
