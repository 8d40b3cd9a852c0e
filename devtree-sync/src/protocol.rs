//! JSON event protocol for tree replication.
//!
//! Every WebSocket text frame carries one event:
//! ```text
//! { "event": "tree_request_init" }
//! { "event": "tree_init",   "data": <snapshot> }
//! { "event": "tree_update", "data": <patch> }
//! { "event": "tree_delete", "data": <patch> }
//! { "event": "tree_error",  "data": { "kind": ..., "detail": ... } }
//! { "event": "ping" } / { "event": "pong" }
//! ```
//!
//! Patch payloads stay as raw JSON until a tree applies them, so a patch of
//! the wrong shape is reported through `tree_error` rather than dropped as
//! an undecodable frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use devtree_core::{ErrorReport, Patch, TreeError, TreeEvent, TreeSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TreeMessage {
    TreeRequestInit,
    TreeInit(TreeSnapshot),
    TreeUpdate(Value),
    TreeDelete(Value),
    TreeError(ErrorReport),
    Ping,
    Pong,
}

impl TreeMessage {
    pub fn update(patch: &Patch) -> Self {
        TreeMessage::TreeUpdate(patch.to_value())
    }

    pub fn delete(patch: &Patch) -> Self {
        TreeMessage::TreeDelete(patch.to_value())
    }

    pub fn error(err: &TreeError) -> Self {
        TreeMessage::TreeError(ErrorReport::from(err))
    }

    /// The outgoing message for a loud tree mutation.
    pub fn from_event(event: &TreeEvent) -> Self {
        match event {
            TreeEvent::Update(patch) => Self::update(patch),
            TreeEvent::Delete(patch) => Self::delete(patch),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TreeMessage::TreeRequestInit => "tree_request_init",
            TreeMessage::TreeInit(_) => "tree_init",
            TreeMessage::TreeUpdate(_) => "tree_update",
            TreeMessage::TreeDelete(_) => "tree_delete",
            TreeMessage::TreeError(_) => "tree_error",
            TreeMessage::Ping => "ping",
            TreeMessage::Pong => "pong",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnexpectedFrame,
    ConnectionFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame => write!(f, "Unexpected frame type"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
