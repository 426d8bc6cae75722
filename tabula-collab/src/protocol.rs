//! Wire protocol for collaboration messages.
//!
//! The transport moves opaque frames ([`Payload`]). They are decoded into a
//! [`CollabMessage`] right at the boundary so nothing downstream handles
//! untyped blobs.
//!
//! Text frames carry JSON, binary frames carry bincode (standard config).
//! Both use the same externally tagged layout:
//!
//! ```text
//! {"presence":      {"user_id": "...", "user_name": "...", "permission": "editor", "timestamp": 1700000000000}}
//! {"cursor_move":   {"user_id": "...", "user_name": "...", "row": 4, "col": 2, "color": "#e0457b"}}
//! {"document_edit": {"user_id": "...", "sheet": "Sheet1", "cell": "C5", "value": "=A1*2"}}
//! ```

use serde::{Deserialize, Serialize};
use tabula_core::{CellId, CellValue};
use thiserror::Error;

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// What a collaborator is allowed to do with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Viewer,
    Editor,
}

impl Permission {
    pub fn can_edit(self) -> bool {
        matches!(self, Permission::Editor)
    }
}

/// Liveness/identity broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub user_name: String,
    pub permission: Permission,
    /// Sender's wall clock in milliseconds since the Unix epoch.
    /// Receipt time is used when absent.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// A collaborator's active cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorMove {
    pub user_id: String,
    pub user_name: String,
    pub row: u32,
    pub col: u32,
    /// Display color (`#rrggbb`). Derived from `user_id` when absent.
    #[serde(default)]
    pub color: Option<String>,
}

/// Replacement of one cell's raw content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEdit {
    pub user_id: String,
    pub sheet: String,
    pub cell: CellId,
    #[serde(default)]
    pub value: CellValue,
}

/// Every message this layer understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollabMessage {
    Presence(PresenceUpdate),
    CursorMove(CursorMove),
    DocumentEdit(DocumentEdit),
}

impl CollabMessage {
    /// Id of the user the message is about.
    pub fn user_id(&self) -> &str {
        match self {
            CollabMessage::Presence(p) => &p.user_id,
            CollabMessage::CursorMove(c) => &c.user_id,
            CollabMessage::DocumentEdit(e) => &e.user_id,
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_text(&self) -> Result<Payload, ProtocolError> {
        serde_json::to_string(self)
            .map(Payload::Text)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Encode as a bincode binary frame.
    pub fn to_binary(&self) -> Result<Payload, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map(Payload::Binary)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode a frame of either kind.
    pub fn decode(payload: &Payload) -> Result<Self, ProtocolError> {
        match payload {
            Payload::Text(text) => serde_json::from_str(text)
                .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
            Payload::Binary(bytes) => {
                let (msg, read) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                if read != bytes.len() {
                    return Err(ProtocolError::TrailingBytes(bytes.len() - read));
                }
                Ok(msg)
            }
        }
    }
}

/// Frame encoding used for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Bincode,
}

impl WireFormat {
    pub fn encode(self, msg: &CollabMessage) -> Result<Payload, ProtocolError> {
        match self {
            WireFormat::Json => msg.to_text(),
            WireFormat::Bincode => msg.to_binary(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
