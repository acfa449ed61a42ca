//! JSON protocol spoken between browser clients and the hub.
//!
//! Every frame is one JSON object tagged by `type`:
//! ```text
//! client → hub   {"type":"edit","content":"…"}      full document text
//!                {"type":"cursor","position":12}
//!                {"type":"join","user_id":"alice"}
//!                {"type":"ping"}
//! hub → client   {"type":"init","content":"…"}      on connect
//!                {"type":"edit","content":"…"}      post-merge text
//!                {"type":"cursor","position":12}
//!                {"type":"join","user_id":"alice"}
//!                {"type":"pong"}
//! ```
//!
//! Edits are content based: the client always ships its whole text and the
//! hub derives CRDT operations from it (see [`crate::diff`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a collaborative document.
///
/// Clients pick it through the connection path; it doubles as the
/// replication bus channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

fn anonymous() -> String {
    "anonymous".to_string()
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Full text as the client currently sees it
    Edit {
        #[serde(default)]
        content: String,
    },
    /// Ephemeral caret position, never persisted
    Cursor {
        #[serde(default)]
        position: u64,
    },
    /// Presence announcement
    Join {
        #[serde(default = "anonymous")]
        user_id: String,
    },
    /// Keepalive
    Ping,
}

impl ClientMessage {
    /// Parse one inbound text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Messages the hub sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Current visible text, sent once per connection
    Init { content: String },
    /// Visible text after an edit or rollback was merged
    Edit { content: String },
    Cursor { position: u64 },
    Join { user_id: String },
    Pong,
}

impl ServerMessage {
    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Inbound frame was not a valid client message
    Malformed(String),
    SerializationError(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed client message: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_edit() {
        let msg = ClientMessage::decode(r#"{"type":"edit","content":"hello"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Edit { content: "hello".into() });
    }

    #[test]
    fn test_decode_defaults() {
        assert_eq!(
            ClientMessage::decode(r#"{"type":"edit"}"#).unwrap(),
            ClientMessage::Edit { content: String::new() }
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"cursor"}"#).unwrap(),
            ClientMessage::Cursor { position: 0 }
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"join"}"#).unwrap(),
            ClientMessage::Join { user_id: "anonymous".into() }
        );
    }

    #[test]
    fn test_decode_ping_ignores_extra_fields() {
        let msg = ClientMessage::decode(r#"{"type":"ping","ts":12345}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_decode_malformed() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ClientMessage::decode(r#"{"content":"no type"}"#).is_err());
        assert!(ClientMessage::decode(r#"{"type":"explode"}"#).is_err());
        assert!(ClientMessage::decode(r#"{"type":"cursor","position":-3}"#).is_err());
    }

    #[test]
    fn test_encode_server_messages() {
        let init = ServerMessage::Init { content: "abc".into() }.encode().unwrap();
        assert_eq!(init, r#"{"type":"init","content":"abc"}"#);

        let pong = ServerMessage::Pong.encode().unwrap();
        assert_eq!(pong, r#"{"type":"pong"}"#);

        let join = ServerMessage::Join { user_id: "bob".into() }.encode().unwrap();
        assert_eq!(join, r#"{"type":"join","user_id":"bob"}"#);
    }

    #[test]
    fn test_document_id_display() {
        let id = DocumentId::from("design-notes");
        assert_eq!(id.to_string(), "design-notes");
        assert_eq!(id.as_str(), "design-notes");
        assert_eq!(DocumentId::new(String::from("x")), DocumentId::from("x"));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::Malformed("eof".into());
        assert!(err.to_string().contains("Malformed"));
    }
}
