use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod chunk;
pub mod validate;

pub use chunk::plan_sync_messages;
pub use validate::{parse_client_message, validate_size};

/// Action names accepted from clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Join,
    Update,
    Presence,
    CreateSnapshot,
    Leave,
    Ping,
    Pong,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::Join,
        ActionType::Update,
        ActionType::Presence,
        ActionType::CreateSnapshot,
        ActionType::Leave,
        ActionType::Ping,
        ActionType::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Join => "join",
            ActionType::Update => "update",
            ActionType::Presence => "presence",
            ActionType::CreateSnapshot => "create_snapshot",
            ActionType::Leave => "leave",
            ActionType::Ping => "ping",
            ActionType::Pong => "pong",
        }
    }

    pub fn parse(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == action)
    }

    /// Whether the action must name a document
    pub fn requires_document(&self) -> bool {
        matches!(
            self,
            ActionType::Join
                | ActionType::Update
                | ActionType::Presence
                | ActionType::CreateSnapshot
                | ActionType::Leave
        )
    }
}

/// Inbound message exactly as it arrives on the wire, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawClientMessage {
    pub action: Option<String>,
    pub document_id: Option<String>,
    pub update: Option<String>,
    pub last_known_version: Option<i64>,
    pub cursor: Option<JsonValue>,
    pub selection: Option<JsonValue>,
}

/// A validated client message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join {
        document_id: String,
        last_known_version: Option<i64>,
    },
    Update {
        document_id: String,
        update: String,
    },
    Presence {
        document_id: String,
        cursor: Option<JsonValue>,
        selection: Option<JsonValue>,
    },
    CreateSnapshot {
        document_id: String,
        update: String,
    },
    Leave {
        document_id: String,
    },
    Ping,
    Pong,
}

impl ClientMessage {
    pub fn action(&self) -> ActionType {
        match self {
            ClientMessage::Join { .. } => ActionType::Join,
            ClientMessage::Update { .. } => ActionType::Update,
            ClientMessage::Presence { .. } => ActionType::Presence,
            ClientMessage::CreateSnapshot { .. } => ActionType::CreateSnapshot,
            ClientMessage::Leave { .. } => ActionType::Leave,
            ClientMessage::Ping => ActionType::Ping,
            ClientMessage::Pong => ActionType::Pong,
        }
    }
}

/// What a presence event announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Join,
    Leave,
    Update,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full join response when it fits in one message
    Sync {
        snapshot: Option<String>,
        ops: Vec<String>,
        version: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    SyncSnapshotChunk {
        chunk_index: usize,
        chunk_count: usize,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    SyncOpsChunk { start_index: usize, ops: Vec<String> },
    #[serde(rename_all = "camelCase")]
    SyncOpFragment {
        op_index: usize,
        fragment_index: usize,
        fragment_count: usize,
        data: String,
    },
    /// Terminates a chunked join response
    #[serde(rename_all = "camelCase")]
    SyncComplete {
        version: Option<i64>,
        snapshot_chunk_count: usize,
        op_count: usize,
        ops_sent: usize,
    },
    #[serde(rename_all = "camelCase")]
    Update { document_id: String, update: String },
    #[serde(rename_all = "camelCase")]
    Presence {
        action: PresenceAction,
        user_id: String,
        user_name: Option<String>,
        email: Option<String>,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cursor: Option<JsonValue>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        selection: Option<JsonValue>,
    },
    #[serde(rename_all = "camelCase")]
    SnapshotNeeded { document_id: String },
    #[serde(rename_all = "camelCase")]
    SnapshotCreated { document_id: String, version: i64 },
    #[serde(rename_all = "camelCase")]
    RoleChanged { new_role: crate::access::Role },
    Error { code: String, message: String },
    Ping,
    Pong,
}

impl ServerMessage {
    /// Build the error reply for a failed client request
    pub fn error(err: &crate::SyncError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.client_message(),
        }
    }
}

/// Encode a message as a JSON text frame
pub fn encode_message<T: Serialize>(message: &T) -> crate::SyncResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a JSON text frame
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &str) -> crate::SyncResult<T> {
    Ok(serde_json::from_str(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_wire_shape() {
        let msg = ServerMessage::Sync {
            snapshot: None,
            ops: vec![],
            version: None,
        };
        let value: JsonValue = serde_json::from_str(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "sync", "snapshot": null, "ops": [], "version": null})
        );
    }

    #[test]
    fn test_camel_case_fields() {
        let msg = ServerMessage::SyncComplete {
            version: Some(3),
            snapshot_chunk_count: 2,
            op_count: 5,
            ops_sent: 5,
        };
        let value: JsonValue = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "sync_complete");
        assert_eq!(value["snapshotChunkCount"], 2);
        assert_eq!(value["opsSent"], 5);

        let msg = ServerMessage::SnapshotCreated {
            document_id: "d".into(),
            version: 1,
        };
        let value: JsonValue = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "snapshot_created", "documentId": "d", "version": 1}));
    }

    #[test]
    fn test_presence_omits_empty_cursor() {
        let msg = ServerMessage::Presence {
            action: PresenceAction::Leave,
            user_id: "u1".into(),
            user_name: Some("Ada".into()),
            email: None,
            timestamp: 42,
            cursor: None,
            selection: None,
        };
        let value: JsonValue = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["action"], "leave");
        assert_eq!(value["userId"], "u1");
        assert!(value.get("cursor").is_none());

        let decoded: ServerMessage = decode_message(&value.to_string()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(ActionType::parse("create_snapshot"), Some(ActionType::CreateSnapshot));
        assert_eq!(ActionType::parse("delete"), None);
        assert!(ActionType::Leave.requires_document());
        assert!(!ActionType::Ping.requires_document());
    }
}
