//! Inbound message checks: raw size, JSON shape, action allow-list,
//! document id form and update payload encoding.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, PAD};
use base64::Engine;
use uuid::Uuid;

use super::{ActionType, ClientMessage, RawClientMessage};
use crate::error::{SyncError, SyncResult, ValidationCode};

pub const MAX_ACTION_LEN: usize = 50;
pub const MAX_DOCUMENT_ID_LEN: usize = 36;

/// Standard alphabet, canonical padding, but tolerant of non-zero trailing
/// bits. Update blobs are relayed verbatim so only well-formedness matters.
const UPDATE_ENGINE: GeneralPurpose =
    GeneralPurpose::new(&alphabet::STANDARD, PAD.with_decode_allow_trailing_bits(true));

/// Reject raw frames above the configured ceiling before parsing them
pub fn validate_size(raw: &str, max_bytes: usize) -> SyncResult<()> {
    if raw.len() > max_bytes {
        return Err(SyncError::validation(
            ValidationCode::MessageTooLarge,
            format!(
                "Message of {} bytes exceeds the {} byte limit",
                raw.len(),
                max_bytes
            ),
        ));
    }
    Ok(())
}

/// Parse and validate a text frame into a typed message
pub fn parse_client_message(raw: &str) -> SyncResult<ClientMessage> {
    let message: RawClientMessage = serde_json::from_str(raw).map_err(|e| {
        SyncError::validation(
            ValidationCode::InvalidMessage,
            format!("Malformed message: {}", e),
        )
    })?;
    validate_schema(message)
}

pub fn validate_schema(message: RawClientMessage) -> SyncResult<ClientMessage> {
    let action = validate_action(message.action.as_deref())?;

    let document_id = match message.document_id {
        Some(id) => {
            validate_document_id(&id)?;
            Some(id)
        }
        None if action.requires_document() => {
            return Err(SyncError::validation(
                ValidationCode::InvalidDocumentId,
                format!("Action '{}' requires a documentId", action.as_str()),
            ));
        }
        None => None,
    };
    // Only actions that require a document read this, so it is never empty there
    let document_id = document_id.unwrap_or_default();

    let parsed = match action {
        ActionType::Join => ClientMessage::Join {
            document_id,
            last_known_version: message.last_known_version,
        },
        ActionType::Update => ClientMessage::Update {
            document_id,
            update: validate_update(message.update)?,
        },
        ActionType::Presence => ClientMessage::Presence {
            document_id,
            cursor: message.cursor,
            selection: message.selection,
        },
        ActionType::CreateSnapshot => ClientMessage::CreateSnapshot {
            document_id,
            update: validate_update(message.update)?,
        },
        ActionType::Leave => ClientMessage::Leave {
            document_id,
        },
        ActionType::Ping => ClientMessage::Ping,
        ActionType::Pong => ClientMessage::Pong,
    };

    Ok(parsed)
}

fn validate_action(action: Option<&str>) -> SyncResult<ActionType> {
    let action = action.ok_or_else(|| {
        SyncError::validation(ValidationCode::InvalidAction, "Missing action")
    })?;

    if action.len() > MAX_ACTION_LEN {
        return Err(SyncError::validation(
            ValidationCode::InvalidAction,
            "Action name too long",
        ));
    }

    ActionType::parse(action).ok_or_else(|| {
        SyncError::validation(
            ValidationCode::InvalidAction,
            format!("Unknown action '{}'", action),
        )
    })
}

/// Document ids are hyphenated UUIDs, nothing else
pub fn validate_document_id(id: &str) -> SyncResult<()> {
    let well_formed = id.len() == MAX_DOCUMENT_ID_LEN && Uuid::try_parse(id).is_ok();
    if !well_formed {
        return Err(SyncError::validation(
            ValidationCode::InvalidDocumentId,
            "documentId must be a UUID",
        ));
    }
    Ok(())
}

fn validate_update(update: Option<String>) -> SyncResult<String> {
    let update = match update {
        Some(u) if !u.is_empty() => u,
        _ => {
            return Err(SyncError::validation(
                ValidationCode::InvalidUpdate,
                "Missing update payload",
            ))
        }
    };

    if UPDATE_ENGINE.decode(update.as_bytes()).is_err() {
        return Err(SyncError::validation(
            ValidationCode::InvalidUpdate,
            "Update payload is not valid base64",
        ));
    }
    Ok(update)
}
