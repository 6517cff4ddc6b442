use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while serving a sync session
///
/// Every variant except the delivery/store/io ones is a per-message error that
/// is serialized back to the originating connection as `error{code,message}`.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{message}")]
    Validation { code: ValidationCode, message: String },

    #[error("Access denied: {0}")]
    Access(String),

    #[error("Rate limit exceeded for action '{action}'")]
    RateLimited { action: String },

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Connection has not joined document {document_id}")]
    NotJoined { document_id: String },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Sub-kinds of validation failures, each with its own wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    MessageTooLarge,
    InvalidMessage,
    InvalidAction,
    InvalidDocumentId,
    InvalidUpdate,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ValidationCode::InvalidMessage => "INVALID_MESSAGE",
            ValidationCode::InvalidAction => "INVALID_ACTION",
            ValidationCode::InvalidDocumentId => "INVALID_DOCUMENT_ID",
            ValidationCode::InvalidUpdate => "INVALID_UPDATE",
        }
    }
}

/// Outcome of a failed push to a single recipient.
///
/// These never reach a client; the broadcast path turns them into registry
/// cleanup and a log line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("recipient transport is gone")]
    Gone,

    #[error("push timed out")]
    Timeout,

    /// Not produced by [`crate::gateway::LocalPushGateway`]; meant for
    /// gateways that relay to another node or an external push service
    #[error("recipient temporarily unavailable: {0}")]
    Unavailable(String),
}

impl SyncError {
    pub fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        SyncError::Validation {
            code,
            message: message.into(),
        }
    }

    /// Stable code sent to clients in `error` messages
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "AUTH_FAILED",
            SyncError::Validation { code, .. } => code.as_str(),
            SyncError::Access(_) => "ACCESS_DENIED",
            SyncError::RateLimited { .. } => "RATE_LIMITED",
            SyncError::Capacity(_) => "CAPACITY_EXCEEDED",
            SyncError::NotJoined { .. } => "NOT_JOINED",
            SyncError::Serialization(_) => "INVALID_MESSAGE",
            SyncError::Delivery(_)
            | SyncError::Store(_)
            | SyncError::Registry(_)
            | SyncError::Io(_)
            | SyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message text safe to show to the client. Internal failures are not
    /// echoed verbatim.
    pub fn client_message(&self) -> String {
        match self.code() {
            "INTERNAL_ERROR" => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Whether this error reflects a fault of the server rather than of the
    /// client's input
    pub fn is_internal(&self) -> bool {
        self.code() == "INTERNAL_ERROR"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(SyncError::Auth("expired".into()).code(), "AUTH_FAILED");
        assert_eq!(
            SyncError::validation(ValidationCode::InvalidDocumentId, "bad").code(),
            "INVALID_DOCUMENT_ID"
        );
        assert_eq!(
            SyncError::RateLimited {
                action: "update".into()
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(SyncError::from(DeliveryError::Gone).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_internal_errors_are_not_echoed() {
        let err = SyncError::Store("disk on fire".into());
        assert!(err.is_internal());
        assert_eq!(err.client_message(), "Internal server error");

        let err = SyncError::Access("viewer cannot edit".into());
        assert!(!err.is_internal());
        assert!(err.client_message().contains("viewer cannot edit"));
    }
}
