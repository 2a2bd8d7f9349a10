use crate::error_bridge::ErrorRecord;
use crate::handle::registry::ScopeId;
use crate::handle::{HandleId, HandleKind};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErrorCode {
    StaleHandle,
    ScopeEnded,
    Native,
    UnhandledError,
    Capability,
    WrongThread,
    InvalidConfig,
    Validation,
}

impl BridgeErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeErrorCode::StaleHandle => "stale_handle",
            BridgeErrorCode::ScopeEnded => "scope_ended",
            BridgeErrorCode::Native => "native",
            BridgeErrorCode::UnhandledError => "unhandled_error",
            BridgeErrorCode::Capability => "capability",
            BridgeErrorCode::WrongThread => "wrong_thread",
            BridgeErrorCode::InvalidConfig => "invalid_config",
            BridgeErrorCode::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("{kind} handle {handle} is no longer valid")]
    StaleHandle { handle: HandleId, kind: HandleKind },
    #[error("scope {scope} has already ended")]
    ScopeEnded { scope: ScopeId },
    #[error("{0}")]
    Native(Arc<ErrorRecord>),
    /// Raised for every native call attempted while an earlier failure is
    /// still unrecovered. Wraps the same record each time.
    #[error("an error from a previous native call was not handled: {0}")]
    UnhandledError(Arc<ErrorRecord>),
    #[error("unsupported operation: {0}")]
    Capability(String),
    #[error("native host called from a non-privileged thread")]
    WrongThread,
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("validation error: {0}")]
    Validation(String),
}

impl BridgeError {
    pub fn code(&self) -> BridgeErrorCode {
        match self {
            BridgeError::StaleHandle { .. } => BridgeErrorCode::StaleHandle,
            BridgeError::ScopeEnded { .. } => BridgeErrorCode::ScopeEnded,
            BridgeError::Native(_) => BridgeErrorCode::Native,
            BridgeError::UnhandledError(_) => BridgeErrorCode::UnhandledError,
            BridgeError::Capability(_) => BridgeErrorCode::Capability,
            BridgeError::WrongThread => BridgeErrorCode::WrongThread,
            BridgeError::InvalidConfig { .. } => BridgeErrorCode::InvalidConfig,
            BridgeError::Validation(_) => BridgeErrorCode::Validation,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// The native record behind a native failure or an unhandled-error block.
    pub fn record(&self) -> Option<&Arc<ErrorRecord>> {
        match self {
            BridgeError::Native(record) | BridgeError::UnhandledError(record) => Some(record),
            _ => None,
        }
    }

    /// SQLSTATE reported by the native host, verbatim.
    pub fn sqlstate(&self) -> Option<&str> {
        self.record().map(|r| r.sqlstate().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{BridgeError, BridgeErrorCode};
    use crate::error_bridge::{ErrorRecord, Severity, SqlState};
    use std::sync::Arc;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(BridgeErrorCode::StaleHandle.as_str(), "stale_handle");
        assert_eq!(BridgeErrorCode::UnhandledError.as_str(), "unhandled_error");
        assert_eq!(BridgeErrorCode::WrongThread.as_str(), "wrong_thread");
    }

    #[test]
    fn native_errors_keep_code_and_message_verbatim() {
        let record = Arc::new(ErrorRecord::synthetic(
            Severity::Error,
            SqlState::new("42P01"),
            "relation \"missing\" does not exist",
        ));
        let err = BridgeError::Native(Arc::clone(&record));
        assert_eq!(err.code(), BridgeErrorCode::Native);
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(err.to_string().contains("relation \"missing\" does not exist"));

        let blocked = BridgeError::UnhandledError(record);
        assert_eq!(blocked.code_str(), "unhandled_error");
        assert_eq!(blocked.sqlstate(), Some("42P01"));
    }
}
