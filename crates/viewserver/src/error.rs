use serde_json::{json, Value};
use thiserror::Error;

use crate::version::ProtocolVersion;

/// Errors that cross the view-server wire protocol.
///
/// The taxonomy has three kinds the host understands plus a catch-all for
/// anything the engine did not anticipate:
///
/// - [`Recoverable`](ViewServerError::Recoverable) poisons the current command
///   only; the engine answers with an error envelope and keeps serving.
/// - [`Fatal`](ViewServerError::Fatal) is a protocol- or system-level failure;
///   the engine answers once and exits with status 1.
/// - [`Forbidden`](ViewServerError::Forbidden) is a validation veto raised by a
///   `validate_doc_update` function; the engine keeps serving.
/// - [`Unexpected`](ViewServerError::Unexpected) is reported with the same
///   envelope shape as `Recoverable` but terminates the engine, mirroring how
///   an unhandled native exception would be treated.
#[derive(Clone, Debug, Error)]
pub enum ViewServerError {
    #[error("{id}: {reason}")]
    Recoverable { id: String, reason: String },
    #[error("fatal {id}: {reason}")]
    Fatal { id: String, reason: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{name}: {message}")]
    Unexpected { name: String, message: String },
}

impl ViewServerError {
    pub fn error(id: impl Into<String>, reason: impl Into<String>) -> Self {
        ViewServerError::Recoverable {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(id: impl Into<String>, reason: impl Into<String>) -> Self {
        ViewServerError::Fatal {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        ViewServerError::Forbidden(reason.into())
    }

    pub fn unexpected(name: impl Into<String>, message: impl Into<String>) -> Self {
        ViewServerError::Unexpected {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True when the engine must exit after responding.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ViewServerError::Fatal { .. } | ViewServerError::Unexpected { .. }
        )
    }

    /// Wire envelope for this error.
    ///
    /// Versions before 0.11.0 use object-shaped envelopes
    /// (`{"error": id, "reason": msg}`); 0.11.0 and later use array-shaped
    /// ones (`["error", id, msg]`). `Forbidden` keeps the same object shape
    /// across all versions.
    pub fn encode(&self, version: &ProtocolVersion) -> Value {
        match self {
            ViewServerError::Forbidden(reason) => json!({ "forbidden": reason }),
            ViewServerError::Recoverable { id, reason } | ViewServerError::Fatal { id, reason } => {
                encode_error(version, id, reason)
            }
            ViewServerError::Unexpected { name, message } => {
                encode_error(version, name, message)
            }
        }
    }
}

fn encode_error(version: &ProtocolVersion, id: &str, reason: &str) -> Value {
    if version.array_envelopes() {
        json!(["error", id, reason])
    } else {
        json!({ "error": id, "reason": reason })
    }
}
