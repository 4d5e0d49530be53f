//! Error taxonomy for schema building, field access, decoding and dispatch.

use thiserror::Error;

/// Boxed error produced by a transport collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A message, service, field or method name was defined twice.
    #[error("duplicate definition of {kind} `{name}`")]
    DuplicateDefinition { kind: &'static str, name: String },

    /// A referenced type name is not registered.
    #[error("unresolved type `{name}` referenced by `{referenced_by}`")]
    UnresolvedType { name: String, referenced_by: String },

    /// Tag number out of range, reserved, or reused within one message.
    #[error("invalid tag {tag} for field `{field}`: {reason}")]
    InvalidTag {
        field: String,
        tag: u32,
        reason: &'static str,
    },

    #[error("message `{message}` has no field named `{field}`")]
    UnknownField { message: String, field: String },

    #[error("type mismatch for `{field}`: expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// Truncated buffer, runaway varint, bad UTF-8 or an unusable wire type.
    #[error("malformed wire data at offset {offset}: {reason}")]
    MalformedWireData { offset: usize, reason: String },

    #[error("service `{service}` has no method `{method}`")]
    UnknownMethod { service: String, method: String },

    #[error("no handler registered for `{method}`")]
    UnimplementedMethod { method: String },

    /// Opaque failure raised by the transport collaborator.
    #[error("transport error: {source}")]
    Transport {
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::MalformedWireData {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn duplicate(kind: &'static str, name: impl Into<String>) -> Self {
        Error::DuplicateDefinition {
            kind,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_keeps_source() {
        let inner: BoxError = "connection reset".into();
        let err = Error::Transport { source: inner };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection reset"));
        assert_eq!(err.to_string(), "transport error: connection reset");
    }

    #[test]
    fn test_display_messages() {
        let err = Error::malformed(7, "varint too long");
        assert_eq!(
            err.to_string(),
            "malformed wire data at offset 7: varint too long"
        );
        let err = Error::duplicate("message", "kv.GetRequest");
        assert_eq!(err.to_string(), "duplicate definition of message `kv.GetRequest`");
    }
}
