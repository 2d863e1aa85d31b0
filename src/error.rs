use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification used by transports and retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, cycles, window violations.
    Validation,
    /// Referenced entity does not exist or is soft-deleted.
    NotFound,
    /// Duplicate name, blocked delete, double assignment.
    Conflict,
    /// Credential could not be verified.
    Unauthenticated,
    /// Store, cache or audit backend unavailable or timed out.
    Infrastructure,
}

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Store error wrapped with the failing operation.
    #[error("store error during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
    /// A bounded call ran past its deadline.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid permission input.
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    /// Generic input validation failure.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Entity lookup failed.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    /// Write conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Parent chain loops back on itself.
    #[error("{kind} cycle detected at {id}")]
    CycleDetected { kind: &'static str, id: String },
    /// Parent chain is longer than the configured bound.
    #[error("{kind} hierarchy depth exceeded at {id}; max depth {max_depth}")]
    DepthExceeded {
        kind: &'static str,
        id: String,
        max_depth: usize,
    },
    /// Token could not be decoded or verified.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Token names a key id that is not trusted.
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),
}

impl Error {
    /// Returns the coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store { .. } | Self::Timeout { .. } => ErrorKind::Infrastructure,
            Self::InvalidId(_)
            | Self::InvalidPermission(_)
            | Self::Validation(_)
            | Self::CycleDetected { .. }
            | Self::DepthExceeded { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidToken(_) | Self::UnknownSigningKey(_) => ErrorKind::Unauthenticated,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_are_retryable() {
        let err = Error::Timeout {
            operation: "load role",
        };
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.is_retryable());

        let err = Error::Store {
            operation: "load group",
            source: "connection reset".into(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("load group"));
    }

    #[test]
    fn business_errors_are_not_retryable() {
        let err = Error::Conflict("role admin already exists".to_string());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());

        let err = Error::CycleDetected {
            kind: "group",
            id: "g1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
