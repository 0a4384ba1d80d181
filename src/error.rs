//! Error types for the resolution engine
//!
//! "Not found" from the external service is not an error anywhere in this
//! crate: it is an empty result. Mapping conflicts are not errors either;
//! they are resolved by policy and written to the audit trail.

use thiserror::Error;

/// Errors from the temp identity generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TempIdError {
    #[error("Temp identity requires a non-empty business key")]
    EmptyBusinessKey,

    #[error("Temp identity salt is not configured")]
    EmptySalt,
}

/// Errors from a cache store backend.
#[derive(Error, Debug)]
pub enum CacheStoreError {
    /// The store cannot be read at all. Fatal for a resolver batch.
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cache store query failed: {0}")]
    Backend(String),

    #[error("Invalid cache entry for {lookup_type}:{lookup_key}: {reason}")]
    InvalidEntry {
        lookup_type: String,
        lookup_key: String,
        reason: String,
    },
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for CacheStoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => CacheStoreError::Unavailable(e.to_string()),
            other => CacheStoreError::Backend(other.to_string()),
        }
    }
}

/// Errors from an enrichment queue backend.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Enrichment queue unavailable: {0}")]
    Unavailable(String),

    #[error("Enrichment queue query failed: {0}")]
    Backend(String),

    #[error("Queue entry {id} not found or not in state '{expected}'")]
    InvalidTransition { id: i64, expected: &'static str },
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => QueueError::Unavailable(e.to_string()),
            other => QueueError::Backend(other.to_string()),
        }
    }
}

/// Why a transient lookup failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Connection,
    ServerError,
    RateLimited,
    CircuitOpen,
}

/// Why a permanent lookup failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    Unauthorized,
    BadRequest,
    MalformedResponse,
    InvalidInput,
}

/// Errors from the external lookup service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    /// Retryable with backoff.
    #[error("Transient lookup failure ({kind:?}): {message}")]
    Transient { kind: TransientKind, message: String },

    /// Retrying will not help.
    #[error("Permanent lookup failure ({kind:?}): {message}")]
    Permanent { kind: PermanentKind, message: String },
}

impl LookupError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            Self::Transient {
                kind: TransientKind::CircuitOpen,
                ..
            }
        )
    }
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting '{0}'")]
    Missing(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors that fail a whole resolver batch.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Cache store error: {0}")]
    Cache(#[from] CacheStoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Temp identity error: {0}")]
    TempId(#[from] TempIdError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_classification() {
        let e = LookupError::transient(TransientKind::CircuitOpen, "open");
        assert!(e.is_transient());
        assert!(e.is_circuit_open());

        let e = LookupError::permanent(PermanentKind::Unauthorized, "401");
        assert!(!e.is_transient());
        assert!(!e.is_circuit_open());
    }

    #[test]
    fn test_error_messages() {
        let e = CacheStoreError::Unavailable("connection refused".into());
        assert_eq!(e.to_string(), "Cache store unavailable: connection refused");

        let e: ResolverError = TempIdError::EmptyBusinessKey.into();
        assert!(e.to_string().contains("non-empty business key"));
    }
}
