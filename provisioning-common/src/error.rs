use thiserror::Error;

use crate::ProviderType;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error taxonomy shared by the repository, the orchestrator and provider dispatch.
#[derive(Debug, Error)]
pub enum Error {
    /// Scoped lookup miss. Also returned for rows owned by another account.
    #[error("not found: {0}")]
    NotFound(String),

    /// A mutation touched an unexpected number of rows (concurrent delete or bad id).
    #[error("{operation}: expected {expected} affected row(s), got {affected}")]
    MismatchAffected {
        operation: &'static str,
        expected: u64,
        affected: u64,
    },

    /// Unique key taken, e.g. a second pubkey with the same name in one account.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Tenant identity with neither an org id nor an account number.
    #[error("identity has neither org id nor account number")]
    MissingIdentity,

    /// The reservation already reached Succeeded or Failed.
    #[error("reservation {0} is already finished")]
    AlreadyFinished(i64),

    /// The parent row exists but the detail row of its variant does not.
    #[error("reservation {0} has no detail row for its provider")]
    MissingDetail(i64),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unmapped architecture: {0}")]
    UnmappedArchitecture(String),

    /// Provider descriptor lacks a field upstream validation guarantees.
    #[error("instance type {instance_type}: missing {field}")]
    MissingField {
        instance_type: String,
        field: &'static str,
    },

    #[error("cannot initialize {provider} client: {source}")]
    ClientInitialization {
        provider: ProviderType,
        #[source]
        source: BoxError,
    },

    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn upstream(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Upstream {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn client_initialization(provider: ProviderType, source: impl Into<BoxError>) -> Self {
        Self::ClientInitialization {
            provider,
            source: source.into(),
        }
    }

    /// Returns a closure wrapping a sqlx error with the attempted operation, for `map_err`.
    pub fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Storage { operation, source }
    }

    /// Errors the transport layer should render as "not found". Row-count mismatches are
    /// included so a concurrent delete does not leak whether the row ever existed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::MismatchAffected { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_is_reported_as_not_found() {
        let err = Error::MismatchAffected {
            operation: "delete reservation",
            expected: 1,
            affected: 0,
        };
        assert!(err.is_not_found());
        assert!(Error::not_found("reservation 7").is_not_found());
        assert!(!Error::Cancelled.is_not_found());
        assert!(!Error::AlreadyFinished(7).is_not_found());
    }

    #[test]
    fn upstream_keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let err = Error::upstream("gcp status", io);
        assert_eq!(err.to_string(), "gcp status: connection reset");
        assert!(std::error::Error::source(&err).is_some());
    }
}
