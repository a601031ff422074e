//! The error taxonomy reported by engine operations

use thiserror::Error;

use crate::{provider::ProviderError, ConnectionId};

/// The broad category of a [`SessionError`], for callers that branch on it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection is unknown
    NotRegistered,
    /// A refresh is already in flight for the connection
    AlreadyRefreshing,
    /// Too many refreshes are in flight; try again later
    ConcurrencyLimitDeferred,
    /// The registry is full
    SessionLimit,
    /// The session has been revoked and will not be refreshed again
    SessionInvalid,
    /// The credential was expired or rejected
    Token,
    /// The credential or request was malformed
    Validation,
    /// An internal or infrastructure failure
    System,
}

/// An error from a session engine operation
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection is not registered
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),
    /// A refresh is already in flight for the connection
    #[error("connection {0} is already refreshing")]
    AlreadyRefreshing(ConnectionId),
    /// The global concurrent refresh limit was reached
    #[error("concurrent refresh limit of {limit} reached, refresh deferred")]
    ConcurrencyLimitDeferred {
        /// The configured limit
        limit: usize,
    },
    /// The registry is full and eviction could not make room
    #[error("session limit of {max_sessions} reached")]
    CapacityExceeded {
        /// The configured capacity
        max_sessions: usize,
    },
    /// The session behind the connection is no longer valid
    #[error("session for connection {connection_id} is no longer valid")]
    SessionInvalid {
        /// The affected connection
        connection_id: ConnectionId,
        /// What the provider reported, if anything
        #[source]
        source: Option<ProviderError>,
    },
    /// The refreshed credential was rejected
    #[error("credential rejected")]
    Token(#[source] ProviderError),
    /// The credential or request was malformed
    #[error("invalid credential: {message}")]
    Validation {
        /// What was wrong
        message: String,
    },
    /// The identity provider could not be reached
    #[error("identity provider unavailable")]
    ProviderUnavailable(#[source] ProviderError),
    /// An unexpected internal failure
    #[error("internal error: {0}")]
    System(String),
}

impl SessionError {
    /// The category of the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRegistered(_) => ErrorKind::NotRegistered,
            Self::AlreadyRefreshing(_) => ErrorKind::AlreadyRefreshing,
            Self::ConcurrencyLimitDeferred { .. } => ErrorKind::ConcurrencyLimitDeferred,
            Self::CapacityExceeded { .. } => ErrorKind::SessionLimit,
            Self::SessionInvalid { .. } => ErrorKind::SessionInvalid,
            Self::Token(_) => ErrorKind::Token,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::ProviderUnavailable(_) | Self::System(_) => ErrorKind::System,
        }
    }

    /// Whether the same operation may succeed if attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRefreshing(_)
                | Self::ConcurrencyLimitDeferred { .. }
                | Self::CapacityExceeded { .. }
                | Self::Token(_)
                | Self::ProviderUnavailable(_)
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Maps a provider failure for `connection_id` onto the engine's taxonomy
    pub(crate) fn from_provider(connection_id: ConnectionId, error: ProviderError) -> Self {
        match error {
            ProviderError::SessionRevoked(_) => Self::SessionInvalid {
                connection_id,
                source: Some(error),
            },
            ProviderError::TokenRejected(_) => Self::Token(error),
            ProviderError::InvalidRequest(message) => Self::Validation { message },
            ProviderError::Unavailable(_) => Self::ProviderUnavailable(error),
        }
    }
}
