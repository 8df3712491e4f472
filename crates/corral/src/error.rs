//! Error types for corral
//!
//! Every failure a caller can observe falls into one of four variants:
//! - [`Error::Connection`] — misuse of a handle, a torn-down connection, or a
//!   protocol violation at the holder boundary
//! - [`Error::Database`] — an error reported by the adapter; the connection
//!   stays alive
//! - [`Error::Disconnected`] — an error that forced the holder to tear the
//!   connection down and reconnect
//! - [`Error::Rollback`] / [`Error::Timeout`] — transaction and pool-queue
//!   outcomes

use thiserror::Error;

/// Boxed adapter-native error, carried as a source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for corral operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for corral
#[derive(Debug, Error)]
pub enum Error {
    /// Handle misuse, closed connection, or protocol violation
    #[error("{message}")]
    Connection {
        /// Human-readable description
        message: String,
    },

    /// Error reported by the adapter; the connection remains usable
    #[error("{source}")]
    Database {
        /// The adapter's own error
        #[source]
        source: BoxError,
    },

    /// Error that forced the connection to be torn down and reconnected
    #[error("{source}")]
    Disconnected {
        /// The adapter's own error
        #[source]
        source: BoxError,
    },

    /// The transaction failed or was explicitly rolled back
    #[error("transaction rolled back")]
    Rollback,

    /// Timed out waiting for a connection from the pool
    #[error("timeout: {message}")]
    Timeout {
        /// Human-readable description
        message: String,
    },
}

impl Error {
    /// Create a connection error with a custom message
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// The handle's check-out window is over or the connection is gone
    pub fn closed() -> Self {
        Self::connection("connection is closed")
    }

    /// The enclosing transaction has failed; operations short-circuit
    pub fn rolling_back() -> Self {
        Self::connection("transaction rolling back")
    }

    /// No ownership reservation exists for the calling principal
    pub fn no_ownership() -> Self {
        Self::connection("cannot find ownership process")
    }

    /// The cursor does not belong to this check-out window
    pub fn cursor_not_found() -> Self {
        Self::connection("cursor not found")
    }

    /// A callback panicked while a client held the connection
    pub fn client_stopped(principal: impl std::fmt::Display, detail: &str) -> Self {
        Self::connection(format!(
            "client {principal} stopped: ** (panic) {detail}"
        ))
    }

    /// An in-flight adapter callback exceeded its deadline
    pub fn operation_timeout(after: std::time::Duration) -> Self {
        Self::connection(format!("operation timed out after {after:?}"))
    }

    /// Wrap an adapter error that left the connection alive
    pub fn database(source: BoxError) -> Self {
        Self::Database { source }
    }

    /// Wrap an adapter error that tore the connection down
    pub fn disconnected(source: BoxError) -> Self {
        Self::Disconnected { source }
    }

    /// The pool queue deadline elapsed before a connection was granted
    pub fn queue_timeout() -> Self {
        Self::Timeout {
            message: "timed out waiting for an idle connection".into(),
        }
    }

    /// Whether this error tore the connection down
    #[inline]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    /// Whether this is the rollback outcome of a transaction
    #[inline]
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback)
    }

    /// Whether this is a pool-queue timeout
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("oops")]
    struct Oops;

    #[test]
    fn test_connection_messages() {
        assert_eq!(Error::closed().to_string(), "connection is closed");
        assert_eq!(
            Error::rolling_back().to_string(),
            "transaction rolling back"
        );
        assert_eq!(
            Error::no_ownership().to_string(),
            "cannot find ownership process"
        );
    }

    #[test]
    fn test_adapter_errors_display_as_source() {
        let err = Error::database(Box::new(Oops));
        assert_eq!(err.to_string(), "oops");
        assert!(!err.is_disconnect());

        let err = Error::disconnected(Box::new(Oops));
        assert_eq!(err.to_string(), "oops");
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_predicates() {
        assert!(Error::Rollback.is_rollback());
        assert!(Error::queue_timeout().is_timeout());
        assert!(!Error::closed().is_timeout());
        assert!(!Error::closed().is_disconnect());
    }

    #[test]
    fn test_client_stopped_message() {
        let err = Error::client_stopped("principal-7", "boom");
        assert_eq!(
            err.to_string(),
            "client principal-7 stopped: ** (panic) boom"
        );
    }
}
