//! Error types for meridiandb-connector.

use std::sync::Arc;

use thiserror::Error;

/// A shared, clonable error cause.
///
/// Refresh results are fanned out to every caller waiting on the same
/// operation, so errors must be clonable. Underlying causes are held behind
/// an `Arc` to keep the full chain intact across clones.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the connector.
///
/// Every instance-scoped variant carries the instance in its short dotted
/// form. Error text never contains OAuth tokens or certificate material.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The caller supplied something invalid: a malformed instance URI, an
    /// endpoint kind the instance does not have, or an incompatible option
    /// combination.
    #[error("configuration error: {message} (instance = {instance})")]
    Config {
        message: String,
        instance: String,
    },

    /// A control-plane call failed or returned unusable data.
    #[error("refresh error: {message} (instance = {instance})")]
    Refresh {
        message: String,
        instance: String,
        #[source]
        source: Option<Cause>,
    },

    /// The dial pipeline failed: TCP connect, TLS handshake, keep-alive
    /// configuration, or the metadata exchange.
    #[error("dial error: {message} (instance = {instance})")]
    Dial {
        message: String,
        instance: String,
        #[source]
        source: Option<Cause>,
    },

    /// The dialer has been closed.
    #[error("dialer is closed")]
    Closed,

    /// The caller's cancellation (or the dialer shutting down) was observed
    /// before the operation completed.
    #[error("operation cancelled (instance = {instance})")]
    Cancelled { instance: String },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>, instance: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            instance: instance.into(),
        }
    }

    pub(crate) fn refresh(
        message: impl Into<String>,
        instance: impl Into<String>,
        source: Option<Cause>,
    ) -> Self {
        Error::Refresh {
            message: message.into(),
            instance: instance.into(),
            source,
        }
    }

    pub(crate) fn dial(
        message: impl Into<String>,
        instance: impl Into<String>,
        source: Option<Cause>,
    ) -> Self {
        Error::Dial {
            message: message.into(),
            instance: instance.into(),
            source,
        }
    }

    pub(crate) fn cancelled(instance: impl Into<String>) -> Self {
        Error::Cancelled {
            instance: instance.into(),
        }
    }

    /// Wrap an arbitrary error as a shared cause.
    pub(crate) fn cause(err: impl std::error::Error + Send + Sync + 'static) -> Option<Cause> {
        Some(Arc::new(err))
    }
}

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, Error>;
