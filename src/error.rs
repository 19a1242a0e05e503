use std::sync::Arc;

use crate::identifiers::ShortAlias;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while resolving variants or reporting impressions.
///
/// None of these are meant to reach a visitor. Callers degrade to default content when
/// personalization is unavailable, and impression errors are logged and dropped.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The personalization project identifier is missing. Only personalization features are
    /// affected; default content keeps working.
    #[error("personalization project uid is not configured")]
    NotConfigured,

    /// Setting up the personalization connection or submitting attributes failed.
    #[error("personalization connection failed: {0}")]
    ConnectionFailure(Arc<str>),

    /// No country could be detected for the visitor.
    #[error("could not detect visitor country")]
    GeolocationFailure,

    /// Reporting a single impression failed.
    #[error("failed to deliver impression for {alias}: {reason}")]
    ImpressionDeliveryFailure {
        /// Alias whose impression was not delivered.
        alias: ShortAlias,
        /// Underlying reason reported by the connection.
        reason: Arc<str>,
    },

    /// Attributes were submitted without a dimension that other dimensions depend on (e.g., a
    /// color preference without a country).
    #[error("incomplete visitor attributes: {0}")]
    IncompleteAttributes(&'static str),

    /// The personalization round trip did not complete in time.
    #[error("personalization request timed out")]
    Timeout,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Failed to (de)serialize persisted or wire data.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),
}

impl Error {
    /// Build a [`Error::ConnectionFailure`] from anything printable.
    pub fn connection(reason: impl std::fmt::Display) -> Error {
        Error::ConnectionFailure(reason.to_string().into())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}
