//! Seams to the personalization vendor.
//!
//! [`PersonalizationClient`] performs the expensive connection setup, [`Connection`] is the
//! established per-project connection. [`EdgeClient`](crate::EdgeClient) implements both over
//! HTTP; tests and alternative vendors provide their own implementations.
use std::sync::Arc;

use async_trait::async_trait;

use crate::{ShortAlias, VisitorAttributes, VisitorId};
#[cfg(doc)]
use crate::Error;

/// Sets up connections to the personalization service.
#[async_trait]
pub trait PersonalizationClient: Send + Sync {
    /// Establish a connection for `project_uid`.
    ///
    /// This is called at most once per process by
    /// [`ConnectionProvider`](crate::ConnectionProvider) (unless re-armed after a failure).
    ///
    /// # Errors
    ///
    /// Should return [`Error::ConnectionFailure`] (or a more specific network error) when the
    /// service cannot be reached.
    async fn init(&self, project_uid: &str) -> crate::Result<Arc<dyn Connection>>;
}

/// An established connection to the personalization service.
///
/// One connection serves every visitor of the process. Each call names the [`VisitorId`] it acts
/// for, and implementations keep attributes and active variants separate per visitor.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Replace the attributes of `visitor` used for audience matching.
    ///
    /// All dimensions arrive in one call so compound audiences (e.g., country and color) can
    /// match. Dimensions submitted earlier but missing now must be cleared. Submitting the same
    /// attributes twice must yield the same variants.
    async fn set_attributes(
        &self,
        visitor: &VisitorId,
        attributes: &VisitorAttributes,
    ) -> crate::Result<()>;

    /// Raw variant identifiers for the attributes last submitted for `visitor`. The shape is
    /// vendor-defined (plain aliases or composite strings).
    fn variant_identifiers(&self, visitor: &VisitorId) -> Vec<String>;

    /// Record that `visitor` was shown the variant identified by `alias`.
    async fn record_impression(&self, visitor: &VisitorId, alias: &ShortAlias)
        -> crate::Result<()>;

    /// Record an auxiliary analytics event for `visitor`.
    async fn record_event(
        &self,
        visitor: &VisitorId,
        name: &str,
        payload: serde_json::Value,
    ) -> crate::Result<()>;

    /// Drop any per-visitor state. Called when a session ends.
    fn forget_visitor(&self, _visitor: &VisitorId) {}
}
