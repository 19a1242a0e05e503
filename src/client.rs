use std::sync::Arc;

use crate::{
    connection::PersonalizationClient, edge_client::EdgeClient, geolocation::AttributeOracle,
    impressions::ImpressionTracker, preferences::PreferenceStore, provider::ConnectionProvider,
    session::PersonalizationSession, PersonalizeConfig, Result, VariantResolver, VisitorId,
};

/// Process-wide entry point.
///
/// Holds the single [`ConnectionProvider`] and [`VariantResolver`] of the process and hands out
/// per-visitor [`PersonalizationSession`]s sharing them.
///
/// In order to create an instance, first create [`PersonalizeConfig`].
///
/// # Examples
/// ```
/// # use personalize::{PersonalizeConfig, Personalizer};
/// let personalizer: Personalizer = PersonalizeConfig::from_project_uid("project-uid")
///     .to_personalizer()
///     .unwrap();
/// ```
pub struct Personalizer {
    config: PersonalizeConfig,
    provider: Arc<ConnectionProvider>,
    resolver: Arc<VariantResolver>,
}

impl Personalizer {
    /// Create a `Personalizer` using `client` to reach the personalization service.
    pub fn new(config: PersonalizeConfig, client: Arc<dyn PersonalizationClient>) -> Self {
        let provider = Arc::new(ConnectionProvider::new(
            client,
            config.project_uid.clone(),
            config.init_timeout,
        ));
        let resolver = Arc::new(VariantResolver::new(
            provider.clone(),
            config.content_uids.clone(),
            config.resolve_timeout,
        ));
        Personalizer {
            config,
            provider,
            resolver,
        }
    }

    pub(crate) fn from_edge(config: PersonalizeConfig) -> Result<Self> {
        let client = EdgeClient::new(config.edge_base_url.clone())?;
        Ok(Personalizer::new(config, Arc::new(client)))
    }

    pub fn connection_provider(&self) -> &Arc<ConnectionProvider> {
        &self.provider
    }

    pub fn resolver(&self) -> &Arc<VariantResolver> {
        &self.resolver
    }

    /// A tracker for `visitor` with its own impression ledger. Sessions create one each; use this
    /// for impressions recorded outside of a session.
    pub fn impression_tracker(&self, visitor: VisitorId) -> ImpressionTracker {
        ImpressionTracker::new(self.provider.clone(), visitor)
    }

    /// Create a session for a new visitor. Call [`PersonalizationSession::start`] to resolve it.
    pub fn session(
        &self,
        oracle: Arc<dyn AttributeOracle>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> PersonalizationSession {
        self.session_for(VisitorId::random(), oracle, preferences)
    }

    /// Create a session for a returning visitor.
    pub fn session_for(
        &self,
        visitor: VisitorId,
        oracle: Arc<dyn AttributeOracle>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> PersonalizationSession {
        log::trace!(target: "personalize", visitor = visitor; "creating session");
        PersonalizationSession::new(
            self.resolver.clone(),
            self.impression_tracker(visitor),
            oracle,
            preferences,
            self.config.session_settings(),
        )
    }
}
