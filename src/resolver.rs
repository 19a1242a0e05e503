//! Attribute → variant resolution.
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    provider::ConnectionProvider, ContentUidTable, ContentVariantUid, Error, Result, ShortAlias,
    VisitorAttributes, VisitorId,
};

/// Variants selected for one set of visitor attributes, in both identifier spaces.
///
/// `short_aliases` feed impression tracking, `content_uids` feed content fetching. The two sets are
/// derived independently and must never be mixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVariantSet {
    pub short_aliases: BTreeSet<ShortAlias>,
    pub content_uids: BTreeSet<ContentVariantUid>,
    /// Attributes the set was resolved for.
    pub source_attributes: VisitorAttributes,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedVariantSet {
    /// A set with no variants. Content falls back to defaults and no impressions are recorded.
    pub fn empty(source_attributes: VisitorAttributes) -> ResolvedVariantSet {
        ResolvedVariantSet {
            short_aliases: BTreeSet::new(),
            content_uids: BTreeSet::new(),
            source_attributes,
            resolved_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.short_aliases.is_empty() && self.content_uids.is_empty()
    }

    /// Whether both sets select the same variants, ignoring when and for which attributes they
    /// were resolved.
    pub fn same_variants(&self, other: &ResolvedVariantSet) -> bool {
        self.short_aliases == other.short_aliases && self.content_uids == other.content_uids
    }
}

/// Resolves visitor attributes into a [`ResolvedVariantSet`].
///
/// Every resolution submits the complete attribute set of one visitor in a single call and then
/// reads back that visitor's variants. Round trips through one resolver are serialized in
/// submission order, so the variants read back always belong to the attributes just submitted.
pub struct VariantResolver {
    provider: Arc<ConnectionProvider>,
    content_uids: ContentUidTable,
    timeout: Duration,
    submissions: Mutex<()>,
}

impl VariantResolver {
    /// Default timeout for one set-then-read round trip.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(
        provider: Arc<ConnectionProvider>,
        content_uids: ContentUidTable,
        timeout: Duration,
    ) -> VariantResolver {
        VariantResolver {
            provider,
            content_uids,
            timeout,
            submissions: Mutex::new(()),
        }
    }

    /// Resolve `attributes` for `visitor`, reporting why resolution was not possible.
    ///
    /// # Errors
    ///
    /// - [`Error::IncompleteAttributes`] if a dependent dimension is missing its parent (color
    ///   without country). Nothing is submitted in that case.
    /// - [`Error::NotConfigured`] or [`Error::ConnectionFailure`] if no connection is available.
    /// - [`Error::Timeout`] if the round trip takes longer than the configured timeout.
    pub async fn try_resolve(
        &self,
        visitor: &VisitorId,
        attributes: &VisitorAttributes,
    ) -> Result<ResolvedVariantSet> {
        attributes.validate()?;

        let connection = self.provider.get_connection().await?;

        let raw = {
            let _submission = self.submissions.lock().await;
            log::trace!(target: "personalize", visitor = visitor, attributes:serde = attributes; "submitting visitor attributes");
            tokio::time::timeout(self.timeout, async {
                connection.set_attributes(visitor, attributes).await?;
                Ok::<_, Error>(connection.variant_identifiers(visitor))
            })
            .await
            .map_err(|_elapsed| Error::Timeout)??
        };

        let resolved = self.normalize(&raw, attributes);
        log::debug!(target: "personalize",
            visitor = visitor,
            attributes:serde = attributes,
            raw:serde = raw,
            aliases = resolved.short_aliases.len(),
            content_uids = resolved.content_uids.len();
            "resolved variants");
        if resolved.is_empty() {
            log::warn!(target: "personalize", attributes:serde = attributes; "no variants matched, using default content");
        }
        Ok(resolved)
    }

    /// Resolve `attributes`, degrading to an empty set on any failure.
    pub async fn resolve(
        &self,
        visitor: &VisitorId,
        attributes: &VisitorAttributes,
    ) -> ResolvedVariantSet {
        match self.try_resolve(visitor, attributes).await {
            Ok(resolved) => resolved,
            Err(err) => {
                log::warn!(target: "personalize", attributes:serde = attributes; "failed to resolve variants, using default content: {:?}", err);
                ResolvedVariantSet::empty(attributes.clone())
            }
        }
    }

    /// Drop whatever the connection keeps for `visitor`. Does nothing before the connection is
    /// established.
    pub fn forget(&self, visitor: &VisitorId) {
        if let Some(connection) = self.provider.ready_connection() {
            log::trace!(target: "personalize", visitor = visitor; "forgetting visitor");
            connection.forget_visitor(visitor);
        }
    }

    /// Split raw vendor identifiers into the two identifier spaces.
    ///
    /// Short aliases come from the identifiers themselves. The content uid comes from the
    /// business attribute (the explicit currency, else the currency of the country) and is only
    /// present when at least one variant matched.
    pub fn normalize(&self, raw: &[String], attributes: &VisitorAttributes) -> ResolvedVariantSet {
        let short_aliases = raw
            .iter()
            .filter_map(|identifier| ShortAlias::from_raw_identifier(identifier))
            .collect::<BTreeSet<_>>();

        let content_uids = if short_aliases.is_empty() {
            BTreeSet::new()
        } else {
            attributes
                .effective_currency()
                .and_then(|currency| self.content_uids.lookup(currency))
                .cloned()
                .into_iter()
                .collect()
        };

        ResolvedVariantSet {
            short_aliases,
            content_uids,
            source_attributes: attributes.clone(),
            resolved_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use super::*;
    use crate::{
        connection::Connection,
        test_support::{init_logger, FakeClient, FakeConnection},
        Currency,
    };

    fn resolver_for(client: &Arc<FakeClient>, timeout: Duration) -> Arc<VariantResolver> {
        let provider = Arc::new(ConnectionProvider::new(
            client.clone(),
            Some("project".to_owned()),
            Duration::from_secs(5),
        ));
        Arc::new(VariantResolver::new(
            provider,
            ContentUidTable::default(),
            timeout,
        ))
    }

    fn resolver(client: &Arc<FakeClient>) -> Arc<VariantResolver> {
        resolver_for(client, VariantResolver::DEFAULT_TIMEOUT)
    }

    fn visitor() -> VisitorId {
        VisitorId::new("visitor")
    }

    fn aliases(values: &[&str]) -> BTreeSet<ShortAlias> {
        values.iter().map(|value| ShortAlias::new(*value)).collect()
    }

    fn content_uid(currency: Currency) -> ContentVariantUid {
        ContentUidTable::default().lookup(currency).unwrap().clone()
    }

    #[tokio::test]
    async fn india_resolves_to_inr_content() {
        init_logger();
        let client = Arc::new(FakeClient::new());
        let resolver = resolver(&client);

        let resolved = resolver
            .try_resolve(&visitor(), &VisitorAttributes::from_country("India"))
            .await
            .unwrap();

        assert_eq!(resolved.short_aliases, aliases(&["1"]));
        assert_eq!(
            resolved.content_uids,
            BTreeSet::from([content_uid(Currency::Inr)])
        );
        assert_eq!(resolved.source_attributes.country(), Some("India"));
    }

    #[tokio::test]
    async fn identical_attributes_resolve_identically() {
        let client = Arc::new(FakeClient::new());
        let resolver = resolver(&client);
        let attributes = VisitorAttributes::from_country("India").with_color("Red");

        let first = resolver.resolve(&visitor(), &attributes).await;
        let second = resolver.resolve(&visitor(), &attributes).await;

        assert!(first.same_variants(&second));
        assert_eq!(client.connection().submissions().len(), 2);
    }

    #[tokio::test]
    async fn compound_attributes_are_submitted_together() {
        let client = Arc::new(FakeClient::new());
        let resolver = resolver(&client);
        let attributes = VisitorAttributes::from_country("United States of America").with_color("Red");

        let resolved = resolver.resolve(&visitor(), &attributes).await;

        assert_eq!(client.connection().submissions(), vec![attributes]);
        assert_eq!(resolved.short_aliases, aliases(&["0", "3"]));
    }

    #[tokio::test]
    async fn color_without_country_is_rejected() {
        let client = Arc::new(FakeClient::new());
        let resolver = resolver(&client);

        let result = resolver
            .try_resolve(&visitor(), &VisitorAttributes::new().with_color("Red"))
            .await;

        assert!(matches!(result, Err(Error::IncompleteAttributes(_))));
        assert!(client.connection().submissions().is_empty());
    }

    #[tokio::test]
    async fn zero_variants_is_not_an_error() {
        let client = Arc::new(FakeClient::new());
        let resolver = resolver(&client);

        let resolved = resolver
            .try_resolve(&visitor(), &VisitorAttributes::from_country("Japan"))
            .await
            .unwrap();

        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn unavailable_connection_degrades_to_empty_set() {
        let client = Arc::new(FakeClient::new().failing());
        let resolver = resolver(&client);
        let attributes = VisitorAttributes::from_country("India");

        assert!(matches!(
            resolver.try_resolve(&visitor(), &attributes).await,
            Err(Error::ConnectionFailure(_))
        ));
        let resolved = resolver.resolve(&visitor(), &attributes).await;
        assert!(resolved.is_empty());
        assert_eq!(resolved.source_attributes, attributes);
    }

    #[tokio::test]
    async fn rejected_submission_degrades_to_empty_set() {
        let client = Arc::new(FakeClient::new());
        client.connection().set_fail_submissions(true);
        let resolver = resolver(&client);

        let resolved = resolver
            .resolve(&visitor(), &VisitorAttributes::from_country("India"))
            .await;

        assert!(resolved.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_round_trip_times_out() {
        let client = Arc::new(FakeClient::new());
        let attributes = VisitorAttributes::from_country("India");
        client
            .connection()
            .delay(attributes.clone(), Duration::from_secs(30));
        let resolver = resolver_for(&client, Duration::from_secs(1));

        assert!(matches!(
            resolver.try_resolve(&visitor(), &attributes).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn composite_identifiers_become_short_aliases() {
        let client = Arc::new(FakeClient::with_connection(Arc::new(
            FakeConnection::with_rule(|_| {
                vec![
                    "cs_personalize_a1b2_0".to_owned(),
                    "cs_personalize_c3d4_2".to_owned(),
                    "cs_personalize__".to_owned(),
                ]
            }),
        )));
        let resolver = resolver(&client);

        let resolved = resolver
            .resolve(&visitor(), &VisitorAttributes::from_country("Germany").with_currency(Currency::Eur))
            .await;

        assert_eq!(resolved.short_aliases, aliases(&["0", "2"]));
        assert_eq!(
            resolved.content_uids,
            BTreeSet::from([content_uid(Currency::Eur)])
        );
        // Neither space leaks into the other.
        assert!(resolved
            .short_aliases
            .iter()
            .all(|alias| !alias.as_str().starts_with("cs")));
    }

    #[tokio::test]
    async fn concurrent_submissions_read_their_own_variants() {
        let client = Arc::new(FakeClient::new());
        let india = VisitorAttributes::from_country("India");
        let us = VisitorAttributes::from_country("United States of America");
        client
            .connection()
            .delay(india.clone(), Duration::from_millis(50));
        let resolver = resolver(&client);

        let slow = {
            let resolver = resolver.clone();
            let india = india.clone();
            tokio::spawn(async move { resolver.resolve(&visitor(), &india).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fast = resolver.resolve(&visitor(), &us).await;
        let slow = slow.await.unwrap();

        assert_eq!(slow.short_aliases, aliases(&["1"]));
        assert_eq!(fast.short_aliases, aliases(&["0"]));
        assert_eq!(client.connection().submissions(), vec![india, us]);
    }

    #[tokio::test]
    async fn visitors_keep_their_own_variants() {
        let client = Arc::new(FakeClient::new());
        let resolver = resolver(&client);
        let india = VisitorId::new("india");
        let us = VisitorId::new("us");

        let first = resolver
            .resolve(&india, &VisitorAttributes::from_country("India"))
            .await;
        let second = resolver
            .resolve(&us, &VisitorAttributes::from_country("United States of America"))
            .await;

        assert_eq!(first.short_aliases, aliases(&["1"]));
        assert_eq!(second.short_aliases, aliases(&["0"]));
        assert_eq!(client.connection().variant_identifiers(&india), vec!["1"]);
        assert_eq!(client.connection().variant_identifiers(&us), vec!["0"]);
    }

    #[tokio::test]
    async fn forget_waits_for_an_established_connection() {
        let client = Arc::new(FakeClient::new());
        let resolver = resolver(&client);
        let visitor = visitor();

        resolver.forget(&visitor);
        assert_eq!(client.init_attempts(), 0);

        resolver
            .resolve(&visitor, &VisitorAttributes::from_country("India"))
            .await;
        resolver.forget(&visitor);

        assert_eq!(client.connection().forgotten(), vec![visitor.clone()]);
        assert!(client.connection().variant_identifiers(&visitor).is_empty());
    }
}
