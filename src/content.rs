//! Boundary to the CMS content-fetch layer.
use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::{ContentVariantUid, ResolvedVariantSet, Result};

/// Which content to fetch for a resolved variant set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentScope {
    /// No variant matched (or personalization is unavailable): fetch base entries.
    Default,
    /// Fetch entries personalized for these variants.
    Variants(BTreeSet<ContentVariantUid>),
}

impl ContentScope {
    pub fn is_default(&self) -> bool {
        matches!(self, ContentScope::Default)
    }

    /// Variant uids to request, empty for [`ContentScope::Default`].
    pub fn variant_uids(&self) -> impl Iterator<Item = &ContentVariantUid> {
        let uids = match self {
            ContentScope::Default => None,
            ContentScope::Variants(uids) => Some(uids),
        };
        uids.into_iter().flatten()
    }

    /// Comma-separated variant list as accepted by the CMS delivery API, or `None` for default
    /// content.
    ///
    /// ```
    /// # use personalize::{ContentScope, ContentVariantUid};
    /// let scope = ContentScope::Variants([ContentVariantUid::new("cs1"), ContentVariantUid::new("cs2")].into());
    /// assert_eq!(scope.variant_param().as_deref(), Some("cs1,cs2"));
    /// assert_eq!(ContentScope::Default.variant_param(), None);
    /// ```
    pub fn variant_param(&self) -> Option<String> {
        let uids = self.variant_uids().map(ContentVariantUid::as_str).collect::<Vec<_>>();
        (!uids.is_empty()).then(|| uids.join(","))
    }
}

impl From<&ResolvedVariantSet> for ContentScope {
    fn from(resolved: &ResolvedVariantSet) -> ContentScope {
        if resolved.content_uids.is_empty() {
            ContentScope::Default
        } else {
            ContentScope::Variants(resolved.content_uids.clone())
        }
    }
}

/// Fetches CMS entries for a [`ContentScope`].
///
/// Implemented by the application's CMS client. Only the scope crosses this boundary; short
/// aliases never reach content fetching.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_entries(
        &self,
        content_type: &str,
        scope: &ContentScope,
    ) -> Result<Vec<serde_json::Value>>;
}
