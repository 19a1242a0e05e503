//! The two variant identifier spaces.
//!
//! The personalization service and the CMS identify the same variant differently:
//!
//! - [`ShortAlias`] is the compact per-experience alias (`"0"`, `"1"`, ...) that impression
//!   recording expects.
//! - [`ContentVariantUid`] is the long CMS identifier (`"cs91db6b7e0d7f71e1"`) that variant-scoped
//!   content queries expect.
//!
//! Passing one where the other is expected silently serves default content, so they are separate
//! types with separate derivations: aliases are parsed out of raw vendor identifiers by
//! [`ShortAlias::from_raw_identifier`], content uids are looked up in a [`ContentUidTable`] keyed
//! by currency. Neither is ever derived from the other.
use std::{collections::HashMap, sync::Arc};

use derive_more::Display;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::currency::Currency;

/// Compact per-experience variant alias used for impression reporting.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortAlias(Arc<str>);

impl ShortAlias {
    /// Wrap an already-normalized alias.
    pub fn new(alias: impl Into<Arc<str>>) -> ShortAlias {
        ShortAlias(alias.into())
    }

    /// Derive an alias from a raw vendor identifier by taking its final `_`-delimited segment.
    ///
    /// `"1"` stays `"1"`, `"cs_personalize_a1_0"` becomes `"0"`. Returns `None` when the final
    /// segment is empty (e.g., `""` or `"cs_personalize_a1_"`).
    ///
    /// ```
    /// # use personalize::ShortAlias;
    /// assert_eq!(ShortAlias::from_raw_identifier("cs_personalize_a1_0"), Some(ShortAlias::new("0")));
    /// assert_eq!(ShortAlias::from_raw_identifier("cs_personalize_a1_"), None);
    /// ```
    pub fn from_raw_identifier(raw: &str) -> Option<ShortAlias> {
        let segment = raw.trim().rsplit('_').next()?;
        if segment.is_empty() {
            return None;
        }
        Some(ShortAlias::new(segment))
    }

    /// Get the alias as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl log::kv::ToValue for ShortAlias {
    fn to_value(&self) -> log::kv::Value<'_> {
        log::kv::Value::from_display(self)
    }
}

/// Full CMS identifier of a content variant, used to scope entry queries.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentVariantUid(Arc<str>);

impl ContentVariantUid {
    /// Wrap a CMS variant uid.
    pub fn new(uid: impl Into<Arc<str>>) -> ContentVariantUid {
        ContentVariantUid(uid.into())
    }

    /// Get the uid as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl log::kv::ToValue for ContentVariantUid {
    fn to_value(&self) -> log::kv::Value<'_> {
        log::kv::Value::from_display(self)
    }
}

/// Identity of one visitor towards the personalization service.
///
/// Attributes, active variants and impressions are all scoped to a visitor, so every session
/// carries its own id while sharing the process-wide connection.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitorId(Arc<str>);

impl VisitorId {
    /// Wrap a known visitor id (e.g., one stored in a cookie).
    pub fn new(id: impl Into<Arc<str>>) -> VisitorId {
        VisitorId(id.into())
    }

    /// Generate a fresh random id: 32 lowercase hex digits.
    pub fn random() -> VisitorId {
        let id: u128 = thread_rng().gen();
        VisitorId::new(format!("{id:032x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl log::kv::ToValue for VisitorId {
    fn to_value(&self) -> log::kv::Value<'_> {
        log::kv::Value::from_display(self)
    }
}

/// Explicit currency → [`ContentVariantUid`] mapping.
///
/// The default table holds the storefront's pricing variants. Deployments with a different CMS
/// stack should provide their own through
/// [`PersonalizeConfig::content_uids`](crate::PersonalizeConfig::content_uids).
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUidTable {
    uids: HashMap<Currency, ContentVariantUid>,
}

impl ContentUidTable {
    /// Create an empty table. Every lookup misses until entries are added.
    pub fn empty() -> ContentUidTable {
        ContentUidTable {
            uids: HashMap::new(),
        }
    }

    /// Add or replace the uid for `currency`.
    pub fn with(mut self, currency: Currency, uid: impl Into<Arc<str>>) -> ContentUidTable {
        self.uids.insert(currency, ContentVariantUid::new(uid));
        self
    }

    /// Look up the content variant for `currency`.
    pub fn lookup(&self, currency: Currency) -> Option<&ContentVariantUid> {
        self.uids.get(&currency)
    }
}

impl Default for ContentUidTable {
    fn default() -> ContentUidTable {
        ContentUidTable::empty()
            .with(Currency::Usd, "cs91db6b7e0d7f71e1")
            .with(Currency::Eur, "csc4ee31b822d1b0d0")
            .with(Currency::Inr, "csb474334af86d3526")
    }
}
