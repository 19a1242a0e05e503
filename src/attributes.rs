use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{currency::Currency, Error, Result};

/// Attribute key holding the visitor's country name.
pub const COUNTRY: &str = "country";
/// Attribute key holding the visitor's currency code.
pub const CURRENCY: &str = "currency";
/// Attribute key holding the visitor's color preference.
pub const COLOR: &str = "color";

/// Attributes describing a visitor, submitted to the personalization service as a whole.
///
/// Keys are attribute names and values are strings. Ordering is deterministic so two attribute
/// sets built in a different order compare (and submit) identically.
///
/// # Examples
/// ```
/// # use personalize::VisitorAttributes;
/// let attributes = VisitorAttributes::from_country("India").with_color("Red");
/// assert_eq!(attributes.country(), Some("India"));
/// assert_eq!(attributes.color(), Some("Red"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitorAttributes(BTreeMap<String, String>);

impl VisitorAttributes {
    /// Create an empty attribute set.
    pub fn new() -> VisitorAttributes {
        VisitorAttributes::default()
    }

    /// Start from a detected or declared country.
    pub fn from_country(country: impl Into<String>) -> VisitorAttributes {
        VisitorAttributes::new().with(COUNTRY, country)
    }

    /// Return a copy with `key` set to `value`, replacing any previous value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> VisitorAttributes {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Return a copy with the currency attribute set.
    pub fn with_currency(self, currency: Currency) -> VisitorAttributes {
        self.with(CURRENCY, currency.code())
    }

    /// Return a copy with the color attribute set.
    pub fn with_color(self, color: impl Into<String>) -> VisitorAttributes {
        self.with(COLOR, color)
    }

    /// Get an attribute by name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The country attribute, if set.
    pub fn country(&self) -> Option<&str> {
        self.get(COUNTRY)
    }

    /// The color attribute, if set.
    pub fn color(&self) -> Option<&str> {
        self.get(COLOR)
    }

    /// The currency attribute, if set and supported.
    pub fn currency(&self) -> Option<Currency> {
        self.get(CURRENCY)?.parse().ok()
    }

    /// The currency these attributes price in: the explicit currency attribute if present,
    /// otherwise the currency suggested for the country.
    pub fn effective_currency(&self) -> Option<Currency> {
        self.currency()
            .or_else(|| self.country().map(Currency::suggest_for_country))
    }

    /// Check that dependent dimensions are accompanied by the dimensions they refine.
    ///
    /// A color preference only narrows a country audience, so color without country is rejected
    /// rather than submitted as a partial attribute set.
    pub fn validate(&self) -> Result<()> {
        if self.color().is_some() && self.country().is_none() {
            return Err(Error::IncompleteAttributes("color requires country"));
        }
        Ok(())
    }

    /// Whether no attributes are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VisitorAttributes {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        VisitorAttributes(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
