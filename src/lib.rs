//! Variant resolution and impression deduplication for personalized storefronts.
//!
//! # Overview
//!
//! A storefront shows different content, prices and currency depending on who is visiting. The
//! crate sits between the storefront and a personalization service:
//!
//! - [`ConnectionProvider`] initializes the single connection to the service, once per process,
//!   even when many requests need it at the same time.
//! - [`VariantResolver`] submits a visitor's [`VisitorAttributes`] (country, currency, color) and
//!   turns the returned variants into a [`ResolvedVariantSet`]. Attributes and variants are kept
//!   per [`VisitorId`], so concurrent visitors never see each other's variants. The set carries
//!   two identifier spaces: [`ShortAlias`]es for impression reporting and [`ContentVariantUid`]s
//!   for content fetching ([`ContentScope`]).
//! - [`ImpressionTracker`] reports every displayed variant once per [`RenderEpoch`], in the
//!   background.
//! - [`PersonalizationSession`] ties these together for one visitor: it detects the country
//!   through an [`AttributeOracle`], honours a manually chosen [`Currency`] persisted in a
//!   [`PreferenceStore`], and publishes [`SessionSnapshot`]s for the page layer.
//!
//! [`Personalizer`], created from a [`PersonalizeConfig`], wires up the process-wide pieces.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! None of them should ever break a page. Resolution degrades to an empty variant set (default
//! content), impression and event failures are logged and dropped. Fallible variants such as
//! [`VariantResolver::try_resolve`] exist for diagnostics.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `personalize` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into variant resolution.
//!
//! # Examples
//!
//! A runnable example lives in the `demos/simple` directory of the repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
mod client;
mod config;
mod connection;
mod content;
mod currency;
mod edge_client;
mod error;
mod events;
mod geolocation;
mod identifiers;
mod impressions;
mod preferences;
mod provider;
mod resolver;
mod session;

#[cfg(test)]
mod test_support;

pub use attributes::{VisitorAttributes, COLOR, COUNTRY, CURRENCY};
pub use client::Personalizer;
pub use config::PersonalizeConfig;
pub use connection::{Connection, PersonalizationClient};
pub use content::{ContentFetcher, ContentScope};
pub use currency::{format_price, Currency, CurrencyCountries, UnknownCurrency, DEFAULT_COUNTRY};
pub use edge_client::{EdgeClient, EdgeConnection, Manifest, ManifestExperience};
pub use error::{Error, Result};
pub use events::{
    DisplayContext, ImpressionBatchEvent, PageType, IMPRESSIONS_TRACKED_EVENT,
    MANUAL_CURRENCY_OVERRIDE_EVENT, PRODUCT_LIST_VIEWED_EVENT, PRODUCT_VIEWED_EVENT,
};
pub use geolocation::{AttributeOracle, FixedCountry, GeolocationService, HttpGeolocationOracle};
pub use identifiers::{ContentUidTable, ContentVariantUid, ShortAlias, VisitorId};
pub use impressions::{ImpressionLedger, ImpressionReport, ImpressionTracker, RenderEpoch};
pub use preferences::{
    CurrencyPreference, JsonFilePreferenceStore, MemoryPreferenceStore, PreferenceStore,
};
pub use provider::{ConnectionProvider, ConnectionState};
pub use resolver::{ResolvedVariantSet, VariantResolver};
pub use session::{
    PersonalizationSession, SelectionMode, SessionSettings, SessionSnapshot, SessionState,
    Transition,
};
