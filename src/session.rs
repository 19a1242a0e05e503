//! Per-visitor currency and variant state.
//!
//! A [`PersonalizationSession`] owns the visitor's [`SessionState`] and drives every transition:
//!
//! ```text
//! Uninitialized ──start──▶ Detecting ──country──▶ Resolved(Auto) ◀──reset_to_auto── Resolved(Manual)
//!       │                                               │                                ▲
//!       └────────────── persisted manual choice ────────┴──────set_manual_currency───────┘
//! ```
//!
//! Each transition takes a ticket. A resolution that completes after a newer transition was
//! requested is discarded, so slow responses never overwrite newer state.
//!
//! The render epoch advances when a transition changes the resolved variants and when content is
//! rendered on a different page than before, so every page view reports its impressions once.
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use serde_json::json;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    events::{
        DisplayContext, PageKey, MANUAL_CURRENCY_OVERRIDE_EVENT, PRODUCT_LIST_VIEWED_EVENT,
        PRODUCT_VIEWED_EVENT,
    },
    geolocation::AttributeOracle,
    impressions::{ImpressionReport, ImpressionTracker, RenderEpoch},
    preferences::{CurrencyPreference, PreferenceStore},
    resolver::{ResolvedVariantSet, VariantResolver},
    ContentScope, ContentVariantUid, Currency, CurrencyCountries, Error, Result, ShortAlias,
    VisitorAttributes, VisitorId, DEFAULT_COUNTRY,
};

/// How the session's currency was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Derived from the detected country.
    Auto,
    /// Explicitly chosen by the visitor.
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Uninitialized,
    /// Waiting for country detection.
    Detecting,
    Resolved {
        mode: SelectionMode,
        currency: Currency,
        /// Country submitted for audience matching.
        country: String,
        variants: ResolvedVariantSet,
    },
}

/// Read-only view of a session for the page layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub currency: Currency,
    /// Country reported by the oracle, `None` if detection failed or did not run.
    pub detected_country: Option<String>,
    pub short_aliases: BTreeSet<ShortAlias>,
    pub content_uids: BTreeSet<ContentVariantUid>,
    pub is_detecting: bool,
    pub is_loading: bool,
    pub render_epoch: RenderEpoch,
    /// `None` until the first resolution completes.
    pub mode: Option<SelectionMode>,
}

impl SessionSnapshot {
    /// Scope for content fetches rendered from this snapshot.
    pub fn content_scope(&self) -> ContentScope {
        if self.content_uids.is_empty() {
            ContentScope::Default
        } else {
            ContentScope::Variants(self.content_uids.clone())
        }
    }
}

/// Outcome of a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transition was applied; content should be rendered for this epoch.
    Applied(RenderEpoch),
    /// A newer transition was requested while this one was resolving. Its result was discarded.
    Superseded,
}

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long to wait for country detection before falling back to `default_country`.
    pub detection_timeout: Duration,
    pub default_country: String,
    /// Country submitted for a manually chosen currency.
    pub currency_countries: CurrencyCountries,
}

impl SessionSettings {
    pub const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for SessionSettings {
    fn default() -> SessionSettings {
        SessionSettings {
            detection_timeout: SessionSettings::DEFAULT_DETECTION_TIMEOUT,
            default_country: DEFAULT_COUNTRY.to_owned(),
            currency_countries: CurrencyCountries::default(),
        }
    }
}

struct SessionInner {
    state: SessionState,
    started: bool,
    detected_country: Option<String>,
    color: Option<String>,
    latest_ticket: u64,
    loading: bool,
    render_epoch: RenderEpoch,
    /// Page rendered in the current epoch.
    rendered_page: Option<PageKey>,
}

impl SessionInner {
    fn advance_epoch(&mut self) {
        self.render_epoch = self.render_epoch.next();
        self.rendered_page = None;
    }
}

impl SessionInner {
    fn snapshot(&self) -> SessionSnapshot {
        let (currency, variants, mode) = match &self.state {
            SessionState::Resolved {
                mode,
                currency,
                variants,
                ..
            } => (*currency, Some(variants), Some(*mode)),
            // USD until anything has been resolved.
            _ => (Currency::Usd, None, None),
        };
        SessionSnapshot {
            currency,
            detected_country: self.detected_country.clone(),
            short_aliases: variants
                .map(|v| v.short_aliases.clone())
                .unwrap_or_default(),
            content_uids: variants
                .map(|v| v.content_uids.clone())
                .unwrap_or_default(),
            is_detecting: matches!(self.state, SessionState::Detecting),
            is_loading: self.loading,
            render_epoch: self.render_epoch,
            mode,
        }
    }
}

/// One visitor's personalization session.
///
/// Sessions share the process-wide [`VariantResolver`] but own their impression ledger and their
/// [`VisitorId`]. Everything the connection keeps for the visitor is dropped with the session.
pub struct PersonalizationSession {
    resolver: Arc<VariantResolver>,
    tracker: ImpressionTracker,
    oracle: Arc<dyn AttributeOracle>,
    preferences: Arc<dyn PreferenceStore>,
    settings: SessionSettings,
    inner: Mutex<SessionInner>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl PersonalizationSession {
    pub fn new(
        resolver: Arc<VariantResolver>,
        tracker: ImpressionTracker,
        oracle: Arc<dyn AttributeOracle>,
        preferences: Arc<dyn PreferenceStore>,
        settings: SessionSettings,
    ) -> PersonalizationSession {
        let inner = SessionInner {
            state: SessionState::Uninitialized,
            started: false,
            detected_country: None,
            color: None,
            latest_ticket: 0,
            loading: false,
            render_epoch: RenderEpoch::INITIAL,
            rendered_page: None,
        };
        let (snapshots, _) = watch::channel(inner.snapshot());
        PersonalizationSession {
            resolver,
            tracker,
            oracle,
            preferences,
            settings,
            inner: Mutex::new(inner),
            snapshots,
        }
    }

    /// Start the session.
    ///
    /// A persisted manual currency is applied directly. Otherwise the visitor's country is
    /// detected and the currency derived from it. Calling `start` again does not start anything
    /// new: it waits until the session has settled and returns its current epoch.
    pub async fn start(&self) -> Transition {
        let already_started = std::mem::replace(&mut self.lock_inner().started, true);
        if already_started {
            return self.settled().await;
        }

        let preference = match self.preferences.load() {
            Ok(preference) => preference,
            Err(err) => {
                log::warn!(target: "personalize", "failed to load currency preference, detecting instead: {:?}", err);
                None
            }
        };

        match preference.and_then(|p| p.active_currency()) {
            Some(currency) => {
                log::debug!(target: "personalize", currency = currency.code(); "restoring manual currency");
                let ticket = self.begin(|_| {});
                self.apply_manual(ticket, currency).await
            }
            None => self.detect_and_resolve().await,
        }
    }

    /// Switch to a manually chosen currency and persist the choice.
    pub async fn set_manual_currency(&self, currency: Currency) -> Transition {
        if let Err(err) = self.preferences.save(&CurrencyPreference::manual(currency)) {
            log::warn!(target: "personalize", currency = currency.code(); "failed to persist currency preference: {:?}", err);
        }

        let (previous, detected_country) = {
            let inner = self.lock_inner();
            (inner.snapshot().currency, inner.detected_country.clone())
        };
        let ticket = self.begin(|_| {});
        self.tracker.track_event(
            MANUAL_CURRENCY_OVERRIDE_EVENT,
            json!({
                "previousCurrency": previous,
                "newCurrency": currency,
                "detectedCountry": detected_country,
            }),
        );

        self.apply_manual(ticket, currency).await
    }

    /// Drop the manual choice and go back to detection.
    pub async fn reset_to_auto(&self) -> Transition {
        if let Err(err) = self.preferences.clear() {
            log::warn!(target: "personalize", "failed to clear currency preference: {:?}", err);
        }
        self.detect_and_resolve().await
    }

    /// Add a color preference to the current attributes and re-resolve.
    ///
    /// # Errors
    ///
    /// [`Error::IncompleteAttributes`] if the session has no country yet.
    pub async fn select_color(&self, color: impl Into<String>) -> Result<Transition> {
        let color = color.into();
        let (ticket, mode, currency, country) = {
            let mut inner = self.lock_inner();
            let SessionState::Resolved {
                mode,
                currency,
                country,
                ..
            } = &inner.state
            else {
                return Err(Error::IncompleteAttributes("color requires country"));
            };
            let (mode, currency, country) = (*mode, *currency, country.clone());
            inner.color = Some(color);
            drop(inner);
            (self.begin(|_| {}), mode, currency, country)
        };

        Ok(self.complete(ticket, mode, currency, country).await)
    }

    /// Start a new render epoch for a page view the session cannot tell apart from the previous
    /// one (e.g., reloading the same page). Returns the current epoch unchanged before the first
    /// resolution.
    pub fn page_changed(&self) -> RenderEpoch {
        let mut inner = self.lock_inner();
        if matches!(inner.state, SessionState::Resolved { .. }) {
            inner.advance_epoch();
            log::trace!(target: "personalize", epoch = inner.render_epoch.value(); "page changed");
            self.publish(&inner);
        }
        inner.render_epoch
    }

    /// Report that content for `context` was rendered.
    ///
    /// Impressions are only recorded when the session is resolved, idle, the content belongs to
    /// the current render epoch and at least one variant is shown. Content rendered on another
    /// page than the previous render of the epoch starts a new epoch, and the returned report
    /// carries it. Returns the background recording, or `None` if nothing was recorded.
    pub fn content_rendered(&self, context: DisplayContext) -> Option<JoinHandle<ImpressionReport>> {
        let (aliases, context) = self.gate(context)?;
        Some(self.tracker.record_impressions(aliases, context))
    }

    /// Record a product detail view: impressions for the shown variants plus a
    /// [`PRODUCT_VIEWED_EVENT`].
    pub fn track_product_view(
        &self,
        product_id: &str,
        context: DisplayContext,
    ) -> Option<JoinHandle<ImpressionReport>> {
        let context = context.with_products([product_id]);
        let (aliases, context) = self.gate(context)?;
        self.tracker.track_event(
            PRODUCT_VIEWED_EVENT,
            json!({
                "productId": product_id,
                "shortUids": aliases,
                "country": context.extra.get("country"),
                "currency": context.extra.get("currency"),
            }),
        );
        Some(self.tracker.record_impressions(aliases, context))
    }

    /// Record a product list view: impressions for the shown variants plus a
    /// [`PRODUCT_LIST_VIEWED_EVENT`].
    pub fn track_product_list_view(
        &self,
        context: DisplayContext,
    ) -> Option<JoinHandle<ImpressionReport>> {
        let (aliases, context) = self.gate(context)?;
        self.tracker.track_event(
            PRODUCT_LIST_VIEWED_EVENT,
            json!({
                "listType": context.page,
                "productCount": context.product_ids.len(),
                "shortUids": aliases,
                "country": context.extra.get("country"),
                "currency": context.extra.get("currency"),
            }),
        );
        Some(self.tracker.record_impressions(aliases, context))
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.lock_inner().state.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receive a new snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// The tracker shared by this session's impressions and events.
    pub fn impression_tracker(&self) -> &ImpressionTracker {
        &self.tracker
    }

    /// Identity the session reports to the personalization service.
    pub fn visitor(&self) -> &VisitorId {
        self.tracker.visitor()
    }

    fn gate(&self, mut context: DisplayContext) -> Option<(Vec<ShortAlias>, DisplayContext)> {
        let mut inner = self.lock_inner();
        if !matches!(inner.state, SessionState::Resolved { .. }) {
            log::debug!(target: "personalize", "not recording impressions before variants are resolved");
            return None;
        }
        if inner.loading {
            log::debug!(target: "personalize", "not recording impressions while variants are changing");
            return None;
        }
        if context.render_epoch != inner.render_epoch {
            log::debug!(target: "personalize",
                rendered = context.render_epoch.value(),
                current = inner.render_epoch.value();
                "not recording impressions for content of another epoch");
            return None;
        }

        let page = context.page_key();
        if matches!(&inner.rendered_page, Some(rendered) if *rendered != page) {
            inner.advance_epoch();
            log::trace!(target: "personalize", epoch = inner.render_epoch.value(); "new page rendered");
            self.publish(&inner);
        }
        inner.rendered_page = Some(page);
        context.render_epoch = inner.render_epoch;

        let SessionState::Resolved {
            currency,
            country,
            variants,
            ..
        } = &inner.state
        else {
            return None;
        };
        if variants.short_aliases.is_empty() {
            log::trace!(target: "personalize", "no variants shown, no impressions to record");
            return None;
        }

        context
            .extra
            .entry("currency")
            .or_insert_with(|| currency.code().into());
        context
            .extra
            .entry("country")
            .or_insert_with(|| country.as_str().into());
        Some((variants.short_aliases.iter().cloned().collect(), context))
    }

    /// Wait until the session has resolved and no transition is in flight.
    async fn settled(&self) -> Transition {
        let mut snapshots = self.snapshots.subscribe();
        let settled = snapshots
            .wait_for(|snapshot| snapshot.mode.is_some() && !snapshot.is_loading)
            .await
            .map(|snapshot| snapshot.render_epoch);
        match settled {
            Ok(epoch) => Transition::Applied(epoch),
            Err(_) => Transition::Superseded,
        }
    }

    async fn detect_and_resolve(&self) -> Transition {
        let ticket = self.begin(|inner| inner.state = SessionState::Detecting);

        let detected = match tokio::time::timeout(
            self.settings.detection_timeout,
            self.oracle.detect_country(),
        )
        .await
        {
            Ok(Some(country)) => Some(country),
            Ok(None) => {
                log::warn!(target: "personalize", "{}, using {}", Error::GeolocationFailure, self.settings.default_country);
                None
            }
            Err(_elapsed) => {
                log::warn!(target: "personalize", "country detection timed out, using {}", self.settings.default_country);
                None
            }
        };

        let country = {
            let mut inner = self.lock_inner();
            if inner.latest_ticket != ticket {
                log::debug!(target: "personalize", "discarding detection result superseded by a newer transition");
                return Transition::Superseded;
            }
            inner.detected_country = detected.clone();
            detected.unwrap_or_else(|| self.settings.default_country.clone())
        };

        let currency = Currency::suggest_for_country(&country);
        self.complete(ticket, SelectionMode::Auto, currency, country)
            .await
    }

    async fn apply_manual(&self, ticket: u64, currency: Currency) -> Transition {
        let country = self
            .settings
            .currency_countries
            .country_for(currency)
            .to_owned();
        self.complete(ticket, SelectionMode::Manual, currency, country)
            .await
    }

    /// Take a new ticket, marking the session as loading.
    fn begin(&self, update: impl FnOnce(&mut SessionInner)) -> u64 {
        let mut inner = self.lock_inner();
        inner.latest_ticket += 1;
        inner.loading = true;
        update(&mut inner);
        self.publish(&inner);
        inner.latest_ticket
    }

    /// Resolve the attributes for the requested state and apply them unless `ticket` was
    /// superseded.
    async fn complete(
        &self,
        ticket: u64,
        mode: SelectionMode,
        currency: Currency,
        country: String,
    ) -> Transition {
        let color = self.lock_inner().color.clone();
        let mut attributes = VisitorAttributes::from_country(country.clone());
        if mode == SelectionMode::Manual {
            attributes = attributes.with_currency(currency);
        }
        if let Some(color) = color {
            attributes = attributes.with_color(color);
        }

        let variants = self.resolver.resolve(self.visitor(), &attributes).await;

        let mut inner = self.lock_inner();
        if inner.latest_ticket != ticket {
            log::debug!(target: "personalize",
                ticket = ticket,
                latest = inner.latest_ticket,
                currency = currency.code();
                "discarding resolution superseded by a newer transition");
            return Transition::Superseded;
        }

        let changed = match &inner.state {
            SessionState::Resolved {
                variants: previous, ..
            } => {
                previous.source_attributes != variants.source_attributes
                    || !previous.same_variants(&variants)
            }
            _ => true,
        };
        if changed {
            inner.advance_epoch();
        }

        log::debug!(target: "personalize",
            mode:? = mode,
            currency = currency.code(),
            country = country.as_str(),
            epoch = inner.render_epoch.value();
            "session resolved");
        inner.state = SessionState::Resolved {
            mode,
            currency,
            country,
            variants,
        };
        inner.loading = false;
        self.publish(&inner);
        Transition::Applied(inner.render_epoch)
    }

    fn publish(&self, inner: &SessionInner) {
        self.snapshots.send_replace(inner.snapshot());
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .expect("thread holding session lock should not panic")
    }
}

impl Drop for PersonalizationSession {
    fn drop(&mut self) {
        self.resolver.forget(self.visitor());
    }
}
