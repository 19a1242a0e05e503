//! Test doubles for the vendor seams.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    connection::{Connection, PersonalizationClient},
    geolocation::AttributeOracle,
    Error, Result, ShortAlias, VisitorAttributes, VisitorId,
};

type VariantRule = Box<dyn Fn(&VisitorAttributes) -> Vec<String> + Send + Sync>;

/// Audience rules used by most tests: India → alias "1", United States → alias "0", a red color
/// preference adds a composite alias for the color experience.
pub fn storefront_rules(attributes: &VisitorAttributes) -> Vec<String> {
    let mut variants = Vec::new();
    match attributes.country() {
        Some("India") => variants.push("1".to_owned()),
        Some("United States of America") => variants.push("0".to_owned()),
        _ => {}
    }
    if attributes.color() == Some("Red") && attributes.country().is_some() {
        variants.push("cs_personalize_colors_3".to_owned());
    }
    variants
}

pub struct FakeConnection {
    rule: VariantRule,
    current: Mutex<HashMap<VisitorId, Vec<String>>>,
    submissions: Mutex<Vec<(VisitorId, VisitorAttributes)>>,
    delays: Mutex<HashMap<VisitorAttributes, Duration>>,
    fail_submissions: AtomicBool,
    impressions: Mutex<Vec<(VisitorId, ShortAlias)>>,
    failing_aliases: Mutex<HashSet<ShortAlias>>,
    require_active_variant: AtomicBool,
    events: Mutex<Vec<(String, serde_json::Value)>>,
    fail_events: AtomicBool,
    forgotten: Mutex<Vec<VisitorId>>,
}

impl FakeConnection {
    pub fn new() -> FakeConnection {
        FakeConnection::with_rule(storefront_rules)
    }

    pub fn with_rule(
        rule: impl Fn(&VisitorAttributes) -> Vec<String> + Send + Sync + 'static,
    ) -> FakeConnection {
        FakeConnection {
            rule: Box::new(rule),
            current: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            fail_submissions: AtomicBool::new(false),
            impressions: Mutex::new(Vec::new()),
            failing_aliases: Mutex::new(HashSet::new()),
            require_active_variant: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
            fail_events: AtomicBool::new(false),
            forgotten: Mutex::new(Vec::new()),
        }
    }

    /// Behave like a manifest-backed service: an impression is only accepted for a variant that
    /// is active for the reporting visitor.
    pub fn require_active_variant(self) -> FakeConnection {
        self.require_active_variant.store(true, Ordering::SeqCst);
        self
    }

    /// Delay the submission of exactly `attributes`.
    pub fn delay(&self, attributes: VisitorAttributes, delay: Duration) {
        self.delays.lock().unwrap().insert(attributes, delay);
    }

    pub fn set_fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_impressions_for(&self, alias: &str) {
        self.failing_aliases
            .lock()
            .unwrap()
            .insert(ShortAlias::new(alias));
    }

    pub fn heal_impressions(&self) {
        self.failing_aliases.lock().unwrap().clear();
    }

    pub fn set_fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<VisitorAttributes> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, attributes)| attributes.clone())
            .collect()
    }

    pub fn impressions(&self) -> Vec<String> {
        self.impressions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, alias)| alias.as_str().to_owned())
            .collect()
    }

    pub fn impressions_for(&self, visitor: &VisitorId) -> Vec<String> {
        self.impressions
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| owner == visitor)
            .map(|(_, alias)| alias.as_str().to_owned())
            .collect()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn forgotten(&self) -> Vec<VisitorId> {
        self.forgotten.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn set_attributes(
        &self,
        visitor: &VisitorId,
        attributes: &VisitorAttributes,
    ) -> Result<()> {
        self.submissions
            .lock()
            .unwrap()
            .push((visitor.clone(), attributes.clone()));

        let delay = self.delays.lock().unwrap().get(attributes).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(Error::connection("attribute submission rejected"));
        }

        self.current
            .lock()
            .unwrap()
            .insert(visitor.clone(), (self.rule)(attributes));
        Ok(())
    }

    fn variant_identifiers(&self, visitor: &VisitorId) -> Vec<String> {
        self.current
            .lock()
            .unwrap()
            .get(visitor)
            .cloned()
            .unwrap_or_default()
    }

    async fn record_impression(&self, visitor: &VisitorId, alias: &ShortAlias) -> Result<()> {
        // Impressions only ever carry short aliases: no composite prefixes, no CMS uids.
        assert!(
            !alias.as_str().contains('_') && !alias.as_str().starts_with("cs"),
            "impression recorded with a non-alias identifier: {alias}"
        );
        tokio::task::yield_now().await;

        if self.failing_aliases.lock().unwrap().contains(alias) {
            return Err(Error::connection("impression endpoint unavailable"));
        }
        if self.require_active_variant.load(Ordering::SeqCst) {
            let active = self
                .variant_identifiers(visitor)
                .iter()
                .filter_map(|raw| ShortAlias::from_raw_identifier(raw))
                .any(|active| &active == alias);
            if !active {
                return Err(Error::connection(format!(
                    "variant {alias} is not active for visitor {visitor}"
                )));
            }
        }
        self.impressions
            .lock()
            .unwrap()
            .push((visitor.clone(), alias.clone()));
        Ok(())
    }

    async fn record_event(
        &self,
        _visitor: &VisitorId,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(Error::connection("event endpoint unavailable"));
        }
        self.events.lock().unwrap().push((name.to_owned(), payload));
        Ok(())
    }

    fn forget_visitor(&self, visitor: &VisitorId) {
        self.current.lock().unwrap().remove(visitor);
        self.forgotten.lock().unwrap().push(visitor.clone());
    }
}

pub struct FakeClient {
    connection: Arc<FakeConnection>,
    init_attempts: AtomicUsize,
    init_delay: Duration,
    failing: AtomicBool,
}

impl FakeClient {
    pub fn new() -> FakeClient {
        FakeClient::with_connection(Arc::new(FakeConnection::new()))
    }

    pub fn with_connection(connection: Arc<FakeConnection>) -> FakeClient {
        FakeClient {
            connection,
            init_attempts: AtomicUsize::new(0),
            init_delay: Duration::ZERO,
            failing: AtomicBool::new(false),
        }
    }

    pub fn with_init_delay(mut self, delay: Duration) -> FakeClient {
        self.init_delay = delay;
        self
    }

    pub fn failing(self) -> FakeClient {
        self.set_failing(true);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn init_attempts(&self) -> usize {
        self.init_attempts.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> Arc<FakeConnection> {
        self.connection.clone()
    }
}

#[async_trait]
impl PersonalizationClient for FakeClient {
    async fn init(&self, _project_uid: &str) -> Result<Arc<dyn Connection>> {
        self.init_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::connection("vendor outage"));
        }
        Ok(self.connection.clone())
    }
}

/// Oracle returning a fixed answer after an optional delay.
pub struct FakeOracle {
    country: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeOracle {
    pub fn country(country: &str) -> FakeOracle {
        FakeOracle {
            country: Some(country.to_owned()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> FakeOracle {
        FakeOracle {
            country: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> FakeOracle {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttributeOracle for FakeOracle {
    async fn detect_country(&self) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.country.clone()
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
