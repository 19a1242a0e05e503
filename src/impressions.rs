//! Impression deduplication and best-effort delivery.
//!
//! Every distinct set of displayed variants belongs to a [`RenderEpoch`]. Within one epoch each
//! [`ShortAlias`] is reported at most once. The [`ImpressionLedger`] only remembers the current
//! epoch, so moving to a new epoch both re-enables every alias and frees the old entries.
use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    events::{timestamped, DisplayContext, ImpressionBatchEvent, IMPRESSIONS_TRACKED_EVENT},
    provider::ConnectionProvider,
    Error, ShortAlias, VisitorId,
};

/// Counter identifying what is currently displayed. Advances whenever the displayed variant set
/// changes (new page, new currency, new color, new detection result).
#[derive(
    Debug, Display, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RenderEpoch(u64);

impl RenderEpoch {
    /// Epoch before anything has been resolved.
    pub const INITIAL: RenderEpoch = RenderEpoch(0);

    /// The following epoch.
    pub fn next(self) -> RenderEpoch {
        RenderEpoch(self.0 + 1)
    }

    /// Numeric value of the epoch.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Aliases already reported (or being reported) for the current epoch.
#[derive(Debug, Default)]
pub struct ImpressionLedger {
    epoch: RenderEpoch,
    recorded: HashSet<ShortAlias>,
    in_flight: HashSet<ShortAlias>,
}

impl ImpressionLedger {
    /// Create an empty ledger at [`RenderEpoch::INITIAL`].
    pub fn new() -> ImpressionLedger {
        ImpressionLedger::default()
    }

    /// Epoch the ledger currently tracks.
    pub fn epoch(&self) -> RenderEpoch {
        self.epoch
    }

    /// Move to `epoch` if it is newer, dropping everything recorded for older epochs.
    ///
    /// Returns `false` if `epoch` is older than the tracked epoch (the render is stale).
    pub fn observe(&mut self, epoch: RenderEpoch) -> bool {
        if epoch > self.epoch {
            self.epoch = epoch;
            self.recorded.clear();
            self.in_flight.clear();
        }
        epoch == self.epoch
    }

    /// Whether `alias` has been successfully reported in the current epoch.
    pub fn is_recorded(&self, alias: &ShortAlias) -> bool {
        self.recorded.contains(alias)
    }

    /// Number of aliases reported in the current epoch.
    pub fn recorded_count(&self) -> usize {
        self.recorded.len()
    }

    /// Reserve `alias` for reporting. Fails if it was already reported or another batch is
    /// reporting it right now.
    fn claim(&mut self, epoch: RenderEpoch, alias: &ShortAlias) -> bool {
        epoch == self.epoch
            && !self.recorded.contains(alias)
            && self.in_flight.insert(alias.clone())
    }

    /// Mark a claimed alias as reported.
    fn confirm(&mut self, epoch: RenderEpoch, alias: &ShortAlias) {
        if epoch == self.epoch && self.in_flight.remove(alias) {
            self.recorded.insert(alias.clone());
        }
    }

    /// Give a claimed alias back so a later render in the same epoch can retry it.
    fn release(&mut self, epoch: RenderEpoch, alias: &ShortAlias) {
        if epoch == self.epoch {
            self.in_flight.remove(alias);
        }
    }
}

/// Outcome of one impression batch. Returned for observability only; callers are free to drop it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpressionReport {
    /// Epoch the batch was recorded for.
    pub epoch: RenderEpoch,
    /// Aliases reported by this batch.
    pub recorded: Vec<ShortAlias>,
    /// Aliases skipped because they were already reported (or the render was stale).
    pub skipped: Vec<ShortAlias>,
    /// Aliases whose report failed. They stay eligible for the rest of the epoch.
    pub failed: Vec<ShortAlias>,
    /// Whether the auxiliary batch event was delivered.
    pub batch_event_sent: bool,
}

/// Reports one visitor's displayed variants to the personalization service exactly once per
/// epoch.
///
/// Cloning is cheap and clones share the same ledger. Use one tracker (one ledger) per visitor
/// session.
#[derive(Clone)]
pub struct ImpressionTracker {
    provider: Arc<ConnectionProvider>,
    visitor: VisitorId,
    ledger: Arc<Mutex<ImpressionLedger>>,
    batch_events: bool,
}

impl ImpressionTracker {
    /// Create a tracker for `visitor` with a fresh ledger.
    pub fn new(provider: Arc<ConnectionProvider>, visitor: VisitorId) -> ImpressionTracker {
        ImpressionTracker {
            provider,
            visitor,
            ledger: Arc::new(Mutex::new(ImpressionLedger::new())),
            batch_events: true,
        }
    }

    /// Visitor the impressions are reported for.
    pub fn visitor(&self) -> &VisitorId {
        &self.visitor
    }

    /// Enable or disable the auxiliary [`IMPRESSIONS_TRACKED_EVENT`] sent after each batch.
    pub fn with_batch_events(mut self, enabled: bool) -> ImpressionTracker {
        self.batch_events = enabled;
        self
    }

    /// Epoch the ledger currently tracks.
    pub fn epoch(&self) -> RenderEpoch {
        self.lock_ledger().epoch()
    }

    /// Whether `alias` has already been reported in the current epoch.
    pub fn is_recorded(&self, alias: &ShortAlias) -> bool {
        self.lock_ledger().is_recorded(alias)
    }

    /// Report `aliases` as shown in `context`, in the background.
    ///
    /// Returns immediately. Failures are logged and never surface to the caller; the returned
    /// handle can be awaited for the [`ImpressionReport`] or simply dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn record_impressions<I>(&self, aliases: I, context: DisplayContext) -> JoinHandle<ImpressionReport>
    where
        I: IntoIterator<Item = ShortAlias>,
    {
        let aliases = aliases.into_iter().collect::<BTreeSet<_>>();
        let tracker = self.clone();
        tokio::spawn(async move { tracker.deliver(aliases, context).await })
    }

    /// Send an auxiliary analytics event in the background. A timestamp is added to the payload.
    ///
    /// Must be called from within a tokio runtime.
    pub fn track_event(&self, name: impl Into<String>, payload: serde_json::Value) -> JoinHandle<bool> {
        let provider = self.provider.clone();
        let visitor = self.visitor.clone();
        let name = name.into();
        tokio::spawn(async move { send_event(&provider, &visitor, &name, timestamped(payload)).await })
    }

    /// Report `aliases` and wait for the outcome.
    pub async fn deliver(&self, aliases: BTreeSet<ShortAlias>, context: DisplayContext) -> ImpressionReport {
        let epoch = context.render_epoch;
        let mut report = ImpressionReport {
            epoch,
            ..ImpressionReport::default()
        };

        let claimed = {
            let mut ledger = self.lock_ledger();
            if !ledger.observe(epoch) {
                log::debug!(target: "personalize", epoch = epoch.value(), current = ledger.epoch().value(); "skipping impressions for a stale render");
                report.skipped = aliases.into_iter().collect();
                return report;
            }
            let (claimed, skipped): (Vec<_>, Vec<_>) = aliases
                .iter()
                .cloned()
                .partition(|alias| ledger.claim(epoch, alias));
            report.skipped = skipped;
            claimed
        };

        if claimed.is_empty() {
            log::trace!(target: "personalize", epoch = epoch.value(); "all impressions already recorded for this epoch");
            return report;
        }

        let connection = match self.provider.get_connection().await {
            Ok(connection) => connection,
            Err(err) => {
                log::warn!(target: "personalize", epoch = epoch.value(); "cannot record impressions, personalization unavailable: {:?}", err);
                let mut ledger = self.lock_ledger();
                for alias in &claimed {
                    ledger.release(epoch, alias);
                }
                report.failed = claimed;
                return report;
            }
        };

        for alias in claimed {
            match connection.record_impression(&self.visitor, &alias).await {
                Ok(()) => {
                    log::trace!(target: "personalize", alias = alias, epoch = epoch.value(); "recorded impression");
                    self.lock_ledger().confirm(epoch, &alias);
                    report.recorded.push(alias);
                }
                Err(err) => {
                    let err = Error::ImpressionDeliveryFailure {
                        alias: alias.clone(),
                        reason: err.to_string().into(),
                    };
                    log::warn!(target: "personalize", alias = alias, epoch = epoch.value(); "{}", err);
                    self.lock_ledger().release(epoch, &alias);
                    report.failed.push(alias);
                }
            }
        }

        if self.batch_events {
            let aliases = aliases.into_iter().collect::<Vec<_>>();
            let payload = ImpressionBatchEvent {
                short_uids: &aliases,
                count: aliases.len(),
                context: &context,
                timestamp: Utc::now(),
            }
            .to_payload();
            report.batch_event_sent = match connection
                .record_event(&self.visitor, IMPRESSIONS_TRACKED_EVENT, payload)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    log::warn!(target: "personalize", epoch = epoch.value(); "failed to send impression batch event: {:?}", err);
                    false
                }
            };
        }

        log::debug!(target: "personalize",
            epoch = epoch.value(),
            recorded = report.recorded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len();
            "impression batch finished");
        report
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, ImpressionLedger> {
        self.ledger
            .lock()
            .expect("thread holding impression ledger lock should not panic")
    }
}

async fn send_event(
    provider: &ConnectionProvider,
    visitor: &VisitorId,
    name: &str,
    payload: serde_json::Value,
) -> bool {
    let connection = match provider.get_connection().await {
        Ok(connection) => connection,
        Err(err) => {
            log::debug!(target: "personalize", event = name; "dropping event, personalization unavailable: {:?}", err);
            return false;
        }
    };
    match connection.record_event(visitor, name, payload).await {
        Ok(()) => {
            log::trace!(target: "personalize", event = name; "sent event");
            true
        }
        Err(err) => {
            log::warn!(target: "personalize", event = name; "failed to send event: {:?}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use super::*;
    use crate::{
        events::PageType,
        test_support::{init_logger, FakeClient, FakeConnection},
    };

    fn aliases(values: &[&str]) -> BTreeSet<ShortAlias> {
        values.iter().map(|value| ShortAlias::new(*value)).collect()
    }

    fn tracker(client: &Arc<FakeClient>) -> ImpressionTracker {
        let provider = Arc::new(ConnectionProvider::new(
            client.clone(),
            Some("project".to_owned()),
            Duration::from_secs(5),
        ));
        ImpressionTracker::new(provider, VisitorId::new("visitor"))
    }

    fn homepage(epoch: RenderEpoch) -> DisplayContext {
        DisplayContext::new(PageType::Homepage, epoch)
    }

    #[test]
    fn ledger_forgets_older_epochs() {
        let mut ledger = ImpressionLedger::new();
        let a = ShortAlias::new("a");
        let epoch = RenderEpoch::INITIAL.next();

        assert!(ledger.observe(epoch));
        assert!(ledger.claim(epoch, &a));
        assert!(!ledger.claim(epoch, &a), "in-flight alias claimed twice");
        ledger.confirm(epoch, &a);
        assert!(ledger.is_recorded(&a));
        assert!(!ledger.claim(epoch, &a));

        assert!(ledger.observe(epoch.next()));
        assert!(!ledger.is_recorded(&a));
        assert_eq!(ledger.recorded_count(), 0);
        assert!(!ledger.observe(epoch), "older epoch accepted");
    }

    #[test]
    fn released_alias_can_be_claimed_again() {
        let mut ledger = ImpressionLedger::new();
        let a = ShortAlias::new("a");

        assert!(ledger.claim(RenderEpoch::INITIAL, &a));
        ledger.release(RenderEpoch::INITIAL, &a);
        assert!(!ledger.is_recorded(&a));
        assert!(ledger.claim(RenderEpoch::INITIAL, &a));
    }

    #[tokio::test]
    async fn same_epoch_reports_each_alias_once() {
        init_logger();
        let client = Arc::new(FakeClient::new());
        let tracker = tracker(&client);
        let epoch = RenderEpoch::INITIAL.next();

        let first = tracker
            .record_impressions(aliases(&["A", "B"]), homepage(epoch))
            .await
            .unwrap();
        let second = tracker
            .record_impressions(aliases(&["A", "B"]), homepage(epoch))
            .await
            .unwrap();

        assert_eq!(first.recorded.len(), 2);
        assert_eq!(second.recorded.len(), 0);
        assert_eq!(second.skipped.len(), 2);
        let mut impressions = client.connection().impressions();
        impressions.sort();
        assert_eq!(impressions, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn concurrent_batches_do_not_double_count() {
        let client = Arc::new(FakeClient::new());
        let tracker = tracker(&client);
        let epoch = RenderEpoch::INITIAL.next();

        let handles = (0..4)
            .map(|_| tracker.record_impressions(aliases(&["A", "B"]), homepage(epoch)))
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(client.connection().impressions().len(), 2);
    }

    #[tokio::test]
    async fn new_epoch_reports_again() {
        let client = Arc::new(FakeClient::new());
        let tracker = tracker(&client);
        let epoch = RenderEpoch::INITIAL.next();

        tracker
            .record_impressions(aliases(&["A"]), homepage(epoch))
            .await
            .unwrap();
        let report = tracker
            .record_impressions(aliases(&["A"]), homepage(epoch.next()))
            .await
            .unwrap();

        assert_eq!(report.recorded, vec![ShortAlias::new("A")]);
        assert_eq!(client.connection().impressions(), vec!["A", "A"]);
        assert_eq!(tracker.epoch(), epoch.next());
    }

    #[tokio::test]
    async fn stale_render_is_skipped() {
        let client = Arc::new(FakeClient::new());
        let tracker = tracker(&client);
        let epoch = RenderEpoch::INITIAL.next().next();

        tracker
            .record_impressions(aliases(&["A"]), homepage(epoch))
            .await
            .unwrap();
        let report = tracker
            .record_impressions(aliases(&["B"]), homepage(RenderEpoch::INITIAL.next()))
            .await
            .unwrap();

        assert_eq!(report.skipped, vec![ShortAlias::new("B")]);
        assert_eq!(client.connection().impressions(), vec!["A"]);
    }

    #[tokio::test]
    async fn one_failing_alias_does_not_block_the_rest() {
        let connection = Arc::new(FakeConnection::new());
        connection.fail_impressions_for("B");
        let client = Arc::new(FakeClient::with_connection(connection.clone()));
        let tracker = tracker(&client);
        let epoch = RenderEpoch::INITIAL.next();

        let report = tracker
            .record_impressions(aliases(&["A", "B", "C"]), homepage(epoch))
            .await
            .unwrap();

        assert_eq!(report.recorded, vec![ShortAlias::new("A"), ShortAlias::new("C")]);
        assert_eq!(report.failed, vec![ShortAlias::new("B")]);
        assert!(!tracker.is_recorded(&ShortAlias::new("B")));

        // The failed alias is retried by the next render of the same epoch, the others are not.
        connection.heal_impressions();
        let retry = tracker
            .record_impressions(aliases(&["A", "B", "C"]), homepage(epoch))
            .await
            .unwrap();
        assert_eq!(retry.recorded, vec![ShortAlias::new("B")]);
        assert_eq!(connection.impressions(), vec!["A", "C", "B"]);
    }

    #[tokio::test]
    async fn unavailable_sdk_is_swallowed() {
        let client = Arc::new(FakeClient::new().failing());
        let tracker = tracker(&client);

        let report = tracker
            .record_impressions(aliases(&["A"]), homepage(RenderEpoch::INITIAL))
            .await
            .unwrap();

        assert_eq!(report.failed, vec![ShortAlias::new("A")]);
        assert!(!tracker.is_recorded(&ShortAlias::new("A")));
    }

    #[tokio::test]
    async fn batch_event_lists_every_alias() {
        let client = Arc::new(FakeClient::new());
        let tracker = tracker(&client);
        let context = homepage(RenderEpoch::INITIAL).with_extra("currency", "INR");

        let report = tracker
            .record_impressions(aliases(&["0", "1"]), context)
            .await
            .unwrap();

        assert!(report.batch_event_sent);
        let events = client.connection().events();
        assert_eq!(events.len(), 1);
        let (name, payload) = &events[0];
        assert_eq!(name, IMPRESSIONS_TRACKED_EVENT);
        assert_eq!(payload["shortUids"], serde_json::json!(["0", "1"]));
        assert_eq!(payload["currency"], serde_json::json!("INR"));
    }

    #[tokio::test]
    async fn batch_event_failure_keeps_impressions() {
        let connection = Arc::new(FakeConnection::new());
        connection.set_fail_events(true);
        let client = Arc::new(FakeClient::with_connection(connection.clone()));
        let tracker = tracker(&client);

        let report = tracker
            .record_impressions(aliases(&["0"]), homepage(RenderEpoch::INITIAL))
            .await
            .unwrap();

        assert!(!report.batch_event_sent);
        assert_eq!(report.recorded, vec![ShortAlias::new("0")]);
        assert!(tracker.is_recorded(&ShortAlias::new("0")));
    }

    #[tokio::test]
    async fn batch_events_can_be_disabled() {
        let client = Arc::new(FakeClient::new());
        let tracker = tracker(&client).with_batch_events(false);

        tracker
            .record_impressions(aliases(&["0"]), homepage(RenderEpoch::INITIAL))
            .await
            .unwrap();

        assert!(client.connection().events().is_empty());
        assert_eq!(client.connection().impressions(), vec!["0"]);
    }

    #[tokio::test]
    async fn track_event_adds_timestamp() {
        let client = Arc::new(FakeClient::new());
        let tracker = tracker(&client);

        let sent = tracker
            .track_event("custom", serde_json::json!({"key": "value"}))
            .await
            .unwrap();

        assert!(sent);
        let events = client.connection().events();
        assert_eq!(events[0].0, "custom");
        assert_eq!(events[0].1["key"], serde_json::json!("value"));
        assert!(events[0].1["timestamp"].is_string());
    }

    #[tokio::test]
    async fn impressions_are_reported_for_the_tracker_visitor() {
        let client = Arc::new(FakeClient::new());
        let provider = Arc::new(ConnectionProvider::new(
            client.clone(),
            Some("project".to_owned()),
            Duration::from_secs(5),
        ));
        let first = ImpressionTracker::new(provider.clone(), VisitorId::new("first"));
        let second = ImpressionTracker::new(provider, VisitorId::new("second"));
        let epoch = RenderEpoch::INITIAL.next();

        first
            .record_impressions(aliases(&["A"]), homepage(epoch))
            .await
            .unwrap();
        second
            .record_impressions(aliases(&["B"]), homepage(epoch))
            .await
            .unwrap();

        let connection = client.connection();
        assert_eq!(connection.impressions_for(first.visitor()), vec!["A"]);
        assert_eq!(connection.impressions_for(second.visitor()), vec!["B"]);
    }
}
