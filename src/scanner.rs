//! Outbox scanner: reconciles pending outbox entries against the store.
//!
//! Every tick expires entries past the max age, then walks the rest in
//! persisted order and queries the entry's chat directly for a matching
//! record. It does not consume the change observer's stream.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::dedup::DedupCache;
use crate::event::{CorrelationEvent, EventBus};
use crate::expectation::ExpectationRegistry;
use crate::lifecycle::{LoopController, LoopState, Tick};
use crate::matching::first_match;
use crate::model::ObservedRecord;
use crate::observer::mark_seen;
use crate::outbox::{Outbox, OutboxEntry};
use crate::store::{MessageStore, RecordQuery};

pub const DEFAULT_MATCH_WINDOW: usize = 5;

/// Outcome of one scan pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub matched: usize,
    pub expired: usize,
    pub failed_queries: usize,
    pub still_pending: usize,
}

pub struct OutboxScanner {
    outbox: Arc<Outbox>,
    store: Arc<dyn MessageStore>,
    registry: Arc<ExpectationRegistry>,
    dedup: Arc<DedupCache>,
    /// Record guids already assigned to an entry. Kept apart from `dedup`,
    /// which the observer fills with every row it reports.
    claims: Arc<DedupCache>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    match_window: usize,
    interval: Duration,
    controller: LoopController,
}

impl OutboxScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outbox: Arc<Outbox>,
        store: Arc<dyn MessageStore>,
        registry: Arc<ExpectationRegistry>,
        dedup: Arc<DedupCache>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        match_window: usize,
        interval: Duration,
    ) -> Self {
        let claims = Arc::new(DedupCache::new(dedup.capacity()));
        Self {
            outbox,
            store,
            registry,
            dedup,
            claims,
            events,
            clock,
            match_window: match_window.max(1),
            interval,
            controller: LoopController::new(),
        }
    }

    /// Shared with the orchestrator so records confirmed by direct poll are
    /// never handed to a second entry.
    pub fn claims(&self) -> Arc<DedupCache> {
        Arc::clone(&self.claims)
    }

    pub fn state(&self) -> LoopState {
        self.controller.state()
    }

    pub fn start(self: &Arc<Self>) {
        if self.controller.start(Arc::clone(self), self.interval) {
            info!(window = self.match_window, "outbox scanner running");
        }
    }

    pub async fn stop(&self) {
        self.controller.stop().await;
    }

    #[instrument(skip(self))]
    pub async fn scan_once(&self) -> ScanReport {
        let mut report = ScanReport::default();

        for entry in self.outbox.expire_stale(self.clock.now()).await {
            info!(
                temp_guid = %entry.temp_guid,
                chat = %entry.chat_guid,
                "outbox entry expired unmatched"
            );
            self.events.publish(CorrelationEvent::OutboxTimeout(entry));
            report.expired += 1;
        }

        for entry in self.outbox.snapshot().await {
            match self.find_match(&entry).await {
                Ok(Some(record)) => {
                    if self.settle(entry, record).await {
                        report.matched += 1;
                    }
                }
                Ok(None) => report.still_pending += 1,
                Err(()) => {
                    report.failed_queries += 1;
                    report.still_pending += 1;
                }
            }
        }

        if report.matched > 0 || report.expired > 0 {
            debug!(?report, "outbox scan complete");
        }
        report
    }

    async fn find_match(&self, entry: &OutboxEntry) -> Result<Option<ObservedRecord>, ()> {
        let query = RecordQuery::recent(entry.chat_guid.clone(), self.match_window)
            .since(entry.created_at)
            .from_me();
        let rows = match self.store.query_recent(&query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(temp_guid = %entry.temp_guid, error = %e, "outbox match query failed");
                return Err(());
            }
        };

        // Ties between identical pending sends go to whichever row the store
        // lists first.
        let unclaimed = rows.iter().filter(|r| !self.claims.has(r.guid.as_str()));
        Ok(first_match(entry, unclaimed).cloned())
    }

    async fn settle(&self, entry: OutboxEntry, record: ObservedRecord) -> bool {
        // Removal is the atomic step; losing it means the direct-poll path
        // already took this entry.
        let Some(entry) = self.outbox.take_matched(&entry.temp_guid).await else {
            return false;
        };

        self.claims.add(record.guid.as_str());
        mark_seen(&self.dedup, &record);
        let resolved = self.registry.resolve_temp(&entry.temp_guid, &record);
        info!(
            temp_guid = %entry.temp_guid,
            record = %record.guid,
            resolved,
            "outbox entry matched"
        );
        self.events.publish(CorrelationEvent::OutboxMatched { entry, record });
        true
    }
}

#[async_trait::async_trait]
impl Tick for OutboxScanner {
    fn name(&self) -> &'static str {
        "outbox-scanner"
    }

    async fn tick(&self) {
        self.scan_once().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::expectation::CorrelationKey;
    use crate::matching::ContentFingerprint;
    use crate::model::{
        AttachmentGuid, AttachmentInfo, ChatGuid, MessageGuid, TempGuid, UnixTimeMs,
    };
    use crate::outbox::{MemoryStorage, OutboxAttachment, OutboxConfig};
    use crate::store::MemoryMessageStore;
    use tokio::sync::broadcast::Receiver;

    struct Harness {
        scanner: Arc<OutboxScanner>,
        outbox: Arc<Outbox>,
        store: Arc<MemoryMessageStore>,
        registry: Arc<ExpectationRegistry>,
        dedup: Arc<DedupCache>,
        clock: Arc<MonotonicClock>,
        rx: Receiver<CorrelationEvent>,
    }

    async fn harness() -> Harness {
        let outbox = Arc::new(
            Outbox::new(Arc::new(MemoryStorage::new()), OutboxConfig::default())
                .await
                .unwrap(),
        );
        let store = Arc::new(MemoryMessageStore::new());
        let registry = Arc::new(ExpectationRegistry::new());
        let dedup = Arc::new(DedupCache::new(100));
        let clock = Arc::new(MonotonicClock::starting_at(UnixTimeMs(1_000_000)));
        let events = EventBus::new(64);
        let rx = events.subscribe();
        let scanner = Arc::new(OutboxScanner::new(
            Arc::clone(&outbox),
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&dedup),
            events,
            clock.clone(),
            DEFAULT_MATCH_WINDOW,
            Duration::from_secs(1),
        ));
        Harness {
            scanner,
            outbox,
            store,
            registry,
            dedup,
            clock,
            rx,
        }
    }

    fn pending(temp: &str, chat: &str, text: &str, at: UnixTimeMs) -> OutboxEntry {
        OutboxEntry::new(TempGuid::new(temp), ChatGuid::new(chat), ContentFingerprint::of(text), at)
    }

    fn sent(guid: &str, chat: &str, text: &str, at: UnixTimeMs) -> ObservedRecord {
        ObservedRecord::new(MessageGuid::new(guid), ChatGuid::new(chat), at)
            .with_text(text)
            .from_me()
    }

    fn attachment_entry(temp: &str, name: &str, audio: bool, at: UnixTimeMs) -> OutboxEntry {
        let fingerprint = ContentFingerprint::placeholder();
        OutboxEntry::new(TempGuid::new(temp), ChatGuid::new("X"), fingerprint, at)
            .with_attachment(OutboxAttachment::new(name, audio))
    }

    fn attachment_row(guid: &str, transfer_name: &str, at: UnixTimeMs) -> ObservedRecord {
        sent(guid, "X", "\u{FFFC}", at).with_attachment(AttachmentInfo {
            guid: AttachmentGuid::new(format!("att-{guid}")),
            transfer_name: transfer_name.into(),
            mime_type: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn match_resolves_expectation_and_removes_entry() {
        let mut h = harness().await;
        let t0 = h.clock.now();
        let entry = pending("temp-1", "X", "ping", t0);
        let handle = h.registry.add(entry.correlation_key(), entry.temp_guid.clone(), t0);
        h.outbox.push(entry).await.unwrap();

        assert_eq!(h.scanner.scan_once().await.still_pending, 1);

        h.store.upsert(sent("m-1", "X", "ping", t0.saturating_add_ms(2_000)));
        let report = h.scanner.scan_once().await;
        assert_eq!(report.matched, 1);

        let record = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(record.guid.as_str(), "m-1");
        assert!(h.outbox.is_empty().await);
        assert!(h.dedup.has("m-1"));
        assert_eq!(h.rx.try_recv().unwrap().name(), "outbox-matched");
        assert_eq!(h.outbox.get_metrics().entries_matched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn different_text_or_chat_never_matches() {
        let h = harness().await;
        let t0 = h.clock.now();
        h.outbox.push(pending("temp-1", "C", "Hello", t0)).await.unwrap();

        h.store.upsert(sent("other-text", "C", "Hello!", t0));
        h.store.upsert(sent("other-chat", "D", "Hello", t0));
        h.store.upsert(
            ObservedRecord::new(MessageGuid::new("not-mine"), ChatGuid::new("C"), t0)
                .with_text("Hello"),
        );

        let report = h.scanner.scan_once().await;
        assert_eq!(report.matched, 0);
        assert_eq!(h.outbox.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_max_age_never_before() {
        let mut h = harness().await;
        let t0 = h.clock.now();
        h.outbox.push(pending("temp-1", "X", "ping", t0)).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(h.scanner.scan_once().await.expired, 0);
        assert!(h.rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(h.scanner.scan_once().await.expired, 1);
        match h.rx.try_recv().unwrap() {
            CorrelationEvent::OutboxTimeout(entry) => {
                assert_eq!(entry.temp_guid.as_str(), "temp-1");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(h.outbox.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_attachment_matches_rewritten_transfer_name() {
        let h = harness().await;
        let t0 = h.clock.now();
        h.outbox.push(attachment_entry("temp-a", "clip.mp3", true, t0)).await.unwrap();
        h.store.upsert(attachment_row("m-audio", "clip.caf", t0));

        assert_eq!(h.scanner.scan_once().await.matched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_attachments_resolve_their_own_callers() {
        let h = harness().await;
        let t0 = h.clock.now();
        let first = attachment_entry("temp-a", "a.png", false, t0);
        let second = attachment_entry("temp-b", "b.png", false, t0);
        let first_handle = h.registry.add(first.correlation_key(), first.temp_guid.clone(), t0);
        let second_handle = h.registry.add(second.correlation_key(), second.temp_guid.clone(), t0);
        h.outbox.push(first).await.unwrap();
        h.outbox.push(second).await.unwrap();

        // only b.png has landed
        h.store.upsert(attachment_row("m-b", "b.png", t0.saturating_add_ms(1_000)));
        let report = h.scanner.scan_once().await;
        assert_eq!(report.matched, 1);
        assert_eq!(report.still_pending, 1);

        let record = second_handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(record.guid.as_str(), "m-b");
        assert_eq!(h.registry.len(), 1);
        assert!(h.outbox.get(&TempGuid::new("temp-a")).await.is_some());

        h.store.upsert(attachment_row("m-a", "a.png", t0.saturating_add_ms(2_000)));
        assert_eq!(h.scanner.scan_once().await.matched, 1);
        let record = first_handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(record.guid.as_str(), "m-a");
    }

    #[tokio::test(start_paused = true)]
    async fn one_record_is_never_assigned_to_two_entries() {
        let h = harness().await;
        let t0 = h.clock.now();
        h.outbox.push(pending("temp-1", "X", "same", t0)).await.unwrap();
        h.outbox.push(pending("temp-2", "X", "same", t0)).await.unwrap();

        h.store.upsert(sent("m-1", "X", "same", t0));
        let report = h.scanner.scan_once().await;
        assert_eq!(report.matched, 1);
        assert_eq!(report.still_pending, 1);
        // persisted order: the older entry wins
        assert!(h.outbox.get(&TempGuid::new("temp-2")).await.is_some());

        h.store.upsert(sent("m-2", "X", "same", t0.saturating_add_ms(10)));
        assert_eq!(h.scanner.scan_once().await.matched, 1);
        assert!(h.outbox.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn records_older_than_the_entry_are_ignored() {
        let h = harness().await;
        h.store.upsert(sent("earlier", "X", "ping", h.clock.now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        h.outbox.push(pending("temp-1", "X", "ping", h.clock.now())).await.unwrap();

        assert_eq!(h.scanner.scan_once().await.matched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolving_without_a_waiter_is_harmless() {
        let h = harness().await;
        let t0 = h.clock.now();
        h.outbox.push(pending("temp-1", "X", "orphan", t0)).await.unwrap();
        h.store.upsert(sent("m-1", "X", "orphan", t0));

        assert_eq!(h.scanner.scan_once().await.matched, 1);
        let key = CorrelationKey::new(ChatGuid::new("X"), ContentFingerprint::of("orphan"));
        assert!(!h.registry.resolve(&key, &sent("m-1", "X", "orphan", t0)));
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_matches_without_manual_ticks() {
        let h = harness().await;
        let t0 = h.clock.now();
        let entry = pending("temp-1", "X", "ping", t0);
        let handle = h.registry.add(entry.correlation_key(), entry.temp_guid.clone(), t0);
        h.outbox.push(entry).await.unwrap();
        h.scanner.start();

        let store = Arc::clone(&h.store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            store.upsert(sent("m-1", "X", "ping", t0.saturating_add_ms(2_000)));
        });

        let record = handle.wait(Duration::from_secs(30)).await.unwrap();
        assert_eq!(record.guid.as_str(), "m-1");
        h.scanner.stop().await;
        assert_eq!(h.scanner.state(), LoopState::Stopped);
    }
}
