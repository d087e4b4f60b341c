//! Change observer: polls the store for rows changed since the last tick and
//! emits one event per unseen change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::dedup::DedupCache;
use crate::event::{CorrelationEvent, EventBus};
use crate::lifecycle::{LoopController, LoopState, Tick};
use crate::model::{ObservedRecord, UnixTimeMs};
use crate::store::{MessageStore, QueryError};

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("cannot read the message store at startup: {0}")]
    SourceUnavailable(#[source] QueryError),
}

/// Dedup key for a specific change to a row.
pub fn change_key(record: &ObservedRecord) -> String {
    format!("{}@{}", record.guid, record.changed_at().0)
}

/// Marks a record and its current state as already processed.
pub fn mark_seen(dedup: &DedupCache, record: &ObservedRecord) {
    dedup.add(record.guid.as_str());
    dedup.add(change_key(record));
}

pub struct ChangeObserver {
    store: Arc<dyn MessageStore>,
    dedup: Arc<DedupCache>,
    events: EventBus,
    interval: Duration,
    last_seen: AtomicU64,
    controller: LoopController,
}

impl ChangeObserver {
    pub fn new(
        store: Arc<dyn MessageStore>,
        dedup: Arc<DedupCache>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dedup,
            events,
            interval,
            last_seen: AtomicU64::new(0),
            controller: LoopController::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.controller.state()
    }

    pub fn last_seen(&self) -> UnixTimeMs {
        UnixTimeMs(self.last_seen.load(Ordering::SeqCst))
    }

    /// Starts from the store's current high-water mark so history is not
    /// replayed. Fails only if the store cannot be read at all.
    pub async fn start(self: &Arc<Self>) -> Result<(), ObserverError> {
        if self.state() == LoopState::Running {
            return Ok(());
        }
        if self.last_seen.load(Ordering::SeqCst) == 0 {
            let latest = self
                .store
                .latest_change()
                .await
                .map_err(ObserverError::SourceUnavailable)?;
            // The cursor is inclusive, so rows sitting on the mark would be
            // re-read on the first tick.
            let boundary = self
                .store
                .query_changed_since(latest)
                .await
                .map_err(ObserverError::SourceUnavailable)?;
            for row in &boundary {
                mark_seen(&self.dedup, row);
            }
            self.last_seen.store(latest.0, Ordering::SeqCst);
        }
        self.controller.start(Arc::clone(self), self.interval);
        info!(since = %self.last_seen(), "change observer running");
        Ok(())
    }

    pub async fn stop(&self) {
        self.controller.stop().await;
    }

    /// One observation pass. Returns how many events were emitted.
    #[instrument(skip(self), fields(since = self.last_seen.load(Ordering::SeqCst)))]
    pub async fn poll_once(&self) -> Result<usize, QueryError> {
        let since = self.last_seen();
        let rows = self.store.query_changed_since(since).await?;

        let mut high_water = since;
        let mut emitted = 0;
        for row in rows {
            high_water = high_water.max(row.changed_at());
            emitted += self.process(row);
        }

        // Advanced only after the whole batch: rows sharing the boundary
        // timestamp are re-read next tick and filtered by dedup.
        self.last_seen.fetch_max(high_water.0, Ordering::SeqCst);
        if emitted > 0 {
            debug!(emitted, "changes observed");
        }
        Ok(emitted)
    }

    fn process(&self, row: ObservedRecord) -> usize {
        if self.dedup.insert_if_new(row.guid.as_str()) {
            self.dedup.add(change_key(&row));
            self.events.publish(CorrelationEvent::NewRecord(row));
            return 1;
        }

        if !self.dedup.insert_if_new(change_key(&row)) {
            return 0;
        }

        let sub_event = specialize(&row);
        self.events.publish(CorrelationEvent::UpdatedRecord(row));
        match sub_event {
            Some(event) => {
                self.events.publish(event);
                2
            }
            None => 1,
        }
    }
}

/// Names the latest mutation of an updated row, if it is a known kind.
fn specialize(row: &ObservedRecord) -> Option<CorrelationEvent> {
    let at = Some(row.changed_at());
    if row.date_retracted == at {
        Some(CorrelationEvent::Unsent(row.clone()))
    } else if row.date_edited == at {
        Some(CorrelationEvent::Edited(row.clone()))
    } else if row.date_read == at {
        Some(CorrelationEvent::Read(row.clone()))
    } else if row.date_delivered == at {
        Some(CorrelationEvent::Delivered(row.clone()))
    } else {
        None
    }
}

#[async_trait::async_trait]
impl Tick for ChangeObserver {
    fn name(&self) -> &'static str {
        "change-observer"
    }

    async fn tick(&self) {
        if let Err(e) = self.poll_once().await {
            warn!(error = %e, "change query failed, retrying next tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatGuid, MessageGuid};
    use crate::store::{MemoryMessageStore, RecordQuery};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::broadcast::Receiver;

    fn row(guid: &str, at: u64) -> ObservedRecord {
        ObservedRecord::new(MessageGuid::new(guid), ChatGuid::new("C"), UnixTimeMs(at))
            .with_text(guid)
    }

    fn drain(rx: &mut Receiver<CorrelationEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    fn observer(
        store: Arc<MemoryMessageStore>,
    ) -> (Arc<ChangeObserver>, Receiver<CorrelationEvent>) {
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        let dedup = Arc::new(DedupCache::new(100));
        let observer = ChangeObserver::new(store, dedup, bus, Duration::from_secs(1));
        (Arc::new(observer), rx)
    }

    #[tokio::test]
    async fn each_new_row_is_emitted_once() {
        let store = Arc::new(MemoryMessageStore::new());
        let (observer, mut rx) = observer(Arc::clone(&store));

        store.upsert(row("a", 10));
        store.upsert(row("b", 10));
        assert_eq!(observer.poll_once().await.unwrap(), 2);
        assert_eq!(observer.poll_once().await.unwrap(), 0);
        assert_eq!(drain(&mut rx), vec!["new-record", "new-record"]);
        assert_eq!(observer.last_seen(), UnixTimeMs(10));
    }

    #[tokio::test]
    async fn rows_sharing_the_boundary_timestamp_are_not_lost() {
        let store = Arc::new(MemoryMessageStore::new());
        let (observer, mut rx) = observer(Arc::clone(&store));

        store.upsert(row("a", 10));
        observer.poll_once().await.unwrap();

        // lands after the tick with the same timestamp
        store.upsert(row("b", 10));
        assert_eq!(observer.poll_once().await.unwrap(), 1);
        assert_eq!(drain(&mut rx), vec!["new-record", "new-record"]);
    }

    #[tokio::test]
    async fn updates_emit_specialized_sub_events() {
        let store = Arc::new(MemoryMessageStore::new());
        let (observer, mut rx) = observer(Arc::clone(&store));

        store.upsert(row("a", 10));
        observer.poll_once().await.unwrap();
        drain(&mut rx);

        store.update(&MessageGuid::new("a"), |r| r.date_read = Some(UnixTimeMs(20)));
        observer.poll_once().await.unwrap();
        assert_eq!(drain(&mut rx), vec!["updated-record", "read"]);

        store.update(&MessageGuid::new("a"), |r| r.date_edited = Some(UnixTimeMs(30)));
        observer.poll_once().await.unwrap();
        assert_eq!(drain(&mut rx), vec!["updated-record", "edited"]);

        store.update(&MessageGuid::new("a"), |r| r.date_retracted = Some(UnixTimeMs(40)));
        observer.poll_once().await.unwrap();
        assert_eq!(drain(&mut rx), vec!["updated-record", "unsent"]);

        assert_eq!(observer.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rows_already_marked_seen_are_skipped() {
        let store = Arc::new(MemoryMessageStore::new());
        let dedup = Arc::new(DedupCache::new(100));
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let observer =
            ChangeObserver::new(store.clone(), Arc::clone(&dedup), bus, Duration::from_secs(1));

        let matched = row("sent", 10);
        mark_seen(&dedup, &matched);
        store.upsert(matched);

        assert_eq!(observer.poll_once().await.unwrap(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    struct FlakyStore {
        inner: MemoryMessageStore,
        down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl MessageStore for FlakyStore {
        async fn get_by_guid(
            &self,
            guid: &MessageGuid,
            force: bool,
        ) -> Result<Option<ObservedRecord>, QueryError> {
            self.inner.get_by_guid(guid, force).await
        }

        async fn query_changed_since(
            &self,
            since: UnixTimeMs,
        ) -> Result<Vec<ObservedRecord>, QueryError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(QueryError::Failed("database is locked".into()));
            }
            self.inner.query_changed_since(since).await
        }

        async fn query_recent(
            &self,
            query: &RecordQuery,
        ) -> Result<Vec<ObservedRecord>, QueryError> {
            self.inner.query_recent(query).await
        }

        async fn latest_change(&self) -> Result<UnixTimeMs, QueryError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(QueryError::Unavailable("no database".into()));
            }
            self.inner.latest_change().await
        }
    }

    #[tokio::test]
    async fn startup_fails_when_store_is_unreadable() {
        let store = Arc::new(FlakyStore {
            inner: MemoryMessageStore::new(),
            down: AtomicBool::new(true),
        });
        let observer = Arc::new(ChangeObserver::new(
            store,
            Arc::new(DedupCache::default()),
            EventBus::default(),
            Duration::from_secs(1),
        ));

        assert!(matches!(observer.start().await, Err(ObserverError::SourceUnavailable(_))));
        assert_eq!(observer.state(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ticks_do_not_advance_or_stop_the_loop() {
        let store = Arc::new(FlakyStore {
            inner: MemoryMessageStore::new(),
            down: AtomicBool::new(false),
        });
        store.inner.upsert(row("old", 5));

        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let observer = Arc::new(ChangeObserver::new(
            store.clone(),
            Arc::new(DedupCache::default()),
            bus,
            Duration::from_secs(1),
        ));
        observer.start().await.unwrap();
        assert_eq!(observer.last_seen(), UnixTimeMs(5));

        store.down.store(true, Ordering::SeqCst);
        store.inner.upsert(row("new", 6));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(observer.state(), LoopState::Running);
        assert_eq!(observer.last_seen(), UnixTimeMs(5));

        store.down.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        observer.stop().await;

        // "old" predates start and stays quiet
        let names = drain(&mut rx);
        assert_eq!(names, vec!["new-record"]);
        assert_eq!(observer.last_seen(), UnixTimeMs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn start_does_not_replay_existing_rows() {
        let store = Arc::new(MemoryMessageStore::new());
        store.upsert(row("history", 5));
        store.upsert(row("older", 3));

        let (observer, mut rx) = observer(Arc::clone(&store));
        observer.start().await.unwrap();
        assert_eq!(observer.last_seen(), UnixTimeMs(5));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(drain(&mut rx).is_empty());

        store.upsert(row("fresh", 5));
        tokio::time::sleep(Duration::from_secs(1)).await;
        observer.stop().await;
        assert_eq!(drain(&mut rx), vec!["new-record"]);
    }
}
