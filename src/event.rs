use tokio::sync::broadcast;
use tracing::trace;

use crate::model::ObservedRecord;
use crate::outbox::OutboxEntry;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum CorrelationEvent {
    /// A row not seen before.
    NewRecord(ObservedRecord),
    /// A known row changed in the store.
    UpdatedRecord(ObservedRecord),
    Edited(ObservedRecord),
    Unsent(ObservedRecord),
    Read(ObservedRecord),
    Delivered(ObservedRecord),
    /// An outbox entry found its record.
    OutboxMatched {
        entry: OutboxEntry,
        record: ObservedRecord,
    },
    /// An outbox entry aged out unmatched. Informational only.
    OutboxTimeout(OutboxEntry),
}

impl CorrelationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewRecord(_) => "new-record",
            Self::UpdatedRecord(_) => "updated-record",
            Self::Edited(_) => "edited",
            Self::Unsent(_) => "unsent",
            Self::Read(_) => "read",
            Self::Delivered(_) => "delivered",
            Self::OutboxMatched { .. } => "outbox-matched",
            Self::OutboxTimeout(_) => "outbox-timeout",
        }
    }
}

/// Fan-out of correlation events. Publishing never blocks; slow subscribers
/// lag and drop the oldest events.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<CorrelationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CorrelationEvent) {
        let name = event.name();
        // No subscribers is not an error.
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(event = name, receivers, "event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CorrelationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatGuid, MessageGuid, UnixTimeMs};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let record = ObservedRecord::new(MessageGuid::new("m"), ChatGuid::new("C"), UnixTimeMs(1));

        bus.publish(CorrelationEvent::NewRecord(record.clone()));
        assert_eq!(rx.recv().await.unwrap(), CorrelationEvent::NewRecord(record));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::default();
        let record = ObservedRecord::new(MessageGuid::new("m"), ChatGuid::new("C"), UnixTimeMs(1));
        bus.publish(CorrelationEvent::Read(record));
    }
}
