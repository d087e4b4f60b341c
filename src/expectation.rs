//! Pending-expectation registry.
//!
//! Each outstanding send owns a single-assignment slot (a oneshot channel).
//! Two producers can race to fill it: the outbox scanner via [`resolve_temp`] and
//! the orchestrator's direct poll, which calls [`cancel`] once it wins. The
//! sender is removed from the map under the lock before it is used, so only
//! one producer ever holds it; the loser finds nothing and returns `false`.
//!
//! [`resolve_temp`]: ExpectationRegistry::resolve_temp
//! [`cancel`]: ExpectationRegistry::cancel

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::matching::ContentFingerprint;
use crate::model::{ChatGuid, ObservedRecord, TempGuid, UnixTimeMs};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub chat_guid: ChatGuid,
    pub fingerprint: ContentFingerprint,
}

impl CorrelationKey {
    pub fn new(chat_guid: ChatGuid, fingerprint: ContentFingerprint) -> Self {
        Self {
            chat_guid,
            fingerprint,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.chat_guid, self.fingerprint.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpectationError {
    #[error("no matching record within {waited:?}")]
    TimedOut { waited: Duration },

    #[error("expectation was cancelled before resolution")]
    Cancelled,
}

#[derive(Debug)]
struct Pending {
    temp_guid: TempGuid,
    created_at: UnixTimeMs,
    tx: oneshot::Sender<ObservedRecord>,
}

#[derive(Debug, Default)]
pub struct ExpectationRegistry {
    pending: Mutex<HashMap<CorrelationKey, VecDeque<Pending>>>,
}

impl ExpectationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        key: CorrelationKey,
        temp_guid: TempGuid,
        created_at: UnixTimeMs,
    ) -> ExpectationHandle {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        let queue = pending.entry(key.clone()).or_default();
        // Waiters that gave up leave closed senders behind.
        queue.retain(|p| !p.tx.is_closed());
        queue.push_back(Pending {
            temp_guid: temp_guid.clone(),
            created_at,
            tx,
        });

        ExpectationHandle {
            key,
            temp_guid,
            created_at,
            rx,
        }
    }

    /// Fulfils the oldest live expectation for `key`. Returns `false` when
    /// there is none, which is the normal outcome when the direct-poll path
    /// already won.
    pub fn resolve(&self, key: &CorrelationKey, record: &ObservedRecord) -> bool {
        let mut pending = self.lock();
        let Some(queue) = pending.get_mut(key) else {
            return false;
        };

        let mut delivered = false;
        while let Some(next) = queue.pop_front() {
            if next.tx.send(record.clone()).is_ok() {
                debug!(
                    temp_guid = %next.temp_guid,
                    record = %record.guid,
                    waited_ms = record.date_created.millis_since(next.created_at),
                    "expectation resolved"
                );
                delivered = true;
                break;
            }
        }

        if queue.is_empty() {
            pending.remove(key);
        }
        delivered
    }

    /// Fulfils the expectation registered for one specific send. Used when
    /// the caller already knows which entry a record belongs to, so waiters
    /// sharing a key are never handed each other's records.
    pub fn resolve_temp(&self, temp_guid: &TempGuid, record: &ObservedRecord) -> bool {
        let Some(next) = self.remove(temp_guid) else {
            return false;
        };
        if next.tx.send(record.clone()).is_err() {
            return false;
        }
        debug!(
            temp_guid = %next.temp_guid,
            record = %record.guid,
            waited_ms = record.date_created.millis_since(next.created_at),
            "expectation resolved"
        );
        true
    }

    /// Withdraws one expectation without resolving it. The waiter, if still
    /// listening, sees [`ExpectationError::Cancelled`].
    pub fn cancel(&self, temp_guid: &TempGuid) -> bool {
        self.remove(temp_guid).is_some()
    }

    fn remove(&self, temp_guid: &TempGuid) -> Option<Pending> {
        let mut pending = self.lock();
        let mut found = None;
        for (key, queue) in pending.iter_mut() {
            if let Some(index) = queue.iter().position(|p| &p.temp_guid == temp_guid) {
                found = queue.remove(index).map(|p| (key.clone(), queue.is_empty(), p));
                break;
            }
        }
        let (key, now_empty, removed) = found?;
        if now_empty {
            pending.remove(&key);
        }
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationKey, VecDeque<Pending>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving half of one expectation.
#[derive(Debug)]
pub struct ExpectationHandle {
    key: CorrelationKey,
    temp_guid: TempGuid,
    created_at: UnixTimeMs,
    rx: oneshot::Receiver<ObservedRecord>,
}

impl ExpectationHandle {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn temp_guid(&self) -> &TempGuid {
        &self.temp_guid
    }

    pub fn created_at(&self) -> UnixTimeMs {
        self.created_at
    }

    /// Waits up to `timeout`. Dropping the handle on timeout closes the slot;
    /// the registry discards it on its next touch of that key.
    pub async fn wait(self, timeout: Duration) -> Result<ObservedRecord, ExpectationError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) => Err(ExpectationError::Cancelled),
            Err(_) => Err(ExpectationError::TimedOut { waited: timeout }),
        }
    }
}
