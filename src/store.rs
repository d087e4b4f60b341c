//! Query contract for the system-of-record, plus an in-process backend.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::model::{ChatGuid, MessageGuid, ObservedRecord, UnixTimeMs};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("message store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Failed(String),
}

/// Filter for recent-message lookups used by heuristic matching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordQuery {
    pub chat_guid: ChatGuid,
    pub limit: usize,
    /// Only rows created at or after this instant.
    pub created_since: Option<UnixTimeMs>,
    pub from_me_only: bool,
}

impl RecordQuery {
    pub fn recent(chat_guid: ChatGuid, limit: usize) -> Self {
        Self {
            chat_guid,
            limit,
            created_since: None,
            from_me_only: false,
        }
    }

    pub fn since(mut self, at: UnixTimeMs) -> Self {
        self.created_since = Some(at);
        self
    }

    pub fn from_me(mut self) -> Self {
        self.from_me_only = true;
        self
    }

    pub fn accepts(&self, record: &ObservedRecord) -> bool {
        record.chat_guid == self.chat_guid
            && (!self.from_me_only || record.is_from_me)
            && self.created_since.map_or(true, |t| record.date_created >= t)
    }
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// `force_refresh` bypasses any read cache so mutable fields are current.
    async fn get_by_guid(
        &self,
        guid: &MessageGuid,
        force_refresh: bool,
    ) -> Result<Option<ObservedRecord>, QueryError>;

    /// Rows whose change timestamp is at or after `since`, oldest first.
    /// Inclusive so rows sharing the last-seen timestamp are not skipped.
    async fn query_changed_since(
        &self,
        since: UnixTimeMs,
    ) -> Result<Vec<ObservedRecord>, QueryError>;

    /// Newest first, at most `query.limit` rows.
    async fn query_recent(&self, query: &RecordQuery) -> Result<Vec<ObservedRecord>, QueryError>;

    /// Latest change timestamp in the store; used to seed observers.
    async fn latest_change(&self) -> Result<UnixTimeMs, QueryError>;
}

/// Message store held in memory. Upserts by guid.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    records: Mutex<Vec<ObservedRecord>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: ObservedRecord) {
        let mut records = self.lock();
        match records.iter().position(|r| r.guid == record.guid) {
            Some(index) => records[index] = record,
            None => records.push(record),
        }
    }

    /// Applies `f` to the stored row, if present.
    pub fn update(&self, guid: &MessageGuid, f: impl FnOnce(&mut ObservedRecord)) -> bool {
        let mut records = self.lock();
        match records.iter_mut().find(|r| &r.guid == guid) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ObservedRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get_by_guid(
        &self,
        guid: &MessageGuid,
        _force_refresh: bool,
    ) -> Result<Option<ObservedRecord>, QueryError> {
        Ok(self.lock().iter().find(|r| &r.guid == guid).cloned())
    }

    async fn query_changed_since(
        &self,
        since: UnixTimeMs,
    ) -> Result<Vec<ObservedRecord>, QueryError> {
        let mut rows: Vec<_> = self
            .lock()
            .iter()
            .filter(|r| r.changed_at() >= since)
            .cloned()
            .collect();
        rows.sort_by_key(ObservedRecord::changed_at);
        Ok(rows)
    }

    async fn query_recent(&self, query: &RecordQuery) -> Result<Vec<ObservedRecord>, QueryError> {
        let mut rows: Vec<_> = self
            .lock()
            .iter()
            .filter(|r| query.accepts(r))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        rows.sort_by(|a, b| b.date_created.cmp(&a.date_created));
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn latest_change(&self) -> Result<UnixTimeMs, QueryError> {
        Ok(self
            .lock()
            .iter()
            .map(ObservedRecord::changed_at)
            .max()
            .unwrap_or(UnixTimeMs::ZERO))
    }
}
