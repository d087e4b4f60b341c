use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::expectation::CorrelationKey;
use crate::matching::{audio_message_transfer_name, ContentFingerprint};
use crate::model::{ChatGuid, TempGuid, UnixTimeMs};

pub const DEFAULT_MAX_AGE_MS: u64 = 60_000;
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("duplicate temp guid: {0}")]
    Duplicate(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted entry: {temp_guid}, reason: {reason}")]
    CorruptedEntry { temp_guid: String, reason: String },
}

// ============================================================================
// Entries
// ============================================================================

/// Attachment a pending send carries; matched by transfer name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxAttachment {
    pub name: String,
    /// Name after a dispatch-time rewrite, when one was applied.
    pub transfer_name: Option<String>,
}

impl OutboxAttachment {
    pub fn new(name: impl Into<String>, is_audio_message: bool) -> Self {
        let name = name.into();
        let transfer_name = if is_audio_message {
            audio_message_transfer_name(&name)
        } else {
            None
        };
        Self { name, transfer_name }
    }

    pub fn accepts_transfer_name(&self, candidate: &str) -> bool {
        candidate == self.name || self.transfer_name.as_deref() == Some(candidate)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboxEntry {
    pub temp_guid: TempGuid,
    pub chat_guid: ChatGuid,
    pub fingerprint: ContentFingerprint,
    pub attachment: Option<OutboxAttachment>,
    pub created_at: UnixTimeMs,
}

impl OutboxEntry {
    pub fn new(
        temp_guid: TempGuid,
        chat_guid: ChatGuid,
        fingerprint: ContentFingerprint,
        created_at: UnixTimeMs,
    ) -> Self {
        Self {
            temp_guid,
            chat_guid,
            fingerprint,
            attachment: None,
            created_at,
        }
    }

    pub fn with_attachment(mut self, attachment: OutboxAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.chat_guid.clone(), self.fingerprint.clone())
    }

    pub fn age_ms(&self, now: UnixTimeMs) -> u64 {
        now.millis_since(self.created_at)
    }

    /// Strictly older than `max_age_ms`; an entry exactly at the limit lives.
    pub fn is_expired(&self, now: UnixTimeMs, max_age_ms: u64) -> bool {
        self.age_ms(now) > max_age_ms
    }

    fn validate(&self) -> Result<(), OutboxError> {
        if self.temp_guid.is_blank() {
            return Err(OutboxError::InvalidEntry("temp guid cannot be empty".into()));
        }
        if self.chat_guid.is_blank() {
            return Err(OutboxError::InvalidEntry("chat guid cannot be empty".into()));
        }
        if self.fingerprint.is_placeholder() && self.attachment.is_none() {
            return Err(OutboxError::InvalidEntry(format!(
                "{}: placeholder text without an attachment can never match",
                self.temp_guid
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub entries_pushed: AtomicU64,
    pub entries_matched: AtomicU64,
    pub entries_expired: AtomicU64,
    pub duplicate_rejections: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl OutboxMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_pushed: self.entries_pushed.load(Ordering::Relaxed),
            entries_matched: self.entries_matched.load(Ordering::Relaxed),
            entries_expired: self.entries_expired.load(Ordering::Relaxed),
            duplicate_rejections: self.duplicate_rejections.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_pushed: u64,
    pub entries_matched: u64,
    pub entries_expired: u64,
    pub duplicate_rejections: u64,
    pub storage_errors: u64,
}

// ============================================================================
// Storage Trait and Backends
// ============================================================================

/// Durable append/delete log of pending sends. `load_all` returns entries in
/// insertion order; a row that fails to decode comes back as its own `Err`
/// so one bad row does not hide the rest.
#[async_trait::async_trait]
pub trait OutboxStorage: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Result<OutboxEntry, OutboxError>>, OutboxError>;
    async fn save(&self, entry: &OutboxEntry) -> Result<(), OutboxError>;
    async fn remove(&self, temp_guid: &TempGuid) -> Result<bool, OutboxError>;
    async fn sync(&self) -> Result<(), OutboxError>;
}

/// Process-local backend; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<Vec<OutboxEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl OutboxStorage for MemoryStorage {
    async fn load_all(&self) -> Result<Vec<Result<OutboxEntry, OutboxError>>, OutboxError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().cloned().map(Ok).collect())
    }

    async fn save(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.iter().position(|e| e.temp_guid == entry.temp_guid) {
            Some(index) => entries[index] = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    async fn remove(&self, temp_guid: &TempGuid) -> Result<bool, OutboxError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| &e.temp_guid != temp_guid);
        Ok(entries.len() != before)
    }

    async fn sync(&self) -> Result<(), OutboxError> {
        Ok(())
    }
}

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStorage;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;

    /// SQLite-backed outbox. Statements run on the blocking pool.
    pub struct SqliteStorage {
        conn: Arc<Mutex<Connection>>,
    }

    fn storage_err(e: impl std::fmt::Display) -> OutboxError {
        OutboxError::Storage(e.to_string())
    }

    impl SqliteStorage {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, OutboxError> {
            let conn = Connection::open(path).map_err(storage_err)?;
            Self::with_connection(conn)
        }

        pub fn open_in_memory() -> Result<Self, OutboxError> {
            let conn = Connection::open_in_memory().map_err(storage_err)?;
            Self::with_connection(conn)
        }

        fn with_connection(conn: Connection) -> Result<Self, OutboxError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS outbox_entries (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    temp_guid TEXT UNIQUE NOT NULL,
                    chat_guid TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    data TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_outbox_key
                    ON outbox_entries(chat_guid, fingerprint, created_at);
                "#,
            )
            .map_err(storage_err)?;

            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, OutboxError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, OutboxError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                f(&conn)
            })
            .await
            .map_err(storage_err)?
        }
    }

    #[async_trait::async_trait]
    impl OutboxStorage for SqliteStorage {
        async fn load_all(&self) -> Result<Vec<Result<OutboxEntry, OutboxError>>, OutboxError> {
            self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT temp_guid, data FROM outbox_entries ORDER BY seq ASC")
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                    .map_err(storage_err)?;

                let mut out = Vec::new();
                for row in rows {
                    let (temp_guid, data) = row.map_err(storage_err)?;
                    out.push(serde_json::from_str(&data).map_err(|e| OutboxError::CorruptedEntry {
                        temp_guid,
                        reason: e.to_string(),
                    }));
                }
                Ok(out)
            })
            .await
        }

        async fn save(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
            let data = serde_json::to_string(entry).map_err(storage_err)?;
            let entry = entry.clone();
            self.with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO outbox_entries (temp_guid, chat_guid, fingerprint, created_at, data)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(temp_guid) DO UPDATE SET data = excluded.data
                    "#,
                    params![
                        entry.temp_guid.as_str(),
                        entry.chat_guid.as_str(),
                        entry.fingerprint.as_str(),
                        i64::try_from(entry.created_at.0).unwrap_or(i64::MAX),
                        data,
                    ],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .await
        }

        async fn remove(&self, temp_guid: &TempGuid) -> Result<bool, OutboxError> {
            let temp_guid = temp_guid.clone();
            self.with_conn(move |conn| {
                let removed = conn
                    .execute(
                        "DELETE FROM outbox_entries WHERE temp_guid = ?1",
                        params![temp_guid.as_str()],
                    )
                    .map_err(storage_err)?;
                Ok(removed > 0)
            })
            .await
        }

        async fn sync(&self) -> Result<(), OutboxError> {
            self.with_conn(|conn| {
                // Returns a row, so it has to go through query_row.
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                    .optional()
                    .map_err(storage_err)?;
                Ok(())
            })
            .await
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct OutboxConfig {
    pub max_entries: usize,
    pub max_age_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.max_entries == 0 {
            return Err(OutboxError::Validation("max_entries must be > 0".into()));
        }
        if self.max_age_ms == 0 {
            return Err(OutboxError::Validation("max_age_ms must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Outbox
// ============================================================================

/// Pending sends awaiting a matching record, in persisted order.
///
/// Memory is authoritative for "is this entry still pending": `take` removes
/// under the write lock, so an entry is handed out at most once even when two
/// scanner ticks overlap.
pub struct Outbox {
    storage: Arc<dyn OutboxStorage>,
    config: OutboxConfig,
    entries: RwLock<VecDeque<OutboxEntry>>,
    quarantined: Vec<(String, String)>,
    metrics: Arc<OutboxMetrics>,
}

impl Outbox {
    #[instrument(skip(storage, config))]
    pub async fn new(
        storage: Arc<dyn OutboxStorage>,
        config: OutboxConfig,
    ) -> Result<Self, OutboxError> {
        config.validate()?;

        let loaded = storage.load_all().await?;
        let mut entries = VecDeque::with_capacity(loaded.len());
        let mut quarantined = Vec::new();

        for result in loaded {
            match result {
                Ok(entry) => entries.push_back(entry),
                Err(OutboxError::CorruptedEntry { temp_guid, reason }) => {
                    warn!(%temp_guid, %reason, "quarantining corrupted outbox entry");
                    quarantined.push((temp_guid, reason));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Outbox initialized with {} entries, {} quarantined",
            entries.len(),
            quarantined.len()
        );

        Ok(Self {
            storage,
            config,
            entries: RwLock::new(entries),
            quarantined,
            metrics: Arc::new(OutboxMetrics::new()),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    #[instrument(skip(self, entry), fields(temp_guid = %entry.temp_guid, chat = %entry.chat_guid))]
    pub async fn push(&self, entry: OutboxEntry) -> Result<(), OutboxError> {
        entry.validate()?;

        let mut entries = self.entries.write().await;

        if entries.len() >= self.config.max_entries {
            return Err(OutboxError::Full(self.config.max_entries));
        }

        if entries.iter().any(|e| e.temp_guid == entry.temp_guid) {
            self.metrics.duplicate_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(OutboxError::Duplicate(entry.temp_guid.to_string()));
        }

        // Persist first: an entry only the memory copy knows about would be
        // lost on restart while its caller believes it is tracked.
        if let Err(e) = self.storage.save(&entry).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist outbox entry: {:?}", e);
            return Err(e);
        }

        entries.push_back(entry);
        self.metrics.entries_pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes and returns the entry if it is still pending.
    #[instrument(skip(self), fields(temp_guid = %temp_guid))]
    pub async fn take(&self, temp_guid: &TempGuid) -> Option<OutboxEntry> {
        let mut entries = self.entries.write().await;
        let index = entries.iter().position(|e| &e.temp_guid == temp_guid)?;
        let entry = entries.remove(index)?;
        self.forget_persisted(&entry).await;
        Some(entry)
    }

    /// Takes a matched entry and counts it.
    pub async fn take_matched(&self, temp_guid: &TempGuid) -> Option<OutboxEntry> {
        let entry = self.take(temp_guid).await?;
        self.metrics.entries_matched.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Removes every entry older than the configured max age.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self, now: UnixTimeMs) -> Vec<OutboxEntry> {
        let max_age = self.config.max_age_ms;
        let mut entries = self.entries.write().await;

        let (expired, live): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.is_expired(now, max_age));
        entries.extend(live);

        for entry in &expired {
            self.forget_persisted(entry).await;
        }

        if !expired.is_empty() {
            self.metrics
                .entries_expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            info!("Expired {} outbox entries", expired.len());
        }
        expired
    }

    /// Copy of the pending entries in persisted order.
    pub async fn snapshot(&self) -> Vec<OutboxEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn get(&self, temp_guid: &TempGuid) -> Option<OutboxEntry> {
        let entries = self.entries.read().await;
        entries.iter().find(|e| &e.temp_guid == temp_guid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Rows that failed to decode at load time, as `(temp_guid, reason)`.
    pub fn quarantined(&self) -> &[(String, String)] {
        &self.quarantined
    }

    pub async fn sync(&self) -> Result<(), OutboxError> {
        self.storage.sync().await
    }

    async fn forget_persisted(&self, entry: &OutboxEntry) {
        // The in-memory removal stands; a row left behind is re-loaded on
        // restart and then expires by age.
        if let Err(e) = self.storage.remove(&entry.temp_guid).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                temp_guid = %entry.temp_guid,
                error = %e,
                "failed to delete persisted outbox entry"
            );
        }
    }
}

// ============================================================================
// Tests with Failure Injection
// ============================================================================
