//! Wiring: builds every component from one config and owns the background
//! loops.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::attachment::{AttachmentStager, CopyConverter, MediaConverter};
use crate::channel::{AutomationChannel, PrivateApi};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, CorrelatorConfig};
use crate::dedup::DedupCache;
use crate::event::{CorrelationEvent, EventBus};
use crate::expectation::ExpectationRegistry;
use crate::observer::{ChangeObserver, ObserverError};
use crate::orchestrator::{SendOrchestrator, SharedState};
use crate::outbox::{MemoryStorage, Outbox, OutboxError, OutboxStorage};
use crate::scanner::OutboxScanner;
use crate::store::MessageStore;
use crate::ErrorKind;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Observer(#[from] ObserverError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Outbox(_) => ErrorKind::Storage,
            Self::Observer(_) => ErrorKind::Query,
        }
    }
}

/// External systems the engine talks to.
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub automation: Arc<dyn AutomationChannel>,
    pub private_api: Option<Arc<dyn PrivateApi>>,
    pub clock: Arc<dyn Clock>,
    pub converter: Arc<dyn MediaConverter>,
    /// Overrides the backend chosen from `outbox_path`.
    pub outbox_storage: Option<Arc<dyn OutboxStorage>>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn MessageStore>, automation: Arc<dyn AutomationChannel>) -> Self {
        Self {
            store,
            automation,
            private_api: None,
            clock: Arc::new(SystemClock),
            converter: Arc::new(CopyConverter),
            outbox_storage: None,
        }
    }

    pub fn with_private_api(mut self, api: Arc<dyn PrivateApi>) -> Self {
        self.private_api = Some(api);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn MediaConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_outbox_storage(mut self, storage: Arc<dyn OutboxStorage>) -> Self {
        self.outbox_storage = Some(storage);
        self
    }
}

pub struct CorrelationEngine {
    orchestrator: SendOrchestrator,
    observer: Arc<ChangeObserver>,
    scanner: Arc<OutboxScanner>,
    outbox: Arc<Outbox>,
    dedup: Arc<DedupCache>,
    events: EventBus,
}

impl CorrelationEngine {
    /// Validates the config, opens the outbox (reloading persisted entries)
    /// and builds every component. Nothing runs until [`start`](Self::start).
    #[instrument(skip_all)]
    pub async fn build(
        config: CorrelatorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let storage = match collaborators.outbox_storage {
            Some(storage) => storage,
            None => open_outbox_storage(&config)?,
        };
        let outbox = Arc::new(Outbox::new(storage, config.outbox_config()).await?);
        let registry = Arc::new(ExpectationRegistry::new());
        let dedup = Arc::new(DedupCache::new(config.dedup_capacity));
        let events = EventBus::new(config.event_capacity);

        let observer = Arc::new(ChangeObserver::new(
            Arc::clone(&collaborators.store),
            Arc::clone(&dedup),
            events.clone(),
            config.observer_interval(),
        ));
        let scanner = Arc::new(OutboxScanner::new(
            Arc::clone(&outbox),
            Arc::clone(&collaborators.store),
            Arc::clone(&registry),
            Arc::clone(&dedup),
            events.clone(),
            Arc::clone(&collaborators.clock),
            config.match_window,
            config.scanner_interval(),
        ));

        let state = SharedState {
            outbox: Arc::clone(&outbox),
            registry,
            claims: scanner.claims(),
            clock: collaborators.clock,
        };
        let stager = AttachmentStager::new(config.staging_dir.clone(), collaborators.converter);
        let orchestrator = SendOrchestrator::new(
            config,
            collaborators.automation,
            collaborators.private_api,
            collaborators.store,
            state,
            stager,
        );

        Ok(Self {
            orchestrator,
            observer,
            scanner,
            outbox,
            dedup,
            events,
        })
    }

    /// Starts both loops. Fails only if the store cannot be read at all.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.observer.start().await?;
        self.scanner.start();
        info!(pending = self.outbox.len().await, "correlation engine started");
        Ok(())
    }

    /// Stops both loops and flushes the outbox. Pending sends stay persisted.
    pub async fn stop(&self) {
        self.scanner.stop().await;
        self.observer.stop().await;
        if let Err(e) = self.outbox.sync().await {
            warn!(error = %e, "outbox sync on shutdown failed");
        }
        info!("correlation engine stopped");
    }

    pub fn orchestrator(&self) -> &SendOrchestrator {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CorrelationEvent> {
        self.events.subscribe()
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    pub fn observer(&self) -> &Arc<ChangeObserver> {
        &self.observer
    }

    pub fn scanner(&self) -> &Arc<OutboxScanner> {
        &self.scanner
    }
}

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
fn open_outbox_storage(config: &CorrelatorConfig) -> Result<Arc<dyn OutboxStorage>, OutboxError> {
    match &config.outbox_path {
        Some(path) => Ok(Arc::new(crate::outbox::SqliteStorage::open(path)?)),
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

#[cfg(not(all(feature = "sqlite", not(target_arch = "wasm32"))))]
fn open_outbox_storage(config: &CorrelatorConfig) -> Result<Arc<dyn OutboxStorage>, OutboxError> {
    match &config.outbox_path {
        Some(path) => Err(OutboxError::Validation(format!(
            "outbox_path {} needs the sqlite feature",
            path.display()
        ))),
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AttachmentCommand, DispatchError, TextCommand};
    use crate::lifecycle::LoopState;
    use crate::store::MemoryMessageStore;

    struct SilentChannel;

    #[async_trait::async_trait]
    impl AutomationChannel for SilentChannel {
        async fn send_text(&self, _command: &TextCommand) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn send_attachment(&self, _command: &AttachmentCommand) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators::new(Arc::new(MemoryMessageStore::new()), Arc::new(SilentChannel))
    }

    #[tokio::test]
    async fn invalid_config_is_a_configuration_error() {
        let config = CorrelatorConfig {
            match_window: 0,
            ..Default::default()
        };
        let err = CorrelationEngine::build(config, collaborators())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn builds_on_memory_outbox_without_a_path() {
        let engine = CorrelationEngine::build(CorrelatorConfig::default(), collaborators())
            .await
            .unwrap();
        assert!(engine.outbox().is_empty().await);
        assert_eq!(engine.scanner().state(), LoopState::Stopped);
    }
}
