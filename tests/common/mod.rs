#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use send_correlator::channel::{
    AttachmentCommand, AutomationChannel, DispatchError, DispatchReceipt, EditCommand, PrivateApi,
    ReactionCommand, TargetCommand, TextCommand,
};
use send_correlator::clock::{Clock, MonotonicClock};
use send_correlator::matching::{reaction_text, ReactionPrefixes, OBJECT_REPLACEMENT};
use send_correlator::model::{
    AttachmentGuid, AttachmentInfo, ChatGuid, MessageGuid, ObservedRecord, UnixTimeMs,
};
use send_correlator::store::{MemoryMessageStore, MessageStore};
use send_correlator::{Collaborators, CorrelationEngine, CorrelatorConfig};
use tempfile::TempDir;

pub const BASE_TIME: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

/// Stands in for both channels and the platform behind them: accepted
/// sends show up in the store after a configurable delay.
pub struct FakePlatform {
    pub store: Arc<MemoryMessageStore>,
    pub clock: Arc<MonotonicClock>,
    deliver_after: Mutex<Option<Duration>>,
    ready: AtomicBool,
    next_id: AtomicU64,
    commands: Mutex<Vec<String>>,
    attachment_receipt: Mutex<Option<DispatchReceipt>>,
    reaction_receipt_guid: Mutex<Option<MessageGuid>>,
    reaction_text: Mutex<Option<String>>,
}

impl FakePlatform {
    pub fn new(store: Arc<MemoryMessageStore>, clock: Arc<MonotonicClock>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            deliver_after: Mutex::new(Some(Duration::from_secs(1))),
            ready: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            commands: Mutex::new(Vec::new()),
            attachment_receipt: Mutex::new(None),
            reaction_receipt_guid: Mutex::new(None),
            reaction_text: Mutex::new(None),
        })
    }

    /// `None` means accepted sends never reach the store.
    pub fn deliver_after(&self, delay: Option<Duration>) {
        *self.deliver_after.lock().unwrap() = delay;
    }

    pub fn set_attachment_receipt(&self, receipt: DispatchReceipt) {
        *self.attachment_receipt.lock().unwrap() = Some(receipt);
    }

    /// Reactions report this guid instead of the one the row lands under.
    pub fn set_reaction_receipt_guid(&self, guid: MessageGuid) {
        *self.reaction_receipt_guid.lock().unwrap() = Some(guid);
    }

    /// Reaction rows carry this text instead of the synthesized one.
    pub fn set_reaction_text(&self, text: impl Into<String>) {
        *self.reaction_text.lock().unwrap() = Some(text.into());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn log(&self, command: String) {
        self.commands.lock().unwrap().push(command);
    }

    fn next_guid(&self) -> MessageGuid {
        MessageGuid::new(format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn deliver(&self, build: impl FnOnce(UnixTimeMs) -> ObservedRecord + Send + 'static) {
        let Some(delay) = *self.deliver_after.lock().unwrap() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.upsert(build(clock.now()));
        });
    }

    fn deliver_text(&self, guid: MessageGuid, chat: ChatGuid, text: String) {
        self.deliver(move |at| ObservedRecord::new(guid, chat, at).with_text(text).from_me());
    }

    fn deliver_attachment(&self, guid: MessageGuid, command: &AttachmentCommand) {
        let chat = command.chat_guid.clone();
        let transfer_name = command.transfer_name.clone();
        self.deliver(move |at| {
            let mime_type = mime_for(&transfer_name);
            ObservedRecord::new(guid, chat, at)
                .with_text(OBJECT_REPLACEMENT.to_string())
                .from_me()
                .with_attachment(AttachmentInfo {
                    guid: AttachmentGuid::new(format!("att-{transfer_name}")),
                    transfer_name,
                    mime_type: Some(mime_type.to_string()),
                })
        });
    }
}

fn mime_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("caf") => "audio/x-caf",
        Some("mp3") => "audio/mpeg",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

#[async_trait::async_trait]
impl AutomationChannel for FakePlatform {
    async fn send_text(&self, command: &TextCommand) -> Result<(), DispatchError> {
        self.log(format!("automation:text:{}", command.text));
        self.deliver_text(self.next_guid(), command.chat_guid.clone(), command.text.clone());
        Ok(())
    }

    async fn send_attachment(&self, command: &AttachmentCommand) -> Result<(), DispatchError> {
        self.log(format!("automation:attachment:{}", command.transfer_name));
        self.deliver_attachment(self.next_guid(), command);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PrivateApi for FakePlatform {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send_text(&self, command: &TextCommand) -> Result<DispatchReceipt, DispatchError> {
        self.log(format!("private:text:{}", command.text));
        let guid = self.next_guid();
        self.deliver_text(guid.clone(), command.chat_guid.clone(), command.text.clone());
        Ok(DispatchReceipt::with_guid(guid))
    }

    async fn send_attachment(
        &self,
        command: &AttachmentCommand,
    ) -> Result<DispatchReceipt, DispatchError> {
        self.log(format!("private:attachment:{}", command.transfer_name));
        if let Some(receipt) = self.attachment_receipt.lock().unwrap().clone() {
            return Ok(receipt);
        }
        let guid = self.next_guid();
        self.deliver_attachment(guid.clone(), command);
        Ok(DispatchReceipt::with_guid(guid))
    }

    async fn react(&self, command: &ReactionCommand) -> Result<DispatchReceipt, DispatchError> {
        self.log(format!("private:react:{}", command.kind));
        let target = self
            .store
            .get_by_guid(&command.target, true)
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?
            .ok_or_else(|| DispatchError::Rejected("unknown target".into()))?;

        let guid = self.next_guid();
        let text = self
            .reaction_text
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| reaction_text(&ReactionPrefixes::default(), command.kind, &target));
        let chat = command.chat_guid.clone();
        let reply_guid = guid.clone();
        let target_guid = command.target.clone();
        self.deliver(move |at| {
            let mut record = ObservedRecord::new(reply_guid, chat, at).with_text(text).from_me();
            record.associated_message_guid = Some(target_guid);
            record
        });
        let reported = self.reaction_receipt_guid.lock().unwrap().clone();
        Ok(DispatchReceipt::with_guid(reported.unwrap_or(guid)))
    }

    async fn edit(&self, command: &EditCommand) -> Result<(), DispatchError> {
        self.log(format!("private:edit:{}", command.text));
        Ok(())
    }

    async fn unsend(&self, command: &TargetCommand) -> Result<(), DispatchError> {
        self.log(format!("private:unsend:{}", command.target));
        Ok(())
    }

    async fn notify(&self, command: &TargetCommand) -> Result<(), DispatchError> {
        self.log(format!("private:notify:{}", command.target));
        Ok(())
    }
}

pub struct TestEnv {
    pub engine: CorrelationEngine,
    pub platform: Arc<FakePlatform>,
    pub store: Arc<MemoryMessageStore>,
    pub clock: Arc<MonotonicClock>,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("staging"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Builds and starts an engine over a fresh in-memory store.
pub async fn start_env(customize: impl FnOnce(&mut CorrelatorConfig)) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CorrelatorConfig {
        staging_dir: dir.path().join("staging"),
        ..Default::default()
    };
    customize(&mut config);

    let store = Arc::new(MemoryMessageStore::new());
    let clock = Arc::new(MonotonicClock::starting_at(BASE_TIME));
    let platform = FakePlatform::new(Arc::clone(&store), Arc::clone(&clock));
    let collaborators = Collaborators::new(store.clone(), platform.clone())
        .with_private_api(platform.clone())
        .with_clock(clock.clone());

    let engine = CorrelationEngine::build(config, collaborators).await.unwrap();
    engine.start().await.unwrap();
    TestEnv {
        engine,
        platform,
        store,
        clock,
        dir,
    }
}

pub fn enable_private_api(config: &mut CorrelatorConfig) {
    config.private_api_enabled = true;
}
