//! Send orchestrator: the public entry point for every outgoing operation.
//!
//! Each operation validates, dispatches through one channel, then waits for
//! the store to confirm. Automation sends are confirmed by the outbox
//! scanner resolving an expectation; private API sends are confirmed by
//! polling the returned identifier, racing the expectation where one exists.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::attachment::{AttachmentError, AttachmentStager};
use crate::awaiter::{AwaitError, PollUntil};
use crate::channel::{
    AttachmentCommand, AutomationChannel, DispatchError, EditCommand, PrivateApi, ReactionCommand,
    TargetCommand, TextCommand,
};
use crate::clock::Clock;
use crate::config::CorrelatorConfig;
use crate::dedup::DedupCache;
use crate::expectation::{ExpectationError, ExpectationHandle, ExpectationRegistry};
use crate::matching::{is_placeholder_text, reaction_text, ContentFingerprint, ReactionKind};
use crate::model::{ChatGuid, MessageGuid, ObservedRecord, PlatformVersion, TempGuid, UnixTimeMs};
use crate::outbox::{Outbox, OutboxAttachment, OutboxEntry, OutboxError};
use crate::store::{MessageStore, QueryError};
use crate::ErrorKind;

pub const EDIT_MIN_PLATFORM: PlatformVersion = PlatformVersion::new(13, 0);
pub const UNSEND_MIN_PLATFORM: PlatformVersion = PlatformVersion::new(13, 0);
pub const NOTIFY_MIN_PLATFORM: PlatformVersion = PlatformVersion::new(12, 0);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SendError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("{operation} was not confirmed after {waited:?}")]
    ConfirmationTimeout {
        operation: &'static str,
        waited: Duration,
    },

    #[error("message store query failed: {0}")]
    Query(#[from] QueryError),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("attachment error: {0}")]
    Attachment(#[from] AttachmentError),
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Dispatch(_) => ErrorKind::Dispatch,
            Self::ConfirmationTimeout { .. } => ErrorKind::Timeout,
            Self::Query(_) => ErrorKind::Query,
            Self::Outbox(_) => ErrorKind::Storage,
            Self::Attachment(AttachmentError::Missing(_) | AttachmentError::InvalidName { .. }) => {
                ErrorKind::Validation
            }
            Self::Attachment(_) => ErrorKind::Attachment,
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SendMethod {
    /// UI automation; nothing authoritative comes back.
    #[default]
    Automation,
    /// Privileged side API; returns the new message's identifier.
    PrivateApi,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendTextRequest {
    pub chat_guid: ChatGuid,
    pub text: String,
    pub method: SendMethod,
    pub subject: Option<String>,
    pub effect_id: Option<String>,
    pub reply_to: Option<MessageGuid>,
}

impl SendTextRequest {
    pub fn new(chat_guid: ChatGuid, text: impl Into<String>) -> Self {
        Self {
            chat_guid,
            text: text.into(),
            method: SendMethod::Automation,
            subject: None,
            effect_id: None,
            reply_to: None,
        }
    }

    pub fn via(mut self, method: SendMethod) -> Self {
        self.method = method;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendAttachmentRequest {
    pub chat_guid: ChatGuid,
    pub path: PathBuf,
    /// Name to send under; defaults to the file's own name.
    pub name: Option<String>,
    pub is_audio_message: bool,
    pub method: SendMethod,
}

impl SendAttachmentRequest {
    pub fn new(chat_guid: ChatGuid, path: impl Into<PathBuf>) -> Self {
        Self {
            chat_guid,
            path: path.into(),
            name: None,
            is_audio_message: false,
            method: SendMethod::Automation,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn as_audio_message(mut self) -> Self {
        self.is_audio_message = true;
        self
    }

    pub fn via(mut self, method: SendMethod) -> Self {
        self.method = method;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionRequest {
    pub chat_guid: ChatGuid,
    pub target: MessageGuid,
    pub kind: ReactionKind,
    pub part_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditRequest {
    pub chat_guid: ChatGuid,
    pub target: MessageGuid,
    pub text: String,
    /// Defaults to `Edited to “text”`.
    pub backwards_compat_text: Option<String>,
    pub part_index: u32,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// State shared with the background loops.
#[derive(Clone)]
pub struct SharedState {
    pub outbox: Arc<Outbox>,
    pub registry: Arc<ExpectationRegistry>,
    /// Records already confirmed for some send.
    pub claims: Arc<DedupCache>,
    pub clock: Arc<dyn Clock>,
}

pub struct SendOrchestrator {
    config: CorrelatorConfig,
    automation: Arc<dyn AutomationChannel>,
    private_api: Option<Arc<dyn PrivateApi>>,
    store: Arc<dyn MessageStore>,
    state: SharedState,
    stager: AttachmentStager,
}

enum FirstConfirmation {
    Polled(Result<ObservedRecord, AwaitError>),
    Matched(Result<ObservedRecord, ExpectationError>),
}

impl SendOrchestrator {
    pub fn new(
        config: CorrelatorConfig,
        automation: Arc<dyn AutomationChannel>,
        private_api: Option<Arc<dyn PrivateApi>>,
        store: Arc<dyn MessageStore>,
        state: SharedState,
        stager: AttachmentStager,
    ) -> Self {
        Self {
            config,
            automation,
            private_api,
            store,
            state,
            stager,
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    #[instrument(skip(self, request), fields(chat = %request.chat_guid, method = ?request.method))]
    pub async fn send_text(&self, request: SendTextRequest) -> Result<ObservedRecord, SendError> {
        validate_chat(&request.chat_guid)?;
        if is_placeholder_text(&request.text) {
            return Err(SendError::invalid("message text cannot be empty"));
        }

        let command = TextCommand {
            chat_guid: request.chat_guid.clone(),
            text: request.text.clone(),
            subject: request.subject,
            effect_id: request.effect_id,
            reply_to: request.reply_to,
        };

        let record = match request.method {
            SendMethod::Automation => {
                let fingerprint = ContentFingerprint::of(&request.text);
                let entry = self.outbox_entry(&request.chat_guid, fingerprint);
                let handle = self.register(entry).await?;
                if let Err(e) = self.automation.send_text(&command).await {
                    self.withdraw(handle.temp_guid()).await;
                    return Err(e.into());
                }
                self.await_expectation("send text", handle).await?
            }
            SendMethod::PrivateApi => {
                let api = self.private_api("send text")?;
                let receipt = api.send_text(&command).await?;
                let guid = receipt.message_guid().ok_or(DispatchError::MissingIdentifier)?;
                self.poll_until_present("send text", guid).await?
            }
        };

        self.state.claims.add(record.guid.as_str());
        info!(record = %record.guid, "text send confirmed");
        Ok(record)
    }

    #[instrument(skip(self, request), fields(chat = %request.chat_guid, method = ?request.method))]
    pub async fn send_attachment(
        &self,
        request: SendAttachmentRequest,
    ) -> Result<ObservedRecord, SendError> {
        validate_chat(&request.chat_guid)?;
        let api = match request.method {
            SendMethod::Automation => None,
            SendMethod::PrivateApi => Some(self.private_api("send attachment")?),
        };

        let staged = self
            .stager
            .stage(&request.path, request.name.as_deref(), request.is_audio_message)
            .await?;
        let attachment = OutboxAttachment {
            name: staged.original_name.clone(),
            transfer_name: staged.was_renamed().then(|| staged.transfer_name.clone()),
        };
        let entry = self
            .outbox_entry(&request.chat_guid, ContentFingerprint::placeholder())
            .with_attachment(attachment);
        let handle = match self.register(entry).await {
            Ok(handle) => handle,
            Err(e) => {
                self.stager.cleanup(&staged).await;
                return Err(e);
            }
        };

        let command = AttachmentCommand {
            chat_guid: request.chat_guid.clone(),
            path: staged.path.clone(),
            transfer_name: staged.transfer_name.clone(),
            is_audio_message: staged.is_audio_message,
        };
        let result = match api {
            None => self.attachment_via_automation(&command, handle).await,
            Some(api) => self.attachment_via_private_api(api, &command, handle).await,
        };

        // The private API keeps reading the file after it accepts it.
        let retain = api.is_some() && !matches!(result, Err(SendError::Dispatch(_)));
        if !retain {
            self.stager.cleanup(&staged).await;
        }

        let record = result?;
        self.state.claims.add(record.guid.as_str());
        info!(
            record = %record.guid,
            transfer_name = %staged.transfer_name,
            "attachment send confirmed"
        );
        Ok(record)
    }

    async fn attachment_via_automation(
        &self,
        command: &AttachmentCommand,
        handle: ExpectationHandle,
    ) -> Result<ObservedRecord, SendError> {
        if let Err(e) = self.automation.send_attachment(command).await {
            self.withdraw(handle.temp_guid()).await;
            return Err(e.into());
        }
        self.await_expectation("send attachment", handle).await
    }

    async fn attachment_via_private_api(
        &self,
        api: &Arc<dyn PrivateApi>,
        command: &AttachmentCommand,
        handle: ExpectationHandle,
    ) -> Result<ObservedRecord, SendError> {
        let receipt = match api.send_attachment(command).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.withdraw(handle.temp_guid()).await;
                return Err(e.into());
            }
        };

        if let Some(record) = receipt.sent_record() {
            self.withdraw(handle.temp_guid()).await;
            return Ok(record.clone());
        }
        let Some(guid) = receipt.message_guid().cloned() else {
            self.withdraw(handle.temp_guid()).await;
            return Err(DispatchError::MissingIdentifier.into());
        };

        match self.first_confirmation("send attachment", &guid, handle).await {
            Ok(record) => Ok(record),
            Err(e) => match receipt.record {
                Some(partial) => {
                    warn!(
                        error = %e,
                        record = %partial.guid,
                        "attachment confirmation failed, using dispatch receipt"
                    );
                    Ok(partial)
                }
                None => Err(e),
            },
        }
    }

    #[instrument(
        skip(self, request),
        fields(chat = %request.chat_guid, target = %request.target, kind = %request.kind)
    )]
    pub async fn send_reaction(
        &self,
        request: ReactionRequest,
    ) -> Result<ObservedRecord, SendError> {
        validate_chat(&request.chat_guid)?;
        validate_target(&request.target)?;
        let api = self.private_api("send reaction")?;

        let target = self.fetch_target(&request.target).await?;
        let text = reaction_text(&self.config.reaction_prefixes, request.kind, &target);
        let entry = self.outbox_entry(&request.chat_guid, ContentFingerprint::of(&text));
        let handle = self.register(entry).await?;

        let command = ReactionCommand {
            chat_guid: request.chat_guid,
            target: request.target,
            kind: request.kind,
            part_index: request.part_index,
        };
        let receipt = match api.react(&command).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.withdraw(handle.temp_guid()).await;
                return Err(e.into());
            }
        };
        let Some(guid) = receipt.message_guid().cloned() else {
            self.withdraw(handle.temp_guid()).await;
            return Err(DispatchError::MissingIdentifier.into());
        };

        let record = self.first_confirmation("send reaction", &guid, handle).await?;
        self.state.claims.add(record.guid.as_str());
        info!(record = %record.guid, %text, "reaction confirmed");
        Ok(record)
    }

    #[instrument(skip(self, request), fields(chat = %request.chat_guid, target = %request.target))]
    pub async fn edit(&self, request: EditRequest) -> Result<ObservedRecord, SendError> {
        validate_chat(&request.chat_guid)?;
        validate_target(&request.target)?;
        if is_placeholder_text(&request.text) {
            return Err(SendError::invalid("edited text cannot be empty"));
        }
        let api = self.private_api("edit")?;
        self.require_platform("edit", EDIT_MIN_PLATFORM)?;

        let baseline = self.fetch_target(&request.target).await?.edited_at();
        let backwards_compat_text = request
            .backwards_compat_text
            .unwrap_or_else(|| format!("Edited to \u{201C}{}\u{201D}", request.text));
        let command = EditCommand {
            chat_guid: request.chat_guid,
            target: request.target.clone(),
            text: request.text,
            backwards_compat_text,
            part_index: request.part_index,
        };
        api.edit(&command).await?;

        let record = self
            .poll_until("edit", &request.target, move |r: &ObservedRecord| {
                r.edited_at() <= baseline
            })
            .await?;
        info!(edited_at = %record.edited_at(), "edit confirmed");
        Ok(record)
    }

    #[instrument(skip(self, command), fields(chat = %command.chat_guid, target = %command.target))]
    pub async fn unsend(&self, command: TargetCommand) -> Result<ObservedRecord, SendError> {
        validate_chat(&command.chat_guid)?;
        validate_target(&command.target)?;
        let api = self.private_api("unsend")?;
        self.require_platform("unsend", UNSEND_MIN_PLATFORM)?;

        let target = self.fetch_target(&command.target).await?;
        if target.date_retracted.is_some() {
            return Err(SendError::invalid(format!("message {} is already unsent", command.target)));
        }
        let baseline = revision(&target);
        api.unsend(&command).await?;

        let record = self
            .poll_until("unsend", &command.target, move |r: &ObservedRecord| {
                revision(r) <= baseline
            })
            .await?;
        info!("unsend confirmed");
        Ok(record)
    }

    #[instrument(skip(self, command), fields(chat = %command.chat_guid, target = %command.target))]
    pub async fn notify(&self, command: TargetCommand) -> Result<ObservedRecord, SendError> {
        validate_chat(&command.chat_guid)?;
        validate_target(&command.target)?;
        let api = self.private_api("notify")?;
        self.require_platform("notify", NOTIFY_MIN_PLATFORM)?;

        let target = self.fetch_target(&command.target).await?;
        if target.did_notify_recipient {
            return Err(SendError::invalid(format!(
                "recipient was already notified about message {}",
                command.target
            )));
        }
        api.notify(&command).await?;

        let record = self
            .poll_until("notify", &command.target, |r: &ObservedRecord| !r.did_notify_recipient)
            .await?;
        info!("notify confirmed");
        Ok(record)
    }

    // --- gates ---

    fn private_api(&self, operation: &str) -> Result<&Arc<dyn PrivateApi>, SendError> {
        if !self.config.private_api_enabled {
            return Err(private_api_unavailable(operation, "disabled"));
        }
        let api = self
            .private_api
            .as_ref()
            .ok_or_else(|| private_api_unavailable(operation, "not configured"))?;
        if !api.is_ready() {
            return Err(private_api_unavailable(operation, "not connected"));
        }
        Ok(api)
    }

    fn require_platform(&self, operation: &str, minimum: PlatformVersion) -> Result<(), SendError> {
        let running = self.config.platform_version;
        if running.is_at_least(minimum) {
            Ok(())
        } else {
            Err(SendError::invalid(format!(
                "{operation} requires platform {minimum} or newer (running {running})"
            )))
        }
    }

    // --- expectations ---

    fn outbox_entry(&self, chat_guid: &ChatGuid, fingerprint: ContentFingerprint) -> OutboxEntry {
        let now = self.state.clock.now();
        OutboxEntry::new(TempGuid::generate(), chat_guid.clone(), fingerprint, now)
    }

    /// Registers the expectation before the entry becomes visible to the
    /// scanner so a fast match always finds a waiter.
    async fn register(&self, entry: OutboxEntry) -> Result<ExpectationHandle, SendError> {
        let handle = self
            .state
            .registry
            .add(entry.correlation_key(), entry.temp_guid.clone(), entry.created_at);
        if let Err(e) = self.state.outbox.push(entry).await {
            self.state.registry.cancel(handle.temp_guid());
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Drops a send's expectation and outbox entry once nothing will match it.
    async fn withdraw(&self, temp_guid: &TempGuid) {
        self.state.registry.cancel(temp_guid);
        self.state.outbox.take(temp_guid).await;
    }

    async fn await_expectation(
        &self,
        operation: &'static str,
        handle: ExpectationHandle,
    ) -> Result<ObservedRecord, SendError> {
        let started = Instant::now();
        handle
            .wait(self.config.confirmation_timeout())
            .await
            .map_err(|e| timed_out(operation, expectation_waited(&e, started)))
    }

    /// Races the identifier poll against the outbox expectation. Whichever
    /// fails first falls back to the other.
    async fn first_confirmation(
        &self,
        operation: &'static str,
        guid: &MessageGuid,
        handle: ExpectationHandle,
    ) -> Result<ObservedRecord, SendError> {
        let started = Instant::now();
        let temp_guid = handle.temp_guid().clone();
        let polled = self.poll_record(guid, None);
        let matched = handle.wait(self.config.confirmation_timeout());
        tokio::pin!(polled, matched);

        let first = tokio::select! {
            r = &mut polled => FirstConfirmation::Polled(r),
            r = &mut matched => FirstConfirmation::Matched(r),
        };

        match first {
            FirstConfirmation::Polled(Ok(record)) => {
                self.withdraw(&temp_guid).await;
                Ok(record)
            }
            FirstConfirmation::Matched(Ok(record)) => Ok(record),
            FirstConfirmation::Polled(Err(_)) => matched
                .await
                .map_err(|e| timed_out(operation, expectation_waited(&e, started))),
            FirstConfirmation::Matched(Err(_)) => match polled.await {
                Ok(record) => {
                    self.withdraw(&temp_guid).await;
                    Ok(record)
                }
                Err(e) => Err(timed_out(operation, e.waited())),
            },
        }
    }

    async fn poll_until_present(
        &self,
        operation: &'static str,
        guid: &MessageGuid,
    ) -> Result<ObservedRecord, SendError> {
        self.poll_record(guid, None)
            .await
            .map_err(|e| timed_out(operation, e.waited()))
    }

    async fn poll_until(
        &self,
        operation: &'static str,
        guid: &MessageGuid,
        keep_waiting: impl Fn(&ObservedRecord) -> bool + Send + Sync + 'static,
    ) -> Result<ObservedRecord, SendError> {
        self.poll_record(guid, Some(Box::new(keep_waiting)))
            .await
            .map_err(|e| timed_out(operation, e.waited()))
    }

    async fn poll_record(
        &self,
        guid: &MessageGuid,
        keep_waiting: Option<Box<dyn Fn(&ObservedRecord) -> bool + Send + Sync>>,
    ) -> Result<ObservedRecord, AwaitError> {
        let mut poller =
            PollUntil::new(self.config.confirmation_timeout(), self.config.poll_interval());
        if let Some(predicate) = keep_waiting {
            poller = poller.keep_waiting(predicate);
        }
        poller.run(|| self.store.get_by_guid(guid, true)).await
    }

    async fn fetch_target(&self, guid: &MessageGuid) -> Result<ObservedRecord, SendError> {
        self.store
            .get_by_guid(guid, true)
            .await?
            .ok_or_else(|| SendError::invalid(format!("message {guid} does not exist")))
    }
}

fn validate_chat(chat_guid: &ChatGuid) -> Result<(), SendError> {
    if chat_guid.is_blank() {
        return Err(SendError::invalid("chat guid cannot be empty"));
    }
    Ok(())
}

fn validate_target(target: &MessageGuid) -> Result<(), SendError> {
    if target.is_blank() {
        return Err(SendError::invalid("target message guid cannot be empty"));
    }
    Ok(())
}

fn private_api_unavailable(operation: &str, why: &str) -> SendError {
    SendError::invalid(format!("{operation} requires the private API, which is {why}"))
}

fn timed_out(operation: &'static str, waited: Duration) -> SendError {
    warn!(operation, ?waited, "confirmation timed out");
    SendError::ConfirmationTimeout { operation, waited }
}

fn expectation_waited(error: &ExpectationError, started: Instant) -> Duration {
    match error {
        ExpectationError::TimedOut { waited } => *waited,
        ExpectationError::Cancelled => started.elapsed(),
    }
}

/// Latest edit or retraction; an unsend moves at least one of them.
fn revision(record: &ObservedRecord) -> UnixTimeMs {
    record
        .edited_at()
        .max(record.date_retracted.unwrap_or(UnixTimeMs::ZERO))
}
