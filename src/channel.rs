//! Contracts for the two outbound channels.
//!
//! The automation channel accepts a command and returns nothing
//! authoritative. The privileged API returns an identifier (and sometimes a
//! record) synchronously, but neither guarantees eventual delivery.

use std::path::PathBuf;

use thiserror::Error;

use crate::matching::ReactionKind;
use crate::model::{ChatGuid, MessageGuid, ObservedRecord};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("channel rejected the command: {0}")]
    Rejected(String),

    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("dispatch accepted but no message identifier was returned")]
    MissingIdentifier,
}

/// What a privileged dispatch hands back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub guid: Option<MessageGuid>,
    pub record: Option<ObservedRecord>,
}

impl DispatchReceipt {
    pub fn with_guid(guid: MessageGuid) -> Self {
        Self {
            guid: Some(guid),
            record: None,
        }
    }

    /// Identifier from the receipt, falling back to the returned record.
    pub fn message_guid(&self) -> Option<&MessageGuid> {
        self.guid
            .as_ref()
            .or_else(|| self.record.as_ref().map(|r| &r.guid))
    }

    pub fn sent_record(&self) -> Option<&ObservedRecord> {
        self.record.as_ref().filter(|r| r.is_sent)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextCommand {
    pub chat_guid: ChatGuid,
    pub text: String,
    pub subject: Option<String>,
    pub effect_id: Option<String>,
    pub reply_to: Option<MessageGuid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentCommand {
    pub chat_guid: ChatGuid,
    /// Staged copy to hand to the channel.
    pub path: PathBuf,
    pub transfer_name: String,
    pub is_audio_message: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionCommand {
    pub chat_guid: ChatGuid,
    pub target: MessageGuid,
    pub kind: ReactionKind,
    pub part_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditCommand {
    pub chat_guid: ChatGuid,
    pub target: MessageGuid,
    pub text: String,
    /// Shown by clients that cannot render edits.
    pub backwards_compat_text: String,
    pub part_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetCommand {
    pub chat_guid: ChatGuid,
    pub target: MessageGuid,
    pub part_index: u32,
}

/// Scripted UI automation. Success means "accepted", nothing more.
#[async_trait::async_trait]
pub trait AutomationChannel: Send + Sync {
    async fn send_text(&self, command: &TextCommand) -> Result<(), DispatchError>;
    async fn send_attachment(&self, command: &AttachmentCommand) -> Result<(), DispatchError>;
}

/// Privileged side API. Every call returns what the platform handed back.
#[async_trait::async_trait]
pub trait PrivateApi: Send + Sync {
    /// Whether the helper is connected and able to take commands.
    fn is_ready(&self) -> bool;

    async fn send_text(&self, command: &TextCommand) -> Result<DispatchReceipt, DispatchError>;
    async fn send_attachment(
        &self,
        command: &AttachmentCommand,
    ) -> Result<DispatchReceipt, DispatchError>;
    async fn react(&self, command: &ReactionCommand) -> Result<DispatchReceipt, DispatchError>;
    async fn edit(&self, command: &EditCommand) -> Result<(), DispatchError>;
    async fn unsend(&self, command: &TargetCommand) -> Result<(), DispatchError>;
    async fn notify(&self, command: &TargetCommand) -> Result<(), DispatchError>;
}
