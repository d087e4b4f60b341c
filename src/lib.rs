// lib.rs - send confirmation correlation engine

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod attachment;
pub mod awaiter;
pub mod channel;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod event;
pub mod expectation;
pub mod lifecycle;
pub mod matching;
pub mod model;
pub mod observer;
pub mod orchestrator;
pub mod outbox;
pub mod scanner;
pub mod store;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use config::CorrelatorConfig;
pub use engine::{Collaborators, CorrelationEngine, EngineError};
pub use event::CorrelationEvent;
pub use model::{ChatGuid, MessageGuid, ObservedRecord, TempGuid, UnixTimeMs};
pub use orchestrator::{
    EditRequest, ReactionRequest, SendAttachmentRequest, SendError, SendMethod, SendOrchestrator,
    SendTextRequest,
};

pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const OUTBOX_MAX_AGE: Duration = Duration::from_secs(60);
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Dispatch,
    Timeout,
    Query,
    Storage,
    Attachment,
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Dispatch => "DISPATCH_ERROR",
            Self::Timeout => "CONFIRMATION_TIMEOUT",
            Self::Query => "QUERY_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Attachment => "ATTACHMENT_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Query | Self::Storage => ErrorSeverity::Transient,

            Self::Configuration => ErrorSeverity::Fatal,

            Self::Validation | Self::Dispatch | Self::Timeout | Self::Attachment => {
                ErrorSeverity::Permanent
            }
        }
    }

    /// Whether the caller may resend. A timed-out send may still land, so
    /// resending risks a duplicate and is left to the caller.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Query | Self::Storage)
    }
}
