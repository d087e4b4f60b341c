use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(ChatGuid);
typed_id!(MessageGuid);
typed_id!(AttachmentGuid);
typed_id!(TempGuid);

impl TempGuid {
    pub fn generate() -> Self {
        Self(format!("temp-{}", uuid::Uuid::new_v4()))
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn millis_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Coarse media class, derived from a MIME type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
    Image,
    Video,
    Audio,
    Other,
}

impl MediaClass {
    pub fn from_mime(mime: Option<&str>) -> Self {
        let Some(mime) = mime else {
            return Self::Other;
        };
        let top = mime
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match top.as_str() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Other,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub guid: AttachmentGuid,
    /// Name the platform declares for the transferred file.
    pub transfer_name: String,
    pub mime_type: Option<String>,
}

impl AttachmentInfo {
    pub fn media_class(&self) -> MediaClass {
        MediaClass::from_mime(self.mime_type.as_deref())
    }
}

/// A message row as read from the system-of-record.
///
/// Edited, unsent, read and delivered state can change after the row is
/// first observed; callers that need those fields must re-fetch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObservedRecord {
    pub guid: MessageGuid,
    pub chat_guid: ChatGuid,
    pub text: Option<String>,
    pub is_from_me: bool,
    pub is_sent: bool,
    pub date_created: UnixTimeMs,
    pub date_edited: Option<UnixTimeMs>,
    pub date_retracted: Option<UnixTimeMs>,
    pub date_delivered: Option<UnixTimeMs>,
    pub date_read: Option<UnixTimeMs>,
    pub did_notify_recipient: bool,
    pub attachments: Vec<AttachmentInfo>,
    /// Set on reaction rows: the message the reaction targets.
    pub associated_message_guid: Option<MessageGuid>,
}

impl ObservedRecord {
    /// Minimal record; tests and store backends fill in the rest.
    pub fn new(guid: MessageGuid, chat_guid: ChatGuid, date_created: UnixTimeMs) -> Self {
        Self {
            guid,
            chat_guid,
            text: None,
            is_from_me: false,
            is_sent: false,
            date_created,
            date_edited: None,
            date_retracted: None,
            date_delivered: None,
            date_read: None,
            did_notify_recipient: false,
            attachments: Vec::new(),
            associated_message_guid: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn from_me(mut self) -> Self {
        self.is_from_me = true;
        self.is_sent = true;
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentInfo) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Latest timestamp at which the store changed this row.
    pub fn changed_at(&self) -> UnixTimeMs {
        [
            Some(self.date_created),
            self.date_edited,
            self.date_retracted,
            self.date_delivered,
            self.date_read,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(self.date_created)
    }

    pub fn edited_at(&self) -> UnixTimeMs {
        self.date_edited.unwrap_or(UnixTimeMs::ZERO)
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}

/// Host platform release, compared as `major.minor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformVersion {
    pub major: u16,
    pub minor: u16,
}

impl PlatformVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_at_least(&self, other: PlatformVersion) -> bool {
        *self >= other
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PlatformVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("invalid platform version '{s}'"))?
            .parse::<u16>()
            .map_err(|e| format!("invalid platform version '{s}': {e}"))?;
        let minor = match parts.next() {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| format!("invalid platform version '{s}': {e}"))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for PlatformVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlatformVersion> for String {
    fn from(value: PlatformVersion) -> Self {
        value.to_string()
    }
}
