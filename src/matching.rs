//! Heuristic identity between an outgoing send and an observed record.
//!
//! There is no shared transaction id: a record is "the same logical send" as
//! an outbox entry when it is self-originated, in the same chat, observed no
//! earlier than the entry was created, and either carries the same text or is
//! a placeholder-only row whose attachment has the recorded transfer name.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{MediaClass, ObservedRecord};
use crate::outbox::OutboxEntry;

/// U+FFFC, stored in place of an inline attachment.
pub const OBJECT_REPLACEMENT: char = '\u{FFFC}';

/// Normalized message text used as the content half of a correlation key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn of(text: &str) -> Self {
        Self(text.trim().to_string())
    }

    /// Fingerprint for attachment sends, whose row text is a placeholder.
    pub fn placeholder() -> Self {
        Self(OBJECT_REPLACEMENT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_placeholder(&self) -> bool {
        is_placeholder_text(&self.0)
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_placeholder_text(text: &str) -> bool {
    text.chars().all(|c| c == OBJECT_REPLACEMENT || c.is_whitespace())
}

/// Rewrites the transfer name of an audio message the platform re-encodes.
/// Returns `None` when the name is sent unchanged.
pub fn audio_message_transfer_name(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || !ext.eq_ignore_ascii_case("mp3") {
        return None;
    }
    Some(format!("{stem}.caf"))
}

/// Applies the matching rule to one candidate record.
pub fn record_matches(entry: &OutboxEntry, record: &ObservedRecord) -> bool {
    if !record.is_from_me || record.chat_guid != entry.chat_guid {
        return false;
    }
    if record.date_created < entry.created_at {
        return false;
    }

    // A placeholder fingerprint says nothing about identity on its own.
    let text = record.text_or_empty();
    if !entry.fingerprint.is_placeholder() && ContentFingerprint::of(text) == entry.fingerprint {
        return true;
    }

    match &entry.attachment {
        Some(attachment) if is_placeholder_text(text) => record
            .attachments
            .iter()
            .any(|a| attachment.accepts_transfer_name(&a.transfer_name)),
        _ => false,
    }
}

/// First candidate, in the order given, that matches `entry`.
pub fn first_match<'a>(
    entry: &OutboxEntry,
    candidates: impl IntoIterator<Item = &'a ObservedRecord>,
) -> Option<&'a ObservedRecord> {
    candidates.into_iter().find(|r| record_matches(entry, r))
}

// --- Reactions ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    Love,
    Like,
    Dislike,
    Laugh,
    Emphasize,
    Question,
}

impl Reaction {
    pub const ALL: [Reaction; 6] = [
        Reaction::Love,
        Reaction::Like,
        Reaction::Dislike,
        Reaction::Laugh,
        Reaction::Emphasize,
        Reaction::Question,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Love => "love",
            Self::Like => "like",
            Self::Dislike => "dislike",
            Self::Laugh => "laugh",
            Self::Emphasize => "emphasize",
            Self::Question => "question",
        }
    }
}

/// A tapback, or the removal of one (`-love`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReactionKind {
    pub reaction: Reaction,
    pub removal: bool,
}

impl ReactionKind {
    pub fn add(reaction: Reaction) -> Self {
        Self {
            reaction,
            removal: false,
        }
    }

    pub fn remove(reaction: Reaction) -> Self {
        Self {
            reaction,
            removal: true,
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.removal {
            f.write_str("-")?;
        }
        f.write_str(self.reaction.as_str())
    }
}

impl FromStr for ReactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (removal, name) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let reaction = Reaction::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| format!("unknown reaction '{s}'"))?;
        Ok(Self { reaction, removal })
    }
}

/// Leading phrase the store writes for each reaction kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionPrefixes(HashMap<String, String>);

impl ReactionPrefixes {
    pub fn prefix(&self, kind: ReactionKind) -> String {
        self.0
            .get(&kind.to_string())
            .cloned()
            .unwrap_or_else(|| default_prefix(kind).to_string())
    }

    pub fn set(&mut self, kind: ReactionKind, prefix: impl Into<String>) {
        self.0.insert(kind.to_string(), prefix.into());
    }

    /// Keys that do not name a reaction kind.
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter(|k| k.parse::<ReactionKind>().is_err())
            .map(String::as_str)
            .collect()
    }
}

impl Default for ReactionPrefixes {
    fn default() -> Self {
        let mut map = HashMap::new();
        for reaction in Reaction::ALL {
            for kind in [ReactionKind::add(reaction), ReactionKind::remove(reaction)] {
                map.insert(kind.to_string(), default_prefix(kind).to_string());
            }
        }
        Self(map)
    }
}

fn default_prefix(kind: ReactionKind) -> &'static str {
    match (kind.reaction, kind.removal) {
        (Reaction::Love, false) => "Loved",
        (Reaction::Like, false) => "Liked",
        (Reaction::Dislike, false) => "Disliked",
        (Reaction::Laugh, false) => "Laughed at",
        (Reaction::Emphasize, false) => "Emphasized",
        (Reaction::Question, false) => "Questioned",
        (Reaction::Love, true) => "Removed a heart from",
        (Reaction::Like, true) => "Removed a like from",
        (Reaction::Dislike, true) => "Removed a dislike from",
        (Reaction::Laugh, true) => "Removed a laugh from",
        (Reaction::Emphasize, true) => "Removed an exclamation from",
        (Reaction::Question, true) => "Removed a question mark from",
    }
}

/// How the store describes the reacted-to message in a reaction row.
pub fn describe_target(target: &ObservedRecord) -> String {
    match target.attachments.first().map(|a| a.media_class()) {
        Some(MediaClass::Image) => "an image".to_string(),
        Some(MediaClass::Video) => "a movie".to_string(),
        Some(MediaClass::Audio) => "an audio message".to_string(),
        Some(MediaClass::Other) => "an attachment".to_string(),
        None => format!("\u{201C}{}\u{201D}", target.text_or_empty().trim()),
    }
}

/// Text the store will hold for a reaction, used as its fingerprint.
pub fn reaction_text(
    prefixes: &ReactionPrefixes,
    kind: ReactionKind,
    target: &ObservedRecord,
) -> String {
    format!("{} {}", prefixes.prefix(kind), describe_target(target))
}
