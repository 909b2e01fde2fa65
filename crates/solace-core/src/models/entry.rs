//! Journal entry model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

const TEMPORARY_PREFIX: &str = "tmp-";

pub const MIN_CONTENT_CHARS: usize = 10;
pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 10;
pub const MAX_LIST_ITEMS: usize = 20;
pub const MAX_LIST_ITEM_CHARS: usize = 100;

/// Identity of a journal entry.
///
/// An entry is `Temporary` from the moment it is written offline until the
/// server acknowledges the queued create, after which it is `Confirmed` with the
/// server-assigned id. The temporary id is never handed out again once confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntryId {
    Temporary(Uuid),
    Confirmed(String),
}

impl EntryId {
    /// Create a new client-side temporary id (UUID v7, time-sortable)
    #[must_use]
    pub fn temporary() -> Self {
        Self::Temporary(Uuid::now_v7())
    }

    #[must_use]
    pub fn confirmed(id: impl Into<String>) -> Self {
        Self::Confirmed(id.into())
    }

    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Server id, if this entry has been acknowledged.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Temporary(_) => None,
            Self::Confirmed(id) => Some(id),
        }
    }

    /// Stable string form used for storage keys and display.
    #[must_use]
    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary(id) => write!(f, "{TEMPORARY_PREFIX}{id}"),
            Self::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ValidationFailed("entry id must not be empty".into()));
        }
        match s.strip_prefix(TEMPORARY_PREFIX) {
            Some(raw) => Uuid::parse_str(raw)
                .map(Self::Temporary)
                .map_err(|error| Error::ValidationFailed(format!("invalid temporary id: {error}"))),
            None => Ok(Self::Confirmed(s.to_string())),
        }
    }
}

/// A journal entry in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    /// Owner user id
    pub user_id: String,
    /// Free-text content
    pub content: String,
    /// Mood rating (1-10)
    pub mood: u8,
    /// Energy rating (1-10)
    pub energy: u8,
    /// Stress rating (1-10)
    pub stress: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    #[serde(default)]
    pub gratitude: Vec<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// AI feedback attached after remote processing. Opaque to the client.
    #[serde(default)]
    pub ai_insight: Option<serde_json::Value>,
}

impl JournalEntry {
    /// Build a new, not yet acknowledged entry from a validated draft.
    #[must_use]
    pub fn from_draft(user_id: impl Into<String>, draft: EntryDraft, now: i64) -> Self {
        Self {
            id: EntryId::temporary(),
            user_id: user_id.into(),
            content: draft.content,
            mood: draft.mood,
            energy: draft.energy,
            stress: draft.stress,
            tags: draft.tags,
            challenges: draft.challenges,
            gratitude: draft.gratitude,
            created_at: now,
            updated_at: now,
            ai_insight: None,
        }
    }

    /// Copy of this entry with the draft's fields applied.
    #[must_use]
    pub fn with_draft(&self, draft: EntryDraft, now: i64) -> Self {
        Self {
            content: draft.content,
            mood: draft.mood,
            energy: draft.energy,
            stress: draft.stress,
            tags: draft.tags,
            challenges: draft.challenges,
            gratitude: draft.gratitude,
            updated_at: now.max(self.updated_at),
            ..self.clone()
        }
    }

    /// Get first line as title preview, truncated to `max_len` characters
    #[must_use]
    pub fn title_preview(&self, max_len: usize) -> String {
        self.content
            .lines()
            .next()
            .unwrap_or("")
            .chars()
            .take(max_len)
            .collect()
    }
}

/// User input for creating or editing an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub content: String,
    pub mood: u8,
    pub energy: u8,
    pub stress: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    #[serde(default)]
    pub gratitude: Vec<String>,
}

impl EntryDraft {
    #[must_use]
    pub fn new(content: impl Into<String>, mood: u8, energy: u8, stress: u8) -> Self {
        Self {
            content: content.into(),
            mood,
            energy,
            stress,
            tags: Vec::new(),
            challenges: Vec::new(),
            gratitude: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_challenges(mut self, challenges: Vec<String>) -> Self {
        self.challenges = challenges;
        self
    }

    #[must_use]
    pub fn with_gratitude(mut self, gratitude: Vec<String>) -> Self {
        self.gratitude = gratitude;
        self
    }

    /// Check shape and bounds, returning the normalized draft.
    ///
    /// Content and list items are trimmed; empty list items are rejected.
    pub fn validate(self) -> Result<Self> {
        let content = self.content.trim().to_string();
        let length = content.chars().count();
        if length < MIN_CONTENT_CHARS {
            return Err(Error::ValidationFailed(format!(
                "content must be at least {MIN_CONTENT_CHARS} characters (got {length})"
            )));
        }
        if length > MAX_CONTENT_CHARS {
            return Err(Error::ValidationFailed(format!(
                "content must be at most {MAX_CONTENT_CHARS} characters (got {length})"
            )));
        }

        for (name, value) in [
            ("mood", self.mood),
            ("energy", self.energy),
            ("stress", self.stress),
        ] {
            if !(MIN_RATING..=MAX_RATING).contains(&value) {
                return Err(Error::ValidationFailed(format!(
                    "{name} must be between {MIN_RATING} and {MAX_RATING} (got {value})"
                )));
            }
        }

        Ok(Self {
            content,
            mood: self.mood,
            energy: self.energy,
            stress: self.stress,
            tags: normalize_list("tags", self.tags)?,
            challenges: normalize_list("challenges", self.challenges)?,
            gratitude: normalize_list("gratitude", self.gratitude)?,
        })
    }
}

fn normalize_list(name: &str, items: Vec<String>) -> Result<Vec<String>> {
    if items.len() > MAX_LIST_ITEMS {
        return Err(Error::ValidationFailed(format!(
            "{name} may contain at most {MAX_LIST_ITEMS} items"
        )));
    }
    items
        .into_iter()
        .map(|item| {
            let item = item.trim().to_string();
            if item.is_empty() {
                Err(Error::ValidationFailed(format!(
                    "{name} must not contain empty items"
                )))
            } else if item.chars().count() > MAX_LIST_ITEM_CHARS {
                Err(Error::ValidationFailed(format!(
                    "{name} items must be at most {MAX_LIST_ITEM_CHARS} characters"
                )))
            } else {
                Ok(item)
            }
        })
        .collect()
}
