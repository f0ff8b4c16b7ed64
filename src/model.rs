use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type EntryId = i64;

/// A journal entry as the server stores it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl Entry {
    pub fn has_feedback(&self) -> bool {
        self.feedback.as_deref().is_some_and(|f| !f.is_empty())
    }
}

/// Fields the server confirmed after an update. Anything missing is left alone.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct EntryPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct EntryFields {
    pub title: String,
    pub content: String,
}

/// The backend stores naive UTC datetimes, so an offset is optional.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp {raw}")))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// One fetched page. `has_more` is a heuristic: a full page suggests another follows.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: u32,
    pub limit: u32,
    pub entries: Vec<Entry>,
    pub has_more: bool,
}

impl Page {
    pub fn skip_for(page: u32, limit: u32) -> u32 {
        page.saturating_sub(1).saturating_mul(limit)
    }

    pub fn from_entries(number: u32, limit: u32, entries: Vec<Entry>) -> Self {
        let has_more = entries.len() == limit as usize;
        Self {
            number,
            limit,
            entries,
            has_more,
        }
    }
}

/// An entry plus the client-only state layered over it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryView {
    pub entry: Entry,
    pub has_feedback: bool,
    /// Number of feedback characters currently revealed.
    pub revealed: usize,
    pub is_typing: bool,
    pub is_expanded: bool,
}

impl EntryView {
    pub fn new(entry: Entry) -> Self {
        let has_feedback = entry.has_feedback();
        let revealed = entry.feedback.as_deref().map_or(0, |f| f.chars().count());
        Self {
            entry,
            has_feedback,
            revealed,
            is_typing: false,
            is_expanded: false,
        }
    }

    pub fn id(&self) -> EntryId {
        self.entry.id
    }

    pub fn feedback_len(&self) -> usize {
        self.entry.feedback.as_deref().map_or(0, |f| f.chars().count())
    }

    /// Always a prefix of the full feedback.
    pub fn displayed_feedback(&self) -> &str {
        let full = self.entry.feedback.as_deref().unwrap_or("");
        match full.char_indices().nth(self.revealed) {
            Some((byte, _)) => &full[..byte],
            None => full,
        }
    }

    /// Sets write-once feedback and resets the reveal to the start.
    /// Returns false when the entry already has feedback.
    pub fn begin_feedback(&mut self, text: String) -> bool {
        if self.has_feedback || text.is_empty() {
            return false;
        }
        self.entry.feedback = Some(text);
        self.has_feedback = true;
        self.revealed = 0;
        self.is_typing = true;
        self.is_expanded = true;
        true
    }

    /// Advances the reveal. Never moves backwards.
    pub fn reveal_to(&mut self, shown: usize) {
        let shown = shown.min(self.feedback_len());
        if shown > self.revealed {
            self.revealed = shown;
        }
    }

    pub fn finish_reveal(&mut self) {
        self.revealed = self.feedback_len();
        self.is_typing = false;
    }

    /// Takes a newer server snapshot of the same entry. Feedback stays
    /// write-once: a snapshot without it never clears what is already held.
    pub fn refresh(&mut self, entry: Entry) {
        self.entry.title = entry.title;
        self.entry.content = entry.content;
        self.entry.created_at = entry.created_at;
        self.apply_patch(EntryPatch {
            feedback: entry.feedback,
            ..EntryPatch::default()
        });
    }

    pub fn apply_patch(&mut self, patch: EntryPatch) {
        if let Some(title) = patch.title {
            self.entry.title = title;
        }
        if let Some(content) = patch.content {
            self.entry.content = content;
        }
        if let Some(feedback) = patch.feedback {
            if !self.has_feedback && !feedback.is_empty() {
                self.entry.feedback = Some(feedback);
                self.has_feedback = true;
                self.revealed = self.feedback_len();
            }
        }
    }
}

/// The single in-progress edit buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditDraft {
    pub id: EntryId,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingState {
    pub edit: bool,
    pub delete: bool,
    pub feedback: bool,
}

impl LoadingState {
    pub fn is_idle(&self) -> bool {
        !(self.edit || self.delete || self.feedback)
    }
}
