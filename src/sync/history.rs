//! Linear version history with an undo/redo cursor.
//!
//! Entries are full snapshots. The cursor marks the visible entry; everything
//! after it is the redo branch, which a new push discards for good.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use super::ParticipantId;

/// Default bound on retained entries per document
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// Errors at the bounds of the history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Nothing to undo")]
    NoHistory,

    #[error("Nothing to redo")]
    NoFuture,
}

/// A single snapshot in the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Position in the linear history
    pub index: usize,
    /// Monotonic sequence number, never reused within a session
    pub seq: u64,
    /// Full document content at this version
    pub content: String,
    pub author_id: ParticipantId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VersionHistory {
    entries: VecDeque<VersionEntry>,
    /// `None` iff `entries` is empty
    cursor: Option<usize>,
    /// Content loaded from storage before the first edit
    initial_content: String,
    max_entries: usize,
    next_seq: u64,
}

impl VersionHistory {
    pub fn new(initial_content: impl Into<String>, max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: None,
            initial_content: initial_content.into(),
            max_entries: max_entries.max(1),
            next_seq: 0,
        }
    }

    /// Push a new version at the cursor.
    ///
    /// Drops the redo branch, appends, trims the oldest entries past the bound
    /// and moves the cursor to the last entry. The cursor is taken from the
    /// length after all of that, never from a length read beforehand.
    pub fn push(
        &mut self,
        content: impl Into<String>,
        author_id: impl Into<ParticipantId>,
        now: DateTime<Utc>,
    ) -> &VersionEntry {
        if let Some(cursor) = self.cursor {
            self.entries.truncate(cursor + 1);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(VersionEntry {
            index: self.entries.len(),
            seq,
            content: content.into(),
            author_id: author_id.into(),
            created_at: now,
        });

        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            for (index, entry) in self.entries.iter_mut().enumerate() {
                entry.index = index;
            }
        }

        let last = self.entries.len() - 1;
        self.cursor = Some(last);
        &self.entries[last]
    }

    /// Step back one version
    pub fn undo(&mut self) -> Result<&VersionEntry, HistoryError> {
        match self.cursor {
            Some(cursor) if cursor > 0 => {
                self.cursor = Some(cursor - 1);
                Ok(&self.entries[cursor - 1])
            }
            _ => Err(HistoryError::NoHistory),
        }
    }

    /// Step forward one version along the redo branch
    pub fn redo(&mut self) -> Result<&VersionEntry, HistoryError> {
        match self.cursor {
            Some(cursor) if cursor + 1 < self.entries.len() => {
                self.cursor = Some(cursor + 1);
                Ok(&self.entries[cursor + 1])
            }
            _ => Err(HistoryError::NoFuture),
        }
    }

    pub fn current(&self) -> Option<&VersionEntry> {
        self.cursor.map(|cursor| &self.entries[cursor])
    }

    /// Content visible at the cursor, or the initial content if nothing was pushed
    pub fn current_content(&self) -> &str {
        self.current()
            .map(|entry| entry.content.as_str())
            .unwrap_or(&self.initial_content)
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn entries(&self) -> impl Iterator<Item = &VersionEntry> {
        self.entries.iter()
    }
}

impl Default for VersionHistory {
    fn default() -> Self {
        Self::new(String::new(), DEFAULT_MAX_ENTRIES)
    }
}
