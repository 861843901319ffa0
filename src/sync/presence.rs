//! Presence and typing indicators for a document session.
//!
//! This module handles ephemeral state that is never persisted:
//! - Who is attached to a document, in join order
//! - Typing/idle status per participant
//! - Auto-idle of typing indicators that went quiet

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::ParticipantId;

/// How long a typing indicator survives without activity
pub const DEFAULT_TYPING_IDLE: std::time::Duration = std::time::Duration::from_secs(5);

/// Activity status of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Idle,
    Typing,
}

/// Presence of one participant within one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    /// Participant identifier
    pub participant_id: ParticipantId,
    /// Current status
    pub status: PresenceStatus,
    /// Last typing transition
    pub last_activity_at: DateTime<Utc>,
    /// When the participant joined this document
    pub joined_at: DateTime<Utc>,
}

impl PresenceState {
    pub fn new(participant_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            participant_id: participant_id.into(),
            status: PresenceStatus::Idle,
            last_activity_at: now,
            joined_at: now,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.status == PresenceStatus::Typing
    }
}

/// Event types for presence changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// Participant joined the document
    Joined { participant_id: ParticipantId },
    /// Participant left the document
    Left { participant_id: ParticipantId },
    /// Typing indicator changed
    TypingChanged {
        participant_id: ParticipantId,
        is_typing: bool,
    },
}

impl PresenceEvent {
    /// Participant the event is about
    pub fn participant_id(&self) -> &str {
        match self {
            PresenceEvent::Joined { participant_id }
            | PresenceEvent::Left { participant_id }
            | PresenceEvent::TypingChanged { participant_id, .. } => participant_id,
        }
    }
}

/// Errors related to presence operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("Participant not attached: {0}")]
    NotAttached(ParticipantId),
}

/// Roster of one document session, ordered by join time
#[derive(Debug, Clone, Default)]
pub struct SessionPresence {
    participants: IndexMap<ParticipantId, PresenceState>,
}

impl SessionPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant as idle and return the full roster.
    ///
    /// A participant that is already present keeps its join position and is
    /// reset to idle. If that ends a typing indicator, the transition is
    /// returned so it can be broadcast like any other.
    pub fn join(
        &mut self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> (Vec<PresenceState>, Option<PresenceEvent>) {
        let mut reset = None;
        match self.participants.get_mut(participant_id) {
            Some(existing) => {
                if existing.is_typing() {
                    reset = Some(PresenceEvent::TypingChanged {
                        participant_id: participant_id.to_string(),
                        is_typing: false,
                    });
                }
                existing.status = PresenceStatus::Idle;
                existing.last_activity_at = now;
            }
            None => {
                self.participants.insert(
                    participant_id.to_string(),
                    PresenceState::new(participant_id, now),
                );
            }
        }
        (self.roster(), reset)
    }

    pub fn leave(&mut self, participant_id: &str) -> Option<PresenceState> {
        self.participants.shift_remove(participant_id)
    }

    /// Update the typing indicator.
    ///
    /// Returns an event only when the status actually changed; repeated
    /// typing_start or typing_stop messages are coalesced.
    pub fn set_typing(
        &mut self,
        participant_id: &str,
        is_typing: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PresenceEvent>, PresenceError> {
        let entry = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| PresenceError::NotAttached(participant_id.to_string()))?;

        entry.last_activity_at = now;

        let status = if is_typing {
            PresenceStatus::Typing
        } else {
            PresenceStatus::Idle
        };
        if entry.status == status {
            return Ok(None);
        }
        entry.status = status;

        Ok(Some(PresenceEvent::TypingChanged {
            participant_id: participant_id.to_string(),
            is_typing,
        }))
    }

    /// Move typing participants that went quiet for longer than `threshold` to idle
    pub fn sweep_idle(&mut self, now: DateTime<Utc>, threshold: Duration) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        for entry in self.participants.values_mut() {
            if entry.is_typing() && now - entry.last_activity_at > threshold {
                entry.status = PresenceStatus::Idle;
                events.push(PresenceEvent::TypingChanged {
                    participant_id: entry.participant_id.clone(),
                    is_typing: false,
                });
            }
        }
        events
    }

    pub fn roster(&self) -> Vec<PresenceState> {
        self.participants.values().cloned().collect()
    }

    #[cfg(test)]
    fn get(&self, participant_id: &str) -> Option<&PresenceState> {
        self.participants.get(participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.contains_key(participant_id)
    }
}
