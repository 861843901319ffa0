//! Single-writer edit lock for a document.
//!
//! Tokens are TTL-driven:
//! - acquire issues a token with `expires_at = now + ttl`
//! - re-acquire or renew by the holder extends the same token
//! - an expired token is reclaimed lazily on the next acquire/renew, or
//!   actively by the sweep through [`DocumentLock::expire`]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Lock held by {holder}")]
    Held { holder: ParticipantId },

    #[error("{0} does not hold the lock")]
    NotHolder(ParticipantId),
}

/// Exclusive write permission for one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockToken {
    pub holder: ParticipantId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a successful acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub token: LockToken,
    /// Holder whose expired token was reclaimed to grant this one
    pub evicted: Option<ParticipantId>,
}

/// Lock slot owned by a document session. At most one live token exists.
#[derive(Debug, Clone, Default)]
pub struct DocumentLock {
    token: Option<LockToken>,
}

impl DocumentLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &mut self,
        participant: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Acquired, LockError> {
        let mut evicted = None;

        if let Some(token) = self.token.as_mut() {
            if token.holder == participant {
                token.expires_at = now + ttl;
                return Ok(Acquired {
                    token: token.clone(),
                    evicted: None,
                });
            }
            if !token.is_expired_at(now) {
                return Err(LockError::Held {
                    holder: token.holder.clone(),
                });
            }
            evicted = Some(token.holder.clone());
        }

        let token = LockToken {
            holder: participant.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        self.token = Some(token.clone());
        Ok(Acquired { token, evicted })
    }

    /// Drop the token if `participant` holds it. Anyone else is ignored.
    pub fn release(&mut self, participant: &str) -> bool {
        match &self.token {
            Some(token) if token.holder == participant => {
                self.token = None;
                true
            }
            _ => false,
        }
    }

    pub fn renew(
        &mut self,
        participant: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockToken, LockError> {
        if self.token.as_ref().is_some_and(|t| t.is_expired_at(now)) {
            self.token = None;
        }

        match self.token.as_mut() {
            Some(token) if token.holder == participant => {
                token.expires_at = now + ttl;
                Ok(token.clone())
            }
            _ => Err(LockError::NotHolder(participant.to_string())),
        }
    }

    /// Reclaim the token if it has expired, returning it
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<LockToken> {
        if self.token.as_ref().is_some_and(|t| t.is_expired_at(now)) {
            self.token.take()
        } else {
            None
        }
    }

    /// Live holder at `now`
    pub fn holder(&self, now: DateTime<Utc>) -> Option<&ParticipantId> {
        self.token
            .as_ref()
            .filter(|t| !t.is_expired_at(now))
            .map(|t| &t.holder)
    }

    #[cfg(test)]
    fn is_held_by(&self, participant: &str, now: DateTime<Utc>) -> bool {
        self.holder(now).is_some_and(|h| h == participant)
    }

    #[cfg(test)]
    fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::seconds(30)
    }

    #[test]
    fn test_acquire_unlocked() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();

        let acquired = lock.acquire("alice", ttl(), now).unwrap();

        assert_eq!(acquired.token.holder, "alice");
        assert_eq!(acquired.token.expires_at, now + ttl());
        assert!(acquired.evicted.is_none());
        assert!(lock.is_held_by("alice", now));
    }

    #[test]
    fn test_second_acquire_before_expiry_is_denied() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();
        lock.acquire("alice", ttl(), now).unwrap();

        let result = lock.acquire("bob", ttl(), now + Duration::seconds(10));

        assert_eq!(
            result,
            Err(LockError::Held {
                holder: "alice".to_string()
            })
        );
    }

    #[test]
    fn test_acquire_after_ttl_evicts_stale_holder() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();
        lock.acquire("alice", ttl(), now).unwrap();

        let later = now + ttl() + Duration::seconds(1);
        let acquired = lock.acquire("bob", ttl(), later).unwrap();

        assert_eq!(acquired.token.holder, "bob");
        assert_eq!(acquired.evicted.as_deref(), Some("alice"));
        assert!(lock.is_held_by("bob", later));
    }

    #[test]
    fn test_reacquire_extends_expiry() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();
        lock.acquire("alice", ttl(), now).unwrap();

        let later = now + Duration::seconds(20);
        let acquired = lock.acquire("alice", ttl(), later).unwrap();

        assert_eq!(acquired.token.acquired_at, now);
        assert_eq!(acquired.token.expires_at, later + ttl());
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();
        lock.acquire("alice", ttl(), now).unwrap();

        assert!(!lock.release("bob"));
        assert!(lock.is_held_by("alice", now));

        assert!(lock.release("alice"));
        assert!(lock.holder(now).is_none());
    }

    #[test]
    fn test_renew() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();
        lock.acquire("alice", ttl(), now).unwrap();

        assert_eq!(
            lock.renew("bob", ttl(), now),
            Err(LockError::NotHolder("bob".to_string()))
        );

        let later = now + Duration::seconds(25);
        let token = lock.renew("alice", ttl(), later).unwrap();
        assert_eq!(token.expires_at, later + ttl());
    }

    #[test]
    fn test_renew_after_expiry_fails() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();
        lock.acquire("alice", ttl(), now).unwrap();

        let later = now + ttl();
        assert!(lock.renew("alice", ttl(), later).is_err());
        assert!(lock.token().is_none());
    }

    #[test]
    fn test_sweep_expire() {
        let mut lock = DocumentLock::new();
        let now = Utc::now();
        lock.acquire("alice", ttl(), now).unwrap();

        assert!(lock.expire(now + Duration::seconds(5)).is_none());
        let expired = lock.expire(now + ttl()).unwrap();
        assert_eq!(expired.holder, "alice");
        assert!(lock.token().is_none());
    }
}
