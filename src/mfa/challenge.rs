//! Short-lived, single-use challenge state for second-factor ceremonies.
//!
//! `take` removes the entry before anything else looks at it, so an entry is gone
//! after its first use whatever the outcome of the verification.

use std::{
    collections::HashMap,
    hash::Hash,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AuthError;

pub const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChallengeError {
    #[error("challenge not found")]
    NotFound,
    #[error("challenge expired")]
    Expired,
    #[error("challenge belongs to another user")]
    UserMismatch,
}

impl From<ChallengeError> for AuthError {
    fn from(err: ChallengeError) -> Self {
        match err {
            ChallengeError::NotFound | ChallengeError::Expired => {
                Self::not_found("challenge not found or expired")
            }
            ChallengeError::UserMismatch => Self::permission_denied(err.to_string()),
        }
    }
}

#[derive(Debug)]
struct Entry<V> {
    user_id: Uuid,
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// An entry taken out of a [`ChallengeStore`].
#[derive(Debug)]
pub struct Taken<V> {
    pub user_id: Uuid,
    pub value: V,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct ChallengeStore<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V> ChallengeStore<K, V> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store `value` for `user_id` under `key`, replacing whatever was there.
    pub async fn insert(&self, key: K, user_id: Uuid, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| !entry.expired(now));
        entries.insert(
            key,
            Entry {
                user_id,
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Remove and return the value under `key`.
    ///
    /// When `user_id` is given the entry must have been created for that user.
    ///
    /// # Errors
    /// Returns a [`ChallengeError`]; the entry is removed in every case.
    pub async fn take(&self, key: &K, user_id: Option<Uuid>) -> Result<V, ChallengeError> {
        let taken = self.take_entry(key).await?;
        if user_id.is_some_and(|user_id| user_id != taken.user_id) {
            return Err(ChallengeError::UserMismatch);
        }
        Ok(taken.value)
    }

    /// Remove the entry under `key`, keeping its deadline so it can be restored.
    ///
    /// # Errors
    /// `NotFound` or `Expired`; the entry is removed in every case.
    pub async fn take_entry(&self, key: &K) -> Result<Taken<V>, ChallengeError> {
        let entry = self
            .entries
            .lock()
            .await
            .remove(key)
            .ok_or(ChallengeError::NotFound)?;

        if entry.expired(Instant::now()) {
            return Err(ChallengeError::Expired);
        }
        Ok(Taken {
            user_id: entry.user_id,
            value: entry.value,
            expires_at: entry.expires_at,
        })
    }

    /// Put a taken entry back under its original deadline.
    ///
    /// Returns `false` when the entry expired in the meantime and was dropped.
    pub async fn restore(&self, key: K, taken: Taken<V>) -> bool {
        if Instant::now() >= taken.expires_at {
            return false;
        }
        self.entries.lock().await.insert(
            key,
            Entry {
                user_id: taken.user_id,
                value: taken.value,
                expires_at: taken.expires_at,
            },
        );
        true
    }

    /// Drop every entry matching `predicate`. Returns how many were dropped.
    pub async fn discard(&self, mut predicate: impl FnMut(Uuid, &V) -> bool) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !predicate(entry.user_id, &entry.value));
        before - entries.len()
    }

    /// Drop expired entries.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        before - entries.len()
    }

    pub async fn pending_for(&self, user_id: Uuid) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.user_id == user_id && !entry.expired(now))
            .count()
    }
}
