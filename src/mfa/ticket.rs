//! Tickets bridging a verified password and the second factor.
//!
//! `/auth/login` hands one out when the account has a second factor. The ticket
//! names the user, so the second-factor endpoints never take an account name. It
//! is bound to the device the password was entered on and is gone after the first
//! successful verification or after [`MAX_FAILED_ATTEMPTS`] wrong codes.

use anyhow::Result;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::AuthError,
    mfa::challenge::{ChallengeError, ChallengeStore, Taken},
    session::ClientContext,
};

pub const MAX_FAILED_ATTEMPTS: u32 = 5;

const INVALID_TICKET: &str = "invalid or expired sign-in ticket";

#[derive(Clone, Debug)]
struct Ticket {
    device_id: String,
    failed_attempts: u32,
}

/// A ticket checked out for one verification.
///
/// Dropping it spends the ticket; [`MfaTickets::fail`] returns it for another try.
#[derive(Debug)]
pub struct Attempt {
    key: String,
    taken: Taken<Ticket>,
}

impl Attempt {
    #[must_use]
    pub const fn user_id(&self) -> Uuid {
        self.taken.user_id
    }
}

#[derive(Debug)]
pub struct MfaTickets {
    tickets: ChallengeStore<String, Ticket>,
}

impl MfaTickets {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: ChallengeStore::new(ttl),
        }
    }

    /// Issue a ticket for `user_id` on the requesting device.
    ///
    /// Earlier tickets of the user on the same device are dropped.
    ///
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub async fn issue(&self, user_id: Uuid, client: &ClientContext) -> Result<String> {
        let mut bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut bytes)?;
        let key = URL_SAFE_NO_PAD.encode(bytes);

        self.tickets
            .discard(|owner, ticket| owner == user_id && ticket.device_id == client.device_id)
            .await;
        self.tickets
            .insert(
                key.clone(),
                user_id,
                Ticket {
                    device_id: client.device_id.clone(),
                    failed_attempts: 0,
                },
            )
            .await;
        Ok(key)
    }

    /// Check a ticket out for one verification.
    ///
    /// # Errors
    /// `PermissionDenied` when the ticket is unknown, expired, checked out by a
    /// concurrent request or presented from another device. A ticket presented
    /// from another device is spent.
    pub async fn begin(&self, key: &str, client: &ClientContext) -> Result<Attempt, AuthError> {
        let taken = self
            .tickets
            .take_entry(&key.to_string())
            .await
            .map_err(|err: ChallengeError| {
                debug!("sign-in ticket rejected: {err}");
                AuthError::permission_denied(INVALID_TICKET)
            })?;

        if taken.value.device_id != client.device_id {
            debug!(user_id = %taken.user_id, "sign-in ticket used from another device");
            return Err(AuthError::permission_denied(INVALID_TICKET));
        }

        Ok(Attempt {
            key: key.to_string(),
            taken,
        })
    }

    /// Look at a ticket without spending it.
    ///
    /// # Errors
    /// Same as [`Self::begin`].
    pub async fn peek(&self, key: &str, client: &ClientContext) -> Result<Uuid, AuthError> {
        let attempt = self.begin(key, client).await?;
        let user_id = attempt.user_id();
        if !self.tickets.restore(attempt.key, attempt.taken).await {
            return Err(AuthError::permission_denied(INVALID_TICKET));
        }
        Ok(user_id)
    }

    /// Record a wrong code. Returns the attempts left; at zero the ticket is spent.
    pub async fn fail(&self, mut attempt: Attempt) -> u32 {
        attempt.taken.value.failed_attempts += 1;
        let left = MAX_FAILED_ATTEMPTS.saturating_sub(attempt.taken.value.failed_attempts);
        if left == 0 {
            debug!(user_id = %attempt.user_id(), "sign-in ticket spent after too many wrong codes");
            return 0;
        }
        if self.tickets.restore(attempt.key, attempt.taken).await {
            left
        } else {
            0
        }
    }

    pub async fn pending_for(&self, user_id: Uuid) -> usize {
        self.tickets.pending_for(user_id).await
    }
}
