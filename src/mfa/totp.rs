//! Authenticator-app (TOTP) second factor.
//!
//! Registration keeps the new secret only in the challenge cache until the first
//! code confirms it; a wrong code discards it and registration starts over.
//! Every accepted code claims its time step, so a code works once.

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::AuthError,
    mfa::challenge::ChallengeStore,
    users::{CredentialStore, TwoFaMethod, UserStore},
};

pub const DEFAULT_TOTP_ISSUER: &str = "Quillgate";

/// What the client needs to add the account to an authenticator app.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TotpEnrollment {
    pub registration_id: Uuid,
    pub secret: String,
    /// `data:image/png;base64,...`
    pub qr_code: String,
    pub otpauth_url: String,
}

#[derive(Debug)]
pub struct TotpGate {
    issuer: String,
    pending: ChallengeStore<Uuid, Vec<u8>>,
}

impl TotpGate {
    #[must_use]
    pub fn new(issuer: String, ttl: Duration) -> Self {
        Self {
            issuer,
            pending: ChallengeStore::new(ttl),
        }
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> anyhow::Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret,
            Some(self.issuer.clone()),
            account.replace(':', ""),
        )
        .map_err(|e| anyhow!("TOTP init error: {e}"))
    }

    /// Generate a secret for `user_id` and park it until confirmed.
    ///
    /// Any earlier unconfirmed registration of the user is dropped.
    ///
    /// # Errors
    /// Returns `Internal` if secret or QR generation fails.
    pub async fn register_begin(
        &self,
        user_id: Uuid,
        account: &str,
    ) -> Result<TotpEnrollment, AuthError> {
        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| anyhow!("Secret gen error: {e}"))?;
        let totp = self.totp(secret.clone(), account)?;

        let qr = totp
            .get_qr_base64()
            .map_err(|e| anyhow!("QR gen error: {e}"))?;

        let registration_id = Uuid::new_v4();
        self.pending
            .discard(|pending_user, _| pending_user == user_id)
            .await;
        self.pending.insert(registration_id, user_id, secret).await;

        Ok(TotpEnrollment {
            registration_id,
            secret: totp.get_secret_base32(),
            qr_code: format!("data:image/png;base64,{qr}"),
            otpauth_url: totp.get_url(),
        })
    }

    /// Confirm a registration with the first code from the app.
    ///
    /// # Errors
    /// `NotFound` when the registration is unknown or expired, `PermissionDenied`
    /// for a wrong code. The pending secret is gone afterwards either way.
    pub async fn verify(
        &self,
        credentials: &dyn CredentialStore,
        users: &dyn UserStore,
        user_id: Uuid,
        registration_id: Uuid,
        code: &str,
    ) -> Result<(), AuthError> {
        let secret = self.pending.take(&registration_id, Some(user_id)).await?;

        let totp = self.totp(secret.clone(), "user")?;
        let Some(step) = matching_step(&totp, code, unix_now()) else {
            debug!(%user_id, "TOTP confirmation failed");
            return Err(AuthError::permission_denied("invalid code"));
        };

        credentials
            .save_totp_secret(user_id, &secret)
            .await
            .context("failed to store TOTP secret")?;
        // the confirmation code must not sign in afterwards
        credentials
            .claim_totp_step(user_id, step)
            .await
            .context("failed to record TOTP step")?;
        users
            .set_two_fa_method(user_id, Some(TwoFaMethod::App))
            .await
            .context("failed to enable two-factor authentication")?;

        debug!(%user_id, "TOTP enabled");
        Ok(())
    }

    /// Check a login code against the user's confirmed secret.
    ///
    /// # Errors
    /// `PermissionDenied` when no secret is stored, the code is wrong or its
    /// time step was already used.
    pub async fn check(
        &self,
        credentials: &dyn CredentialStore,
        user_id: Uuid,
        code: &str,
    ) -> Result<(), AuthError> {
        let secret = credentials
            .totp_secret(user_id)
            .await
            .context("failed to load TOTP secret")?
            .ok_or_else(|| AuthError::permission_denied("authenticator app not configured"))?;

        let totp = self.totp(secret, "user")?;
        let step = matching_step(&totp, code, unix_now())
            .ok_or_else(|| AuthError::permission_denied("invalid code"))?;

        if credentials
            .claim_totp_step(user_id, step)
            .await
            .context("failed to record TOTP step")?
        {
            Ok(())
        } else {
            debug!(%user_id, step, "TOTP code replayed");
            Err(AuthError::permission_denied("code already used"))
        }
    }

    /// Remove the user's TOTP secret. Returns the method now in effect.
    ///
    /// # Errors
    /// Returns `Internal` on storage failures.
    pub async fn delete(
        &self,
        credentials: &dyn CredentialStore,
        users: &dyn UserStore,
        user_id: Uuid,
    ) -> Result<Option<TwoFaMethod>, AuthError> {
        credentials
            .delete_totp_secret(user_id)
            .await
            .context("failed to delete TOTP secret")?;

        let has_passkeys = !credentials
            .list_passkeys(user_id)
            .await
            .context("failed to list passkeys")?
            .is_empty();
        let method = has_passkeys.then_some(TwoFaMethod::Passkey);

        users
            .set_two_fa_method(user_id, method)
            .await
            .context("failed to update two-factor method")?;
        Ok(method)
    }

    pub async fn pending_for(&self, user_id: Uuid) -> usize {
        self.pending.pending_for(user_id).await
    }
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

/// The time step within the allowed skew that produces `code`.
fn matching_step(totp: &TOTP, code: &str, now: u64) -> Option<i64> {
    let code = code.trim();
    let current = now / totp.step;
    let skew = u64::from(totp.skew);
    (current.saturating_sub(skew)..=current + skew)
        .find(|step| {
            totp.generate(step * totp.step)
                .as_bytes()
                .ct_eq(code.as_bytes())
                .into()
        })
        .and_then(|step| i64::try_from(step).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::Result;

    fn gate() -> TotpGate {
        TotpGate::new(DEFAULT_TOTP_ISSUER.to_string(), Duration::from_secs(60))
    }

    fn current_code(secret_base32: &str) -> Result<String> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| anyhow!("{e}"))?;
        let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, "user".to_string())
            .map_err(|e| anyhow!("{e}"))?;
        Ok(totp.generate_current()?)
    }

    #[tokio::test]
    async fn enroll_and_confirm() -> Result<()> {
        let gate = gate();
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        let enrollment = gate.register_begin(user_id, "alice").await?;
        assert!(enrollment.qr_code.starts_with("data:image/png;base64,"));
        assert!(enrollment.otpauth_url.starts_with("otpauth://totp/"));
        assert_eq!(gate.pending_for(user_id).await, 1);

        let code = current_code(&enrollment.secret)?;
        gate.verify(&store, &store, user_id, enrollment.registration_id, &code)
            .await?;

        assert_eq!(gate.pending_for(user_id).await, 0);
        assert!(store.totp_secret(user_id).await?.is_some());
        assert_eq!(
            store.ensure_settings(user_id).await?.two_fa_method,
            Some(TwoFaMethod::App)
        );
        assert!(matches!(
            gate.check(&store, user_id, &code).await,
            Err(AuthError::PermissionDenied(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn login_code_works_once() -> Result<()> {
        let gate = gate();
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| anyhow!("{e}"))?;
        store.save_totp_secret(user_id, &secret).await?;

        let totp = gate.totp(secret, "user")?;
        let code = totp.generate_current()?;
        gate.check(&store, user_id, &code).await?;
        assert!(matches!(
            gate.check(&store, user_id, &code).await,
            Err(AuthError::PermissionDenied(_))
        ));

        // an older step inside the skew window is stale once a newer one was used
        let previous = totp.generate(unix_now() - totp.step);
        if previous != code {
            assert!(gate.check(&store, user_id, &previous).await.is_err());
        }
        Ok(())
    }

    #[test]
    fn steps_within_skew() -> Result<()> {
        let totp = gate().totp(vec![3; 20], "user")?;
        let at = 1_700_000_010;
        let code = totp.generate(at);
        let step = i64::try_from(at / 30)?;

        assert_eq!(matching_step(&totp, &code, at), Some(step));
        assert_eq!(matching_step(&totp, &format!(" {code} "), at + 30), Some(step));
        assert_eq!(matching_step(&totp, &code, at + 90), None);
        assert_eq!(matching_step(&totp, "12345", at), None);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_code_clears_registration() -> Result<()> {
        let gate = gate();
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        let enrollment = gate.register_begin(user_id, "alice").await?;
        let code = current_code(&enrollment.secret)?;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let result = gate
            .verify(&store, &store, user_id, enrollment.registration_id, wrong)
            .await;
        assert!(matches!(result, Err(AuthError::PermissionDenied(_))));
        assert_eq!(gate.pending_for(user_id).await, 0);

        let retry = gate
            .verify(&store, &store, user_id, enrollment.registration_id, &code)
            .await;
        assert!(matches!(retry, Err(AuthError::NotFound(_))));
        assert!(store.totp_secret(user_id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn new_registration_replaces_pending_one() -> Result<()> {
        let gate = gate();
        let user_id = Uuid::new_v4();
        let first = gate.register_begin(user_id, "alice").await?;
        let second = gate.register_begin(user_id, "alice").await?;

        assert_ne!(first.registration_id, second.registration_id);
        assert_eq!(gate.pending_for(user_id).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_falls_back_to_nothing() -> Result<()> {
        let gate = gate();
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store.save_totp_secret(user_id, &[7; 20]).await?;
        store.set_two_fa_method(user_id, Some(TwoFaMethod::App)).await?;

        assert_eq!(gate.delete(&store, &store, user_id).await?, None);
        assert!(store.totp_secret(user_id).await?.is_none());
        assert!(matches!(
            gate.check(&store, user_id, "123456").await,
            Err(AuthError::PermissionDenied(_))
        ));
        Ok(())
    }
}
