//! WebAuthn second factor, bound to the device it was registered on.
//!
//! Mobile devices run the passkey ceremony (user verification required); other
//! devices run the security-key ceremony. Registrations are parked under the user
//! id, logins under every credential id offered to the device. Credentials are
//! stored as serialized [`StoredCredential`] values.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use crate::{
    error::AuthError,
    mfa::challenge::ChallengeStore,
    session::ClientContext,
    users::{CredentialStore, StoredPasskey, TwoFaMethod, User, UserStore},
};

pub const DEFAULT_RP_NAME: &str = "Quillgate";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "credential", rename_all = "snake_case")]
pub enum StoredCredential {
    Passkey(Passkey),
    SecurityKey(SecurityKey),
}

impl StoredCredential {
    #[must_use]
    pub fn cred_id(&self) -> &CredentialID {
        match self {
            Self::Passkey(passkey) => passkey.cred_id(),
            Self::SecurityKey(key) => key.cred_id(),
        }
    }

    fn update(&mut self, result: &AuthenticationResult) -> Option<bool> {
        match self {
            Self::Passkey(passkey) => passkey.update_credential(result),
            Self::SecurityKey(key) => key.update_credential(result),
        }
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize credential")
    }

    /// # Errors
    /// Returns an error if `data` is not a stored credential.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("failed to deserialize credential")
    }
}

enum Registration {
    Passkey(PasskeyRegistration),
    SecurityKey(SecurityKeyRegistration),
}

struct PendingRegistration {
    device_id: String,
    ceremony: Registration,
}

enum Authentication {
    Passkey(PasskeyAuthentication),
    SecurityKey(SecurityKeyAuthentication),
}

struct PendingAuthentication {
    ceremony_id: Uuid,
    user_id: Uuid,
    device_id: String,
    ceremony: Authentication,
}

pub struct WebauthnGate {
    webauthn: Webauthn,
    registrations: ChallengeStore<Uuid, PendingRegistration>,
    authentications: ChallengeStore<Vec<u8>, Arc<PendingAuthentication>>,
}

impl WebauthnGate {
    /// Build the relying party.
    ///
    /// # Errors
    /// Returns an error if the origin is not a URL or does not match `rp_id`.
    pub fn new(rp_id: &str, rp_origin: &str, rp_name: &str, ttl: Duration) -> Result<Self> {
        let rp_origin_url =
            Url::parse(rp_origin).with_context(|| format!("Invalid WebAuthn origin: {rp_origin}"))?;
        let webauthn = WebauthnBuilder::new(rp_id, &rp_origin_url)?
            .rp_name(rp_name)
            .build()?;

        Ok(Self {
            webauthn,
            registrations: ChallengeStore::new(ttl),
            authentications: ChallengeStore::new(ttl),
        })
    }

    /// Start registering a credential for `user` on the requesting device.
    ///
    /// Every credential the user already owns is excluded.
    ///
    /// # Errors
    /// Returns `Internal` on storage or ceremony failures.
    pub async fn register_options(
        &self,
        credentials: &dyn CredentialStore,
        user: &User,
        client: &ClientContext,
    ) -> Result<CreationChallengeResponse, AuthError> {
        let exclude: Vec<CredentialID> = credentials
            .list_passkeys(user.id)
            .await
            .context("failed to list passkeys")?
            .into_iter()
            .map(|passkey| passkey.credential_id.into())
            .collect();

        let display_name = user.name.as_deref().unwrap_or(&user.username);
        let (challenge, ceremony) = if client.attributes.is_mobile() {
            let (challenge, registration) = self
                .webauthn
                .start_passkey_registration(user.id, &user.username, display_name, Some(exclude))
                .context("failed to start passkey registration")?;
            (challenge, Registration::Passkey(registration))
        } else {
            let (challenge, registration) = self
                .webauthn
                .start_securitykey_registration(
                    user.id,
                    &user.username,
                    display_name,
                    Some(exclude),
                    None,
                    None,
                )
                .context("failed to start security key registration")?;
            (challenge, Registration::SecurityKey(registration))
        };

        self.registrations
            .insert(
                user.id,
                user.id,
                PendingRegistration {
                    device_id: client.device_id.clone(),
                    ceremony,
                },
            )
            .await;

        Ok(challenge)
    }

    /// Finish a registration and make WebAuthn the user's second factor.
    ///
    /// # Errors
    /// `NotFound` without a pending registration, `PermissionDenied` when the
    /// response does not verify or comes from another device, `AlreadyExists`
    /// when the user already has this credential.
    pub async fn register_verify(
        &self,
        credentials: &dyn CredentialStore,
        users: &dyn UserStore,
        user_id: Uuid,
        client: &ClientContext,
        response: &RegisterPublicKeyCredential,
    ) -> Result<(), AuthError> {
        let pending = self.registrations.take(&user_id, Some(user_id)).await?;
        if pending.device_id != client.device_id {
            return Err(AuthError::permission_denied(
                "registration started on another device",
            ));
        }

        let credential = match &pending.ceremony {
            Registration::Passkey(state) => self
                .webauthn
                .finish_passkey_registration(response, state)
                .map(StoredCredential::Passkey),
            Registration::SecurityKey(state) => self
                .webauthn
                .finish_securitykey_registration(response, state)
                .map(StoredCredential::SecurityKey),
        }
        .map_err(|err| {
            debug!(%user_id, "WebAuthn registration rejected: {err}");
            AuthError::permission_denied("passkey verification failed")
        })?;

        let inserted = credentials
            .insert_passkey(StoredPasskey {
                credential_id: credential.cred_id().as_slice().to_vec(),
                user_id,
                device_id: pending.device_id,
                credential: credential.to_bytes()?,
                created_at: Utc::now(),
            })
            .await
            .context("failed to store passkey")?;
        if !inserted {
            return Err(AuthError::already_exists("passkey already registered"));
        }

        users
            .set_two_fa_method(user_id, Some(TwoFaMethod::Passkey))
            .await
            .context("failed to enable two-factor authentication")?;

        debug!(%user_id, "passkey registered");
        Ok(())
    }

    /// Start a login for `user` with the credentials registered on this device.
    ///
    /// # Errors
    /// `PermissionDenied` when the device has no usable credential.
    pub async fn login_options(
        &self,
        credentials: &dyn CredentialStore,
        user: &User,
        client: &ClientContext,
    ) -> Result<RequestChallengeResponse, AuthError> {
        let stored: Vec<StoredCredential> = credentials
            .list_passkeys(user.id)
            .await
            .context("failed to list passkeys")?
            .into_iter()
            .filter(|passkey| passkey.device_id == client.device_id)
            .filter_map(|passkey| StoredCredential::from_bytes(&passkey.credential).ok())
            .collect();

        let (challenge, ceremony, allowed) = if client.attributes.is_mobile() {
            let passkeys: Vec<Passkey> = stored
                .into_iter()
                .filter_map(|credential| match credential {
                    StoredCredential::Passkey(passkey) => Some(passkey),
                    StoredCredential::SecurityKey(_) => None,
                })
                .collect();
            if passkeys.is_empty() {
                return Err(AuthError::permission_denied(
                    "no passkey registered on this device",
                ));
            }
            let allowed: Vec<Vec<u8>> = passkeys.iter().map(|p| p.cred_id().as_slice().to_vec()).collect();
            let (challenge, state) = self
                .webauthn
                .start_passkey_authentication(&passkeys)
                .context("failed to start passkey authentication")?;
            (challenge, Authentication::Passkey(state), allowed)
        } else {
            let keys: Vec<SecurityKey> = stored
                .into_iter()
                .filter_map(|credential| match credential {
                    StoredCredential::SecurityKey(key) => Some(key),
                    StoredCredential::Passkey(_) => None,
                })
                .collect();
            if keys.is_empty() {
                return Err(AuthError::permission_denied(
                    "no passkey registered on this device",
                ));
            }
            let allowed: Vec<Vec<u8>> = keys.iter().map(|k| k.cred_id().as_slice().to_vec()).collect();
            let (challenge, state) = self
                .webauthn
                .start_securitykey_authentication(&keys)
                .context("failed to start security key authentication")?;
            (challenge, Authentication::SecurityKey(state), allowed)
        };

        let pending = Arc::new(PendingAuthentication {
            ceremony_id: Uuid::new_v4(),
            user_id: user.id,
            device_id: client.device_id.clone(),
            ceremony,
        });
        for credential_id in allowed {
            self.authentications
                .insert(credential_id, user.id, Arc::clone(&pending))
                .await;
        }

        Ok(challenge)
    }

    /// Verify a login assertion. Returns the authenticated user.
    ///
    /// # Errors
    /// `NotFound` without a pending login for the credential, `PermissionDenied`
    /// when the assertion does not verify or comes from another device.
    pub async fn login_verify(
        &self,
        credentials: &dyn CredentialStore,
        users: &dyn UserStore,
        client: &ClientContext,
        response: &PublicKeyCredential,
    ) -> Result<User, AuthError> {
        let credential_id = response.get_credential_id().to_vec();
        let pending = self.authentications.take(&credential_id, None).await?;
        let ceremony_id = pending.ceremony_id;
        self.authentications
            .discard(|_, other| other.ceremony_id == ceremony_id)
            .await;

        if pending.device_id != client.device_id {
            return Err(AuthError::permission_denied(
                "login started on another device",
            ));
        }

        let result = match &pending.ceremony {
            Authentication::Passkey(state) => {
                self.webauthn.finish_passkey_authentication(response, state)
            }
            Authentication::SecurityKey(state) => self
                .webauthn
                .finish_securitykey_authentication(response, state),
        }
        .map_err(|err| {
            debug!(user_id = %pending.user_id, "WebAuthn login rejected: {err}");
            AuthError::permission_denied("passkey verification failed")
        })?;

        let stored = credentials
            .list_passkeys(pending.user_id)
            .await
            .context("failed to list passkeys")?
            .into_iter()
            .find(|passkey| passkey.credential_id.as_slice() == result.cred_id().as_slice())
            .ok_or_else(|| AuthError::permission_denied("unknown passkey"))?;

        let mut credential = StoredCredential::from_bytes(&stored.credential)?;
        if credential.update(&result) == Some(true) {
            credentials
                .update_passkey(&stored.credential_id, credential.to_bytes()?)
                .await
                .context("failed to update passkey")?;
        }

        users
            .find_by_id(pending.user_id)
            .await
            .context("failed to load user")?
            .ok_or_else(|| AuthError::not_found("user not found"))
    }

    /// Remove this device's credentials. Returns the method now in effect.
    ///
    /// # Errors
    /// Returns `Internal` on storage failures.
    pub async fn delete(
        &self,
        credentials: &dyn CredentialStore,
        users: &dyn UserStore,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<TwoFaMethod>, AuthError> {
        credentials
            .delete_device_passkeys(user_id, device_id)
            .await
            .context("failed to delete passkeys")?;

        let method = if !credentials
            .list_passkeys(user_id)
            .await
            .context("failed to list passkeys")?
            .is_empty()
        {
            Some(TwoFaMethod::Passkey)
        } else if credentials
            .totp_secret(user_id)
            .await
            .context("failed to load TOTP secret")?
            .is_some()
        {
            Some(TwoFaMethod::App)
        } else {
            None
        };

        users
            .set_two_fa_method(user_id, method)
            .await
            .context("failed to update two-factor method")?;
        Ok(method)
    }

    pub async fn pending_registrations_for(&self, user_id: Uuid) -> usize {
        self.registrations.pending_for(user_id).await
    }

    pub async fn pending_logins_for(&self, user_id: Uuid) -> usize {
        self.authentications.pending_for(user_id).await
    }
}
