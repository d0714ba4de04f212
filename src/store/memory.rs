//! In-process stores for tests and `--memory-store` runs.
//!
//! All state sits behind one `tokio::sync::Mutex`. A refresh guard owns that lock
//! until it is consumed, which gives the same exclusion as `SELECT ... FOR UPDATE`.
//! Writes inside a guard are applied at commit time, so dropping it changes nothing.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    session::{NewSession, RefreshGuard, Session, SessionOwner, SessionStore},
    users::{
        CredentialStore, NewUser, SavedAccount, StoredPasskey, TwoFaMethod, User, UserSettings,
        UserStore, role_name,
    },
};

#[derive(Debug, Default)]
struct DeviceLink {
    users: BTreeSet<Uuid>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    settings: HashMap<Uuid, Option<TwoFaMethod>>,
    sessions: HashMap<Uuid, Session>,
    devices: HashMap<String, DeviceLink>,
    totp: HashMap<Uuid, Vec<u8>>,
    totp_steps: HashMap<Uuid, i64>,
    verifications: HashMap<Uuid, (Vec<u8>, DateTime<Utc>)>,
    passkeys: Vec<StoredPasskey>,
}

impl Inner {
    fn insert_session(&mut self, new: NewSession) -> Session {
        self.sessions.retain(|_, session| {
            session.revoked
                || session.user_id != new.user_id
                || session.device_id != new.device_id
        });

        let now = Utc::now();
        let session = Session {
            correlation_id: new.correlation_id,
            user_id: new.user_id,
            device_id: new.device_id,
            csrf_hash: new.csrf_hash,
            access_token: new.access_token,
            refresh_token: new.refresh_token,
            user_agent: new.user_agent,
            ip_address: new.ip_address,
            revoked: false,
            revoked_until: None,
            login_with: new.login_with,
            access_expires_at: new.access_expires_at,
            refresh_expires_at: new.refresh_expires_at,
            created_at: now,
            updated_at: now,
        };
        self.sessions.insert(session.correlation_id, session.clone());
        session
    }

    fn revoke_all(&mut self, user_id: Uuid) -> u64 {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.user_id != user_id);
        (before - self.sessions.len()) as u64
    }

    fn find_user(&self, identifier: &str) -> Option<&User> {
        let identifier = identifier.trim();
        let email = identifier.to_lowercase();
        self.users.values().find(|user| {
            user.email == email || user.username.eq_ignore_ascii_case(identifier)
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: NewSession) -> Result<Session> {
        Ok(self.inner.lock().await.insert_session(session))
    }

    async fn find_by_correlation_id(&self, correlation_id: Uuid) -> Result<Option<Session>> {
        Ok(self.inner.lock().await.sessions.get(&correlation_id).cloned())
    }

    async fn find_by_user_and_device(&self, user_id: Uuid, device_id: &str) -> Result<Vec<Session>> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|session| session.user_id == user_id && session.device_id == device_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn revoke(&self, correlation_id: Uuid, grace_until: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.sessions.get_mut(&correlation_id) {
            Some(session) => {
                session.revoked = true;
                session.revoked_until = Some(grace_until);
                session.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        Ok(self.inner.lock().await.revoke_all(user_id))
    }

    async fn delete(&self, correlation_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .remove(&correlation_id)
            .is_some())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64> {
        let cutoff = now - retention;
        let mut inner = self.inner.lock().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, session| {
            let grace_over =
                session.revoked && session.revoked_until.is_some_and(|until| until < now);
            !grace_over && session.updated_at >= cutoff
        });
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn begin_refresh(&self, correlation_id: Uuid) -> Result<Option<Box<dyn RefreshGuard>>> {
        let inner = self.inner.clone().lock_owned().await;
        let Some(session) = inner.sessions.get(&correlation_id).cloned() else {
            return Ok(None);
        };
        let user = inner
            .users
            .get(&session.user_id)
            .ok_or_else(|| anyhow!("session {correlation_id} has no owner"))?;
        let owner = SessionOwner {
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
        };
        Ok(Some(Box::new(MemoryRefreshGuard {
            inner,
            session,
            owner,
        })))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryRefreshGuard {
    inner: OwnedMutexGuard<Inner>,
    session: Session,
    owner: SessionOwner,
}

#[async_trait]
impl RefreshGuard for MemoryRefreshGuard {
    fn session(&self) -> &Session {
        &self.session
    }

    fn owner(&self) -> &SessionOwner {
        &self.owner
    }

    async fn revoke_all(self: Box<Self>) -> Result<u64> {
        let Self {
            mut inner, session, ..
        } = *self;
        Ok(inner.revoke_all(session.user_id))
    }

    async fn rotate(
        self: Box<Self>,
        grace_until: DateTime<Utc>,
        replacement: NewSession,
    ) -> Result<Session> {
        let Self {
            mut inner, session, ..
        } = *self;

        let stored = inner
            .sessions
            .get_mut(&session.correlation_id)
            .ok_or_else(|| anyhow!("locked session {} vanished", session.correlation_id))?;
        stored.revoked = true;
        stored.revoked_until = Some(grace_until);
        stored.updated_at = Utc::now();

        Ok(inner.insert_session(replacement))
    }

    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_email_or_username(&self, identifier: &str) -> Result<Option<User>> {
        Ok(self.inner.lock().await.find_user(identifier).cloned())
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&user_id).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<Option<User>> {
        let mut inner = self.inner.lock().await;
        let taken = inner.users.values().any(|existing| {
            existing.email == user.email || existing.username.eq_ignore_ascii_case(&user.username)
        });
        if taken {
            return Ok(None);
        }

        let created = User {
            id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            name: user.name,
            picture: user.picture,
            role_id: user.role_id,
            role: role_name(user.role_id).to_string(),
            verified: user.verified,
            created_at: Utc::now(),
        };
        inner.users.insert(created.id, created.clone());
        Ok(Some(created))
    }

    async fn find_or_create_by_email(&self, user: NewUser) -> Result<User> {
        let email = user.email.clone();
        if let Some(created) = self.create_user(user).await? {
            return Ok(created);
        }
        let inner = self.inner.lock().await;
        inner
            .users
            .values()
            .find(|existing| existing.email == email)
            .cloned()
            .ok_or_else(|| anyhow!("username already taken for {email}"))
    }

    async fn ensure_settings(&self, user_id: Uuid) -> Result<UserSettings> {
        let mut inner = self.inner.lock().await;
        let two_fa_method = *inner.settings.entry(user_id).or_default();
        Ok(UserSettings {
            user_id,
            two_fa_method,
        })
    }

    async fn set_two_fa_method(&self, user_id: Uuid, method: Option<TwoFaMethod>) -> Result<()> {
        self.inner.lock().await.settings.insert(user_id, method);
        Ok(())
    }

    async fn link_saved_account(&self, device_id: &str, user_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let link = inner.devices.entry(device_id.to_string()).or_default();
        link.users.insert(user_id);
        link.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn saved_accounts(&self, device_id: &str) -> Result<Vec<SavedAccount>> {
        let inner = self.inner.lock().await;
        let Some(link) = inner.devices.get(device_id) else {
            return Ok(Vec::new());
        };

        let mut accounts: Vec<SavedAccount> = link
            .users
            .iter()
            .filter_map(|user_id| inner.users.get(user_id))
            .map(|user| SavedAccount {
                username: user.username.clone(),
                name: user.name.clone(),
                picture: user.picture.clone(),
                two_fa_method: inner.settings.get(&user.id).copied().flatten(),
            })
            .collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(accounts)
    }

    async fn unlink_saved_account(&self, device_id: &str, username: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(user_id) = inner
            .users
            .values()
            .find(|user| user.username.eq_ignore_ascii_case(username))
            .map(|user| user.id)
        else {
            return Ok(false);
        };
        Ok(inner
            .devices
            .get_mut(device_id)
            .is_some_and(|link| link.users.remove(&user_id)))
    }

    async fn sweep_saved_accounts(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.devices.len();
        inner
            .devices
            .retain(|_, link| link.updated_at.is_some_and(|updated| updated >= cutoff));
        Ok((before - inner.devices.len()) as u64)
    }

    async fn save_email_verification(
        &self,
        user_id: Uuid,
        code_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .lock()
            .await
            .verifications
            .insert(user_id, (code_hash.to_vec(), expires_at));
        Ok(())
    }

    async fn redeem_email_verification(
        &self,
        user_id: Uuid,
        code_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .verifications
            .get(&user_id)
            .is_some_and(|(stored, expires_at)| {
                *expires_at > now && bool::from(stored.as_slice().ct_eq(code_hash))
            });
        if !matches {
            return Ok(false);
        }
        inner.verifications.remove(&user_id);
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.verified = true;
        }
        Ok(true)
    }

    async fn sweep_email_verifications(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.verifications.len();
        inner
            .verifications
            .retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - inner.verifications.len()) as u64)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn save_totp_secret(&self, user_id: Uuid, secret: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.totp.insert(user_id, secret.to_vec());
        inner.totp_steps.remove(&user_id);
        Ok(())
    }

    async fn totp_secret(&self, user_id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.totp.get(&user_id).cloned())
    }

    async fn delete_totp_secret(&self, user_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.totp_steps.remove(&user_id);
        Ok(inner.totp.remove(&user_id).is_some())
    }

    async fn claim_totp_step(&self, user_id: Uuid, step: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.totp.contains_key(&user_id) {
            return Ok(false);
        }
        if inner.totp_steps.get(&user_id).is_some_and(|last| *last >= step) {
            return Ok(false);
        }
        inner.totp_steps.insert(user_id, step);
        Ok(true)
    }

    async fn list_passkeys(&self, user_id: Uuid) -> Result<Vec<StoredPasskey>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .passkeys
            .iter()
            .filter(|passkey| passkey.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_passkey(&self, passkey: StoredPasskey) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let exists = inner.passkeys.iter().any(|existing| {
            existing.user_id == passkey.user_id && existing.credential_id == passkey.credential_id
        });
        if exists {
            return Ok(false);
        }
        inner.passkeys.push(passkey);
        Ok(true)
    }

    async fn update_passkey(&self, credential_id: &[u8], credential: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner
            .passkeys
            .iter_mut()
            .find(|passkey| passkey.credential_id == credential_id)
        {
            stored.credential = credential;
        }
        Ok(())
    }

    async fn delete_device_passkeys(&self, user_id: Uuid, device_id: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.passkeys.len();
        inner
            .passkeys
            .retain(|passkey| passkey.user_id != user_id || passkey.device_id != device_id);
        Ok((before - inner.passkeys.len()) as u64)
    }
}
