//! Postgres-backed stores.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{
    Connection, FromRow, PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};
use std::time::Duration as StdDuration;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::{
    session::{NewSession, RefreshGuard, Session, SessionOwner, SessionStore},
    users::{
        CredentialStore, NewUser, SavedAccount, StoredPasskey, TwoFaMethod, User, UserSettings,
        UserStore,
    },
};

const SESSION_COLUMNS: &str = "correlation_id, user_id, device_id, csrf_hash, access_token, refresh_token, user_agent, ip_address, revoked, revoked_until, login_with, access_expires_at, refresh_expires_at, created_at, updated_at";

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    )))
}

impl FromRow<'_, PgRow> for Session {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let login_with: String = row.try_get("login_with")?;
        Ok(Self {
            correlation_id: row.try_get("correlation_id")?,
            user_id: row.try_get("user_id")?,
            device_id: row.try_get("device_id")?,
            csrf_hash: row.try_get("csrf_hash")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            user_agent: row.try_get("user_agent")?,
            ip_address: row.try_get("ip_address")?,
            revoked: row.try_get("revoked")?,
            revoked_until: row.try_get("revoked_until")?,
            login_with: login_with
                .parse()
                .map_err(|e| decode_error(format!("invalid sessions.login_with: {e}")))?,
            access_expires_at: row.try_get("access_expires_at")?,
            refresh_expires_at: row.try_get("refresh_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl FromRow<'_, PgRow> for User {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            name: row.try_get("name")?,
            picture: row.try_get("picture")?,
            role_id: row.try_get("role_id")?,
            role: row.try_get("role")?,
            verified: row.try_get("verified")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn parse_two_fa_method(value: Option<String>) -> Result<Option<TwoFaMethod>, sqlx::Error> {
    value
        .map(|value| {
            value
                .parse()
                .map_err(|e| decode_error(format!("invalid two_fa_method: {e}")))
        })
        .transpose()
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a small pool to `dsn`.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .max_lifetime(StdDuration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_session(tx: &mut Transaction<'static, Postgres>, new: NewSession) -> Result<Session> {
    // one live session per user and device; rotated rows stay until their grace window ends
    let query = "DELETE FROM sessions WHERE device_id = $1 AND user_id = $2 AND NOT revoked";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&new.device_id)
        .bind(new.user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to delete previous device sessions")?;

    let query = r"
        INSERT INTO sessions
            (correlation_id, user_id, device_id, csrf_hash, access_token, refresh_token,
             user_agent, ip_address, login_with, access_expires_at, refresh_expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING correlation_id, user_id, device_id, csrf_hash, access_token, refresh_token,
            user_agent, ip_address, revoked, revoked_until, login_with, access_expires_at,
            refresh_expires_at, created_at, updated_at
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query_as::<_, Session>(query)
        .bind(new.correlation_id)
        .bind(new.user_id)
        .bind(&new.device_id)
        .bind(&new.csrf_hash)
        .bind(&new.access_token)
        .bind(&new.refresh_token)
        .bind(&new.user_agent)
        .bind(&new.ip_address)
        .bind(new.login_with.as_str())
        .bind(new.access_expires_at)
        .bind(new.refresh_expires_at)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert session")
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create(&self, session: NewSession) -> Result<Session> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start session transaction")?;
        let session = insert_session(&mut tx, session).await?;
        tx.commit()
            .await
            .context("failed to commit session transaction")?;
        Ok(session)
    }

    async fn find_by_correlation_id(&self, correlation_id: Uuid) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE correlation_id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load session")
    }

    async fn find_by_user_and_device(&self, user_id: Uuid, device_id: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 AND device_id = $2 ORDER BY created_at DESC"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(user_id)
            .bind(device_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to load device sessions")
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list user sessions")
    }

    async fn revoke(&self, correlation_id: Uuid, grace_until: DateTime<Utc>) -> Result<bool> {
        let query = r"
            UPDATE sessions
            SET revoked = TRUE, revoked_until = $2, updated_at = NOW()
            WHERE correlation_id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(correlation_id)
            .bind(grace_until)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM sessions WHERE user_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete user sessions")?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, correlation_id: Uuid) -> Result<bool> {
        let query = "DELETE FROM sessions WHERE correlation_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(correlation_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64> {
        let query = r"
            DELETE FROM sessions
            WHERE (revoked AND revoked_until < $1)
               OR updated_at < $2
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .bind(now - retention)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to sweep sessions")?;
        Ok(result.rows_affected())
    }

    async fn begin_refresh(&self, correlation_id: Uuid) -> Result<Option<Box<dyn RefreshGuard>>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start refresh transaction")?;

        let query = r"
            SELECT s.correlation_id, s.user_id, s.device_id, s.csrf_hash, s.access_token,
                   s.refresh_token, s.user_agent, s.ip_address, s.revoked, s.revoked_until,
                   s.login_with, s.access_expires_at, s.refresh_expires_at, s.created_at,
                   s.updated_at, u.username, u.email, r.name AS role
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            JOIN roles r ON r.id = u.role_id
            WHERE s.correlation_id = $1
            FOR UPDATE OF s
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let Some(row) = sqlx::query(query)
            .bind(correlation_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock session")?
        else {
            tx.rollback()
                .await
                .context("failed to roll back refresh transaction")?;
            return Ok(None);
        };

        let session = Session::from_row(&row).context("failed to decode session")?;
        let owner = SessionOwner {
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            role: row.try_get("role")?,
        };

        Ok(Some(Box::new(PgRefreshGuard { tx, session, owner })))
    }

    async fn ping(&self) -> Result<()> {
        let span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire database connection")?;
        conn.ping()
            .instrument(span)
            .await
            .context("failed to ping database")
    }
}

struct PgRefreshGuard {
    tx: Transaction<'static, Postgres>,
    session: Session,
    owner: SessionOwner,
}

#[async_trait]
impl RefreshGuard for PgRefreshGuard {
    fn session(&self) -> &Session {
        &self.session
    }

    fn owner(&self) -> &SessionOwner {
        &self.owner
    }

    async fn revoke_all(self: Box<Self>) -> Result<u64> {
        let Self {
            mut tx, session, ..
        } = *self;

        let query = "DELETE FROM sessions WHERE user_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session.user_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to delete user sessions")?;

        tx.commit()
            .await
            .context("failed to commit session revocation")?;
        Ok(result.rows_affected())
    }

    async fn rotate(
        self: Box<Self>,
        grace_until: DateTime<Utc>,
        replacement: NewSession,
    ) -> Result<Session> {
        let Self {
            mut tx, session, ..
        } = *self;

        let query = r"
            UPDATE sessions
            SET revoked = TRUE, revoked_until = $2, updated_at = NOW()
            WHERE correlation_id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(session.correlation_id)
            .bind(grace_until)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to revoke rotated session")?;

        let rotated = insert_session(&mut tx, replacement).await?;

        tx.commit()
            .await
            .context("failed to commit session rotation")?;
        Ok(rotated)
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back refresh transaction")
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_by_email_or_username(&self, identifier: &str) -> Result<Option<User>> {
        let query = r"
            SELECT u.id, u.username, u.email, u.password_hash, u.name, u.picture, u.role_id,
                   r.name AS role, u.verified, u.created_at
            FROM users u
            JOIN roles r ON r.id = u.role_id
            WHERE u.email = lower($1) OR lower(u.username) = lower($1)
            LIMIT 1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, User>(query)
            .bind(identifier.trim())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up user")
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let query = r"
            SELECT u.id, u.username, u.email, u.password_hash, u.name, u.picture, u.role_id,
                   r.name AS role, u.verified, u.created_at
            FROM users u
            JOIN roles r ON r.id = u.role_id
            WHERE u.id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, User>(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load user")
    }

    async fn create_user(&self, user: NewUser) -> Result<Option<User>> {
        let query = r"
            WITH inserted AS (
                INSERT INTO users (id, username, email, password_hash, name, picture, role_id, verified)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT DO NOTHING
                RETURNING id, username, email, password_hash, name, picture, role_id, verified, created_at
            )
            SELECT i.id, i.username, i.email, i.password_hash, i.name, i.picture, i.role_id,
                   r.name AS role, i.verified, i.created_at
            FROM inserted i
            JOIN roles r ON r.id = i.role_id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query_as::<_, User>(query)
            .bind(Uuid::new_v4())
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.name)
            .bind(&user.picture)
            .bind(user.role_id)
            .bind(user.verified)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert user")
    }

    async fn find_or_create_by_email(&self, user: NewUser) -> Result<User> {
        let email = user.email.clone();
        if let Some(created) = self.create_user(user).await? {
            return Ok(created);
        }
        self.find_by_email_or_username(&email)
            .await?
            .filter(|existing| existing.email == email)
            .ok_or_else(|| anyhow!("username already taken for {email}"))
    }

    async fn ensure_settings(&self, user_id: Uuid) -> Result<UserSettings> {
        let query = r"
            WITH inserted AS (
                INSERT INTO user_settings (user_id)
                VALUES ($1)
                ON CONFLICT (user_id) DO NOTHING
                RETURNING user_id, two_fa_method
            )
            SELECT user_id, two_fa_method FROM inserted
            UNION ALL
            SELECT user_id, two_fa_method FROM user_settings WHERE user_id = $1
            LIMIT 1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to ensure user settings")?;

        Ok(UserSettings {
            user_id: row.try_get("user_id")?,
            two_fa_method: parse_two_fa_method(row.try_get("two_fa_method")?)?,
        })
    }

    async fn set_two_fa_method(&self, user_id: Uuid, method: Option<TwoFaMethod>) -> Result<()> {
        let query = r"
            INSERT INTO user_settings (user_id, two_fa_method)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET two_fa_method = EXCLUDED.two_fa_method, updated_at = NOW()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(method.map(TwoFaMethod::as_str))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update two-factor method")?;
        Ok(())
    }

    async fn link_saved_account(&self, device_id: &str, user_id: Uuid) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start saved account transaction")?;

        let query = r"
            INSERT INTO saved_accounts (device_id)
            VALUES ($1)
            ON CONFLICT (device_id) DO UPDATE SET updated_at = NOW()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(device_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to upsert saved account")?;

        let query = r"
            INSERT INTO user_saved_accounts (device_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(device_id)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to link saved account")?;

        tx.commit()
            .await
            .context("failed to commit saved account link")?;
        Ok(())
    }

    async fn saved_accounts(&self, device_id: &str) -> Result<Vec<SavedAccount>> {
        let query = r"
            SELECT u.username, u.name, u.picture, s.two_fa_method
            FROM user_saved_accounts usa
            JOIN users u ON u.id = usa.user_id
            LEFT JOIN user_settings s ON s.user_id = u.id
            WHERE usa.device_id = $1
            ORDER BY u.username
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list saved accounts")?;

        rows.iter()
            .map(|row| {
                Ok(SavedAccount {
                    username: row.try_get("username")?,
                    name: row.try_get("name")?,
                    picture: row.try_get("picture")?,
                    two_fa_method: parse_two_fa_method(row.try_get("two_fa_method")?)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("failed to decode saved accounts")
    }

    async fn unlink_saved_account(&self, device_id: &str, username: &str) -> Result<bool> {
        let query = r"
            DELETE FROM user_saved_accounts usa
            USING users u
            WHERE usa.user_id = u.id
              AND usa.device_id = $1
              AND lower(u.username) = lower($2)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(device_id)
            .bind(username)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to unlink saved account")?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_saved_accounts(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM saved_accounts WHERE updated_at < $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to sweep saved accounts")?;
        Ok(result.rows_affected())
    }

    async fn save_email_verification(
        &self,
        user_id: Uuid,
        code_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = r"
            INSERT INTO email_verifications (user_id, code_hash, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id)
            DO UPDATE SET code_hash = EXCLUDED.code_hash, expires_at = EXCLUDED.expires_at, created_at = NOW()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(code_hash)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to save email verification")?;
        Ok(())
    }

    async fn redeem_email_verification(
        &self,
        user_id: Uuid,
        code_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start email verification transaction")?;

        let query = r"
            DELETE FROM email_verifications
            WHERE user_id = $1 AND code_hash = $2 AND expires_at > $3
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let redeemed = sqlx::query(query)
            .bind(user_id)
            .bind(code_hash)
            .bind(now)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to redeem email verification")?
            .rows_affected()
            > 0;
        if !redeemed {
            return Ok(false);
        }

        let query = "UPDATE users SET verified = TRUE WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to mark user verified")?;

        tx.commit()
            .await
            .context("failed to commit email verification")?;
        Ok(true)
    }

    async fn sweep_email_verifications(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM email_verifications WHERE expires_at <= $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to sweep email verifications")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn save_totp_secret(&self, user_id: Uuid, secret: &[u8]) -> Result<()> {
        let query = r"
            INSERT INTO user_totp_secrets (user_id, secret)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET secret = EXCLUDED.secret, last_used_step = NULL, created_at = NOW()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(secret)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store TOTP secret")?;
        Ok(())
    }

    async fn totp_secret(&self, user_id: Uuid) -> Result<Option<Vec<u8>>> {
        let query = "SELECT secret FROM user_totp_secrets WHERE user_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load TOTP secret")?;
        row.map(|row| row.try_get("secret"))
            .transpose()
            .context("failed to decode TOTP secret")
    }

    async fn delete_totp_secret(&self, user_id: Uuid) -> Result<bool> {
        let query = "DELETE FROM user_totp_secrets WHERE user_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete TOTP secret")?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_totp_step(&self, user_id: Uuid, step: i64) -> Result<bool> {
        let query = r"
            UPDATE user_totp_secrets
            SET last_used_step = $2
            WHERE user_id = $1 AND (last_used_step IS NULL OR last_used_step < $2)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(step)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to record TOTP step")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_passkeys(&self, user_id: Uuid) -> Result<Vec<StoredPasskey>> {
        let query = r"
            SELECT credential_id, user_id, device_id, credential, created_at
            FROM user_passkeys
            WHERE user_id = $1
            ORDER BY created_at
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list passkeys")?;

        rows.iter()
            .map(|row| {
                Ok(StoredPasskey {
                    credential_id: row.try_get("credential_id")?,
                    user_id: row.try_get("user_id")?,
                    device_id: row.try_get("device_id")?,
                    credential: row.try_get("credential")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("failed to decode passkeys")
    }

    async fn insert_passkey(&self, passkey: StoredPasskey) -> Result<bool> {
        let query = r"
            INSERT INTO user_passkeys (credential_id, user_id, device_id, credential)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, credential_id) DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(&passkey.credential_id)
            .bind(passkey.user_id)
            .bind(&passkey.device_id)
            .bind(&passkey.credential)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert passkey")?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_passkey(&self, credential_id: &[u8], credential: Vec<u8>) -> Result<()> {
        let query = r"
            UPDATE user_passkeys
            SET credential = $2, last_used_at = NOW()
            WHERE credential_id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(credential_id)
            .bind(credential)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update passkey")?;
        Ok(())
    }

    async fn delete_device_passkeys(&self, user_id: Uuid, device_id: &str) -> Result<u64> {
        let query = "DELETE FROM user_passkeys WHERE user_id = $1 AND device_id = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(device_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete passkeys")?;
        Ok(result.rows_affected())
    }
}
