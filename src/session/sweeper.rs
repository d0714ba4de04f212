//! Periodic cleanup of sessions, saved-account links and expired email
//! verification codes.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use super::SessionStore;
use crate::users::UserStore;

const DEFAULT_INTERVAL_SECONDS: u64 = 60 * 60;
const DEFAULT_RETENTION_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug)]
pub struct SweepConfig {
    interval_seconds: u64,
    retention_seconds: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            retention_seconds: DEFAULT_RETENTION_SECONDS,
        }
    }

    #[must_use]
    pub const fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    #[must_use]
    pub const fn with_retention_seconds(mut self, seconds: i64) -> Self {
        self.retention_seconds = seconds;
        self
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    #[must_use]
    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.retention_seconds.max(0))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: u64,
    pub saved_accounts: u64,
    pub email_verifications: u64,
}

/// Run one sweep pass over both stores.
///
/// # Errors
/// Returns an error if any delete fails; the others still run.
pub async fn sweep_once(
    sessions: &dyn SessionStore,
    users: &dyn UserStore,
    config: &SweepConfig,
) -> Result<SweepReport> {
    let now = Utc::now();
    let session_result = sessions.sweep_expired(now, config.retention()).await;
    let saved_result = users.sweep_saved_accounts(now - config.retention()).await;
    let verification_result = users.sweep_email_verifications(now).await;

    Ok(SweepReport {
        sessions: session_result?,
        saved_accounts: saved_result?,
        email_verifications: verification_result?,
    })
}

/// Spawn the background sweeper. The first pass runs immediately.
pub fn spawn_sweeper(
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    config: SweepConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match sweep_once(sessions.as_ref(), users.as_ref(), &config).await {
                Ok(report) if report == SweepReport::default() => {
                    debug!("sweep found nothing to delete");
                }
                Ok(report) => info!(
                    sessions = report.sessions,
                    saved_accounts = report.saved_accounts,
                    email_verifications = report.email_verifications,
                    "sweep removed stale records"
                ),
                Err(err) => error!("session sweep failed: {err:#}"),
            }
        }
    })
}
