//! Credential lifecycle: the access/refresh token pair, inline refresh,
//! and proactive refresh-token rotation.
//!
//! Single-writer discipline: only this manager mutates the pair, and it
//! replaces the whole pair atomically. Every other component reads a
//! snapshot through [`CredentialManager::access_token`]. Inline refresh is
//! single-flight: concurrent callers serialize on one mutex and the losers
//! re-read the fresh pair instead of issuing a second network call.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::CredentialError;
use crate::notifications::NotificationLog;
use crate::secrets::{CREDENTIALS_ACCOUNT, SecretStore, service_name};

/// Tokens returned by the refresh endpoint. The server may rotate the
/// refresh token on any refresh; `refresh_token` is `None` when it did not.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub agent_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Seam to the network layer for the one refresh/rotation wire call.
///
/// Implementations map "token invalid" responses to
/// [`CredentialError::RefreshTokenExpired`] (which clears credentials) and
/// transport failures to [`CredentialError::Transport`] (which keeps the
/// old pair for the next cycle).
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn refresh(
        &self,
        agent_id: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, CredentialError>;
}

/// The agent's current token pair. Replaced atomically, never patched.
#[derive(Clone)]
pub struct CredentialPair {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub agent_id: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    /// When the current refresh token was issued. Rotation is scheduled
    /// from this instant, not from the last access refresh.
    pub issued_at: DateTime<Utc>,
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("agent_id", &self.agent_id)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

impl CredentialPair {
    pub fn needs_access_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now >= self.access_expires_at - chrono::Duration::from_std(buffer).unwrap_or_default()
    }

    pub fn needs_rotation(&self, now: DateTime<Utc>, rotation_age: Duration) -> bool {
        now >= self.issued_at + chrono::Duration::from_std(rotation_age).unwrap_or_default()
    }

    pub fn refresh_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_expires_at
    }
}

/// Plain-text shape persisted via the secret store (encrypted at rest).
#[derive(Serialize, Deserialize)]
struct StoredPair {
    access_token: String,
    refresh_token: String,
    agent_id: String,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
}

impl From<&CredentialPair> for StoredPair {
    fn from(pair: &CredentialPair) -> Self {
        Self {
            access_token: pair.access_token.expose_secret().to_string(),
            refresh_token: pair.refresh_token.expose_secret().to_string(),
            agent_id: pair.agent_id.clone(),
            access_expires_at: pair.access_expires_at,
            refresh_expires_at: pair.refresh_expires_at,
            issued_at: pair.issued_at,
        }
    }
}

impl From<StoredPair> for CredentialPair {
    fn from(stored: StoredPair) -> Self {
        Self {
            access_token: SecretString::from(stored.access_token),
            refresh_token: SecretString::from(stored.refresh_token),
            agent_id: stored.agent_id,
            access_expires_at: stored.access_expires_at,
            refresh_expires_at: stored.refresh_expires_at,
            issued_at: stored.issued_at,
        }
    }
}

/// Timing knobs, overridable for tests.
#[derive(Debug, Clone)]
pub struct CredentialSchedule {
    /// Refresh this long before access-token expiry.
    pub refresh_buffer: Duration,
    /// Rotate the refresh token once it reaches this age
    /// (one day inside the 30-day hard expiry).
    pub rotation_age: Duration,
    /// Wait this long before the single rotation retry.
    pub rotation_retry: Duration,
}

impl Default for CredentialSchedule {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(5 * 60),
            rotation_age: Duration::from_secs(29 * 24 * 60 * 60),
            rotation_retry: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of loading persisted credentials at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing persisted; enrollment has not happened.
    Absent,
    /// A pair existed but its refresh token is past hard expiry; it has
    /// been cleared and enrollment must restart.
    Expired,
    /// A usable pair was loaded and timers are scheduled.
    Ready { needs_rotation: bool },
}

struct Timers {
    refresh: Option<JoinHandle<()>>,
    rotation: Option<JoinHandle<()>>,
}

/// Owns the credential pair and its two one-shot timers.
pub struct CredentialManager {
    pair: RwLock<Option<CredentialPair>>,
    /// Single-flight guard for refresh/rotation network calls.
    refresh_lock: Mutex<()>,
    transport: Arc<dyn RefreshTransport>,
    store: Arc<dyn SecretStore>,
    service: String,
    notifications: Arc<NotificationLog>,
    schedule: CredentialSchedule,
    timers: StdMutex<Timers>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn SecretStore>,
        namespace: &str,
        transport: Arc<dyn RefreshTransport>,
        notifications: Arc<NotificationLog>,
        schedule: CredentialSchedule,
    ) -> Arc<Self> {
        Arc::new(Self {
            pair: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            transport,
            store,
            service: service_name(namespace),
            notifications,
            schedule,
            timers: StdMutex::new(Timers {
                refresh: None,
                rotation: None,
            }),
        })
    }

    /// Store a new pair: validate, atomically replace, persist, reschedule
    /// both timers.
    pub async fn store(self: &Arc<Self>, pair: CredentialPair) -> Result<(), CredentialError> {
        let now = Utc::now();
        if pair.access_expires_at <= now || pair.refresh_expires_at <= now {
            return Err(CredentialError::InvalidResponse {
                reason: "server returned tokens that are already expired".to_string(),
            });
        }

        let stored = serde_json::to_vec(&StoredPair::from(&pair))
            .map_err(crate::error::SecretStoreError::from)?;
        self.store
            .set(&self.service, CREDENTIALS_ACCOUNT, &stored)
            .await?;

        *self.pair.write().await = Some(pair.clone());
        self.schedule_timers(&pair);
        Ok(())
    }

    /// Load persisted credentials at startup and schedule timers.
    ///
    /// An overdue rotation schedules with zero delay, so it fires
    /// immediately rather than waiting for a future boundary.
    pub async fn load(self: &Arc<Self>) -> Result<LoadOutcome, CredentialError> {
        let Some(bytes) = self.store.get(&self.service, CREDENTIALS_ACCOUNT).await? else {
            return Ok(LoadOutcome::Absent);
        };
        let stored: StoredPair =
            serde_json::from_slice(&bytes).map_err(crate::error::SecretStoreError::from)?;
        let pair = CredentialPair::from(stored);

        let now = Utc::now();
        if pair.refresh_expired(now) {
            tracing::warn!("persisted refresh token is past hard expiry, clearing");
            self.clear().await;
            return Ok(LoadOutcome::Expired);
        }

        let needs_rotation = pair.needs_rotation(now, self.schedule.rotation_age);
        *self.pair.write().await = Some(pair.clone());
        self.schedule_timers(&pair);
        Ok(LoadOutcome::Ready { needs_rotation })
    }

    /// Agent ID from the current pair, if any.
    pub async fn agent_id(&self) -> Option<String> {
        self.pair.read().await.as_ref().map(|p| p.agent_id.clone())
    }

    pub async fn has_credentials(&self) -> bool {
        self.pair.read().await.is_some()
    }

    /// Get a bearer token, refreshing inline first when the access token is
    /// inside the expiry buffer.
    pub async fn access_token(self: &Arc<Self>) -> Result<String, CredentialError> {
        let now = Utc::now();
        {
            let guard = self.pair.read().await;
            let pair = guard.as_ref().ok_or(CredentialError::NoCredentials)?;
            if pair.refresh_expired(now) {
                drop(guard);
                self.clear().await;
                self.notifications.record(
                    "credentials_cleared",
                    "refresh token expired, re-enrollment required",
                    None,
                );
                return Err(CredentialError::RefreshTokenExpired);
            }
            if !pair.needs_access_refresh(now, self.schedule.refresh_buffer) {
                return Ok(pair.access_token.expose_secret().to_string());
            }
        }

        // Needs refresh. Serialize with any concurrent refresher and
        // re-check afterwards: the winner already did the work.
        let _flight = self.refresh_lock.lock().await;
        {
            let guard = self.pair.read().await;
            let pair = guard.as_ref().ok_or(CredentialError::NoCredentials)?;
            if !pair.needs_access_refresh(Utc::now(), self.schedule.refresh_buffer) {
                return Ok(pair.access_token.expose_secret().to_string());
            }
        }
        self.refresh_locked().await?;

        let guard = self.pair.read().await;
        let pair = guard.as_ref().ok_or(CredentialError::NoCredentials)?;
        Ok(pair.access_token.expose_secret().to_string())
    }

    /// Force a refresh now (the 401-retry path).
    pub async fn refresh(self: &Arc<Self>) -> Result<(), CredentialError> {
        let _flight = self.refresh_lock.lock().await;
        self.refresh_locked().await?;
        Ok(())
    }

    /// Refresh only if the access token is inside the expiry buffer.
    /// Used by the scheduled refresh timer.
    async fn refresh_if_due(self: &Arc<Self>) -> Result<(), CredentialError> {
        let _flight = self.refresh_lock.lock().await;
        {
            let guard = self.pair.read().await;
            let Some(pair) = guard.as_ref() else {
                return Ok(());
            };
            if !pair.needs_access_refresh(Utc::now(), self.schedule.refresh_buffer) {
                return Ok(());
            }
        }
        self.refresh_locked().await?;
        Ok(())
    }

    /// Proactive refresh-token rotation. Same wire call as a refresh; on a
    /// transient failure schedules exactly one retry instead of looping
    /// against a failing server.
    pub async fn rotate(self: &Arc<Self>) -> Result<(), CredentialError> {
        self.rotate_attempt(true).await
    }

    async fn rotate_attempt(self: &Arc<Self>, first_attempt: bool) -> Result<(), CredentialError> {
        let result = {
            let _flight = self.refresh_lock.lock().await;
            self.refresh_locked().await
        };

        match result {
            Ok(true) => {
                self.notifications
                    .record("token_rotated", "refresh token rotated", None);
                Ok(())
            }
            Ok(false) => {
                // The server answered but kept the current refresh token;
                // refresh_locked has already deferred the next attempt.
                tracing::info!("server kept the current refresh token, rotation deferred");
                Ok(())
            }
            Err(CredentialError::RefreshTokenExpired) => Err(CredentialError::RefreshTokenExpired),
            Err(e) if first_attempt => {
                self.notifications.record(
                    "token_rotation_failed",
                    format!(
                        "rotation failed, retrying once in {:?}: {e}",
                        self.schedule.rotation_retry
                    ),
                    None,
                );
                self.schedule_rotation_retry();
                Err(e)
            }
            Err(e) => {
                // The single retry also failed. Stop here; the next
                // successful refresh re-arms the rotation timer.
                self.notifications.record(
                    "token_rotation_failed",
                    format!("rotation retry failed, deferring to the next refresh: {e}"),
                    None,
                );
                Err(e)
            }
        }
    }

    /// Drop the pair, erase persistence, cancel timers.
    pub async fn clear(&self) {
        self.cancel_timers();
        *self.pair.write().await = None;
        if let Err(e) = self.store.delete(&self.service, CREDENTIALS_ACCOUNT).await {
            tracing::warn!("failed to erase persisted credentials: {e}");
        }
    }

    /// Cancel both timers without touching the pair. Called at shutdown.
    pub fn cancel_timers(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timers.refresh.take() {
            handle.abort();
        }
        if let Some(handle) = timers.rotation.take() {
            handle.abort();
        }
    }

    /// The actual refresh call. Caller must hold `refresh_lock`. Returns
    /// whether the server rotated the refresh token.
    async fn refresh_locked(self: &Arc<Self>) -> Result<bool, CredentialError> {
        let (agent_id, refresh_token, old) = {
            let guard = self.pair.read().await;
            let pair = guard.as_ref().ok_or(CredentialError::NoCredentials)?;
            (
                pair.agent_id.clone(),
                pair.refresh_token.expose_secret().to_string(),
                pair.clone(),
            )
        };

        let now = Utc::now();
        if old.refresh_expired(now) {
            self.clear().await;
            return Err(CredentialError::RefreshTokenExpired);
        }

        match self.transport.refresh(&agent_id, &refresh_token).await {
            Ok(grant) => {
                let rotated = grant.refresh_token.is_some();
                let new_pair = CredentialPair {
                    access_token: SecretString::from(grant.access_token),
                    refresh_token: grant
                        .refresh_token
                        .map(SecretString::from)
                        .unwrap_or(old.refresh_token),
                    agent_id: if grant.agent_id.is_empty() {
                        old.agent_id
                    } else {
                        grant.agent_id
                    },
                    access_expires_at: grant.expires_at,
                    refresh_expires_at: match (rotated, grant.refresh_expires_at) {
                        (_, Some(expiry)) => expiry,
                        (true, None) => now + chrono::Duration::days(30),
                        (false, None) => old.refresh_expires_at,
                    },
                    issued_at: if rotated { now } else { old.issued_at },
                };

                let rotation_still_due =
                    !rotated && new_pair.needs_rotation(now, self.schedule.rotation_age);
                self.store(new_pair).await?;
                if rotation_still_due {
                    // The pair is past the rotation boundary but the server
                    // kept the old refresh token. `store` armed the rotation
                    // timer with zero delay; replace it with the retry delay
                    // so rotation attempts stay spaced, not back-to-back.
                    tracing::debug!(
                        "refresh token not rotated while past rotation age, retrying in {:?}",
                        self.schedule.rotation_retry
                    );
                    self.schedule_rotation_retry();
                }
                tracing::debug!(rotated, "access token refreshed");
                Ok(rotated)
            }
            Err(CredentialError::RefreshTokenExpired) => {
                // Server says the token is invalid: clear everything rather
                // than retrying indefinitely.
                self.clear().await;
                self.notifications.record(
                    "credentials_cleared",
                    "server rejected refresh token, re-enrollment required",
                    None,
                );
                Err(CredentialError::RefreshTokenExpired)
            }
            Err(e) => {
                tracing::warn!("token refresh failed, keeping current pair: {e}");
                Err(e)
            }
        }
    }

    /// Cancel and recreate both one-shot timers for a pair. Overdue delays
    /// clamp to zero and fire immediately.
    fn schedule_timers(self: &Arc<Self>, pair: &CredentialPair) {
        let now = Utc::now();
        let buffer = chrono::Duration::from_std(self.schedule.refresh_buffer).unwrap_or_default();
        let rotation_age =
            chrono::Duration::from_std(self.schedule.rotation_age).unwrap_or_default();

        let refresh_delay = (pair.access_expires_at - buffer - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let rotation_delay = (pair.issued_at + rotation_age - now)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let refresh_handle = {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(refresh_delay).await;
                if let Some(manager) = Weak::upgrade(&weak)
                    && let Err(e) = manager.refresh_if_due().await
                {
                    tracing::warn!("scheduled access refresh failed: {e}");
                }
            })
        };

        let rotation_handle = {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(rotation_delay).await;
                if let Some(manager) = Weak::upgrade(&weak)
                    && let Err(e) = manager.rotate().await
                {
                    tracing::warn!("scheduled rotation failed: {e}");
                }
            })
        };

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = timers.refresh.replace(refresh_handle) {
            old.abort();
        }
        if let Some(old) = timers.rotation.replace(rotation_handle) {
            old.abort();
        }
    }

    /// One delayed rotation attempt. Replaces the rotation timer slot so a
    /// subsequent `store` cancels it like any other timer. The attempt is
    /// marked as a retry: if it fails too, no further retry is scheduled.
    fn schedule_rotation_retry(self: &Arc<Self>) {
        let delay = self.schedule.rotation_retry;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = Weak::upgrade(&weak)
                && let Err(e) = manager.rotate_attempt(false).await
            {
                tracing::warn!("rotation retry failed: {e}");
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = timers.rotation.replace(handle) {
            old.abort();
        }
    }
}

impl Drop for CredentialManager {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
