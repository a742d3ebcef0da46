//! The orchestrator: connection state machine, enrollment, and the four
//! periodic jobs.
//!
//! The orchestrator is the only writer of [`ConnectionState`]. Every other
//! component reports errors upward and the job loops translate terminal
//! ones (agent deleted server-side, credentials unusable) into state
//! transitions here.

mod jobs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::credentials::{
    CredentialManager, CredentialPair, CredentialSchedule, LoadOutcome, TokenGrant,
};
use crate::error::{AgentError, CredentialError, EnrollmentError};
use crate::facts::HostFactProvider;
use crate::identity::{IdentityManager, Registration};
use crate::net::{ApiClient, HttpTransport, RefreshClient};
use crate::notifications::NotificationLog;
use crate::secrets::SecretStore;
use crate::tasks::TaskExecutor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where the agent stands with the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable credentials; waiting for enrollment.
    Disconnected,
    /// An enrollment attempt is in flight.
    Connecting,
    /// Enrollment accepted, credentials not yet persisted.
    Connected,
    /// Holding a credential pair; jobs are running.
    Authenticated,
    /// The last enrollment attempt failed. Cleared by the next attempt.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Wires every component together and drives the lifecycle.
pub struct Agent {
    config: Config,
    state: RwLock<ConnectionState>,
    identity: IdentityManager,
    credentials: Arc<CredentialManager>,
    api: Arc<ApiClient>,
    executor: TaskExecutor,
    facts: Arc<dyn HostFactProvider>,
    notifications: Arc<NotificationLog>,
    jobs: StdMutex<Vec<JoinHandle<()>>>,
    jobs_started: AtomicBool,
}

impl Agent {
    pub fn new(
        config: Config,
        store: Arc<dyn SecretStore>,
        facts: Arc<dyn HostFactProvider>,
    ) -> Arc<Self> {
        Self::with_schedule(config, store, facts, CredentialSchedule::default())
    }

    /// Full constructor with an explicit credential schedule, so tests can
    /// run expiry boundaries at millisecond scale.
    pub fn with_schedule(
        config: Config,
        store: Arc<dyn SecretStore>,
        facts: Arc<dyn HostFactProvider>,
        schedule: CredentialSchedule,
    ) -> Arc<Self> {
        let notifications = Arc::new(NotificationLog::new());
        let transport = Arc::new(HttpTransport::new(&config));
        let credentials = CredentialManager::new(
            store.clone(),
            &config.namespace,
            Arc::new(RefreshClient::new(transport.clone())),
            notifications.clone(),
            schedule,
        );
        let api = Arc::new(ApiClient::new(
            transport,
            credentials.clone(),
            notifications.clone(),
        ));
        let identity = IdentityManager::new(store, &config.namespace);
        let executor = TaskExecutor::new(facts.clone());

        Arc::new(Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            identity,
            credentials,
            api,
            executor,
            facts,
            notifications,
            jobs: StdMutex::new(Vec::new()),
            jobs_started: AtomicBool::new(false),
        })
    }

    pub async fn status(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn notifications(&self) -> Arc<NotificationLog> {
        self.notifications.clone()
    }

    pub async fn agent_id(&self) -> Option<String> {
        self.credentials.agent_id().await
    }

    /// Bring the agent up from persisted state.
    ///
    /// No registration: stay Disconnected and wait for `enroll`. Registration
    /// with a live pair: go straight to Authenticated and start jobs,
    /// rotating first when the refresh token is past its rotation boundary.
    /// Registration with an expired pair: credentials are cleared and
    /// enrollment must restart.
    pub async fn initialize(self: &Arc<Self>) -> Result<ConnectionState, AgentError> {
        let Some(registration) = self.identity.load_registration().await? else {
            tracing::info!("no registration found, awaiting enrollment");
            return Ok(ConnectionState::Disconnected);
        };

        match self.credentials.load().await? {
            LoadOutcome::Absent => {
                tracing::warn!("registration present but no credentials, re-enrollment required");
                self.notifications.record(
                    "credentials_missing",
                    "registration found without credentials, re-enrollment required",
                    None,
                );
                Ok(ConnectionState::Disconnected)
            }
            LoadOutcome::Expired => {
                self.notifications.record(
                    "credentials_cleared",
                    "stored refresh token expired, re-enrollment required",
                    None,
                );
                Ok(ConnectionState::Disconnected)
            }
            LoadOutcome::Ready { needs_rotation } => {
                if needs_rotation {
                    match self.credentials.rotate().await {
                        Ok(()) | Err(CredentialError::Transport { .. }) => {
                            // Transient rotation failure keeps the old pair;
                            // the retry timer is already scheduled.
                        }
                        Err(e) => {
                            tracing::warn!("startup rotation failed terminally: {e}");
                            return Ok(ConnectionState::Disconnected);
                        }
                    }
                }

                self.set_state(ConnectionState::Authenticated).await;
                self.start_jobs();
                tracing::info!(
                    hostname = %registration.hostname,
                    device_id = %registration.device_id,
                    "agent initialized from persisted state"
                );
                Ok(ConnectionState::Authenticated)
            }
        }
    }

    /// Exchange a one-time enrollment token for the initial credential pair.
    ///
    /// Failure is terminal: the state moves to Error and the operator must
    /// retry with a fresh token. There is no automatic retry because the
    /// token is single-use.
    pub async fn enroll(self: &Arc<Self>, token: &str) -> Result<(), EnrollmentError> {
        self.set_state(ConnectionState::Connecting).await;

        match self.enroll_inner(token).await {
            Ok(()) => {
                self.set_state(ConnectionState::Authenticated).await;
                self.notifications
                    .record("enrolled", "agent enrolled with control plane", None);
                self.start_jobs();
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Error).await;
                self.notifications.record(
                    "enrollment_failed",
                    format!("enrollment failed: {e}"),
                    None,
                );
                Err(e)
            }
        }
    }

    async fn enroll_inner(self: &Arc<Self>, token: &str) -> Result<(), EnrollmentError> {
        let mut info = self.facts.device_info().await;
        let device_id = match self.identity.discover_device_id().await {
            Ok(id) => id,
            Err(e) if !info.serial_number.is_empty() => {
                tracing::debug!("identity probes failed ({e}), using provider serial");
                info.serial_number.clone()
            }
            Err(e) => return Err(e.into()),
        };
        if info.serial_number.is_empty() {
            info.serial_number = device_id.clone();
        }

        let grant = self.api.enroll(token, &info).await?;
        self.set_state(ConnectionState::Connected).await;

        let pair = pair_from_grant(grant)?;
        let registration = Registration {
            device_id,
            hostname: info.hostname.clone(),
            platform: info.os.clone(),
            enrollment_token: token.to_string(),
            enrolled_at: Utc::now(),
        };
        self.identity.store_registration(&registration).await?;
        self.credentials.store(pair).await?;
        tracing::info!(device_id = %registration.device_id, "enrollment complete");
        Ok(())
    }

    /// Wipe everything: jobs, credentials, registration.
    pub async fn reset(&self) -> Result<(), AgentError> {
        self.stop_jobs();
        self.credentials.clear().await;
        self.identity.clear().await?;
        self.set_state(ConnectionState::Disconnected).await;
        self.notifications
            .record("reset", "agent reset, all local state cleared", None);
        Ok(())
    }

    /// Stop all background work without touching persisted state.
    pub async fn shutdown(&self) {
        self.stop_jobs();
        self.credentials.cancel_timers();
        self.set_state(ConnectionState::Disconnected).await;
        tracing::info!("agent shut down");
    }

    /// Spawn the four periodic jobs exactly once.
    pub fn start_jobs(self: &Arc<Self>) {
        if self.jobs_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles = jobs::spawn_all(self);
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        // A previous set may still be draining after a flag-only stop
        // (credentials lost, agent deleted). Abort it before replacing,
        // or the old loops would keep polling alongside the new ones.
        for old in jobs.drain(..) {
            old.abort();
        }
        *jobs = handles;
        tracing::info!("periodic jobs started");
    }

    fn stop_jobs(&self) {
        self.jobs_started.store(false, Ordering::SeqCst);
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for handle in jobs.drain(..) {
            handle.abort();
        }
    }

    /// The server no longer knows this agent: the registration is stale,
    /// not just the tokens. Distinct from token expiry, which keeps the
    /// registration.
    pub(crate) async fn handle_agent_missing(&self) {
        self.credentials.clear().await;
        if let Err(e) = self.identity.clear().await {
            tracing::warn!("failed to clear stale registration: {e}");
        }
        self.jobs_started.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Credentials became unusable (expired or cleared by the circuit
    /// breaker). The registration survives; only enrollment can recover.
    pub(crate) async fn handle_credentials_lost(&self) {
        self.jobs_started.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            tracing::debug!(from = %*state, to = %next, "connection state change");
            *state = next;
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for handle in jobs.drain(..) {
            handle.abort();
        }
    }
}

/// An enrollment grant must carry everything the pair needs; a refresh may
/// omit fields, an enrollment may not.
fn pair_from_grant(grant: TokenGrant) -> Result<CredentialPair, EnrollmentError> {
    let now = Utc::now();
    let refresh_token = grant.refresh_token.ok_or_else(|| {
        EnrollmentError::Credential(CredentialError::InvalidResponse {
            reason: "enrollment response is missing a refresh token".to_string(),
        })
    })?;
    if grant.agent_id.is_empty() {
        return Err(EnrollmentError::Credential(
            CredentialError::InvalidResponse {
                reason: "enrollment response is missing an agent id".to_string(),
            },
        ));
    }

    Ok(CredentialPair {
        access_token: SecretString::from(grant.access_token),
        refresh_token: SecretString::from(refresh_token),
        agent_id: grant.agent_id,
        access_expires_at: grant.expires_at,
        refresh_expires_at: grant
            .refresh_expires_at
            .unwrap_or(now + chrono::Duration::days(30)),
        issued_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::StaticFactProvider;
    use crate::secrets::MemorySecretStore;

    fn agent() -> Arc<Agent> {
        Agent::new(
            Config::for_base_url("http://127.0.0.1:9", "test-key"),
            Arc::new(MemorySecretStore::new()),
            Arc::new(StaticFactProvider::default()),
        )
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        assert_eq!(agent().status().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_initialize_without_registration_stays_disconnected() {
        let agent = agent();
        let state = agent.initialize().await.unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(agent.status().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reset_clears_registration() {
        let agent = agent();
        agent
            .identity
            .store_registration(&Registration {
                device_id: "C02ABC".to_string(),
                hostname: "mac-042".to_string(),
                platform: "macos".to_string(),
                enrollment_token: "abc123".to_string(),
                enrolled_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(agent.identity.is_ready().await);

        agent.reset().await.unwrap();
        assert!(!agent.identity.is_ready().await);
        assert_eq!(agent.status().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_restart_after_credentials_lost_replaces_job_set() {
        let agent = agent();
        agent.set_state(ConnectionState::Authenticated).await;
        agent.start_jobs();
        let first_set: Vec<_> = {
            let jobs = agent.jobs.lock().unwrap();
            jobs.iter().map(|h| h.abort_handle()).collect()
        };
        assert_eq!(first_set.len(), 4);

        // Flag-only stop: the old loops are still parked on their intervals
        // when jobs restart.
        agent.handle_credentials_lost().await;
        agent.set_state(ConnectionState::Authenticated).await;
        agent.start_jobs();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        for old in &first_set {
            assert!(old.is_finished());
        }
        assert_eq!(agent.jobs.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_pair_from_grant_requires_refresh_token() {
        let grant = TokenGrant {
            agent_id: "A1".to_string(),
            access_token: "T1".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            refresh_expires_at: None,
        };
        assert!(pair_from_grant(grant).is_err());
    }

    #[test]
    fn test_pair_from_grant_defaults_refresh_expiry() {
        let grant = TokenGrant {
            agent_id: "A1".to_string(),
            access_token: "T1".to_string(),
            refresh_token: Some("R1".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            refresh_expires_at: None,
        };
        let pair = pair_from_grant(grant).unwrap();
        let expected = Utc::now() + chrono::Duration::days(30);
        assert!((pair.refresh_expires_at - expected).num_seconds().abs() < 5);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Authenticated.to_string(), "authenticated");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
