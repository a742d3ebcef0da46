//! HTTP transport and the typed control-plane client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::Config;
use crate::credentials::{CredentialManager, RefreshTransport, TokenGrant};
use crate::error::{CredentialError, NetworkError};
use crate::facts::DeviceInfo;
use crate::net::endpoints::{AuthMode, Endpoint};
use crate::notifications::NotificationLog;
use crate::tasks::Task;

/// Transport-level retry budget (timeouts, connection failures).
const MAX_SEND_ATTEMPTS: u32 = 3;
/// Backoff base; attempt n sleeps `base * 2^(n-1)`.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Refresh budget per outer logical call before the circuit breaks.
const MAX_REFRESH_ATTEMPTS: u32 = 3;
/// Minimum gap between repeated notifications for the same special-case
/// server error.
const NOTIFY_COOLDOWN: Duration = Duration::from_secs(30);

/// Low-level JSON POST sender shared by every client.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            request_timeout: config.request_timeout,
        }
    }

    /// Send a JSON POST to an endpoint, authenticating per the endpoint
    /// table and retrying transport failures with exponential backoff.
    /// HTTP-level errors are never retried here.
    pub(crate) async fn post(
        &self,
        endpoint: Endpoint,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, NetworkError> {
        let path = endpoint.path();
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            let mut request = self.http.post(&url).json(body);
            request = match endpoint.auth() {
                AuthMode::ServiceKey => {
                    request.header("X-Api-Key", self.api_key.expose_secret())
                }
                AuthMode::Bearer => {
                    let token = bearer.ok_or(CredentialError::NoCredentials)?;
                    request.bearer_auth(token)
                }
            };

            match request.send().await {
                Ok(response) => return handle_response(response).await,
                Err(e) => {
                    let err = if e.is_timeout() {
                        NetworkError::Timeout(self.request_timeout)
                    } else {
                        NetworkError::Transport {
                            detail: e.to_string(),
                        }
                    };

                    attempt += 1;
                    if attempt >= MAX_SEND_ATTEMPTS {
                        return Err(err);
                    }
                    let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                    tracing::debug!(path, attempt, "transport failure, retrying in {backoff:?}: {err}");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

async fn handle_response(response: reqwest::Response) -> Result<serde_json::Value, NetworkError> {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    if (200..300).contains(&status) {
        return serde_json::from_str(&body).map_err(|e| NetworkError::Protocol {
            detail: format!("non-JSON 2xx body: {e}"),
        });
    }

    Err(classify_error(status, body))
}

/// Translate special-cased server error bodies into dedicated kinds.
fn classify_error(status: u16, body: String) -> NetworkError {
    if status == 404 || status == 410 {
        return NetworkError::AgentNotFound;
    }

    let lower = body.to_lowercase();
    if lower.contains("token already used")
        || lower.contains("invalid enrollment token")
        || lower.contains("enrollment token invalid")
    {
        return NetworkError::EnrollmentTokenInvalid;
    }
    if lower.contains("hostname") && (lower.contains("conflict") || lower.contains("exists")) {
        return NetworkError::HostnameConflict;
    }

    NetworkError::Http { status, body }
}

/// Wire shape shared by the enroll and token-refresh responses.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    agent_id: String,
    #[serde(alias = "api_token")]
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    refresh_expires_at: Option<DateTime<Utc>>,
}

fn parse_token_grant(value: serde_json::Value) -> Result<TokenGrant, String> {
    let parsed: TokenResponse = serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(TokenGrant {
        agent_id: parsed.agent_id,
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: parsed.expires_at,
        refresh_expires_at: parsed.refresh_expires_at,
    })
}

/// Implements the credential manager's refresh seam over the transport.
///
/// Refresh and rotation share one endpoint; the distinction is purely the
/// caller's intent.
pub struct RefreshClient {
    transport: Arc<HttpTransport>,
}

impl RefreshClient {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl RefreshTransport for RefreshClient {
    async fn refresh(
        &self,
        agent_id: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, CredentialError> {
        let body = serde_json::json!({
            "refresh_token": refresh_token,
            "agent_id": agent_id,
        });

        match self
            .transport
            .post(Endpoint::TokenRefresh, None, &body)
            .await
        {
            Ok(value) => {
                parse_token_grant(value).map_err(|reason| CredentialError::InvalidResponse { reason })
            }
            Err(e) if e.is_token_invalid() => Err(CredentialError::RefreshTokenExpired),
            Err(e) => Err(CredentialError::Transport {
                detail: e.to_string(),
            }),
        }
    }
}

/// Typed client for every control-plane endpoint.
pub struct ApiClient {
    transport: Arc<HttpTransport>,
    credentials: Arc<CredentialManager>,
    notifications: Arc<NotificationLog>,
    /// Last notification instant per special-case error kind.
    cooldowns: StdMutex<HashMap<&'static str, Instant>>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<HttpTransport>,
        credentials: Arc<CredentialManager>,
        notifications: Arc<NotificationLog>,
    ) -> Self {
        Self {
            transport,
            credentials,
            notifications,
            cooldowns: StdMutex::new(HashMap::new()),
        }
    }

    /// Exchange a one-time enrollment token plus device identity for the
    /// initial credential pair.
    pub async fn enroll(
        &self,
        token: &str,
        info: &DeviceInfo,
    ) -> Result<TokenGrant, NetworkError> {
        let body = serde_json::json!({
            "token": token,
            "deviceInfo": {
                "hostname": info.hostname,
                "os": info.os,
                "osVersion": info.os_version,
                "arch": info.arch,
                "cpu_model": info.cpu_model,
                "total_memory": info.total_memory,
                "mac_address": info.mac_address,
                "serial_number": info.serial_number,
            },
        });

        match self.transport.post(Endpoint::Enroll, None, &body).await {
            Ok(value) => parse_token_grant(value)
                .map_err(|detail| NetworkError::Protocol { detail }),
            Err(e @ NetworkError::EnrollmentTokenInvalid) => {
                self.notify_limited(
                    "enrollment_token_invalid",
                    "enrollment token rejected: invalid or already used",
                );
                Err(e)
            }
            Err(e @ NetworkError::HostnameConflict) => {
                self.notify_limited(
                    "hostname_conflict",
                    "an agent with this hostname is already enrolled",
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Check in and fetch pending tasks.
    pub async fn fetch_tasks(
        &self,
        agent_id: &str,
        snapshot: &serde_json::Value,
    ) -> Result<Vec<Task>, NetworkError> {
        let body = serde_json::json!({
            "agent_id": agent_id,
            "system": snapshot,
        });
        let value = self.request_authed(Endpoint::GetTasks, &body).await?;

        let tasks = value
            .get("tasks")
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        serde_json::from_value(tasks).map_err(|e| NetworkError::Protocol {
            detail: format!("malformed task list: {e}"),
        })
    }

    /// Report a task execution outcome.
    pub async fn update_task(
        &self,
        task_id: &str,
        status: &str,
        result: &serde_json::Value,
        execution_time: f64,
    ) -> Result<(), NetworkError> {
        let body = serde_json::json!({
            "task_id": task_id,
            "status": status,
            "result": result,
            "execution_time": execution_time,
        });
        self.request_authed(Endpoint::UpdateTask, &body).await?;
        Ok(())
    }

    /// Send a lightweight metrics snapshot.
    pub async fn send_telemetry(&self, payload: &serde_json::Value) -> Result<(), NetworkError> {
        self.request_authed(Endpoint::Telemetry, payload).await?;
        Ok(())
    }

    /// Send the full device-data snapshot.
    pub async fn report_device_data(
        &self,
        payload: &serde_json::Value,
    ) -> Result<(), NetworkError> {
        self.request_authed(Endpoint::ReportData, payload).await?;
        Ok(())
    }

    /// Liveness ping with version info.
    pub async fn heartbeat(
        &self,
        hostname: &str,
        status: &str,
        version: &str,
    ) -> Result<(), NetworkError> {
        let body = serde_json::json!({
            "hostname": hostname,
            "status": status,
            "version": version,
        });
        self.request_authed(Endpoint::Heartbeat, &body).await?;
        Ok(())
    }

    /// Send an authenticated request.
    ///
    /// A 401 triggers a credential refresh and one retry with the fresh
    /// token, bounded by [`MAX_REFRESH_ATTEMPTS`] across this call; past the
    /// budget, credentials are cleared and the call fails terminally.
    async fn request_authed(
        &self,
        endpoint: Endpoint,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, NetworkError> {
        let mut refresh_attempts: u32 = 0;

        loop {
            let token = self.credentials.access_token().await?;

            match self.transport.post(endpoint, Some(&token), body).await {
                Err(NetworkError::Http { status: 401, .. }) => {
                    if refresh_attempts >= MAX_REFRESH_ATTEMPTS {
                        tracing::warn!(
                            path = endpoint.path(),
                            "refresh budget exhausted, clearing credentials"
                        );
                        self.credentials.clear().await;
                        self.notify_limited(
                            "reenrollment_required",
                            "server persistently rejects tokens, re-enrollment required",
                        );
                        return Err(NetworkError::ReenrollmentRequired);
                    }
                    refresh_attempts += 1;
                    tracing::debug!(
                        path = endpoint.path(),
                        refresh_attempts,
                        "401 received, refreshing and retrying"
                    );
                    self.credentials.refresh().await?;
                }
                Err(e @ NetworkError::AgentNotFound) => {
                    self.notify_limited(
                        "agent_not_found",
                        "server no longer knows this agent; identity was deleted server-side",
                    );
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Record a notification for a special-case error, at most once per
    /// cooldown window per kind.
    fn notify_limited(&self, event: &'static str, message: &str) {
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(last) = cooldowns.get(event)
            && now.duration_since(*last) < NOTIFY_COOLDOWN
        {
            return;
        }
        cooldowns.insert(event, now);
        drop(cooldowns);

        self.notifications.record(event, message, None);
    }
}
