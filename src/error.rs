//! Error types for the agent core.
//!
//! One enum per domain. Network and credential errors bubble up to the
//! orchestrator job that issued the call; task errors are caught at the
//! handler boundary and turned into failed task results.

use std::time::Duration;

use thiserror::Error;

/// Errors from the control-plane network client.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transport-level failure (connect, DNS, reset). Retryable.
    #[error("transport failure: {detail}")]
    Transport { detail: String },

    /// The request did not complete within the configured timeout. Retryable.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-2xx response outside the special cases below. Not retried.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// 2xx response whose body was not valid JSON.
    #[error("protocol error: {detail}")]
    Protocol { detail: String },

    /// The enrollment token was rejected (invalid or already used).
    #[error("enrollment token rejected by server")]
    EnrollmentTokenInvalid,

    /// An agent with this hostname is already enrolled.
    #[error("an agent with this hostname is already enrolled")]
    HostnameConflict,

    /// The server no longer knows this agent. Identity was deleted
    /// server-side; the local registration must be cleared.
    #[error("agent not found on server")]
    AgentNotFound,

    /// The 401 refresh budget was exhausted. Credentials have been
    /// cleared and the agent must re-enroll.
    #[error("credential refresh budget exhausted, re-enrollment required")]
    ReenrollmentRequired,

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl NetworkError {
    /// Whether the failure is transient and worth a backoff retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout(_))
    }

    /// Whether the server signalled that the presented token is invalid,
    /// as opposed to a transient failure.
    pub fn is_token_invalid(&self) -> bool {
        matches!(
            self,
            Self::Http {
                status: 401 | 403,
                ..
            } | Self::EnrollmentTokenInvalid
        )
    }
}

/// Errors from the credential manager.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No credential pair is stored. Enrollment has not happened or was reset.
    #[error("no credentials stored")]
    NoCredentials,

    /// The refresh token passed its hard expiry. The pair is unusable and
    /// has been cleared; enrollment must restart.
    #[error("refresh token expired, re-enrollment required")]
    RefreshTokenExpired,

    /// The server returned a token response we could not use.
    #[error("invalid token response: {reason}")]
    InvalidResponse { reason: String },

    /// The refresh call failed at the transport level. The old pair is kept.
    #[error("token refresh transport failure: {detail}")]
    Transport { detail: String },

    #[error(transparent)]
    Store(#[from] SecretStoreError),
}

/// Errors from the enrollment flow. Terminal; never auto-retried.
#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("enrollment token invalid or already used")]
    TokenInvalid,

    #[error("an agent with this hostname already exists")]
    AgentExists,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("enrollment request failed: {0}")]
    Network(NetworkError),
}

impl From<NetworkError> for EnrollmentError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::EnrollmentTokenInvalid => Self::TokenInvalid,
            NetworkError::HostnameConflict => Self::AgentExists,
            other => Self::Network(other),
        }
    }
}

/// Errors surfaced by the orchestrator's lifecycle operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Errors from task execution. Caught per task and reported as a failed
/// result; never propagated out of the poll loop.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unsupported task type: {0}")]
    UnsupportedType(String),

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("command blocked by security policy: {0}")]
    SecurityViolation(String),

    #[error("unknown package manager: {0}")]
    UnknownManager(String),

    #[error("unknown policy type: {0}")]
    UnknownPolicy(String),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from secret storage backends.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto failure: {detail}")]
    Crypto { detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("keychain error: {detail}")]
    Keychain { detail: String },
}

/// Errors from device identity discovery and registration persistence.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Every identity probe failed or returned garbage.
    #[error("no usable device identity source")]
    NoSource,

    #[error(transparent)]
    Store(#[from] SecretStoreError),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {detail}")]
    Invalid { var: &'static str, detail: String },
}
