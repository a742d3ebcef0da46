//! Control-plane endpoint table.

/// How a request authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Fixed service API key. Used before the agent has credentials.
    ServiceKey,
    /// `Authorization: Bearer <access token>` from the credential manager.
    Bearer,
}

/// Named control-plane endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Enroll,
    TokenRefresh,
    GetTasks,
    UpdateTask,
    Telemetry,
    ReportData,
    Heartbeat,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::Enroll => "/enroll-agent",
            Self::TokenRefresh => "/agent-token-refresh",
            Self::GetTasks => "/agent-get-tasks",
            Self::UpdateTask => "/agent-update-task",
            Self::Telemetry => "/agent-telemetry",
            Self::ReportData => "/agent-report-data",
            Self::Heartbeat => "/check-agent-status",
        }
    }

    pub fn auth(self) -> AuthMode {
        match self {
            Self::Enroll | Self::TokenRefresh => AuthMode::ServiceKey,
            _ => AuthMode::Bearer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_modes() {
        assert_eq!(Endpoint::Enroll.auth(), AuthMode::ServiceKey);
        assert_eq!(Endpoint::TokenRefresh.auth(), AuthMode::ServiceKey);
        assert_eq!(Endpoint::GetTasks.auth(), AuthMode::Bearer);
        assert_eq!(Endpoint::Heartbeat.auth(), AuthMode::Bearer);
    }

    #[test]
    fn test_paths() {
        assert_eq!(Endpoint::Enroll.path(), "/enroll-agent");
        assert_eq!(Endpoint::Heartbeat.path(), "/check-agent-status");
    }
}
