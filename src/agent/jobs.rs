//! The four periodic jobs: task poll, telemetry, device-data report,
//! heartbeat.
//!
//! Each job is its own interval loop. A failed tick is logged (and, for
//! terminal errors, translated into a state transition) but never stops the
//! loop or its siblings; the loops themselves exit only when the agent
//! leaves the Authenticated state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::{Agent, ConnectionState, VERSION};
use crate::error::{CredentialError, NetworkError};
use crate::tasks::TaskStatus;

pub(super) fn spawn_all(agent: &Arc<Agent>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_task_poll(agent.clone()),
        spawn_telemetry(agent.clone()),
        spawn_device_report(agent.clone()),
        spawn_heartbeat(agent.clone()),
    ]
}

/// Interval that waits a full period before its first tick.
async fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it.
    interval.tick().await;
    interval
}

fn spawn_task_poll(agent: Arc<Agent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(agent.config.task_poll_interval).await;
        loop {
            ticker.tick().await;
            if agent.status().await != ConnectionState::Authenticated {
                break;
            }
            if let Err(e) = poll_tasks_once(&agent).await {
                handle_tick_error(&agent, "task_poll", e).await;
            }
        }
    })
}

fn spawn_telemetry(agent: Arc<Agent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(agent.config.telemetry_interval).await;
        loop {
            ticker.tick().await;
            if agent.status().await != ConnectionState::Authenticated {
                break;
            }
            if let Err(e) = telemetry_once(&agent).await {
                handle_tick_error(&agent, "telemetry", e).await;
            }
        }
    })
}

fn spawn_device_report(agent: Arc<Agent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(agent.config.device_report_interval).await;
        loop {
            ticker.tick().await;
            if agent.status().await != ConnectionState::Authenticated {
                break;
            }
            if let Err(e) = device_report_once(&agent).await {
                handle_tick_error(&agent, "device_report", e).await;
            }
        }
    })
}

fn spawn_heartbeat(agent: Arc<Agent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(agent.config.heartbeat_interval).await;
        loop {
            ticker.tick().await;
            if agent.status().await != ConnectionState::Authenticated {
                break;
            }
            if let Err(e) = heartbeat_once(&agent).await {
                handle_tick_error(&agent, "heartbeat", e).await;
            }
        }
    })
}

/// Classify a tick failure. Most are transient and worth nothing more than
/// a log line; identity-level failures flip the agent back to Disconnected.
async fn handle_tick_error(agent: &Arc<Agent>, job: &'static str, err: NetworkError) {
    match err {
        NetworkError::AgentNotFound => {
            tracing::warn!(job, "agent deleted server-side, clearing local identity");
            agent.handle_agent_missing().await;
        }
        NetworkError::ReenrollmentRequired
        | NetworkError::Credential(
            CredentialError::RefreshTokenExpired | CredentialError::NoCredentials,
        ) => {
            tracing::warn!(job, "credentials unusable, awaiting re-enrollment: {err}");
            agent.handle_credentials_lost().await;
        }
        e => tracing::warn!(job, "tick failed: {e}"),
    }
}

/// Check in, execute any pending tasks, and report each outcome.
/// A zero-task poll is silent.
async fn poll_tasks_once(agent: &Arc<Agent>) -> Result<(), NetworkError> {
    let agent_id = agent
        .credentials
        .agent_id()
        .await
        .ok_or(CredentialError::NoCredentials)?;
    let snapshot = agent.facts.metrics().await;
    let tasks = agent.api.fetch_tasks(&agent_id, &snapshot).await?;
    if tasks.is_empty() {
        return Ok(());
    }

    tracing::info!(count = tasks.len(), "received tasks");
    for task in &tasks {
        let clock = Instant::now();
        let result = agent.executor.execute(task).await;
        let report = match result.status {
            TaskStatus::Completed => result.payload.clone(),
            _ => serde_json::json!({ "error": result.message }),
        };
        agent
            .api
            .update_task(
                &task.task_id,
                &result.status.to_string(),
                &report,
                clock.elapsed().as_secs_f64(),
            )
            .await?;
    }
    Ok(())
}

/// Lightweight metrics snapshot.
async fn telemetry_once(agent: &Arc<Agent>) -> Result<(), NetworkError> {
    let agent_id = agent
        .credentials
        .agent_id()
        .await
        .ok_or(CredentialError::NoCredentials)?;
    let payload = serde_json::json!({
        "agent_id": agent_id,
        "timestamp": Utc::now(),
        "metrics": agent.facts.metrics().await,
    });
    agent.api.send_telemetry(&payload).await
}

/// Full device description plus inventory.
async fn device_report_once(agent: &Arc<Agent>) -> Result<(), NetworkError> {
    let agent_id = agent
        .credentials
        .agent_id()
        .await
        .ok_or(CredentialError::NoCredentials)?;
    let info = agent.facts.device_info().await;
    let payload = serde_json::json!({
        "agent_id": agent_id,
        "timestamp": Utc::now(),
        "deviceInfo": info,
        "inventory": agent.facts.inventory().await,
    });
    agent.api.report_device_data(&payload).await
}

/// Liveness ping.
async fn heartbeat_once(agent: &Arc<Agent>) -> Result<(), NetworkError> {
    let info = agent.facts.device_info().await;
    agent.api.heartbeat(&info.hostname, "online", VERSION).await
}
