//! System-setting policy application, dispatched by policy-type key.
//!
//! Each policy maps to a small fixed set of system-setting mutations. The
//! commands are macOS-flavored; on other platforms they fail at execution
//! time and the task is reported as failed, which is the intended behavior
//! for a policy the host cannot honor.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::TaskError;
use crate::tasks::command::run_command;

/// Apply a policy. Returns a summary of what was changed.
pub async fn apply_policy(
    policy_type: &str,
    payload: &HashMap<String, String>,
    timeout: Duration,
) -> Result<serde_json::Value, TaskError> {
    let commands = match policy_type {
        "firewall" => firewall_commands(payload),
        "screen_lock" => screen_lock_commands(payload),
        "power" => power_commands(payload)?,
        "security" => security_commands(payload),
        other => return Err(TaskError::UnknownPolicy(other.to_string())),
    };

    let mut applied = Vec::new();
    for command in &commands {
        let out = run_command(command, timeout).await?;
        if out.exit_code != 0 {
            return Err(TaskError::ExecutionFailed(format!(
                "policy command '{command}' exited {}: {}",
                out.exit_code, out.output
            )));
        }
        applied.push(command.clone());
    }

    Ok(serde_json::json!({
        "policy_type": policy_type,
        "applied": applied,
    }))
}

fn enabled(payload: &HashMap<String, String>) -> bool {
    payload
        .get("enabled")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true)
}

fn firewall_commands(payload: &HashMap<String, String>) -> Vec<String> {
    let state = if enabled(payload) { "on" } else { "off" };
    vec![format!(
        "/usr/libexec/ApplicationFirewall/socketfilterfw --setglobalstate {state}"
    )]
}

fn screen_lock_commands(payload: &HashMap<String, String>) -> Vec<String> {
    let ask = if enabled(payload) { "1" } else { "0" };
    let mut commands = vec![format!(
        "defaults write com.apple.screensaver askForPassword -int {ask}"
    )];
    if let Some(delay) = payload.get("delay_seconds") {
        commands.push(format!(
            "defaults write com.apple.screensaver askForPasswordDelay -int {}",
            delay.parse::<u32>().unwrap_or(0)
        ));
    }
    commands
}

fn power_commands(payload: &HashMap<String, String>) -> Result<Vec<String>, TaskError> {
    let sleep = payload
        .get("sleep_minutes")
        .ok_or_else(|| TaskError::MissingParameter("sleep_minutes".to_string()))?;
    let minutes: u32 = sleep.parse().map_err(|_| {
        TaskError::ExecutionFailed(format!("sleep_minutes is not a number: {sleep}"))
    })?;
    Ok(vec![format!("pmset -a sleep {minutes}")])
}

fn security_commands(payload: &HashMap<String, String>) -> Vec<String> {
    let mut commands = Vec::new();
    if payload.get("gatekeeper").map(String::as_str) == Some("enabled") {
        commands.push("spctl --master-enable".to_string());
    }
    if payload.get("remote_login").map(String::as_str) == Some("disabled") {
        commands.push("systemsetup -setremotelogin off".to_string());
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_policy_type() {
        let result = apply_policy("telemetry_cap", &HashMap::new(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TaskError::UnknownPolicy(_))));
    }

    #[tokio::test]
    async fn test_power_requires_sleep_minutes() {
        let result = apply_policy("power", &HashMap::new(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TaskError::MissingParameter(_))));
    }

    #[test]
    fn test_firewall_commands() {
        let on = firewall_commands(&HashMap::new());
        assert!(on[0].ends_with("--setglobalstate on"));

        let mut payload = HashMap::new();
        payload.insert("enabled".to_string(), "false".to_string());
        let off = firewall_commands(&payload);
        assert!(off[0].ends_with("--setglobalstate off"));
    }

    #[test]
    fn test_screen_lock_with_delay() {
        let mut payload = HashMap::new();
        payload.insert("delay_seconds".to_string(), "5".to_string());
        let commands = screen_lock_commands(&payload);
        assert_eq!(commands.len(), 2);
        assert!(commands[1].contains("askForPasswordDelay -int 5"));
    }

    #[test]
    fn test_security_commands_empty_payload() {
        assert!(security_commands(&HashMap::new()).is_empty());
    }
}
