//! Device-ID discovery probes.
//!
//! Three probes per platform, ordered fastest first. Each runs under its own
//! timeout; a hung utility only costs its own budget, never the whole chain.

use std::future::Future;
use std::time::Duration;

use tokio::process::Command;

use crate::error::IdentityError;

/// Per-probe time budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Run the platform probe chain; first well-formed result wins.
pub async fn discover_device_id() -> Result<String, IdentityError> {
    for (name, probe) in probes() {
        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Some(raw)) => {
                if let Some(id) = well_formed(&raw) {
                    tracing::debug!(probe = name, device_id = %id, "device id discovered");
                    return Ok(id);
                }
                tracing::debug!(probe = name, "probe returned malformed value");
            }
            Ok(None) => tracing::debug!(probe = name, "probe returned nothing"),
            Err(_) => tracing::warn!(probe = name, "probe timed out"),
        }
    }
    Err(IdentityError::NoSource)
}

type Probe = std::pin::Pin<Box<dyn Future<Output = Option<String>> + Send>>;

#[cfg(target_os = "macos")]
fn probes() -> Vec<(&'static str, Probe)> {
    vec![
        ("ioreg", Box::pin(probe_ioreg_serial())),
        ("system_profiler", Box::pin(probe_system_profiler())),
        ("ioreg_uuid", Box::pin(probe_ioreg_uuid())),
    ]
}

#[cfg(not(target_os = "macos"))]
fn probes() -> Vec<(&'static str, Probe)> {
    vec![
        ("machine_id", Box::pin(probe_machine_id())),
        ("dmi_serial", Box::pin(probe_dmi_serial())),
        ("dmi_uuid", Box::pin(probe_dmi_uuid())),
    ]
}

/// Validate a candidate identifier: trimmed, sane length, no whitespace or
/// shell metacharacters.
fn well_formed(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() < 4 || trimmed.len() > 64 {
        return None;
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    Some(trimmed.to_string())
}

async fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "macos")]
async fn probe_ioreg_serial() -> Option<String> {
    let out = run("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"]).await?;
    extract_ioreg_value(&out, "IOPlatformSerialNumber")
}

#[cfg(target_os = "macos")]
async fn probe_ioreg_uuid() -> Option<String> {
    let out = run("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"]).await?;
    extract_ioreg_value(&out, "IOPlatformUUID")
}

#[cfg(target_os = "macos")]
async fn probe_system_profiler() -> Option<String> {
    let out = run("system_profiler", &["SPHardwareDataType", "-json"]).await?;
    let parsed: serde_json::Value = serde_json::from_str(&out).ok()?;
    parsed
        .get("SPHardwareDataType")?
        .get(0)?
        .get("serial_number")?
        .as_str()
        .map(str::to_string)
}

/// Pull `"key" = "value"` out of ioreg's plist-ish text output.
#[cfg(target_os = "macos")]
fn extract_ioreg_value(output: &str, key: &str) -> Option<String> {
    for line in output.lines() {
        if line.contains(key) {
            let value = line.split('=').nth(1)?.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(not(target_os = "macos"))]
async fn probe_machine_id() -> Option<String> {
    tokio::fs::read_to_string("/etc/machine-id").await.ok()
}

#[cfg(not(target_os = "macos"))]
async fn probe_dmi_serial() -> Option<String> {
    tokio::fs::read_to_string("/sys/class/dmi/id/product_serial")
        .await
        .ok()
}

#[cfg(not(target_os = "macos"))]
async fn probe_dmi_uuid() -> Option<String> {
    tokio::fs::read_to_string("/sys/class/dmi/id/product_uuid")
        .await
        .ok()
}
