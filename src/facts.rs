//! Host fact provider boundary.
//!
//! Raw host telemetry (hardware inventory, CPU/memory samples) is collected
//! by an external provider; the core only packages and forwards it. The
//! shipped [`SystemFactProvider`] is a thin default that shells out to a few
//! OS utilities with timeouts. [`StaticFactProvider`] returns canned values
//! for tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Budget for any single fact-gathering subprocess.
const FACT_TIMEOUT: Duration = Duration::from_secs(5);

/// Device description sent with enrollment and device-data reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub cpu_model: String,
    pub total_memory: u64,
    pub mac_address: String,
    pub serial_number: String,
}

/// Supplies already-available host facts to the core.
#[async_trait]
pub trait HostFactProvider: Send + Sync {
    /// Static device description. Best effort; unknown fields stay empty.
    async fn device_info(&self) -> DeviceInfo;

    /// Lightweight metrics snapshot (cpu/mem) for telemetry.
    async fn metrics(&self) -> serde_json::Value;

    /// Larger inventory snapshot (hardware/software/security/network).
    async fn inventory(&self) -> serde_json::Value;
}

/// Default provider shelling out to OS utilities.
#[derive(Debug, Default)]
pub struct SystemFactProvider;

impl SystemFactProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostFactProvider for SystemFactProvider {
    async fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            hostname: hostname().await,
            os: std::env::consts::OS.to_string(),
            os_version: os_version().await,
            arch: std::env::consts::ARCH.to_string(),
            cpu_model: cpu_model().await,
            total_memory: total_memory().await,
            mac_address: mac_address().await,
            serial_number: String::new(),
        }
    }

    async fn metrics(&self) -> serde_json::Value {
        serde_json::json!({
            "load_average": load_average().await,
            "memory_total_bytes": total_memory().await,
            "uptime": run_trimmed("uptime", &[]).await.unwrap_or_default(),
        })
    }

    async fn inventory(&self) -> serde_json::Value {
        let info = self.device_info().await;
        serde_json::json!({
            "hardware": {
                "cpu_model": info.cpu_model,
                "arch": info.arch,
                "total_memory": info.total_memory,
            },
            "software": {
                "os": info.os,
                "os_version": info.os_version,
            },
            "network": {
                "hostname": info.hostname,
                "mac_address": info.mac_address,
            },
            "security": {},
        })
    }
}

async fn run_trimmed(program: &str, args: &[&str]) -> Option<String> {
    let result = tokio::time::timeout(FACT_TIMEOUT, Command::new(program).args(args).output());
    let output = result.await.ok()?.ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

async fn hostname() -> String {
    run_trimmed("hostname", &[]).await.unwrap_or_default()
}

async fn os_version() -> String {
    #[cfg(target_os = "macos")]
    let probe = run_trimmed("sw_vers", &["-productVersion"]).await;
    #[cfg(not(target_os = "macos"))]
    let probe = run_trimmed("uname", &["-r"]).await;
    probe.unwrap_or_default()
}

async fn cpu_model() -> String {
    #[cfg(target_os = "macos")]
    let probe = run_trimmed("sysctl", &["-n", "machdep.cpu.brand_string"]).await;
    #[cfg(not(target_os = "macos"))]
    let probe = tokio::fs::read_to_string("/proc/cpuinfo")
        .await
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split(':').nth(1))
                .map(|v| v.trim().to_string())
        });
    probe.unwrap_or_default()
}

async fn total_memory() -> u64 {
    #[cfg(target_os = "macos")]
    {
        run_trimmed("sysctl", &["-n", "hw.memsize"])
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
    #[cfg(not(target_os = "macos"))]
    {
        // MemTotal is reported in kB.
        tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("MemTotal"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse::<u64>().ok())
            })
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    }
}

async fn mac_address() -> String {
    #[cfg(target_os = "macos")]
    let output = run_trimmed("ifconfig", &["en0"]).await;
    #[cfg(not(target_os = "macos"))]
    let output = run_trimmed("ip", &["link"]).await;

    output
        .and_then(|text| {
            text.split_whitespace()
                .skip_while(|w| *w != "ether" && *w != "link/ether")
                .nth(1)
                .map(str::to_string)
        })
        .unwrap_or_default()
}

async fn load_average() -> serde_json::Value {
    #[cfg(not(target_os = "macos"))]
    if let Ok(content) = tokio::fs::read_to_string("/proc/loadavg").await {
        let parts: Vec<f64> = content
            .split_whitespace()
            .take(3)
            .filter_map(|v| v.parse().ok())
            .collect();
        if parts.len() == 3 {
            return serde_json::json!(parts);
        }
    }
    #[cfg(target_os = "macos")]
    if let Some(out) = run_trimmed("sysctl", &["-n", "vm.loadavg"]).await {
        let parts: Vec<f64> = out
            .trim_matches(['{', '}'])
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if parts.len() == 3 {
            return serde_json::json!(parts);
        }
    }
    serde_json::Value::Null
}

/// Canned facts for tests and headless environments.
#[derive(Debug, Clone)]
pub struct StaticFactProvider {
    pub info: DeviceInfo,
}

impl StaticFactProvider {
    pub fn new(info: DeviceInfo) -> Self {
        Self { info }
    }
}

impl Default for StaticFactProvider {
    fn default() -> Self {
        Self {
            info: DeviceInfo {
                hostname: "test-host".to_string(),
                os: "testos".to_string(),
                os_version: "1.0".to_string(),
                arch: "x86_64".to_string(),
                cpu_model: "Test CPU".to_string(),
                total_memory: 8 * 1024 * 1024 * 1024,
                mac_address: "00:00:00:00:00:01".to_string(),
                serial_number: "TEST-SERIAL".to_string(),
            },
        }
    }
}

#[async_trait]
impl HostFactProvider for StaticFactProvider {
    async fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn metrics(&self) -> serde_json::Value {
        serde_json::json!({ "load_average": [0.1, 0.2, 0.3], "memory_total_bytes": self.info.total_memory })
    }

    async fn inventory(&self) -> serde_json::Value {
        serde_json::json!({
            "hardware": { "cpu_model": self.info.cpu_model },
            "software": { "os": self.info.os },
            "network": { "hostname": self.info.hostname },
            "security": {},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_roundtrip() {
        let provider = StaticFactProvider::default();
        let info = provider.device_info().await;
        assert_eq!(info.hostname, "test-host");

        let inventory = provider.inventory().await;
        assert!(inventory.get("hardware").is_some());
        assert!(inventory.get("security").is_some());
    }

    #[tokio::test]
    async fn test_system_provider_never_panics() {
        let provider = SystemFactProvider::new();
        let info = provider.device_info().await;
        // Fields are best effort, but os/arch come from compile-time consts.
        assert!(!info.os.is_empty());
        assert!(!info.arch.is_empty());

        let _ = provider.metrics().await;
    }
}
