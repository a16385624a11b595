//! OS-level IP forwarding control.
//!
//! While redirection is active the host must route the targets' non-DNS
//! traffic onward to the real gateway, otherwise poisoning their ARP
//! caches cuts them off entirely.

use tracing::info;

use crate::error::{NetworkError, Result};

#[cfg(target_os = "linux")]
const PROC_IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// Enable kernel IP forwarding.
#[cfg(target_os = "linux")]
pub fn enable() -> Result<()> {
    set_forwarding(true)
}

/// Disable kernel IP forwarding.
#[cfg(target_os = "linux")]
pub fn disable() -> Result<()> {
    set_forwarding(false)
}

#[cfg(target_os = "linux")]
fn set_forwarding(enabled: bool) -> Result<()> {
    use std::fs;

    let value = if enabled { "1" } else { "0" };
    fs::write(PROC_IP_FORWARD, value)
        .map_err(|e| NetworkError::IpForward(format!("write {PROC_IP_FORWARD}: {e}")))?;
    info!(enabled, "ip forwarding updated");
    Ok(())
}

/// Enable kernel IP forwarding.
#[cfg(target_os = "macos")]
pub fn enable() -> Result<()> {
    set_forwarding(true)
}

/// Disable kernel IP forwarding.
#[cfg(target_os = "macos")]
pub fn disable() -> Result<()> {
    set_forwarding(false)
}

#[cfg(target_os = "macos")]
fn set_forwarding(enabled: bool) -> Result<()> {
    use std::process::Command;

    let value = if enabled { "1" } else { "0" };
    let status = Command::new("sysctl")
        .args(["-w", &format!("net.inet.ip.forwarding={value}")])
        .status()
        .map_err(|e| NetworkError::IpForward(format!("run sysctl: {e}")))?;

    if !status.success() {
        return Err(NetworkError::IpForward(format!("sysctl exited with {status}")).into());
    }
    info!(enabled, "ip forwarding updated");
    Ok(())
}
