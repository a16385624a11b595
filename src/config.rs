//! Configuration loading and validation.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Which DNS capture path the agent runs.
///
/// The two modes are mutually exclusive: `Proxy` answers queries itself,
/// `Arp` redirects traffic through this host and observes it passively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Forwarding DNS proxy; devices must be pointed at this host.
    Proxy,
    /// ARP redirection plus passive sniffing; no router changes needed.
    Arp,
}

impl CaptureMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Arp => "arp",
        }
    }
}

/// Main configuration for the lanscope agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// DNS capture mode.
    pub mode: CaptureMode,

    /// Network interface to capture on. If None, auto-detect.
    pub interface: Option<String>,

    /// Gateway (router) IP address. If None, auto-detect from the routing table.
    pub gateway_ip: Option<Ipv4Addr>,

    /// Subnet to scan for devices, CIDR notation.
    pub network_cidr: Ipv4Network,

    /// Primary upstream DNS resolver (e.g., "8.8.8.8:53").
    #[serde(deserialize_with = "deserialize_socket_addr")]
    pub upstream_resolver: SocketAddr,

    /// Secondary upstream tried once if the primary fails.
    #[serde(default, deserialize_with = "deserialize_opt_socket_addr")]
    pub fallback_resolver: Option<SocketAddr>,

    /// Timeout for a single upstream forward, in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// UDP port the proxy listens on (proxy mode only).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// SQLite database file path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// DNS queries to these domains are never logged.
    /// Supports exact matches ("localhost") and wildcards ("*.local").
    #[serde(default = "default_ignore_domains")]
    pub ignore_domains: Vec<String>,

    /// Timeout for ARP scans and gateway resolution, in seconds.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    /// ARP redirection settings (arp mode only).
    #[serde(default)]
    pub arp_spoof: ArpSpoofSettings,

    /// Prometheus metrics exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// ARP redirection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArpSpoofSettings {
    /// Interval in seconds between spoofed ARP replies.
    #[serde(default = "default_spoof_interval")]
    pub spoof_interval_secs: u64,

    /// Spoof only these IPs. Empty means every responder on the subnet
    /// except the gateway.
    #[serde(default)]
    pub targets: Vec<Ipv4Addr>,
}

impl Default for ArpSpoofSettings {
    fn default() -> Self {
        Self {
            spoof_interval_secs: default_spoof_interval(),
            targets: Vec::new(),
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Enable the Prometheus HTTP exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter listen address.
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const fn default_upstream_timeout() -> u64 {
    5
}

const fn default_listen_port() -> u16 {
    53
}

fn default_db_path() -> PathBuf {
    PathBuf::from("lanscope.db")
}

fn default_ignore_domains() -> Vec<String> {
    ["localhost", "*.local", "*.arpa", "*.internal"]
        .into_iter()
        .map(String::from)
        .collect()
}

const fn default_scan_timeout() -> u64 {
    5
}

const fn default_spoof_interval() -> u64 {
    2
}

fn default_metrics_listen() -> SocketAddr {
    ([127, 0, 0, 1], 9598).into()
}

fn deserialize_socket_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn deserialize_opt_socket_addr<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<()> {
        if self.upstream_timeout_secs == 0 {
            return Err(
                ConfigError::Validation("upstream_timeout_secs must be > 0".into()).into(),
            );
        }

        if self.scan_timeout_secs == 0 {
            return Err(ConfigError::Validation("scan_timeout_secs must be > 0".into()).into());
        }

        if self.arp_spoof.spoof_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "arp_spoof.spoof_interval_secs must be > 0".into(),
            )
            .into());
        }

        for pattern in &self.ignore_domains {
            if pattern.is_empty() {
                return Err(ConfigError::Validation("empty ignore pattern".into()).into());
            }
            if pattern.starts_with("*.") && pattern.len() <= 2 {
                return Err(ConfigError::Validation(format!(
                    "invalid wildcard pattern: {pattern}"
                ))
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
            mode = "proxy"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "8.8.8.8:53"
            fallback_resolver = "8.8.4.4:53"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.mode, CaptureMode::Proxy);
        assert_eq!(config.upstream_resolver.to_string(), "8.8.8.8:53");
        assert_eq!(
            config.fallback_resolver.map(|a| a.to_string()),
            Some("8.8.4.4:53".to_string())
        );
        assert!(config.interface.is_none());
        assert!(config.gateway_ip.is_none());
    }

    #[test]
    fn test_default_values() {
        let toml = r#"
            mode = "arp"
            network_cidr = "10.0.0.0/24"
            upstream_resolver = "1.1.1.1:53"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.mode, CaptureMode::Arp);
        assert_eq!(config.listen_port, 53);
        assert_eq!(config.upstream_timeout_secs, 5);
        assert_eq!(config.scan_timeout_secs, 5);
        assert_eq!(config.arp_spoof.spoof_interval_secs, 2);
        assert!(config.arp_spoof.targets.is_empty());
        assert_eq!(config.db_path, PathBuf::from("lanscope.db"));
        assert!(config.ignore_domains.contains(&"*.local".to_string()));
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_arp_spoof_config() {
        let toml = r#"
            mode = "arp"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "1.1.1.1:53"
            gateway_ip = "192.168.1.1"

            [arp_spoof]
            spoof_interval_secs = 5
            targets = ["192.168.1.42", "192.168.1.43"]
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.gateway_ip, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(config.arp_spoof.spoof_interval_secs, 5);
        assert_eq!(config.arp_spoof.targets.len(), 2);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let toml = r#"
            mode = "both"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "1.1.1.1:53"
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_invalid_resolver_address() {
        let toml = r#"
            mode = "proxy"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "not-an-address"
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_zero_spoof_interval_rejected() {
        let toml = r#"
            mode = "arp"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "1.1.1.1:53"

            [arp_spoof]
            spoof_interval_secs = 0
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_empty_ignore_pattern_rejected() {
        let toml = r#"
            mode = "proxy"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "1.1.1.1:53"
            ignore_domains = ["localhost", ""]
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = r#"
            mode = "proxy"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "1.1.1.1:53"
            unknown_field = "value"
        "#;

        assert!(Config::parse(toml).is_err());
    }
}
