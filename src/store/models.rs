//! Row types for the query log and device registry.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Format a timestamp the way the store persists it.
///
/// RFC-3339 UTC with microseconds, so stored values compare correctly both
/// lexicographically (index range scans) and through SQLite's date functions.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A logged DNS query. Rows are append-only: the core never updates or
/// deletes them once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRecord {
    /// Store-assigned, monotonically increasing in append order.
    pub id: i64,
    /// UTC, RFC-3339.
    pub timestamp: String,
    pub source_ip: String,
    /// Empty when the capture path has no link-layer visibility.
    pub source_mac: String,
    /// Lowercased, trailing dot stripped before storage.
    pub domain: String,
    pub query_type: String,
    pub response: String,
    pub device_name: String,
}

/// A query to append, before the store assigns an id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct NewQuery {
    pub source_ip: String,
    pub source_mac: String,
    pub domain: String,
    pub query_type: String,
    pub response: String,
    pub device_name: String,
}

impl NewQuery {
    /// Create a query record input, normalizing the domain.
    pub fn new(
        source_ip: impl Into<String>,
        domain: impl AsRef<str>,
        query_type: impl Into<String>,
    ) -> Self {
        Self {
            source_ip: source_ip.into(),
            domain: normalize_domain(domain.as_ref()),
            query_type: query_type.into(),
            ..Self::default()
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.source_mac = mac.into();
        self
    }
}

/// Lowercase a domain and strip its trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_lowercase()
}

/// A known device, keyed by IP.
///
/// Identity is keyed purely by IP: under DHCP lease churn a new device
/// overwrites the previous occupant's mac/hostname/vendor in place while
/// `first_seen` survives. This is a deliberate tradeoff, not a bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub ip: String,
    pub mac: String,
    /// Empty when reverse lookup fails.
    pub hostname: String,
    /// Derived from the MAC OUI prefix; empty if unknown.
    pub vendor: String,
    pub first_seen: String,
    pub last_seen: String,
}

/// A (domain, count) pair for report rollups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: u64,
}

/// Query count for a single calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    /// "YYYY-MM-DD", UTC.
    pub day: String,
    pub count: u64,
}

/// Per-device browsing summary over a window of days.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub ip: String,
    pub days: u32,
    pub total: u64,
    /// Up to 50 domains, by count descending.
    pub top_domains: Vec<DomainCount>,
    /// By calendar day, newest first.
    pub daily_breakdown: Vec<DayCount>,
}

/// Overall store counters for the status surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub total_queries: u64,
    pub queries_today: u64,
    pub unique_devices: u64,
}

/// A distinct domain with its usage window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainUsage {
    pub domain: String,
    /// Present when grouping by (domain, source_ip) across all devices.
    pub source_ip: Option<String>,
    pub count: u64,
    pub first_seen: String,
    pub last_seen: String,
}

/// Query count within a single UTC hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    /// "YYYY-MM-DD HH:00", UTC.
    pub hour: String,
    pub count: u64,
}
