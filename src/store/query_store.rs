//! SQLite-backed query store.
//!
//! One shared connection behind a mutex: SQLite serializes writes
//! internally, so every cloned handle can append or read without external
//! coordination and ids stay monotonic in append order.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

use super::models::{
    format_timestamp, DayCount, DeviceRecord, DeviceReport, DomainCount, DomainUsage, HourBucket,
    NewQuery, QueryRecord, StoreStats,
};
use crate::error::Result;

/// Thread-safe store for the DNS query log and device registry.
#[derive(Clone)]
pub struct QueryStore {
    conn: Arc<Mutex<Connection>>,
}

impl QueryStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS dns_queries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                source_ip TEXT NOT NULL,
                source_mac TEXT DEFAULT '',
                domain TEXT NOT NULL,
                query_type TEXT DEFAULT 'A',
                response TEXT DEFAULT '',
                device_name TEXT DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_dns_timestamp ON dns_queries(timestamp);
            CREATE INDEX IF NOT EXISTS idx_dns_source_ip ON dns_queries(source_ip);
            CREATE INDEX IF NOT EXISTS idx_dns_domain ON dns_queries(domain);

            CREATE TABLE IF NOT EXISTS devices (
                ip TEXT PRIMARY KEY,
                mac TEXT NOT NULL,
                hostname TEXT DEFAULT '',
                vendor TEXT DEFAULT '',
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    /// Append a DNS query to the log. Returns the assigned id.
    pub fn append(&self, query: &NewQuery) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dns_queries \
             (timestamp, source_ip, source_mac, domain, query_type, response, device_name) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format_timestamp(Utc::now()),
                query.source_ip,
                query.source_mac,
                query.domain,
                query.query_type,
                query.response,
                query.device_name,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent queries, newest first.
    pub fn recent(&self, limit: u32, offset: u32) -> Result<Vec<QueryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, source_ip, source_mac, domain, query_type, response, device_name \
             FROM dns_queries ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], query_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Search queries by domain substring, optionally bounded by inclusive
    /// timestamps. Newest first.
    pub fn search(
        &self,
        term: &str,
        limit: u32,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueryRecord>> {
        // LIKE metacharacters in the term must match themselves.
        let escaped = term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, source_ip, source_mac, domain, query_type, response, device_name \
             FROM dns_queries WHERE domain LIKE ?1 ESCAPE '\\' \
             AND (?2 IS NULL OR timestamp >= ?2) \
             AND (?3 IS NULL OR timestamp <= ?3) \
             ORDER BY id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                format!("%{escaped}%"),
                from.map(format_timestamp),
                to.map(format_timestamp),
                limit,
            ],
            query_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Queries from a specific device IP, optionally time-bounded. Newest first.
    pub fn queries_by_device(
        &self,
        ip: &str,
        limit: u32,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, source_ip, source_mac, domain, query_type, response, device_name \
             FROM dns_queries WHERE source_ip = ?1 \
             AND (?2 IS NULL OR timestamp >= ?2) \
             AND (?3 IS NULL OR timestamp <= ?3) \
             ORDER BY id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![ip, from.map(format_timestamp), to.map(format_timestamp), limit],
            query_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Browsing summary for a device over the last `days` days.
    pub fn device_report(&self, ip: &str, days: u32) -> Result<DeviceReport> {
        let since = format_timestamp(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.conn.lock();

        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM dns_queries WHERE source_ip = ?1 AND timestamp >= ?2",
            params![ip, since],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT domain, COUNT(*) AS cnt FROM dns_queries \
             WHERE source_ip = ?1 AND timestamp >= ?2 \
             GROUP BY domain ORDER BY cnt DESC LIMIT 50",
        )?;
        let top_domains = stmt
            .query_map(params![ip, since], |row| {
                Ok(DomainCount {
                    domain: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = conn.prepare(
            "SELECT DATE(timestamp) AS day, COUNT(*) AS cnt FROM dns_queries \
             WHERE source_ip = ?1 AND timestamp >= ?2 \
             GROUP BY day ORDER BY day DESC",
        )?;
        let daily_breakdown = stmt
            .query_map(params![ip, since], |row| {
                Ok(DayCount {
                    day: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(DeviceReport {
            ip: ip.to_string(),
            days,
            total,
            top_domains,
            daily_breakdown,
        })
    }

    /// Overall counters for the status surface.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();

        let total_queries: u64 =
            conn.query_row("SELECT COUNT(*) FROM dns_queries", [], |row| row.get(0))?;

        // "YYYY-MM-DD" compares below any RFC-3339 timestamp on the same day.
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let queries_today: u64 = conn.query_row(
            "SELECT COUNT(*) FROM dns_queries WHERE timestamp >= ?1",
            params![today],
            |row| row.get(0),
        )?;

        let unique_devices: u64 = conn.query_row(
            "SELECT COUNT(DISTINCT source_ip) FROM dns_queries",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            total_queries,
            queries_today,
            unique_devices,
        })
    }

    /// Distinct domains with usage counts over the last `days` days.
    ///
    /// Grouped by domain alone when `ip` is given, otherwise by
    /// (domain, source_ip) pair.
    pub fn unique_domains(
        &self,
        ip: Option<&str>,
        days: u32,
        limit: u32,
    ) -> Result<Vec<DomainUsage>> {
        let since = format_timestamp(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.conn.lock();

        if let Some(ip) = ip {
            let mut stmt = conn.prepare(
                "SELECT domain, COUNT(*) AS cnt, MIN(timestamp), MAX(timestamp) \
                 FROM dns_queries WHERE source_ip = ?1 AND timestamp >= ?2 \
                 GROUP BY domain ORDER BY cnt DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![ip, since, limit], |row| {
                Ok(DomainUsage {
                    domain: row.get(0)?,
                    source_ip: None,
                    count: row.get(1)?,
                    first_seen: row.get(2)?,
                    last_seen: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        } else {
            let mut stmt = conn.prepare(
                "SELECT domain, source_ip, COUNT(*) AS cnt, MIN(timestamp), MAX(timestamp) \
                 FROM dns_queries WHERE timestamp >= ?1 \
                 GROUP BY domain, source_ip ORDER BY cnt DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![since, limit], |row| {
                Ok(DomainUsage {
                    domain: row.get(0)?,
                    source_ip: Some(row.get(1)?),
                    count: row.get(2)?,
                    first_seen: row.get(3)?,
                    last_seen: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        }
    }

    /// Hourly activity buckets for a device, newest first.
    pub fn timeline(&self, ip: &str, days: u32) -> Result<Vec<HourBucket>> {
        let since = format_timestamp(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT strftime('%Y-%m-%d %H:00', timestamp) AS hour, COUNT(*) AS cnt \
             FROM dns_queries WHERE source_ip = ?1 AND timestamp >= ?2 \
             GROUP BY hour ORDER BY hour DESC",
        )?;
        let rows = stmt.query_map(params![ip, since], |row| {
            Ok(HourBucket {
                hour: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// All queries from the last `hours` hours in append order, for alert
    /// window scans.
    pub fn queries_since(&self, hours: u32) -> Result<Vec<QueryRecord>> {
        let since = format_timestamp(Utc::now() - Duration::hours(i64::from(hours)));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, source_ip, source_mac, domain, query_type, response, device_name \
             FROM dns_queries WHERE timestamp >= ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![since], query_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Insert or update a device sighting.
    ///
    /// Updates mac/hostname/vendor/last_seen on an existing IP; first_seen
    /// is written once and preserved thereafter.
    pub fn upsert_device(&self, ip: &str, mac: &str, hostname: &str, vendor: &str) -> Result<()> {
        let now = format_timestamp(Utc::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (ip, mac, hostname, vendor, first_seen, last_seen) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT(ip) DO UPDATE SET \
             mac = excluded.mac, hostname = excluded.hostname, \
             vendor = excluded.vendor, last_seen = excluded.last_seen",
            params![ip, mac, hostname, vendor, now],
        )?;
        Ok(())
    }

    /// All known devices, most recently seen first.
    pub fn all_devices(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ip, mac, hostname, vendor, first_seen, last_seen \
             FROM devices ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeviceRecord {
                ip: row.get(0)?,
                mac: row.get(1)?,
                hostname: row.get(2)?,
                vendor: row.get(3)?,
                first_seen: row.get(4)?,
                last_seen: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<QueryRecord> {
    Ok(QueryRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        source_ip: row.get(2)?,
        source_mac: row.get(3)?,
        domain: row.get(4)?,
        query_type: row.get(5)?,
        response: row.get(6)?,
        device_name: row.get(7)?,
    })
}
