//! Append-only DNS query log and device registry.

mod models;
mod query_store;

pub use models::{
    DayCount, DeviceRecord, DeviceReport, DomainCount, DomainUsage, HourBucket, NewQuery,
    QueryRecord, StoreStats, normalize_domain,
};
pub use query_store::QueryStore;
