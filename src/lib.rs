//! Lanscope - a LAN DNS monitoring agent.
//!
//! Lanscope records which domains the devices on a local network look
//! up, attributes each query to a device, and flags domains that fall
//! into risky categories. Queries reach the agent through one of two
//! mutually exclusive capture paths: a forwarding DNS proxy that
//! devices are pointed at, or ARP redirection that pulls traffic
//! through this host and sniffs it passively.
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`store`]: Append-only query log and device registry (SQLite)
//! - [`ignore`]: Domains that are never logged
//! - [`category`]: Domain categorization and alert derivation
//! - [`network`]: Capture channels, ARP frames, IP forwarding
//! - [`scan`]: Active device discovery
//! - [`spoof`]: ARP redirection engine
//! - [`sniff`]: Passive DNS sniffer
//! - [`proxy`]: Active forwarding DNS proxy
//! - [`monitor`]: Capture lifecycle controller
//! - [`error`]: Error types
//!
//! # Testing
//!
//! The capture and resolution seams are traits, so the pipeline can be
//! exercised without a network:
//!
//! ```rust
//! use lanscope::category::CategorySet;
//! use lanscope::ignore::IgnoreList;
//!
//! let ignore = IgnoreList::new(["*.local"]);
//! assert!(ignore.is_ignored("printer.local"));
//!
//! let categories = CategorySet::builtin();
//! assert!(categories.categorize("sub.pornhub.com").is_some());
//! ```

pub mod category;
pub mod config;
pub mod error;
pub mod ignore;
pub mod metrics;
pub mod monitor;
pub mod network;
pub mod proxy;
pub mod scan;
pub mod sniff;
pub mod spoof;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use monitor::Monitor;
