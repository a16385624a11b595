//! Passive DNS sniffer.
//!
//! Reads frames off the capture channel, keeps the ones that are DNS
//! queries headed for port 53, and appends them to the query log with
//! the sender's MAC attached. Runs on a blocking thread; the stop flag
//! is re-checked between frames, which the capture channel's read
//! timeout keeps bounded.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hickory_proto::op::{Message, MessageType};
use hickory_proto::serialize::binary::BinDecodable;
use tracing::{debug, info, warn};

use crate::ignore::IgnoreList;
use crate::network::{PacketCapture, extract_dns_query};
use crate::store::{NewQuery, QueryStore};

/// Per-frame query extraction and logging.
pub struct Sniffer {
    store: QueryStore,
    ignore: Arc<IgnoreList>,
    our_ip: Ipv4Addr,
}

impl Sniffer {
    pub fn new(store: QueryStore, ignore: Arc<IgnoreList>, our_ip: Ipv4Addr) -> Self {
        Self {
            store,
            ignore,
            our_ip,
        }
    }

    /// Handle one captured frame; returns the appended row id when the
    /// frame produced a log entry.
    ///
    /// Non-DNS frames, our own upstream lookups, responses, ignored
    /// domains, and malformed payloads are all dropped. A store failure
    /// is logged and swallowed so the capture loop keeps running.
    pub fn process_frame(&self, frame: &[u8]) -> Option<i64> {
        let (info, payload) = extract_dns_query(frame)?;

        // Our own forwarded lookups would otherwise be double counted.
        if info.source_ip == IpAddr::V4(self.our_ip) {
            return None;
        }

        let message = match Message::from_bytes(&payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(source_ip = %info.source_ip, error = %e, "undecodable dns payload");
                return None;
            }
        };

        if message.message_type() != MessageType::Query {
            return None;
        }

        let query = message.queries().first()?;
        let domain = query.name().to_string();

        if self.ignore.is_ignored(&domain) {
            return None;
        }

        let record = NewQuery::new(
            info.source_ip.to_string(),
            domain,
            query.query_type().to_string(),
        )
        .with_mac(info.source_mac.to_string());

        match self.store.append(&record) {
            Ok(id) => {
                metrics::counter!("lanscope_queries_total", "path" => "sniff").increment(1);
                Some(id)
            }
            Err(e) => {
                warn!(source_ip = %info.source_ip, error = %e, "failed to log sniffed query");
                None
            }
        }
    }

    /// Blocking capture loop. Returns once the stop flag flips.
    pub fn run<C: PacketCapture>(&self, mut capture: C, stop: &AtomicBool) {
        info!("passive sniffer running");
        while !stop.load(Ordering::SeqCst) {
            // None covers both read timeouts and a closed channel; the
            // stop check above decides whether to keep waiting.
            if let Some(frame) = capture.next_packet() {
                self.process_frame(&frame);
            }
        }
        info!("passive sniffer stopped");
    }
}
