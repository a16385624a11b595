//! Active device discovery.
//!
//! A scan broadcasts an ARP who-has for every host address in the
//! configured CIDR, collects replies until a deadline, enriches each
//! responder with a reverse-DNS hostname and an OUI vendor guess, and
//! upserts the result into the device registry. When the sweep comes
//! back empty (raw sockets unavailable, hostile switch) the OS neighbor
//! table is used as a best-effort fallback.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use ipnetwork::Ipv4Network;
use pnet::packet::arp::ArpOperations;
use pnet::util::MacAddr;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::network::arp::{ArpFrameBuilder, HostInfo, parse_arp_packet};
use crate::network::{PacketCapture, PacketSender};
use crate::store::{DeviceRecord, QueryStore};

/// OUI prefix to vendor mapping for the device registry.
///
/// Deliberately small: this covers the devices a home LAN actually has,
/// not the full IEEE registry.
const OUI_VENDORS: &[(&str, &str)] = &[
    ("00:50:56", "VMware"),
    ("00:0c:29", "VMware"),
    ("00:05:69", "VMware"),
    ("00:15:5d", "Microsoft Hyper-V"),
    ("b8:27:eb", "Raspberry Pi"),
    ("dc:a6:32", "Raspberry Pi"),
    ("e4:5f:01", "Raspberry Pi"),
    ("28:6a:ba", "Apple"),
    ("3c:22:fb", "Apple"),
    ("a4:83:e7", "Apple"),
    ("f0:18:98", "Apple"),
    ("8c:85:90", "Apple"),
    ("5c:0a:5b", "Samsung"),
    ("8c:77:12", "Samsung"),
    ("ec:1f:72", "Samsung"),
    ("50:c7:bf", "TP-Link"),
    ("60:32:b1", "TP-Link"),
    ("a4:2b:b0", "TP-Link"),
    ("00:1b:21", "Intel"),
    ("3c:a9:f4", "Intel"),
    ("94:65:9c", "Intel"),
];

/// Best-effort vendor lookup from the MAC's OUI prefix.
pub fn vendor_for(mac: MacAddr) -> &'static str {
    let prefix = format!("{:02x}:{:02x}:{:02x}", mac.0, mac.1, mac.2);
    OUI_VENDORS
        .iter()
        .find(|(oui, _)| *oui == prefix)
        .map_or("", |(_, vendor)| vendor)
}

/// Reverse-DNS lookup, empty string on failure.
pub fn lookup_hostname(ip: Ipv4Addr) -> String {
    dns_lookup::lookup_addr(&IpAddr::V4(ip)).unwrap_or_default()
}

/// Broadcast ARP requests across the CIDR and collect replies until the
/// deadline.
///
/// Our own address never appears in the result. Duplicate replies from
/// one host collapse to the latest MAC seen.
pub fn arp_sweep<C, S>(
    capture: &mut C,
    sender: &mut S,
    builder: &ArpFrameBuilder,
    network: Ipv4Network,
    our_ip: Ipv4Addr,
    timeout: Duration,
) -> Result<Vec<HostInfo>>
where
    C: PacketCapture,
    S: PacketSender,
{
    let deadline = Instant::now() + timeout;
    let mut probed = 0usize;

    for ip in network.iter() {
        if ip == our_ip || ip == network.network() || ip == network.broadcast() {
            continue;
        }
        let frame = builder.build_arp_request(ip);
        if let Err(e) = sender.send(&frame) {
            debug!(target_ip = %ip, error = %e, "arp request failed");
            continue;
        }
        probed += 1;
    }
    debug!(probed, "arp sweep requests sent");

    // The capture channel carries a read timeout, so this loop re-checks
    // the deadline between frames instead of blocking indefinitely.
    let mut hosts: HashMap<Ipv4Addr, MacAddr> = HashMap::new();
    while Instant::now() < deadline {
        let Some(frame) = capture.next_packet() else {
            break;
        };
        if let Some((operation, host)) = parse_arp_packet(&frame) {
            if operation == ArpOperations::Reply && host.ip != our_ip {
                hosts.insert(host.ip, host.mac);
            }
        }
    }

    Ok(hosts
        .into_iter()
        .map(|(ip, mac)| HostInfo { ip, mac })
        .collect())
}

/// Read the OS neighbor table. Never fails; parse problems yield an
/// empty list.
#[cfg(target_os = "linux")]
pub fn neighbor_table() -> Vec<HostInfo> {
    use std::fs;
    use std::str::FromStr;

    let Ok(table) = fs::read_to_string("/proc/net/arp") else {
        return Vec::new();
    };

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            // Flags 0x2 marks a complete entry.
            if fields[2] != "0x2" {
                return None;
            }
            let ip = Ipv4Addr::from_str(fields[0]).ok()?;
            let mac = MacAddr::from_str(fields[3]).ok()?;
            Some(HostInfo { ip, mac })
        })
        .collect()
}

/// Read the OS neighbor table. Never fails; parse problems yield an
/// empty list.
#[cfg(target_os = "macos")]
pub fn neighbor_table() -> Vec<HostInfo> {
    use std::process::Command;
    use std::str::FromStr;

    let Ok(output) = Command::new("arp").arg("-a").output() else {
        return Vec::new();
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            // "host (192.168.1.1) at 0:11:22:33:44:55 on en0 ... [ethernet]"
            let ip = line.split('(').nth(1)?.split(')').next()?;
            let mac = line.split(" at ").nth(1)?.split_whitespace().next()?;
            let ip = Ipv4Addr::from_str(ip).ok()?;
            let mac = MacAddr::from_str(&normalize_mac(mac)?).ok()?;
            Some(HostInfo { ip, mac })
        })
        .collect()
}

/// macOS `arp -a` prints MAC octets without leading zeros.
#[cfg(target_os = "macos")]
fn normalize_mac(raw: &str) -> Option<String> {
    let octets: Vec<&str> = raw.split(':').collect();
    if octets.len() != 6 {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|o| format!("{:0>2}", o))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Enrich discovered hosts and upsert them into the device registry.
///
/// Enrichment is best effort: a failed reverse lookup or unknown OUI
/// leaves the field empty rather than failing the scan.
pub fn persist_hosts(hosts: &[HostInfo], store: &QueryStore) -> Result<Vec<DeviceRecord>> {
    for host in hosts {
        let hostname = lookup_hostname(host.ip);
        let vendor = vendor_for(host.mac);
        store.upsert_device(&host.ip.to_string(), &host.mac.to_string(), &hostname, vendor)?;
    }

    info!(devices = hosts.len(), "network scan complete");
    metrics::counter!("lanscope_scanned_devices_total").increment(hosts.len() as u64);
    store.all_devices()
}

/// Discovery from the OS neighbor table alone, for when no datalink
/// channel is available.
pub fn fallback_scan(
    network: Ipv4Network,
    our_ip: Ipv4Addr,
    store: &QueryStore,
) -> Result<Vec<DeviceRecord>> {
    let hosts: Vec<HostInfo> = neighbor_table()
        .into_iter()
        .filter(|host| host.ip != our_ip && network.contains(host.ip))
        .collect();
    persist_hosts(&hosts, store)
}

/// Run a full discovery pass and persist the results.
pub fn run_scan<C, S>(
    capture: &mut C,
    sender: &mut S,
    builder: &ArpFrameBuilder,
    network: Ipv4Network,
    our_ip: Ipv4Addr,
    timeout: Duration,
    store: &QueryStore,
) -> Result<Vec<DeviceRecord>>
where
    C: PacketCapture,
    S: PacketSender,
{
    let mut hosts = arp_sweep(capture, sender, builder, network, our_ip, timeout)?;

    if hosts.is_empty() {
        warn!("arp sweep found nothing, falling back to the OS neighbor table");
        hosts = neighbor_table()
            .into_iter()
            .filter(|host| host.ip != our_ip && network.contains(host.ip))
            .collect();
    }

    persist_hosts(&hosts, store)
}
