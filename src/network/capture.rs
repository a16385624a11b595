//! Packet capture and send abstraction.
//!
//! Trait seams over pnet's datalink channel so the sniffer and the
//! redirection engine can be exercised in tests without a real interface.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::udp::UdpPacket;
use pnet::util::MacAddr;

use crate::error::{NetworkError, Result};

/// Addressing extracted from a captured frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketInfo {
    pub source_mac: MacAddr,
    pub dest_mac: MacAddr,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
}

/// Trait for packet capture implementations.
pub trait PacketCapture: Send {
    /// Receive the next frame.
    ///
    /// Returns None when the capture has ended, or on a read timeout so
    /// the caller can check its stop flag between frames.
    fn next_packet(&mut self) -> Option<Vec<u8>>;
}

/// Trait for raw frame sending implementations.
pub trait PacketSender: Send {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
}

/// Resolve the interface to operate on.
///
/// With a name, that exact interface must exist. Without one, picks the
/// first interface that is up, not loopback, and has an address.
pub fn find_interface(name: Option<&str>) -> Result<NetworkInterface> {
    let interfaces = datalink::interfaces();

    if let Some(name) = name {
        interfaces
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| NetworkError::NoInterface.into())
    } else {
        interfaces
            .into_iter()
            .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
            .ok_or_else(|| NetworkError::NoInterface.into())
    }
}

/// Extract our IPv4 address and MAC from an interface.
pub fn get_interface_info(interface: &NetworkInterface) -> Result<(Ipv4Addr, MacAddr)> {
    let mac = interface.mac.ok_or(NetworkError::NoInterface)?;

    let ip = interface
        .ips
        .iter()
        .find_map(|ip| match ip.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or(NetworkError::NoInterface)?;

    Ok((ip, mac))
}

/// Production packet capture over a pnet datalink channel.
pub struct PnetCapture {
    rx: Box<dyn DataLinkReceiver>,
}

impl PnetCapture {
    /// Open a capture/send channel pair on the given interface.
    ///
    /// `read_timeout` bounds how long `next_packet` can block, so loops
    /// driven by a stop flag stay responsive.
    pub fn new(
        interface: &NetworkInterface,
        read_timeout: Option<Duration>,
    ) -> Result<(Self, PnetSender)> {
        let config = datalink::Config {
            read_timeout,
            ..Default::default()
        };

        let (tx, rx) = match datalink::channel(interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(NetworkError::UnsupportedChannel.into()),
            Err(e) => return Err(NetworkError::ChannelOpen(e.to_string()).into()),
        };

        Ok((Self { rx }, PnetSender { tx }))
    }
}

impl PacketCapture for PnetCapture {
    fn next_packet(&mut self) -> Option<Vec<u8>> {
        self.rx.next().ok().map(<[u8]>::to_vec)
    }
}

/// Production frame sender over a pnet datalink channel.
pub struct PnetSender {
    tx: Box<dyn DataLinkSender>,
}

impl PacketSender for PnetSender {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.tx
            .send_to(frame, None)
            .ok_or_else(|| NetworkError::SendFailed("send returned None".into()))?
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

/// Extract the DNS payload of a captured frame, if it carries one.
///
/// Returns None unless the frame is IPv4 or IPv6, UDP, and addressed to
/// port 53. The returned info keeps the link-layer source so queries can
/// be attributed to a device MAC.
pub fn extract_dns_query(frame: &[u8]) -> Option<(PacketInfo, Vec<u8>)> {
    let ethernet = EthernetPacket::new(frame)?;

    let (source_ip, dest_ip, udp_payload) = match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(ethernet.payload())?;
            (
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                ipv4.payload().to_vec(),
            )
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(ethernet.payload())?;
            (
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                ipv6.payload().to_vec(),
            )
        }
        _ => return None,
    };

    let udp = UdpPacket::new(&udp_payload)?;

    if udp.get_destination() != 53 {
        return None;
    }

    let packet_info = PacketInfo {
        source_mac: ethernet.get_source(),
        dest_mac: ethernet.get_destination(),
        source_ip,
        dest_ip,
        source_port: udp.get_source(),
        dest_port: udp.get_destination(),
    };

    Some((packet_info, udp.payload().to_vec()))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    /// Mock packet capture fed from a fixed frame list.
    pub struct MockCapture {
        frames: VecDeque<Vec<u8>>,
    }

    impl MockCapture {
        pub fn new(frames: Vec<Vec<u8>>) -> Self {
            Self {
                frames: frames.into(),
            }
        }
    }

    impl PacketCapture for MockCapture {
        fn next_packet(&mut self) -> Option<Vec<u8>> {
            self.frames.pop_front()
        }
    }

    /// Mock frame sender recording everything sent.
    ///
    /// `fail_from` makes every send starting at that index fail, for
    /// exercising partial-failure paths.
    #[derive(Clone, Default)]
    pub struct MockSender {
        pub sent_frames: Arc<Mutex<Vec<Vec<u8>>>>,
        attempts: Arc<AtomicUsize>,
        fail_from: Option<usize>,
    }

    impl MockSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_from(index: usize) -> Self {
            Self {
                fail_from: Some(index),
                ..Self::default()
            }
        }

        pub fn sent_count(&self) -> usize {
            self.sent_frames.lock().len()
        }

        pub fn attempt_count(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn last_sent(&self) -> Option<Vec<u8>> {
            self.sent_frames.lock().last().cloned()
        }
    }

    impl PacketSender for MockSender {
        fn send(&mut self, frame: &[u8]) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(from) = self.fail_from {
                if attempt >= from {
                    return Err(NetworkError::SendFailed("mock failure".into()).into());
                }
            }
            self.sent_frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn should_drain_mock_capture_in_order() {
        let mut capture = MockCapture::new(vec![vec![1, 2, 3], vec![4, 5, 6]]);

        assert_eq!(capture.next_packet(), Some(vec![1, 2, 3]));
        assert_eq!(capture.next_packet(), Some(vec![4, 5, 6]));
        assert_eq!(capture.next_packet(), None);
    }

    #[test]
    fn should_record_sent_frames() {
        let mut sender = MockSender::new();

        sender.send(&[1, 2, 3]).unwrap();
        sender.send(&[4, 5, 6]).unwrap();

        assert_eq!(sender.sent_count(), 2);
        assert_eq!(sender.last_sent(), Some(vec![4, 5, 6]));
    }

    #[test]
    fn should_fail_sends_from_configured_index() {
        let mut sender = MockSender::failing_from(1);

        assert!(sender.send(&[1]).is_ok());
        assert!(sender.send(&[2]).is_err());
        assert!(sender.send(&[3]).is_err());

        assert_eq!(sender.sent_count(), 1);
        assert_eq!(sender.attempt_count(), 3);
    }
}
