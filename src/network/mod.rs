//! Link-layer plumbing: capture channels, ARP frames, IP forwarding.

pub mod arp;
mod capture;
pub mod ip_forward;

pub use capture::{
    PacketCapture, PacketInfo, PacketSender, PnetCapture, PnetSender, extract_dns_query,
    find_interface, get_interface_info,
};

#[cfg(test)]
pub use capture::tests::{MockCapture, MockSender};
