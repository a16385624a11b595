//! Capture lifecycle controller.
//!
//! One `Monitor` owns the store, the ignore list, and the category
//! table, and runs at most one capture path at a time. Mode changes go
//! through an explicit stop: starting the other mode while one is
//! active is an error, never an implicit restart.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pnet::datalink::NetworkInterface;
use pnet::util::MacAddr;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::category::{Alert, CategorySet, CategorySummary};
use crate::config::{CaptureMode, Config};
use crate::error::{Error, Result, SpoofError};
use crate::ignore::IgnoreList;
use crate::network::arp::{self, ArpFrameBuilder, HostInfo};
use crate::network::{PnetCapture, PnetSender, find_interface, get_interface_info, ip_forward};
use crate::proxy::{QueryHandler, UpstreamResolver, run_proxy};
use crate::scan;
use crate::sniff::Sniffer;
use crate::spoof::{SpoofEngine, resolve_mac, run_spoof_loop};
use crate::store::{DeviceRecord, QueryStore, StoreStats};

/// How long `stop_capture` waits for each background task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capture channels use a short read timeout so blocking loops notice
/// the stop flag promptly.
const CAPTURE_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot of the agent for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    /// Active capture mode, if any.
    pub mode: Option<&'static str>,
    /// Liveness per background task of the active capture; empty when
    /// idle. A `false` means the task exited while the capture is still
    /// nominally running.
    pub components: BTreeMap<&'static str, bool>,
    pub stats: StoreStats,
}

struct ActiveCapture {
    mode: CaptureMode,
    stop: Arc<AtomicBool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    /// Present in ARP mode, for target refresh and restore-on-stop.
    engine: Option<Arc<parking_lot::Mutex<SpoofEngine<PnetSender>>>>,
}

/// The agent's central controller.
pub struct Monitor {
    config: Config,
    store: QueryStore,
    ignore: Arc<IgnoreList>,
    categories: CategorySet,
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
}

impl Monitor {
    /// Open the store and build the shared context from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let store = QueryStore::open(&config.db_path)?;
        let ignore = Arc::new(IgnoreList::new(&config.ignore_domains));
        info!(
            db = %config.db_path.display(),
            ignore_patterns = ignore.len(),
            "monitor ready"
        );
        Ok(Self {
            config,
            store,
            ignore,
            categories: CategorySet::builtin(),
            active: tokio::sync::Mutex::new(None),
        })
    }

    /// The underlying query store, for the read surfaces.
    pub fn store(&self) -> &QueryStore {
        &self.store
    }

    /// Category table rollup.
    pub fn category_summaries(&self) -> Vec<CategorySummary> {
        self.categories.summaries()
    }

    /// Flagged domains from the last `hours` of logged queries,
    /// optionally restricted to one device.
    pub fn alerts(&self, hours: u32, source_ip: Option<&str>) -> Result<Vec<Alert>> {
        let mut records = self.store.queries_since(hours)?;
        if let Some(ip) = source_ip {
            records.retain(|record| record.source_ip == ip);
        }
        Ok(self.categories.alerts_from(&records))
    }

    /// Start the given capture mode.
    ///
    /// Starting the already-running mode is a no-op; starting the other
    /// mode while one is active fails with `CaptureActive`.
    pub async fn start_capture(&self, mode: CaptureMode) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.mode == mode {
                info!(mode = mode.as_str(), "capture already running");
                return Ok(());
            }
            return Err(Error::CaptureActive(current.mode.as_str()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let capture = match mode {
            CaptureMode::Proxy => ActiveCapture {
                mode,
                handles: self.start_proxy(Arc::clone(&stop)).await?,
                stop,
                engine: None,
            },
            CaptureMode::Arp => {
                let (handles, engine) = self.start_redirection(Arc::clone(&stop)).await?;
                ActiveCapture {
                    mode,
                    handles,
                    stop,
                    engine: Some(engine),
                }
            }
        };

        info!(mode = mode.as_str(), "capture started");
        *active = Some(capture);
        Ok(())
    }

    /// Stop whatever capture is running. No-op when idle.
    ///
    /// The tasks are joined first, within a bounded grace period, so the
    /// spoof loop cannot poison again once the caches are touched. Then,
    /// in ARP mode, the caches are restored and IP forwarding is
    /// switched back off; both happen even if a task overran its grace.
    pub async fn stop_capture(&self) -> Result<()> {
        let Some(capture) = self.active.lock().await.take() else {
            return Ok(());
        };

        info!(mode = capture.mode.as_str(), "stopping capture");
        capture.stop.store(true, Ordering::SeqCst);

        for (name, handle) in capture.handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "capture task panicked"),
                Err(_) => warn!(task = name, "capture task did not stop in time"),
            }
        }

        if let Some(engine) = capture.engine {
            let restore = tokio::task::spawn_blocking(move || {
                engine.lock().restore_all();
            });
            if let Err(e) = restore.await {
                warn!(error = %e, "restore task failed");
            }
            if let Err(e) = ip_forward::disable() {
                warn!(error = %e, "failed to disable ip forwarding");
            }
        }

        info!("capture stopped");
        Ok(())
    }

    /// Current mode, per-task liveness, and store counters.
    pub async fn status(&self) -> Result<MonitorStatus> {
        let (mode, components) = match self.active.lock().await.as_ref() {
            Some(capture) => (
                Some(capture.mode.as_str()),
                capture
                    .handles
                    .iter()
                    .map(|(name, handle)| (*name, !handle.is_finished()))
                    .collect(),
            ),
            None => (None, BTreeMap::new()),
        };
        Ok(MonitorStatus {
            mode,
            components,
            stats: self.store.stats()?,
        })
    }

    /// Sweep the subnet and upsert every responder into the device
    /// registry. Independent of the capture paths.
    pub async fn scan_network(&self) -> Result<Vec<DeviceRecord>> {
        let (interface, our_ip, our_mac) = self.interface_info()?;
        let gateway_ip = self.gateway_ip()?;
        let builder = ArpFrameBuilder::new(our_ip, our_mac, gateway_ip);
        let network = self.config.network_cidr;
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let store = self.store.clone();

        tokio::task::spawn_blocking(move || {
            // Without raw socket privileges the neighbor table is still
            // better than nothing.
            match PnetCapture::new(&interface, Some(CAPTURE_READ_TIMEOUT)) {
                Ok((mut capture, mut sender)) => scan::run_scan(
                    &mut capture,
                    &mut sender,
                    &builder,
                    network,
                    our_ip,
                    timeout,
                    &store,
                ),
                Err(e) => {
                    warn!(error = %e, "cannot open capture channel, using the neighbor table");
                    scan::fallback_scan(network, our_ip, &store)
                }
            }
        })
        .await?
    }

    /// Known devices, most recently seen first.
    pub fn known_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.store.all_devices()
    }

    /// Re-sweep the subnet and merge new responders into the running
    /// redirection engine. Fails with `NotActive` unless ARP capture is
    /// running. Returns the new target count.
    pub async fn refresh_spoof_targets(&self) -> Result<usize> {
        let engine = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(capture) if capture.mode == CaptureMode::Arp => capture
                    .engine
                    .as_ref()
                    .map(Arc::clone)
                    .ok_or(SpoofError::NotActive)?,
                _ => return Err(SpoofError::NotActive.into()),
            }
        };

        let (interface, our_ip, our_mac) = self.interface_info()?;
        let gateway_ip = self.gateway_ip()?;
        let builder = ArpFrameBuilder::new(our_ip, our_mac, gateway_ip);
        let network = self.config.network_cidr;
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let wanted = self.config.arp_spoof.targets.clone();

        let count = tokio::task::spawn_blocking(move || -> Result<usize> {
            let (mut capture, mut sender) =
                PnetCapture::new(&interface, Some(CAPTURE_READ_TIMEOUT))?;
            let hosts =
                scan::arp_sweep(&mut capture, &mut sender, &builder, network, our_ip, timeout)?;
            let discovered = select_targets(&hosts, gateway_ip, &wanted);
            Ok(engine.lock().merge_targets(discovered))
        })
        .await??;

        info!(targets = count, "spoof targets refreshed");
        Ok(count)
    }

    async fn start_proxy(
        &self,
        stop: Arc<AtomicBool>,
    ) -> Result<Vec<(&'static str, JoinHandle<()>)>> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.listen_port)).await?;
        let resolver = UpstreamResolver::new(
            self.config.upstream_resolver,
            self.config.fallback_resolver,
            Duration::from_secs(self.config.upstream_timeout_secs),
        );
        let handler = QueryHandler::new(resolver, self.store.clone(), Arc::clone(&self.ignore));

        let handle = tokio::spawn(async move {
            if let Err(e) = run_proxy(socket, handler, stop).await {
                warn!(error = %e, "proxy loop failed");
            }
        });

        Ok(vec![("proxy", handle)])
    }

    async fn start_redirection(
        &self,
        stop: Arc<AtomicBool>,
    ) -> Result<(
        Vec<(&'static str, JoinHandle<()>)>,
        Arc<parking_lot::Mutex<SpoofEngine<PnetSender>>>,
    )> {
        let (interface, our_ip, our_mac) = self.interface_info()?;
        let gateway_ip = self.gateway_ip()?;
        let builder = ArpFrameBuilder::new(our_ip, our_mac, gateway_ip);
        let network = self.config.network_cidr;
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let wanted = self.config.arp_spoof.targets.clone();

        // Discovery is blocking work: sweep the subnet, learn the
        // gateway MAC, and pick the target set.
        let setup_builder = builder.clone();
        type RedirectionSetup = (PnetCapture, PnetSender, MacAddr, HashMap<Ipv4Addr, MacAddr>);
        let (sniff_capture, spoof_sender, gateway_mac, targets) =
            tokio::task::spawn_blocking(move || -> Result<RedirectionSetup> {
                let (mut capture, mut sender) =
                    PnetCapture::new(&interface, Some(CAPTURE_READ_TIMEOUT))?;

                let hosts = scan::arp_sweep(
                    &mut capture,
                    &mut sender,
                    &setup_builder,
                    network,
                    our_ip,
                    timeout,
                )?;

                let gateway_mac = match hosts.iter().find(|host| host.ip == gateway_ip) {
                    Some(gateway) => gateway.mac,
                    None => resolve_mac(
                        &mut capture,
                        &mut sender,
                        &setup_builder,
                        gateway_ip,
                        timeout,
                    )?,
                };

                let targets = select_targets(&hosts, gateway_ip, &wanted);
                for ip in &wanted {
                    if !targets.contains_key(ip) {
                        warn!(target_ip = %ip, "configured target did not answer, skipping");
                    }
                }
                Ok((capture, sender, gateway_mac, targets))
            })
            .await??;

        let engine = Arc::new(parking_lot::Mutex::new(SpoofEngine::new(
            builder,
            spoof_sender,
            gateway_mac,
            targets,
        )?));

        ip_forward::enable()?;

        let interval = Duration::from_secs(self.config.arp_spoof.spoof_interval_secs);
        let tick_handle = tokio::spawn(run_spoof_loop(
            Arc::clone(&engine),
            Arc::clone(&stop),
            interval,
        ));

        let sniffer = Sniffer::new(self.store.clone(), Arc::clone(&self.ignore), our_ip);
        let sniff_stop = Arc::clone(&stop);
        let sniff_handle = tokio::task::spawn_blocking(move || {
            sniffer.run(sniff_capture, &sniff_stop);
        });

        Ok((vec![("spoof", tick_handle), ("sniffer", sniff_handle)], engine))
    }

    fn interface_info(&self) -> Result<(NetworkInterface, Ipv4Addr, MacAddr)> {
        let interface = find_interface(self.config.interface.as_deref())?;
        let (our_ip, our_mac) = get_interface_info(&interface)?;
        Ok((interface, our_ip, our_mac))
    }

    fn gateway_ip(&self) -> Result<Ipv4Addr> {
        match self.config.gateway_ip {
            Some(ip) => Ok(ip),
            None => arp::detect_gateway(),
        }
    }
}

/// Pick the spoof target set from sweep results.
///
/// An explicit target list filters the responders; an empty list means
/// every responder except the gateway.
fn select_targets(
    hosts: &[HostInfo],
    gateway_ip: Ipv4Addr,
    wanted: &[Ipv4Addr],
) -> HashMap<Ipv4Addr, MacAddr> {
    hosts
        .iter()
        .filter(|host| host.ip != gateway_ip)
        .filter(|host| wanted.is_empty() || wanted.contains(&host.ip))
        .map(|host| (host.ip, host.mac))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn proxy_config(db_path: &std::path::Path) -> Config {
        Config::parse(&format!(
            r#"
            mode = "proxy"
            network_cidr = "192.168.1.0/24"
            upstream_resolver = "1.1.1.1:53"
            listen_port = 0
            db_path = "{}"
            "#,
            db_path.display()
        ))
        .unwrap()
    }

    fn monitor() -> (Monitor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = proxy_config(&dir.path().join("test.db"));
        (Monitor::new(config).unwrap(), dir)
    }

    #[tokio::test]
    async fn should_report_idle_status_initially() {
        let (monitor, _dir) = monitor();

        let status = monitor.status().await.unwrap();
        assert_eq!(status.mode, None);
        assert_eq!(status.stats.total_queries, 0);
    }

    #[tokio::test]
    async fn should_start_and_stop_proxy_capture() {
        let (monitor, _dir) = monitor();

        monitor.start_capture(CaptureMode::Proxy).await.unwrap();
        assert_eq!(monitor.status().await.unwrap().mode, Some("proxy"));

        monitor.stop_capture().await.unwrap();
        assert_eq!(monitor.status().await.unwrap().mode, None);
    }

    #[tokio::test]
    async fn should_expose_component_liveness_in_status() {
        let (monitor, _dir) = monitor();

        assert!(monitor.status().await.unwrap().components.is_empty());

        monitor.start_capture(CaptureMode::Proxy).await.unwrap();
        let status = monitor.status().await.unwrap();
        assert_eq!(status.components.get("proxy"), Some(&true));

        monitor.stop_capture().await.unwrap();
        assert!(monitor.status().await.unwrap().components.is_empty());
    }

    #[tokio::test]
    async fn should_treat_same_mode_start_as_noop() {
        let (monitor, _dir) = monitor();

        monitor.start_capture(CaptureMode::Proxy).await.unwrap();
        monitor.start_capture(CaptureMode::Proxy).await.unwrap();

        monitor.stop_capture().await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_cross_mode_start() {
        let (monitor, _dir) = monitor();

        monitor.start_capture(CaptureMode::Proxy).await.unwrap();
        let result = monitor.start_capture(CaptureMode::Arp).await;

        assert!(matches!(result, Err(Error::CaptureActive("proxy"))));

        monitor.stop_capture().await.unwrap();
    }

    #[tokio::test]
    async fn should_allow_stop_when_idle() {
        let (monitor, _dir) = monitor();
        monitor.stop_capture().await.unwrap();
    }

    #[tokio::test]
    async fn should_allow_restart_after_stop() {
        let (monitor, _dir) = monitor();

        monitor.start_capture(CaptureMode::Proxy).await.unwrap();
        monitor.stop_capture().await.unwrap();
        monitor.start_capture(CaptureMode::Proxy).await.unwrap();
        assert_eq!(monitor.status().await.unwrap().mode, Some("proxy"));

        monitor.stop_capture().await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_target_refresh_when_not_redirecting() {
        let (monitor, _dir) = monitor();

        let result = monitor.refresh_spoof_targets().await;
        assert!(matches!(
            result,
            Err(Error::Spoof(SpoofError::NotActive))
        ));
    }

    #[tokio::test]
    async fn should_derive_alerts_from_logged_queries() {
        use crate::store::NewQuery;

        let (monitor, _dir) = monitor();
        let store = monitor.store();
        store
            .append(&NewQuery::new("192.168.1.20", "pornhub.com", "A"))
            .unwrap();
        store
            .append(&NewQuery::new("192.168.1.21", "tinder.com", "A"))
            .unwrap();
        store
            .append(&NewQuery::new("192.168.1.21", "example.com", "A"))
            .unwrap();

        let alerts = monitor.alerts(24, None).unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].category, "adult");

        let filtered = monitor.alerts(24, Some("192.168.1.21")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].domain, "tinder.com");
    }

    #[test]
    fn should_select_all_responders_when_no_explicit_targets() {
        let gateway = Ipv4Addr::new(192, 168, 1, 1);
        let hosts = vec![
            HostInfo {
                ip: gateway,
                mac: MacAddr(0, 1, 2, 3, 4, 5),
            },
            HostInfo {
                ip: Ipv4Addr::new(192, 168, 1, 10),
                mac: MacAddr(1, 1, 1, 1, 1, 1),
            },
            HostInfo {
                ip: Ipv4Addr::new(192, 168, 1, 11),
                mac: MacAddr(2, 2, 2, 2, 2, 2),
            },
        ];

        let targets = select_targets(&hosts, gateway, &[]);
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains_key(&gateway));
    }

    #[test]
    fn should_filter_to_explicit_targets() {
        let gateway = Ipv4Addr::new(192, 168, 1, 1);
        let wanted = vec![Ipv4Addr::new(192, 168, 1, 11)];
        let hosts = vec![
            HostInfo {
                ip: Ipv4Addr::new(192, 168, 1, 10),
                mac: MacAddr(1, 1, 1, 1, 1, 1),
            },
            HostInfo {
                ip: Ipv4Addr::new(192, 168, 1, 11),
                mac: MacAddr(2, 2, 2, 2, 2, 2),
            },
        ];

        let targets = select_targets(&hosts, gateway, &wanted);
        assert_eq!(targets.len(), 1);
        assert!(targets.contains_key(&Ipv4Addr::new(192, 168, 1, 11)));
    }
}
