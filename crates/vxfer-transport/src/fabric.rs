//! In-process simulated RDMA fabric.
//!
//! The fabric stands in for the network and the adapter firmware: it hands out
//! device contexts, keys and virtual addresses, routes connect requests to
//! listeners, and keeps the table of remotely accessible memory regions that
//! one-sided operations are resolved against. Everything runs in the calling
//! thread; two endpoints sharing a `Fabric` handle can live on different
//! threads of the same process.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::cm::CmIdInner;
use crate::error::{Result, VerbsError};
use crate::memory::RegionInner;

static FABRIC_COUNTER: AtomicU64 = AtomicU64::new(1);

const FIRST_ADDR: u64 = 0x1000_0000;
const PAGE_SIZE: u64 = 4096;
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Simulated fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Name reported by the device context.
    pub device_name: String,
    /// Host addresses reachable besides loopback.
    pub hosts: Vec<IpAddr>,
    /// Probability in `[0, 1]` that a posted send-side request fails with
    /// `RetryExceeded` instead of executing.
    pub failure_rate: f64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            device_name: "sim_mlx5_0".to_string(),
            hosts: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            failure_rate: 0.0,
        }
    }
}

/// Counters for operations executed on the fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Send-side requests that completed successfully.
    pub operations_completed: u64,
    /// Send-side requests that completed with an error.
    pub operations_failed: u64,
    /// Payload bytes pushed by sends and writes.
    pub bytes_sent: u64,
    /// Payload bytes pulled by reads.
    pub bytes_received: u64,
}

pub(crate) struct PortBinding {
    pub(crate) owner: Weak<CmIdInner>,
    pub(crate) backlog: Option<u32>,
    pub(crate) pending: u32,
}

struct FabricInner {
    id: u64,
    config: FabricConfig,
    ports: Mutex<HashMap<u16, PortBinding>>,
    regions: Mutex<HashMap<u32, Arc<RegionInner>>>,
    stats: Mutex<FabricStats>,
    next_key: AtomicU32,
    next_addr: AtomicU64,
    next_qp_num: AtomicU32,
    next_ephemeral: AtomicU16,
}

/// Handle to a simulated fabric. Clones share the same fabric.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("id", &self.inner.id)
            .field("device", &self.inner.config.device_name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new(FabricConfig::default())
    }
}

impl Fabric {
    /// Creates a fabric with the given configuration.
    pub fn new(config: FabricConfig) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                id: FABRIC_COUNTER.fetch_add(1, Ordering::Relaxed),
                config,
                ports: Mutex::new(HashMap::new()),
                regions: Mutex::new(HashMap::new()),
                stats: Mutex::new(FabricStats::default()),
                next_key: AtomicU32::new(1),
                next_addr: AtomicU64::new(FIRST_ADDR),
                next_qp_num: AtomicU32::new(1),
                next_ephemeral: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// Fabric identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Fabric configuration.
    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    /// Opens the fabric's device context.
    pub fn device(&self) -> DeviceContext {
        DeviceContext {
            inner: Arc::new(DeviceInner {
                name: self.inner.config.device_name.clone(),
                fabric: self.clone(),
            }),
        }
    }

    /// Returns whether address resolution toward `ip` can succeed.
    pub fn is_reachable(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || ip.is_unspecified() || self.inner.config.hosts.contains(&ip)
    }

    /// Returns whether some endpoint is listening on `port`.
    pub fn is_listening(&self, port: u16) -> bool {
        self.inner
            .ports
            .lock()
            .get(&port)
            .map(|b| b.backlog.is_some() && b.owner.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Polls until an endpoint listens on `port` or `timeout` elapses.
    pub fn wait_for_listener(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_listening(port) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> FabricStats {
        self.inner.stats.lock().clone()
    }

    pub(crate) fn ephemeral_addr(&self) -> SocketAddr {
        let port = self.inner.next_ephemeral.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub(crate) fn next_qp_num(&self) -> u32 {
        self.inner.next_qp_num.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a fresh (lkey, rkey) pair. Keys are never reused.
    pub(crate) fn alloc_keys(&self) -> (u32, u32) {
        let n = self.inner.next_key.fetch_add(1, Ordering::Relaxed) & 0x3FFF_FFFF;
        (n | 0x4000_0000, n | 0x8000_0000)
    }

    /// Reserves a page-aligned virtual address range of `len` bytes.
    pub(crate) fn alloc_addr(&self, len: usize) -> u64 {
        let span = (len as u64).max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        self.inner.next_addr.fetch_add(span, Ordering::Relaxed)
    }

    pub(crate) fn bind_port(&self, port: u16, owner: Weak<CmIdInner>) -> Result<()> {
        let mut ports = self.inner.ports.lock();
        if let Some(existing) = ports.get(&port) {
            if existing.owner.strong_count() > 0 {
                return Err(VerbsError::AddressInUse { port });
            }
        }
        ports.insert(
            port,
            PortBinding {
                owner,
                backlog: None,
                pending: 0,
            },
        );
        Ok(())
    }

    pub(crate) fn set_listening(&self, port: u16, backlog: u32) -> bool {
        match self.inner.ports.lock().get_mut(&port) {
            Some(binding) => {
                binding.backlog = Some(backlog);
                true
            }
            None => false,
        }
    }

    pub(crate) fn release_port(&self, port: u16) {
        let mut ports = self.inner.ports.lock();
        if let Some(binding) = ports.get(&port) {
            if binding.owner.strong_count() == 0 {
                ports.remove(&port);
            }
        }
    }

    /// Outcome of routing a connect request to `port`.
    pub(crate) fn route_connect(&self, port: u16) -> ConnectRoute {
        let mut ports = self.inner.ports.lock();
        let Some(binding) = ports.get_mut(&port) else {
            return ConnectRoute::NoListener;
        };
        let (Some(backlog), Some(owner)) = (binding.backlog, binding.owner.upgrade()) else {
            return ConnectRoute::NoListener;
        };
        if binding.pending >= backlog {
            return ConnectRoute::BacklogFull;
        }
        binding.pending += 1;
        ConnectRoute::Listener(owner)
    }

    pub(crate) fn request_settled(&self, port: u16) {
        if let Some(binding) = self.inner.ports.lock().get_mut(&port) {
            binding.pending = binding.pending.saturating_sub(1);
        }
    }

    pub(crate) fn publish_region(&self, region: Arc<RegionInner>) {
        self.inner.regions.lock().insert(region.rkey, region);
    }

    pub(crate) fn retract_region(&self, rkey: u32) {
        self.inner.regions.lock().remove(&rkey);
    }

    pub(crate) fn lookup_remote(&self, rkey: u32) -> Option<Arc<RegionInner>> {
        self.inner.regions.lock().get(&rkey).cloned()
    }

    pub(crate) fn should_fail(&self) -> bool {
        let rate = self.inner.config.failure_rate;
        if rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(rate.min(1.0))
    }

    pub(crate) fn record_completed(&self, bytes_sent: u64, bytes_received: u64) {
        let mut stats = self.inner.stats.lock();
        stats.operations_completed += 1;
        stats.bytes_sent += bytes_sent;
        stats.bytes_received += bytes_received;
    }

    pub(crate) fn record_failed(&self) {
        self.inner.stats.lock().operations_failed += 1;
    }
}

pub(crate) enum ConnectRoute {
    NoListener,
    BacklogFull,
    Listener(Arc<CmIdInner>),
}

struct DeviceInner {
    name: String,
    fabric: Fabric,
}

/// Hardware context an endpoint is bound to after resolution.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("name", &self.inner.name)
            .field("fabric", &self.inner.fabric.id())
            .finish()
    }
}

impl DeviceContext {
    /// Device name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fabric the device is attached to.
    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_config_defaults() {
        let config = FabricConfig::default();
        assert_eq!(config.device_name, "sim_mlx5_0");
        assert_eq!(config.failure_rate, 0.0);
        assert_eq!(config.hosts, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }

    #[test]
    fn test_reachability() {
        let fabric = Fabric::new(FabricConfig {
            hosts: vec!["10.0.1.37".parse().unwrap()],
            ..FabricConfig::default()
        });
        assert!(fabric.is_reachable("127.0.0.1".parse().unwrap()));
        assert!(fabric.is_reachable("10.0.1.37".parse().unwrap()));
        assert!(!fabric.is_reachable("10.0.1.38".parse().unwrap()));
    }

    #[test]
    fn test_keys_unique() {
        let fabric = Fabric::default();
        let (l1, r1) = fabric.alloc_keys();
        let (l2, r2) = fabric.alloc_keys();
        assert_ne!(l1, l2);
        assert_ne!(r1, r2);
        assert_ne!(l1, r1);
    }

    #[test]
    fn test_addresses_page_aligned_and_disjoint() {
        let fabric = Fabric::default();
        let a = fabric.alloc_addr(100);
        let b = fabric.alloc_addr(5000);
        let c = fabric.alloc_addr(0);
        assert_eq!(a % PAGE_SIZE, 0);
        assert_eq!(b, a + PAGE_SIZE);
        assert_eq!(c, b + 2 * PAGE_SIZE);
    }

    #[test]
    fn test_no_listener_route() {
        let fabric = Fabric::default();
        assert!(matches!(fabric.route_connect(7471), ConnectRoute::NoListener));
        assert!(!fabric.is_listening(7471));
        assert!(!fabric.wait_for_listener(7471, Duration::from_millis(5)));
    }

    #[test]
    fn test_failure_injection_always() {
        let fabric = Fabric::new(FabricConfig {
            failure_rate: 1.0,
            ..FabricConfig::default()
        });
        assert!(fabric.should_fail());
        assert!(!Fabric::default().should_fail());
    }

    #[test]
    fn test_stats_accumulate() {
        let fabric = Fabric::default();
        fabric.record_completed(8, 0);
        fabric.record_completed(0, 6);
        fabric.record_failed();
        let stats = fabric.stats();
        assert_eq!(stats.operations_completed, 2);
        assert_eq!(stats.operations_failed, 1);
        assert_eq!(stats.bytes_sent, 8);
        assert_eq!(stats.bytes_received, 6);
    }
}
