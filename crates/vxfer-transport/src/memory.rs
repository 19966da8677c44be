//! Protection domains and memory region registration.
//!
//! Registering a buffer yields a local key (accepted in local work requests
//! posted to queue pairs of the same protection domain) and a remote key
//! (accepted in one-sided operations issued by the connected peer). Keys stop
//! working the moment the region is deregistered, and deregistration is refused
//! while posted work requests still reference the region.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, VerbsError};
use crate::fabric::{DeviceContext, Fabric};
use crate::work_request::Sge;

static PD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Access rights of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local reads (source of sends and writes).
    pub const LOCAL_READ: Self = Self(1);
    /// Local writes (target of receives and reads).
    pub const LOCAL_WRITE: Self = Self(2);
    /// Peer may read the region with a one-sided read.
    pub const REMOTE_READ: Self = Self(4);
    /// Peer may write the region with a one-sided write.
    pub const REMOTE_WRITE: Self = Self(8);
    /// Every right.
    pub const ALL: Self = Self(0xF);

    /// Returns whether every right in `other` is present.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No rights.
    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

pub(crate) struct RegionInner {
    pub(crate) lkey: u32,
    pub(crate) rkey: u32,
    pub(crate) addr: u64,
    pub(crate) pd_id: u64,
    pub(crate) access: AccessFlags,
    // Fits in u32, checked at registration.
    len: usize,
    buffer: Mutex<Vec<u8>>,
    outstanding: AtomicUsize,
    registered: AtomicBool,
}

impl RegionInner {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Translates `[addr, addr + len)` into an offset inside the region.
    pub(crate) fn offset_of(&self, addr: u64, len: u64) -> Option<usize> {
        let offset = addr.checked_sub(self.addr)?;
        let end = offset.checked_add(len)?;
        if end > self.len as u64 {
            return None;
        }
        Some(offset as usize)
    }

    pub(crate) fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.buffer.lock()[offset..offset + len].to_vec()
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) {
        self.buffer.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub(crate) fn acquire(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

/// Handle to a registered memory region.
///
/// Clones refer to the same buffer. The handle stays usable for CPU access
/// after deregistration, but its keys are rejected from then on.
#[derive(Clone)]
pub struct MemoryRegion {
    inner: Arc<RegionInner>,
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.inner.addr))
            .field("len", &self.inner.len)
            .field("lkey", &format_args!("0x{:08X}", self.inner.lkey))
            .field("rkey", &format_args!("0x{:08X}", self.inner.rkey))
            .field("access", &self.inner.access)
            .finish()
    }
}

impl MemoryRegion {
    /// Virtual start address.
    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Returns whether the region is zero bytes long.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Local key.
    pub fn lkey(&self) -> u32 {
        self.inner.lkey
    }

    /// Remote key.
    pub fn rkey(&self) -> u32 {
        self.inner.rkey
    }

    /// Access rights granted at registration.
    pub fn access(&self) -> AccessFlags {
        self.inner.access
    }

    /// Number of posted work requests still referencing the region.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Returns whether the keys are still valid.
    pub fn is_registered(&self) -> bool {
        self.inner.is_registered()
    }

    /// Scatter/gather element covering the whole region.
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.inner.addr,
            length: self.inner.len as u32,
            lkey: self.inner.lkey,
        }
    }

    /// Scatter/gather element covering `[offset, offset + len)`.
    pub fn sge_range(&self, offset: usize, len: usize) -> Result<Sge> {
        // In range implies len fits in u32.
        self.check_range(offset, len)?;
        Ok(Sge {
            addr: self.inner.addr + offset as u64,
            length: len as u32,
            lkey: self.inner.lkey,
        })
    }

    /// Copies `len` bytes starting at `offset` out of the buffer.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        Ok(self.inner.read(offset, len))
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.inner.write(offset, data);
        Ok(())
    }

    /// Copy of the whole buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.buffer.lock().clone()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.inner.len => Ok(()),
            _ => Err(VerbsError::OutOfRange {
                offset,
                len,
                region_len: self.inner.len,
            }),
        }
    }
}

struct PdInner {
    id: u64,
    device: DeviceContext,
    regions: Mutex<HashMap<u32, Arc<RegionInner>>>,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        let regions = self.regions.get_mut();
        if !regions.is_empty() {
            tracing::warn!(pd = self.id, count = regions.len(), "protection domain released with registered regions");
            let fabric = self.device.fabric();
            for (_, region) in regions.drain() {
                region.registered.store(false, Ordering::Release);
                fabric.retract_region(region.rkey);
            }
        }
    }
}

/// Isolation scope binding memory registrations to queue pairs.
#[derive(Clone)]
pub struct ProtectionDomain {
    inner: Arc<PdInner>,
}

impl std::fmt::Debug for ProtectionDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionDomain")
            .field("id", &self.inner.id)
            .field("regions", &self.inner.regions.lock().len())
            .finish()
    }
}

impl ProtectionDomain {
    /// Allocates a protection domain on `device`.
    pub fn alloc(device: &DeviceContext) -> Self {
        let id = PD_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pd = id, device = device.name(), "allocated protection domain");
        Self {
            inner: Arc::new(PdInner {
                id,
                device: device.clone(),
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Domain identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Device the domain was allocated on.
    pub fn device(&self) -> &DeviceContext {
        &self.inner.device
    }

    fn fabric(&self) -> &Fabric {
        self.inner.device.fabric()
    }

    /// Number of regions currently registered.
    pub fn region_count(&self) -> usize {
        self.inner.regions.lock().len()
    }

    /// Registers `buffer` with the given access rights.
    pub fn register(&self, buffer: Vec<u8>, access: AccessFlags) -> Result<MemoryRegion> {
        if access.contains(AccessFlags::REMOTE_WRITE) && !access.contains(AccessFlags::LOCAL_WRITE) {
            return Err(VerbsError::InvalidCapability(
                "remote write access requires local write access".to_string(),
            ));
        }
        let len = buffer.len();
        if u32::try_from(len).is_err() {
            return Err(VerbsError::LengthOverflow { len });
        }
        let fabric = self.fabric();
        let (lkey, rkey) = fabric.alloc_keys();
        let region = Arc::new(RegionInner {
            lkey,
            rkey,
            addr: fabric.alloc_addr(len),
            pd_id: self.inner.id,
            access,
            len,
            buffer: Mutex::new(buffer),
            outstanding: AtomicUsize::new(0),
            registered: AtomicBool::new(true),
        });
        self.inner.regions.lock().insert(lkey, region.clone());
        fabric.publish_region(region.clone());
        tracing::debug!(pd = self.inner.id, lkey, rkey, len, "registered memory region");
        Ok(MemoryRegion { inner: region })
    }

    /// Deregisters `mr`. Fails while work requests still reference it.
    pub fn deregister(&self, mr: &MemoryRegion) -> Result<()> {
        let lkey = mr.inner.lkey;
        let mut regions = self.inner.regions.lock();
        if !regions.contains_key(&lkey) {
            return Err(VerbsError::RegionNotRegistered { lkey });
        }
        let outstanding = mr.outstanding();
        if outstanding > 0 {
            return Err(VerbsError::RegionBusy { lkey, outstanding });
        }
        regions.remove(&lkey);
        drop(regions);
        mr.inner.registered.store(false, Ordering::Release);
        self.fabric().retract_region(mr.inner.rkey);
        tracing::debug!(pd = self.inner.id, lkey, "deregistered memory region");
        Ok(())
    }

    /// Resolves a scatter/gather element to its region and byte offset.
    pub(crate) fn resolve(&self, sge: &Sge) -> Result<(Arc<RegionInner>, usize)> {
        let region = self
            .inner
            .regions
            .lock()
            .get(&sge.lkey)
            .cloned()
            .ok_or(VerbsError::InvalidLocalKey { lkey: sge.lkey })?;
        let offset = region
            .offset_of(sge.addr, sge.length as u64)
            .ok_or(VerbsError::SgeOutOfBounds {
                addr: sge.addr,
                length: sge.length,
                lkey: sge.lkey,
            })?;
        Ok((region, offset))
    }
}

/// Regions registered by one connection, deregistered together on drop.
pub struct MemoryRegistry {
    pd: ProtectionDomain,
    regions: Vec<MemoryRegion>,
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("pd", &self.pd.id())
            .field("regions", &self.regions)
            .finish()
    }
}

impl MemoryRegistry {
    /// Creates an empty registry on `pd`.
    pub fn new(pd: ProtectionDomain) -> Self {
        Self {
            pd,
            regions: Vec::new(),
        }
    }

    /// Registers `buffer` and keeps the registration until it is
    /// deregistered or the registry is dropped.
    pub fn register(&mut self, buffer: Vec<u8>, access: AccessFlags) -> Result<MemoryRegion> {
        let mr = self.pd.register(buffer, access)?;
        self.regions.push(mr.clone());
        Ok(mr)
    }

    /// Deregisters `mr` now.
    pub fn deregister(&mut self, mr: &MemoryRegion) -> Result<()> {
        self.pd.deregister(mr)?;
        self.regions.retain(|r| r.lkey() != mr.lkey());
        Ok(())
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns whether the registry holds no registrations.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Protection domain backing the registry.
    pub fn pd(&self) -> &ProtectionDomain {
        &self.pd
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        while let Some(mr) = self.regions.pop() {
            if let Err(e) = self.pd.deregister(&mr) {
                tracing::warn!(lkey = mr.lkey(), error = %e, "deregistration at teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pd() -> ProtectionDomain {
        ProtectionDomain::alloc(&Fabric::default().device())
    }

    #[test]
    fn test_access_flags_basic() {
        let flags = AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE;
        assert!(flags.contains(AccessFlags::LOCAL_READ));
        assert!(flags.contains(AccessFlags::LOCAL_WRITE));
        assert!(!flags.contains(AccessFlags::REMOTE_READ));
        assert!(AccessFlags::ALL.contains(flags | AccessFlags::REMOTE_WRITE));
        assert!(!AccessFlags::empty().contains(AccessFlags::LOCAL_READ));
    }

    #[test]
    fn test_register_assigns_keys_and_address() {
        let pd = pd();
        let mr = pd.register(vec![0u8; 1024], AccessFlags::ALL).unwrap();
        assert_eq!(mr.len(), 1024);
        assert_ne!(mr.lkey(), mr.rkey());
        assert_eq!(mr.sge().length, 1024);
        assert_eq!(mr.sge().addr, mr.addr());
        assert_eq!(pd.region_count(), 1);
    }

    #[test]
    fn test_remote_write_requires_local_write() {
        let pd = pd();
        assert!(pd.register(vec![0u8; 8], AccessFlags::REMOTE_WRITE).is_err());
        assert!(pd
            .register(vec![0u8; 8], AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_WRITE)
            .is_ok());
    }

    #[test]
    fn test_read_write_at() {
        let mr = pd().register(vec![0u8; 16], AccessFlags::LOCAL_WRITE).unwrap();
        mr.write_at(4, &[1, 2, 3]).unwrap();
        assert_eq!(mr.read_at(4, 3).unwrap(), vec![1, 2, 3]);
        assert!(mr.read_at(10, 7).is_err());
        assert!(mr.write_at(15, &[1, 2]).is_err());
    }

    #[test]
    fn test_sge_range_bounds() {
        let mr = pd().register(vec![0u8; 100], AccessFlags::LOCAL_READ).unwrap();
        let sge = mr.sge_range(10, 20).unwrap();
        assert_eq!(sge.addr, mr.addr() + 10);
        assert_eq!(sge.length, 20);
        assert!(mr.sge_range(90, 20).is_err());
    }

    #[test]
    fn test_resolve_sge() {
        let pd = pd();
        let mr = pd.register(vec![0u8; 64], AccessFlags::LOCAL_READ).unwrap();
        let (_, offset) = pd.resolve(&mr.sge_range(8, 8).unwrap()).unwrap();
        assert_eq!(offset, 8);

        let past_end = Sge {
            addr: mr.addr() + 60,
            length: 8,
            lkey: mr.lkey(),
        };
        assert!(matches!(pd.resolve(&past_end), Err(VerbsError::SgeOutOfBounds { .. })));
    }

    #[test]
    fn test_resolve_rejects_foreign_domain() {
        let fabric = Fabric::default();
        let pd_a = ProtectionDomain::alloc(&fabric.device());
        let pd_b = ProtectionDomain::alloc(&fabric.device());
        let mr = pd_a.register(vec![0u8; 8], AccessFlags::LOCAL_READ).unwrap();
        assert!(matches!(pd_b.resolve(&mr.sge()), Err(VerbsError::InvalidLocalKey { .. })));
    }

    #[test]
    fn test_deregister_idle_region_succeeds() {
        let pd = pd();
        let mr = pd.register(vec![0u8; 32], AccessFlags::ALL).unwrap();
        pd.deregister(&mr).unwrap();
        assert!(!mr.is_registered());
        assert_eq!(pd.region_count(), 0);
    }

    #[test]
    fn test_key_rejected_after_deregister() {
        let fabric = Fabric::default();
        let pd = ProtectionDomain::alloc(&fabric.device());
        let mr = pd.register(vec![0u8; 32], AccessFlags::ALL).unwrap();
        pd.deregister(&mr).unwrap();

        assert!(matches!(pd.resolve(&mr.sge()), Err(VerbsError::InvalidLocalKey { .. })));
        assert!(fabric.lookup_remote(mr.rkey()).is_none());
        assert!(matches!(
            pd.deregister(&mr),
            Err(VerbsError::RegionNotRegistered { .. })
        ));
    }

    #[test]
    fn test_deregister_busy_region_refused() {
        let pd = pd();
        let mr = pd.register(vec![0u8; 32], AccessFlags::ALL).unwrap();
        mr.inner.acquire();
        assert!(matches!(
            pd.deregister(&mr),
            Err(VerbsError::RegionBusy { outstanding: 1, .. })
        ));
        mr.inner.release();
        pd.deregister(&mr).unwrap();
    }

    #[test]
    fn test_registry_releases_on_drop() {
        let fabric = Fabric::default();
        let pd = ProtectionDomain::alloc(&fabric.device());
        let rkey;
        {
            let mut registry = MemoryRegistry::new(pd.clone());
            let a = registry.register(vec![0u8; 8], AccessFlags::ALL).unwrap();
            let _b = registry.register(vec![0u8; 8], AccessFlags::ALL).unwrap();
            rkey = a.rkey();
            registry.deregister(&a).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(pd.region_count(), 0);
        assert!(fabric.lookup_remote(rkey).is_none());
    }
}
