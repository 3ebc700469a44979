//! DMA memory shared with the IOC.
//!
//! The engine never holds raw pointers into DMA memory. Every queue and
//! frame pool is a [`DmaRegion`]: a word-addressable view with a bus
//! address, shared by reference count so identity can be checked across a
//! reset. Frames inside a pool are addressed by index.
//!
//! Two allocators exist:
//!
//! - [`HostMemory`] hands out heap buffers and keeps a registry from bus
//!   address to buffer. The software IOC resolves the addresses it is given
//!   through the same registry.
//! - [`crate::vfio::VfioDmaAllocator`] hands out pinned pages mapped through
//!   the IOMMU.
//!
//! Values are stored little-endian in memory regardless of host order.

use crate::error::{MptError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Backing storage for a [`DmaRegion`].
pub trait DmaMemory: Send + Sync + fmt::Debug {
    /// Device-visible address of the first byte.
    fn bus_addr(&self) -> u64;

    /// The memory as 32-bit words.
    fn words(&self) -> &[AtomicU32];
}

/// Source of DMA regions.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `len` zeroed bytes, page aligned, within one 4 GiB window.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::DmaAllocation`] if memory cannot be provided.
    fn allocate(&self, len: usize) -> Result<DmaRegion>;
}

/// A DMA buffer shared between host and IOC.
#[derive(Clone)]
pub struct DmaRegion {
    mem: Arc<dyn DmaMemory>,
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr()))
            .field("len", &self.len())
            .finish()
    }
}

impl DmaRegion {
    /// Wrap backing memory.
    pub fn new(mem: Arc<dyn DmaMemory>) -> Self {
        Self { mem }
    }

    /// Bus address of the first byte.
    pub fn bus_addr(&self) -> u64 {
        self.mem.bus_addr()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.mem.words().len() * 4
    }

    /// Whether the region is zero-length.
    pub fn is_empty(&self) -> bool {
        self.mem.words().is_empty()
    }

    /// Whether `[bus, bus + len)` lies inside this region.
    pub fn contains(&self, bus: u64, len: usize) -> bool {
        let start = self.bus_addr();
        bus >= start && bus + len as u64 <= start + self.len() as u64
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.mem), Arc::as_ptr(&other.mem))
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "unaligned DMA word access at {offset:#x}");
        &self.mem.words()[offset / 4]
    }

    /// Read a little-endian 32-bit value.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or out of bounds.
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le(self.word(offset).load(Ordering::Acquire))
    }

    /// Write a little-endian 32-bit value.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or out of bounds.
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value.to_le(), Ordering::Release);
    }

    /// Read a little-endian 64-bit value as two words, low first.
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from(self.read_u32(offset)) | u64::from(self.read_u32(offset + 4)) << 32
    }

    /// Write a little-endian 64-bit value as two words, low first.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }

    /// Copy bytes out of the region.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len(), "DMA read out of bounds");
        let words = self.mem.words();
        for (i, b) in out.iter_mut().enumerate() {
            let at = offset + i;
            let raw = words[at / 4].load(Ordering::Acquire);
            *b = raw.to_ne_bytes()[at % 4];
        }
    }

    /// Copy bytes out of the region into a new vector.
    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_bytes(offset, &mut out);
        out
    }

    /// Copy bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len(), "DMA write out of bounds");
        let words = self.mem.words();
        let mut at = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let lane = at % 4;
            let take = (4 - lane).min(rest.len());
            let cell = &words[at / 4];
            let mut bytes = cell.load(Ordering::Acquire).to_ne_bytes();
            bytes[lane..lane + take].copy_from_slice(&rest[..take]);
            cell.store(u32::from_ne_bytes(bytes), Ordering::Release);
            at += take;
            rest = &rest[take..];
        }
    }

    /// Set `len` bytes starting at `offset` to `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len(), "DMA fill out of bounds");
        if offset % 4 == 0 && len % 4 == 0 {
            let word = u32::from_ne_bytes([byte; 4]);
            for cell in &self.mem.words()[offset / 4..(offset + len) / 4] {
                cell.store(word, Ordering::Release);
            }
        } else {
            self.write_bytes(offset, &vec![byte; len]);
        }
    }
}

// ── Host memory ─────────────────────────────────────────────────────────────

/// First bus address handed out by [`HostMemory`].
pub const HOST_BUS_BASE: u64 = 0x1_0000_0000;

const PAGE_SIZE: u64 = 4096;
const WINDOW: u64 = 1 << 32;

#[derive(Debug)]
struct HostBuffer {
    bus_addr: u64,
    words: Box<[AtomicU32]>,
}

impl DmaMemory for HostBuffer {
    fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    fn words(&self) -> &[AtomicU32] {
        &self.words
    }
}

#[derive(Debug)]
struct HostMemoryState {
    next_bus: u64,
    live: BTreeMap<u64, Weak<HostBuffer>>,
    remaining: Option<u64>,
    allocations: u64,
}

/// Heap-backed DMA memory with a bus-address registry.
///
/// Cloning yields another handle to the same address space.
#[derive(Debug, Clone)]
pub struct HostMemory {
    state: Arc<Mutex<HostMemoryState>>,
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemory {
    /// Empty address space starting at [`HOST_BUS_BASE`].
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostMemoryState {
                next_bus: HOST_BUS_BASE,
                live: BTreeMap::new(),
                remaining: None,
                allocations: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the live region holding `[bus, bus + len)` and the offset of
    /// `bus` within it.
    pub fn resolve(&self, bus: u64, len: usize) -> Option<(DmaRegion, usize)> {
        let state = self.lock();
        let (_, weak) = state.live.range(..=bus).next_back()?;
        let buf = weak.upgrade()?;
        let region = DmaRegion::new(buf);
        if !region.contains(bus, len) {
            return None;
        }
        let offset = usize::try_from(bus - region.bus_addr()).ok()?;
        Some((region, offset))
    }

    /// Let `n` more allocations succeed, then fail every one after.
    pub fn fail_after(&self, n: u64) {
        self.lock().remaining = Some(n);
    }

    /// Remove any injected allocation failure.
    pub fn clear_failures(&self) {
        self.lock().remaining = None;
    }

    /// Number of successful allocations so far.
    pub fn allocation_count(&self) -> u64 {
        self.lock().allocations
    }

    /// Number of regions still referenced.
    pub fn live_regions(&self) -> usize {
        self.lock()
            .live
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl DmaAllocator for HostMemory {
    fn allocate(&self, len: usize) -> Result<DmaRegion> {
        let mut state = self.lock();
        match state.remaining {
            Some(0) => {
                return Err(MptError::dma_allocation(format!(
                    "host memory exhausted ({len} bytes requested)"
                )))
            }
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        let size = (len.max(4) as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        if size > WINDOW {
            return Err(MptError::dma_allocation(format!(
                "{len} bytes cannot fit in one 4 GiB window"
            )));
        }
        let mut bus = state.next_bus;
        if bus / WINDOW != (bus + size - 1) / WINDOW {
            bus = (bus / WINDOW + 1) * WINDOW;
        }
        state.next_bus = bus + size;
        state.live.retain(|_, w| w.strong_count() > 0);

        let words: Box<[AtomicU32]> = (0..len.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        let buf = Arc::new(HostBuffer {
            bus_addr: bus,
            words,
        });
        state.live.insert(bus, Arc::downgrade(&buf));
        state.allocations += 1;
        tracing::trace!("host DMA region {bus:#x}+{len:#x}");
        Ok(DmaRegion::new(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian_bytes() {
        let mem = HostMemory::new();
        let r = mem.allocate(16).unwrap();
        r.write_u32(4, 0x1122_3344);
        assert_eq!(r.to_vec(4, 4), vec![0x44, 0x33, 0x22, 0x11]);
        r.write_bytes(9, &[0xAA, 0xBB]);
        assert_eq!(r.read_u32(8), 0x00BB_AA00);
    }

    #[test]
    fn u64_splits_low_then_high() {
        let mem = HostMemory::new();
        let r = mem.allocate(8).unwrap();
        r.write_u64(0, 0xDEAD_BEEF_0000_0001);
        assert_eq!(r.read_u32(0), 1);
        assert_eq!(r.read_u32(4), 0xDEAD_BEEF);
        assert_eq!(r.read_u64(0), 0xDEAD_BEEF_0000_0001);
    }

    #[test]
    fn fill_unaligned_range() {
        let mem = HostMemory::new();
        let r = mem.allocate(12).unwrap();
        r.fill(0, 12, 0xFF);
        r.fill(3, 2, 0x00);
        assert_eq!(r.to_vec(0, 6), vec![0xFF, 0xFF, 0xFF, 0, 0, 0xFF]);
    }

    #[test]
    fn resolve_finds_interior_addresses() {
        let mem = HostMemory::new();
        let a = mem.allocate(64).unwrap();
        let b = mem.allocate(64).unwrap();
        let (found, off) = mem.resolve(b.bus_addr() + 8, 8).unwrap();
        assert!(found.same_allocation(&b));
        assert!(!found.same_allocation(&a));
        assert_eq!(off, 8);
        assert!(mem.resolve(b.bus_addr() + 60, 8).is_none());
    }

    #[test]
    fn dropped_regions_stop_resolving() {
        let mem = HostMemory::new();
        let r = mem.allocate(32).unwrap();
        let bus = r.bus_addr();
        drop(r);
        assert!(mem.resolve(bus, 4).is_none());
        assert_eq!(mem.live_regions(), 0);
    }

    #[test]
    fn injected_failure() {
        let mem = HostMemory::new();
        mem.fail_after(1);
        assert!(mem.allocate(8).is_ok());
        assert!(matches!(mem.allocate(8), Err(MptError::DmaAllocation { .. })));
        mem.clear_failures();
        assert!(mem.allocate(8).is_ok());
        assert_eq!(mem.allocation_count(), 2);
    }

    #[test]
    fn regions_stay_inside_one_window() {
        let mem = HostMemory::new();
        for _ in 0..4 {
            let r = mem.allocate(1 << 20).unwrap();
            assert_eq!(r.bus_addr() >> 32, (r.bus_addr() + r.len() as u64 - 1) >> 32);
        }
    }
}
