//! VFIO access to a real controller.
//!
//! # Requirements
//!
//! 1. IOMMU enabled in firmware and kernel (`intel_iommu=on` or `amd_iommu=on`)
//! 2. Controller unbound from `mpt3sas` and bound to `vfio-pci`
//! 3. Access to `/dev/vfio/$IOMMU_GROUP`
//!
//! ```bash
//! mpt bind-vfio 0000:03:00.0
//! sudo chown $USER /dev/vfio/$(basename $(readlink /sys/bus/pci/devices/0000:03:00.0/iommu_group))
//! ```
//!
//! [`VfioDevice::open`] sets up the container and group, then hands out the
//! register BAR as a [`MappedRegion`] and a [`VfioDmaAllocator`] whose
//! regions are pinned, zeroed pages mapped at increasing IOVAs.
//!
//! VFIO ioctls go through libc; mmap and mlock go through rustix.

// FFI/ioctl casts are intentional - VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use crate::dma::{DmaAllocator, DmaMemory, DmaRegion};
use crate::error::{MptError, Result};
use crate::mmio::MappedRegion;
use mpt_chip::pcie::REGISTER_BAR;
use rustix::mm::{mlock, munlock};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, PoisonError};

/// VFIO ioctl numbers: `_IO(';', 100 + n)`.
mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

const PAGE_SIZE: usize = 4096;
const IOVA_BASE: u64 = 0x1000_0000;
const IOVA_WINDOW: u64 = 1 << 32;

/// Place `size` bytes at or after `cursor` without crossing a 4 GiB
/// boundary. Returns the IOVA and the next cursor.
fn place_iova(cursor: u64, size: u64) -> Option<(u64, u64)> {
    if size == 0 || size > IOVA_WINDOW {
        return None;
    }
    let mut iova = cursor;
    if iova / IOVA_WINDOW != (iova + size - 1) / IOVA_WINDOW {
        iova = (iova / IOVA_WINDOW + 1) * IOVA_WINDOW;
    }
    Some((iova, iova.checked_add(size)?))
}

/// Container and group, kept open while any DMA mapping exists.
#[derive(Debug)]
struct VfioContext {
    container: File,
    _group: File,
}

/// Pinned host pages mapped for device access.
#[derive(Debug)]
pub struct DmaBuffer {
    vaddr: *mut u8,
    iova: u64,
    size: usize,
    context: Arc<VfioContext>,
}

// SAFETY: DmaBuffer owns its allocation; all access goes through atomics.
unsafe impl Send for DmaBuffer {}

// SAFETY: the memory is only viewed as &[AtomicU32], which is Sync.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    fn new(context: Arc<VfioContext>, size: usize, iova: u64) -> Result<Self> {
        let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| MptError::dma_allocation(format!("invalid DMA layout: {e}")))?;

        // SAFETY: layout has non-zero size and a power-of-two alignment; the
        // allocation is freed with the same layout in Drop or on error below.
        let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };
        if vaddr.is_null() {
            return Err(MptError::dma_allocation(format!("out of memory for {size:#x} bytes")));
        }

        // SAFETY: [vaddr, vaddr + size) is the allocation made above.
        if let Err(e) = unsafe { mlock(vaddr.cast(), size) } {
            // SAFETY: vaddr came from alloc_zeroed with this layout.
            unsafe { std::alloc::dealloc(vaddr, layout) };
            return Err(MptError::dma_allocation(format!("mlock: {e}")));
        }

        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr as u64,
            iova,
            size: size as u64,
        };

        // SAFETY: the container fd is open with a Type1v2 IOMMU set, and
        // dma_map describes the locked allocation above.
        let ret = unsafe {
            libc::ioctl(
                context.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const dma_map,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: vaddr is locked and allocated with layout.
            unsafe {
                let _ = munlock(vaddr.cast(), size);
                std::alloc::dealloc(vaddr, layout);
            }
            return Err(MptError::dma_allocation(format!(
                "IOMMU map {iova:#x}+{size:#x}: {err}"
            )));
        }

        tracing::debug!("DMA buffer vaddr={vaddr:p} iova={iova:#x} size={size:#x}");
        Ok(Self {
            vaddr,
            iova,
            size,
            context,
        })
    }

    /// Device address.
    pub const fn iova(&self) -> u64 {
        self.iova
    }

    /// Size in bytes, a whole number of pages.
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl DmaMemory for DmaBuffer {
    fn bus_addr(&self) -> u64 {
        self.iova
    }

    fn words(&self) -> &[AtomicU32] {
        // SAFETY: vaddr is page aligned and valid for size bytes for the
        // life of self; AtomicU32 has the layout of u32.
        unsafe { std::slice::from_raw_parts(self.vaddr.cast::<AtomicU32>(), self.size / 4) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let dma_unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: self.iova,
            size: self.size as u64,
        };
        // SAFETY: unmaps the IOVA range mapped in new() before the pages go.
        unsafe {
            libc::ioctl(
                self.context.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const dma_unmap,
            );
        }
        // SAFETY: the range was locked in new().
        unsafe {
            let _ = munlock(self.vaddr.cast(), self.size);
        }
        match std::alloc::Layout::from_size_align(self.size, PAGE_SIZE) {
            // SAFETY: same layout as the allocation in new(); the device can
            // no longer reach it.
            Ok(layout) => unsafe { std::alloc::dealloc(self.vaddr, layout) },
            Err(e) => tracing::error!("leaking DMA buffer at {:#x}: {e}", self.iova),
        }
        tracing::trace!("freed DMA buffer iova={:#x}", self.iova);
    }
}

/// [`DmaAllocator`] backed by the device's IOMMU container.
#[derive(Debug, Clone)]
pub struct VfioDmaAllocator {
    context: Arc<VfioContext>,
    next_iova: Arc<Mutex<u64>>,
}

impl DmaAllocator for VfioDmaAllocator {
    fn allocate(&self, len: usize) -> Result<DmaRegion> {
        let size = len.max(4).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let iova = {
            let mut cursor = self.next_iova.lock().unwrap_or_else(PoisonError::into_inner);
            let (iova, next) = place_iova(*cursor, size as u64).ok_or_else(|| {
                MptError::dma_allocation(format!("{len} bytes cannot fit in one 4 GiB window"))
            })?;
            *cursor = next;
            iova
        };
        let buffer = DmaBuffer::new(Arc::clone(&self.context), size, iova)?;
        Ok(DmaRegion::new(Arc::new(buffer)))
    }
}

/// An open VFIO controller.
#[derive(Debug)]
pub struct VfioDevice {
    pcie_address: String,
    context: Arc<VfioContext>,
    device: File,
    num_regions: u32,
    num_irqs: u32,
}

impl VfioDevice {
    /// Open the controller at `pcie_address` (e.g. `0000:03:00.0`).
    ///
    /// # Errors
    ///
    /// Returns [`MptError::DeviceNotFound`] if the VFIO nodes are missing and
    /// [`MptError::HardwareError`] if any VFIO setup step fails.
    pub fn open(pcie_address: &str) -> Result<Self> {
        tracing::info!("Opening {pcie_address} through VFIO");
        let group_id = iommu_group(pcie_address)?;

        let container = open_rw("/dev/vfio/vfio")?;

        // SAFETY: container is /dev/vfio/vfio; the ioctl takes no argument.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if api_version != ioctls::VFIO_API_VERSION {
            return Err(MptError::hardware_error(format!(
                "unsupported VFIO API version {api_version}"
            )));
        }

        // SAFETY: the third argument is an extension id passed by value.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(MptError::hardware_error("VFIO Type1v2 IOMMU not supported"));
        }

        let group = open_rw(&format!("/dev/vfio/{group_id}"))?;

        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        // SAFETY: status is a live vfio_group_status the kernel fills in.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut status,
            )
        };
        if ret < 0 || status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(MptError::hardware_error(format!(
                "IOMMU group {group_id} not viable (every device in it must be bound to vfio-pci)"
            )));
        }

        let container_fd = container.as_raw_fd();
        // SAFETY: the kernel reads one int (the container fd) from the pointer.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                &raw const container_fd,
            )
        };
        if ret < 0 {
            return Err(MptError::hardware_error(format!(
                "set container: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: the IOMMU type is passed by value.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(MptError::hardware_error(format!(
                "set IOMMU: {}",
                std::io::Error::last_os_error()
            )));
        }

        let name = std::ffi::CString::new(pcie_address)
            .map_err(|e| MptError::invalid_request(format!("PCIe address: {e}")))?;
        // SAFETY: name is NUL-terminated; the kernel returns a new fd or -1.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                name.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(MptError::hardware_error(format!(
                "get device fd: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: device_fd is a fresh fd we now own.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };
        // SAFETY: info is a live vfio_device_info the kernel fills in.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut info,
            )
        };
        if ret < 0 {
            return Err(MptError::hardware_error(format!(
                "get device info: {}",
                std::io::Error::last_os_error()
            )));
        }
        if info.num_regions <= REGISTER_BAR {
            return Err(MptError::hardware_error(format!(
                "{pcie_address} exposes {} regions, no register BAR",
                info.num_regions
            )));
        }
        tracing::info!(
            "VFIO device {pcie_address}: {} regions, {} IRQs",
            info.num_regions,
            info.num_irqs
        );

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            context: Arc::new(VfioContext {
                container,
                _group: group,
            }),
            device,
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
        })
    }

    /// PCIe address.
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Regions the device exposes.
    pub const fn num_regions(&self) -> u32 {
        self.num_regions
    }

    /// Interrupt index count.
    pub const fn num_irqs(&self) -> u32 {
        self.num_irqs
    }

    /// Map the MPI register window.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::HardwareError`] if the BAR cannot be mapped.
    pub fn map_registers(&self) -> Result<MappedRegion> {
        MappedRegion::map(&self.device, REGISTER_BAR)
    }

    /// Allocator for queue and frame memory.
    pub fn dma_allocator(&self) -> VfioDmaAllocator {
        VfioDmaAllocator {
            context: Arc::clone(&self.context),
            next_iova: Arc::new(Mutex::new(IOVA_BASE)),
        }
    }
}

fn open_rw(path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MptError::device_not_found(path),
            _ => MptError::hardware_error(format!("cannot open {path}: {e}")),
        })
}

// ── Device binding helpers ──────────────────────────────────────────────────

fn read_id(pcie_address: &str, attr: &str) -> Result<u16> {
    let path = format!("/sys/bus/pci/devices/{pcie_address}/{attr}");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| MptError::hardware_error(format!("cannot read {path}: {e}")))?;
    u16::from_str_radix(raw.trim().trim_start_matches("0x"), 16)
        .map_err(|e| MptError::hardware_error(format!("bad {attr} in {path}: {e}")))
}

/// Bind a controller to `vfio-pci`, detaching it from its current driver.
///
/// Requires root or CAP_SYS_ADMIN.
///
/// # Errors
///
/// Returns an error if any sysfs access fails (usually permission denied).
pub fn bind_to_vfio(pcie_address: &str) -> Result<()> {
    tracing::info!("Binding {pcie_address} to vfio-pci");

    let driver_unbind = format!("/sys/bus/pci/devices/{pcie_address}/driver/unbind");
    if Path::new(&driver_unbind).exists() {
        std::fs::write(&driver_unbind, pcie_address)
            .map_err(|e| MptError::hardware_error(format!("cannot unbind {pcie_address}: {e}")))?;
        tracing::info!("Unbound from existing driver");
    }

    let new_id = "/sys/bus/pci/drivers/vfio-pci/new_id";
    if Path::new(new_id).exists() {
        let vendor = read_id(pcie_address, "vendor")?;
        let device = read_id(pcie_address, "device")?;
        // EEXIST when the id is already registered is harmless.
        if let Err(e) = std::fs::write(new_id, format!("{vendor:04x} {device:04x}")) {
            tracing::debug!("vfio-pci/new_id: {e}");
        }
    }

    let bind = "/sys/bus/pci/drivers/vfio-pci/bind";
    if Path::new(&format!("/sys/bus/pci/drivers/vfio-pci/{pcie_address}")).exists() {
        tracing::info!("{pcie_address} already bound to vfio-pci");
        return Ok(());
    }
    std::fs::write(bind, pcie_address)
        .map_err(|e| MptError::hardware_error(format!("cannot bind to vfio-pci: {e}")))?;

    tracing::info!("{pcie_address} bound to vfio-pci");
    Ok(())
}

/// Unbind from `vfio-pci` and hand the controller back to `mpt3sas`.
///
/// # Errors
///
/// Returns an error if sysfs writes fail.
pub fn unbind_from_vfio(pcie_address: &str) -> Result<()> {
    std::fs::write("/sys/bus/pci/drivers/vfio-pci/unbind", pcie_address)
        .map_err(|e| MptError::hardware_error(format!("cannot unbind from vfio-pci: {e}")))?;

    let bind = "/sys/bus/pci/drivers/mpt3sas/bind";
    if Path::new(bind).exists() {
        std::fs::write(bind, pcie_address)
            .map_err(|e| MptError::hardware_error(format!("cannot bind to mpt3sas: {e}")))?;
        tracing::info!("{pcie_address} re-bound to mpt3sas");
    } else {
        tracing::info!("{pcie_address} unbound (mpt3sas not loaded)");
    }
    Ok(())
}

/// IOMMU group number of a PCIe device, from the `iommu_group` symlink.
///
/// # Errors
///
/// Returns [`MptError::DeviceNotFound`] if the device has no IOMMU group.
pub fn iommu_group(pcie_address: &str) -> Result<u32> {
    let link = format!("/sys/bus/pci/devices/{pcie_address}/iommu_group");
    let target = std::fs::read_link(&link).map_err(|_| MptError::device_not_found(&link))?;
    let group = target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| MptError::hardware_error(format!("cannot parse IOMMU group from {target:?}")))?;
    tracing::debug!("{pcie_address} → IOMMU group {group}");
    Ok(group)
}
