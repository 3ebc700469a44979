//! Memory-mapped access to the MPI system register window.
//!
//! The window sits at the start of the memory BAR
//! ([`mpt_chip::pcie::REGISTER_BAR`]). The BAR is mapped through VFIO with
//! rustix; libc is only needed for the region-info ioctl.

// Hardware register access requires exact type casts for mmap/ioctl APIs
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::items_after_statements)]

use crate::error::{MptError, Result};
use crate::regio::RegisterIo;
use mpt_chip::regs::WINDOW_SIZE;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd};

/// `struct vfio_region_info`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct VfioRegionInfo {
    /// Size of this structure
    pub argsz: u32,
    /// Region flags
    pub flags: u32,
    /// Region index (BAR number)
    pub index: u32,
    /// Offset to extended capabilities
    pub cap_offset: u32,
    /// Size of the region in bytes
    pub size: u64,
    /// Offset of the region within the device fd
    pub offset: u64,
}

/// A mapped memory BAR.
pub struct MappedRegion {
    ptr: *mut u8,
    size: usize,
    bar: u32,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively; mmap'd memory is
// process-wide and moving the owner between threads does not invalidate it.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - every access is a bounds-checked volatile 32-bit load or
// store. Ordering between registers is the engine's concern and is kept by
// the controller lock.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map BAR `bar` of a VFIO device.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::HardwareError`] if the region-info ioctl or the
    /// mmap fails, or if the BAR is smaller than the register window.
    pub fn map(device_fd: &File, bar: u32) -> Result<Self> {
        let mut region_info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index: bar,
            ..Default::default()
        };

        // VFIO_DEVICE_GET_REGION_INFO = _IOWR(';', 100 + 8, ...)
        const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = 0xc018_3b68;

        // SAFETY: the fd is an open VFIO device and region_info is a live,
        // correctly sized vfio_region_info the kernel fills in.
        let ret = unsafe {
            libc::ioctl(
                device_fd.as_raw_fd(),
                VFIO_DEVICE_GET_REGION_INFO as _,
                &raw mut region_info,
            )
        };
        if ret < 0 {
            return Err(MptError::hardware_error(format!(
                "BAR{bar} region info: {}",
                std::io::Error::last_os_error()
            )));
        }

        tracing::debug!(
            "BAR{bar}: size={:#x}, offset={:#x}, flags={:#x}",
            region_info.size,
            region_info.offset,
            region_info.flags
        );
        if (region_info.size as usize) < WINDOW_SIZE {
            return Err(MptError::hardware_error(format!(
                "BAR{bar} is {:#x} bytes, smaller than the register window",
                region_info.size
            )));
        }

        // SAFETY: size and offset come from a successful region-info ioctl
        // on the same fd; the result is valid for size bytes or an error.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                region_info.size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device_fd.as_fd(),
                region_info.offset,
            )
            .map_err(|e| MptError::hardware_error(format!("mmap BAR{bar}: {e}")))?
        };

        tracing::info!("Mapped BAR{bar} at {ptr:p}, size={:#x}", region_info.size);

        Ok(Self {
            ptr: ptr.cast(),
            size: region_info.size as usize,
            bar,
        })
    }

    /// BAR index.
    pub const fn bar(&self) -> u32 {
        self.bar
    }

    /// Mapping size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl RegisterIo for MappedRegion {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapping.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: ptr is valid for self.size bytes, offset + 4 is in bounds
        // and register offsets are 4-byte aligned.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapping.
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: as in read32; the store has hardware side effects, hence
        // volatile.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size describe the mapping made in map(), which
        // nothing else references once the owner drops.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped BAR{}", self.bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_info_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<VfioRegionInfo>(), 32);
    }
}
