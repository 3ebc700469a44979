//! Silicon model for LSI/Broadcom Fusion-MPT SAS2/SAS3 controllers.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the MPI 2 host interface: the system register window, the
//! doorbell word format, message layouts exchanged over the doorbell and the
//! request queue, IEEE scatter/gather elements, and the 64-bit request and
//! reply descriptors.
//!
//! All multi-byte wire values are little-endian. Encoders write into byte
//! slices and decoders read from them, so the same code serves a real DMA
//! buffer and the software IOC model in `mpt-driver`.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, register BAR, chip variants |
//! | [`regs`] | System register offsets and bit definitions |
//! | [`mpi`] | Function codes, IOC states, IOCStatus, event codes |
//! | [`msg`] | Message layouts: IOC Facts/Init, Event Notification, Config, SCSI IO |
//! | [`sge`] | IEEE simple and chain scatter/gather elements |
//! | [`descriptor`] | Request descriptor encoding, reply descriptor decoding |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod descriptor;
pub mod mpi;
pub mod msg;
pub mod pcie;
pub mod regs;
pub mod sge;

pub(crate) mod le {
    //! Little-endian field access on byte slices.

    pub fn u16_at(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes([buf[off], buf[off + 1]])
    }

    pub fn u32_at(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
    }

    pub fn u64_at(buf: &[u8], off: usize) -> u64 {
        u64::from(u32_at(buf, off)) | (u64::from(u32_at(buf, off + 4)) << 32)
    }

    pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}
