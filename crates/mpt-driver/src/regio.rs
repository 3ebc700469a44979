//! Register access layer.
//!
//! [`RegisterIo`] is the seam between the engine and the hardware. It is
//! implemented by [`crate::mmio::MappedRegion`] for a real BAR and by
//! [`crate::sim::SimulatedIoc`] for the software model. [`Registers`] wraps
//! it with one accessor per MPI system register.

use mpt_chip::mpi::IocState;
use mpt_chip::regs;

/// 32-bit access to the MPI system register window.
///
/// Implementations must not reorder accesses: the engine relies on the low
/// half of a request descriptor reaching the IOC before the high half.
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register at a byte offset.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register at a byte offset.
    fn write32(&self, offset: usize, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for std::sync::Arc<T> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value);
    }
}

/// Typed view over a [`RegisterIo`].
#[derive(Debug)]
pub struct Registers<R>(pub R);

macro_rules! reg32 {
    ($get:ident, $set:ident, $reg:ident) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> u32 {
            self.0.read32(regs::$reg)
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: u32) {
            self.0.write32(regs::$reg, v)
        }
    };
}

impl<R: RegisterIo> Registers<R> {
    reg32!(doorbell, set_doorbell, DOORBELL);
    reg32!(write_sequence, set_write_sequence, WRITE_SEQUENCE);
    reg32!(host_diagnostic, set_host_diagnostic, HOST_DIAGNOSTIC);
    reg32!(interrupt_status, set_interrupt_status, HOST_INTERRUPT_STATUS);
    reg32!(interrupt_mask, set_interrupt_mask, HOST_INTERRUPT_MASK);
    reg32!(reply_free_host_index, set_reply_free_host_index, REPLY_FREE_HOST_INDEX);
    reg32!(reply_post_host_index, set_reply_post_host_index, REPLY_POST_HOST_INDEX);

    /// Clear the doorbell interrupt. Any written value clears it.
    pub fn clear_interrupt_status(&self) {
        self.set_interrupt_status(0);
    }

    /// IOC state from the doorbell.
    pub fn ioc_state(&self) -> IocState {
        IocState::from_doorbell(self.doorbell())
    }

    /// Post a request descriptor, low half first.
    pub fn post_request(&self, low: u32, high: u32) {
        self.0.write32(regs::REQUEST_DESCRIPTOR_POST_LOW, low);
        self.0.write32(regs::REQUEST_DESCRIPTOR_POST_HIGH, high);
    }

    /// Mask doorbell and reply interrupts.
    pub fn mask_interrupts(&self) {
        let mask = self.interrupt_mask();
        self.set_interrupt_mask(mask | regs::him::ENGINE);
    }

    /// Unmask doorbell and reply interrupts.
    pub fn unmask_interrupts(&self) {
        let mask = self.interrupt_mask();
        self.set_interrupt_mask(mask & !regs::him::ENGINE);
    }
}
