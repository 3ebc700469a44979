//! MPI 2 system register window.
//!
//! The window is 256 bytes of 32-bit registers at the start of the memory
//! BAR (see [`crate::pcie::REGISTER_BAR`]). Only the registers the queue
//! engine touches are listed.
//!
//! ```text
//! 0x00  Doorbell                  state | used | who-init | function / data
//! 0x04  WriteSequence             diagnostic unlock keys
//! 0x08  HostDiagnostic            write-enable, reset-adapter
//! 0x30  HostInterruptStatus       doorbell and reply interrupts (write clears)
//! 0x34  HostInterruptMask
//! 0x48  ReplyFreeHostIndex
//! 0x6C  ReplyPostHostIndex
//! 0xC0  RequestDescriptorPostLow  written first
//! 0xC4  RequestDescriptorPostHigh written second, triggers the post
//! ```

// ── Offsets ──────────────────────────────────────────────────────────────────

/// System doorbell.
pub const DOORBELL: usize = 0x00;
/// Diagnostic unlock sequence.
pub const WRITE_SEQUENCE: usize = 0x04;
/// Host diagnostic control.
pub const HOST_DIAGNOSTIC: usize = 0x08;
/// Host interrupt status. Any write clears the doorbell interrupt.
pub const HOST_INTERRUPT_STATUS: usize = 0x30;
/// Host interrupt mask.
pub const HOST_INTERRUPT_MASK: usize = 0x34;
/// Host producer index of the reply free queue.
pub const REPLY_FREE_HOST_INDEX: usize = 0x48;
/// Host consumer index of the reply descriptor post queue.
pub const REPLY_POST_HOST_INDEX: usize = 0x6C;
/// Low word of the request descriptor post FIFO.
pub const REQUEST_DESCRIPTOR_POST_LOW: usize = 0xC0;
/// High word of the request descriptor post FIFO.
pub const REQUEST_DESCRIPTOR_POST_HIGH: usize = 0xC4;

/// Size of the system register window in bytes.
pub const WINDOW_SIZE: usize = 0x100;

// ── Doorbell ─────────────────────────────────────────────────────────────────

/// Doorbell word fields.
pub mod doorbell {
    /// IOC state field (see [`crate::mpi::IocState`]).
    pub const STATE_MASK: u32 = 0xF000_0000;
    /// Shift of the IOC state field.
    pub const STATE_SHIFT: u32 = 28;
    /// Set while a doorbell handshake owns the register.
    pub const USED: u32 = 0x0800_0000;
    /// Which agent last initialized the IOC.
    pub const WHO_INIT_MASK: u32 = 0x0700_0000;
    /// Shift of the who-init field.
    pub const WHO_INIT_SHIFT: u32 = 24;
    /// Fault code carried in the low half while in the fault state.
    pub const FAULT_CODE_MASK: u32 = 0x0000_FFFF;
    /// 16-bit handshake data.
    pub const DATA_MASK: u32 = 0x0000_FFFF;
    /// Shift of the function field in a doorbell command.
    pub const FUNCTION_SHIFT: u32 = 24;
    /// Shift of the dword count in a handshake announcement.
    pub const ADD_DWORDS_SHIFT: u32 = 16;
}

/// Who-init values in the doorbell.
pub mod who_init {
    /// Nobody has initialized the IOC.
    pub const NONE: u8 = 0x00;
    /// System BIOS.
    pub const SYSTEM_BIOS: u8 = 0x01;
    /// ROM BIOS.
    pub const ROM_BIOS: u8 = 0x02;
    /// A PCI peer owns the IOC.
    pub const PCI_PEER: u8 = 0x03;
    /// A host driver.
    pub const HOST_DRIVER: u8 = 0x04;
    /// Manufacturing.
    pub const MANUFACTURING: u8 = 0x05;
}

// ── Host interrupt status / mask ─────────────────────────────────────────────

/// Host interrupt status bits.
pub mod his {
    /// IOC wrote the doorbell (handshake data or acknowledgement ready).
    pub const IOC2SYS_DB_STATUS: u32 = 0x0000_0001;
    /// Reply descriptors are pending in the post queue.
    pub const REPLY_DESCRIPTOR_INTERRUPT: u32 = 0x0000_0008;
    /// Host wrote the doorbell and the IOC has not consumed it yet.
    pub const SYS2IOC_DB_STATUS: u32 = 0x8000_0000;
}

/// Host interrupt mask bits. A set bit suppresses the interrupt.
pub mod him {
    /// Doorbell interrupt.
    pub const DOORBELL: u32 = 0x0000_0001;
    /// Reply descriptor interrupt.
    pub const REPLY: u32 = 0x0000_0008;
    /// Reset interrupt.
    pub const RESET_IRQ: u32 = 0x4000_0000;
    /// Everything the engine masks during reset.
    pub const ENGINE: u32 = DOORBELL | REPLY;
}

// ── Host diagnostic ──────────────────────────────────────────────────────────

/// Host diagnostic bits.
pub mod diag {
    /// Host boot source is the HCB.
    pub const HCB_MODE: u32 = 0x0000_0100;
    /// Writes to this register are unlocked.
    pub const DIAG_WRITE_ENABLE: u32 = 0x0000_0080;
    /// Reset the adapter. Reads back set until the reset completes.
    pub const RESET_ADAPTER: u32 = 0x0000_0004;
    /// Hold the IOC in reset.
    pub const HOLD_IOC_RESET: u32 = 0x0000_0002;
}

/// Diagnostic unlock sequence written to [`WRITE_SEQUENCE`], one key per write.
pub const UNLOCK_KEYS: [u32; 7] = [0x0, 0xF, 0x4, 0xB, 0x2, 0x7, 0xD];

/// Key written to [`WRITE_SEQUENCE`] to relock the diagnostic register.
pub const FLUSH_KEY: u32 = 0x0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_halves_are_adjacent() {
        assert_eq!(REQUEST_DESCRIPTOR_POST_HIGH - REQUEST_DESCRIPTOR_POST_LOW, 4);
        assert!(REQUEST_DESCRIPTOR_POST_HIGH + 4 <= WINDOW_SIZE);
    }

    #[test]
    fn doorbell_fields_are_disjoint() {
        assert_eq!(doorbell::STATE_MASK & doorbell::USED, 0);
        assert_eq!(doorbell::USED & doorbell::WHO_INIT_MASK, 0);
        assert_eq!(doorbell::WHO_INIT_MASK & doorbell::DATA_MASK, 0);
    }

    #[test]
    fn unlock_sequence_starts_with_flush() {
        assert_eq!(UNLOCK_KEYS[0], FLUSH_KEY);
        assert_eq!(UNLOCK_KEYS.len(), 7);
    }
}
