//! Request and reply descriptors.
//!
//! Both are 64-bit little-endian words. A request descriptor is written to
//! the post FIFO low half first; a reply descriptor is written by the IOC
//! into the reply post queue and reset to all ones by the host once
//! consumed.
//!
//! ```text
//! request:  flags:8  msix:8  smid:16 | lmid:16  dev_handle:16
//! reply:    flags:8  msix:8  smid:16 | task_tag:16 rsvd:16   (success types)
//!                                    | reply_frame_address:32 (address reply)
//! ```

/// Request descriptor types (byte 0).
pub mod request_flags {
    /// SCSI IO.
    pub const SCSI_IO: u8 = 0x00;
    /// SCSI target.
    pub const SCSI_TARGET: u8 = 0x02;
    /// High priority (task management).
    pub const HIGH_PRIORITY: u8 = 0x06;
    /// Default (everything else).
    pub const DEFAULT: u8 = 0x08;
    /// RAID accelerator.
    pub const RAID_ACCELERATOR: u8 = 0x0A;
    /// Fast-path SCSI IO (MPI 2.5).
    pub const FAST_PATH_SCSI_IO: u8 = 0x0C;
}

/// Reply descriptor types (low nibble of byte 0).
pub mod reply_flags {
    /// Mask selecting the type.
    pub const TYPE_MASK: u8 = 0x0F;
    /// SCSI IO completed without a reply frame.
    pub const SCSI_IO_SUCCESS: u8 = 0x00;
    /// A reply frame was written.
    pub const ADDRESS_REPLY: u8 = 0x01;
    /// Target assist success.
    pub const TARGETASSIST_SUCCESS: u8 = 0x02;
    /// Target command buffer.
    pub const TARGET_COMMAND_BUFFER: u8 = 0x03;
    /// RAID accelerator success.
    pub const RAID_ACCELERATOR_SUCCESS: u8 = 0x05;
    /// Fast-path SCSI IO success.
    pub const FAST_PATH_SCSI_IO_SUCCESS: u8 = 0x06;
    /// Slot not yet written by the IOC.
    pub const UNUSED: u8 = 0x0F;
}

/// Value of a consumed or never-written reply descriptor word.
pub const UNUSED_WORD: u32 = 0xFFFF_FFFF;

/// Request descriptor posted to the FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Descriptor type, see [`request_flags`].
    pub request_flags: u8,
    /// Reply queue to complete on.
    pub msix_index: u8,
    /// Slot id of the request frame.
    pub smid: u16,
    /// Logical message id (RAID accelerator only).
    pub lmid: u16,
    /// Device handle (SCSI IO types).
    pub dev_handle: u16,
}

impl RequestDescriptor {
    /// Default descriptor for a non-IO request.
    #[must_use]
    pub const fn default_request(smid: u16) -> Self {
        Self {
            request_flags: request_flags::DEFAULT,
            msix_index: 0,
            smid,
            lmid: 0,
            dev_handle: 0,
        }
    }

    /// Low and high 32-bit halves in posting order.
    #[must_use]
    pub const fn words(&self) -> (u32, u32) {
        let low = self.request_flags as u32 | (self.msix_index as u32) << 8 | (self.smid as u32) << 16;
        let high = self.lmid as u32 | (self.dev_handle as u32) << 16;
        (low, high)
    }

    /// Decode from posted halves.
    #[must_use]
    pub const fn from_words(low: u32, high: u32) -> Self {
        Self {
            request_flags: (low & 0xFF) as u8,
            msix_index: ((low >> 8) & 0xFF) as u8,
            smid: (low >> 16) as u16,
            lmid: (high & 0xFFFF) as u16,
            dev_handle: (high >> 16) as u16,
        }
    }
}

/// Decoded reply descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDescriptor {
    /// No descriptor at this slot.
    Unused,
    /// SCSI IO (or fast path, or RAID accelerator) success with no reply frame.
    Success {
        /// Descriptor type.
        kind: u8,
        /// Completed slot.
        smid: u16,
    },
    /// A reply frame at `frame_address` (low 32 bits of its bus address).
    /// Slot 0 denotes an asynchronous event.
    AddressReply {
        /// Completed slot, or 0 for an event.
        smid: u16,
        /// Low 32 bits of the reply frame bus address.
        frame_address: u32,
    },
    /// A type the engine does not handle.
    Unrecognized {
        /// Descriptor type.
        kind: u8,
        /// Slot from the common header.
        smid: u16,
    },
}

impl ReplyDescriptor {
    /// Decode a descriptor from its two words.
    #[must_use]
    pub const fn decode(low: u32, high: u32) -> Self {
        let kind = (low & 0xFF) as u8 & reply_flags::TYPE_MASK;
        if kind == reply_flags::UNUSED || high == UNUSED_WORD {
            return Self::Unused;
        }
        let smid = (low >> 16) as u16;
        match kind {
            reply_flags::SCSI_IO_SUCCESS
            | reply_flags::FAST_PATH_SCSI_IO_SUCCESS
            | reply_flags::RAID_ACCELERATOR_SUCCESS => Self::Success { kind, smid },
            reply_flags::ADDRESS_REPLY => Self::AddressReply {
                smid,
                frame_address: high,
            },
            _ => Self::Unrecognized { kind, smid },
        }
    }

    /// Encode as the IOC would write it.
    #[must_use]
    pub const fn encode(&self) -> (u32, u32) {
        match *self {
            Self::Unused => (UNUSED_WORD, UNUSED_WORD),
            Self::Success { kind, smid } | Self::Unrecognized { kind, smid } => {
                (kind as u32 | (smid as u32) << 16, 0)
            }
            Self::AddressReply { smid, frame_address } => (
                reply_flags::ADDRESS_REPLY as u32 | (smid as u32) << 16,
                frame_address,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_words() {
        let d = RequestDescriptor {
            request_flags: request_flags::SCSI_IO,
            msix_index: 0,
            smid: 0x0102,
            lmid: 0,
            dev_handle: 0x0009,
        };
        assert_eq!(d.words(), (0x0102_0000, 0x0009_0000));
        let (lo, hi) = d.words();
        assert_eq!(RequestDescriptor::from_words(lo, hi), d);
    }

    #[test]
    fn unused_descriptors() {
        assert_eq!(ReplyDescriptor::decode(UNUSED_WORD, UNUSED_WORD), ReplyDescriptor::Unused);
        // a valid type with an all-ones high word is still unused
        assert_eq!(ReplyDescriptor::decode(0x0003_0000, UNUSED_WORD), ReplyDescriptor::Unused);
    }

    #[test]
    fn address_reply_carries_frame() {
        let d = ReplyDescriptor::decode(0x0000_0001, 0x8000_0400);
        assert_eq!(
            d,
            ReplyDescriptor::AddressReply {
                smid: 0,
                frame_address: 0x8000_0400
            }
        );
        let (lo, hi) = d.encode();
        assert_eq!(ReplyDescriptor::decode(lo, hi), d);
    }

    #[test]
    fn success_kinds() {
        for kind in [
            reply_flags::SCSI_IO_SUCCESS,
            reply_flags::FAST_PATH_SCSI_IO_SUCCESS,
            reply_flags::RAID_ACCELERATOR_SUCCESS,
        ] {
            let low = u32::from(kind) | 5 << 16;
            assert_eq!(ReplyDescriptor::decode(low, 0), ReplyDescriptor::Success { kind, smid: 5 });
        }
        assert!(matches!(
            ReplyDescriptor::decode(0x0002_0002, 0),
            ReplyDescriptor::Unrecognized { kind: 2, smid: 2 }
        ));
    }
}
