//! IEEE scatter/gather elements.
//!
//! ```text
//! 0      8         12        14               15
//! ┌──────┬─────────┬─────────┬────────────────┬───────┐
//! │ addr │ length  │ rsvd    │ next chain off │ flags │
//! └──────┴─────────┴─────────┴────────────────┴───────┘
//! ```
//!
//! A simple element describes one host buffer. A chain element points at a
//! chain frame holding `length / 16` further elements; when that frame
//! itself ends in a chain element, `next_chain_offset` gives its index.

use crate::le::{put_u32, put_u64, u32_at, u64_at};

/// Size of one IEEE element.
pub const SGE_SIZE: usize = 16;

/// IEEE element flags (byte 15).
pub mod flags {
    /// Simple element.
    pub const SIMPLE_ELEMENT: u8 = 0x00;
    /// Chain element.
    pub const CHAIN_ELEMENT: u8 = 0x80;
    /// Element type mask.
    pub const ELEMENT_TYPE_MASK: u8 = 0x80;
    /// Last element of the list.
    pub const END_OF_LIST: u8 = 0x40;
    /// Address is in system memory.
    pub const SYSTEM_ADDR: u8 = 0x00;
}

/// One 16-byte IEEE element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Sge {
    /// Bus address.
    pub address: u64,
    /// Byte count (simple) or chain segment size in bytes (chain).
    pub length: u32,
    /// Index of the next chain element inside the chained frame, or 0.
    pub next_chain_offset: u8,
    /// Element flags.
    pub flags: u8,
}

impl Sge {
    /// A simple element.
    #[must_use]
    pub const fn simple(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            next_chain_offset: 0,
            flags: flags::SIMPLE_ELEMENT | flags::SYSTEM_ADDR,
        }
    }

    /// A chain element pointing at `elements` entries at `address`.
    #[must_use]
    pub const fn chain(address: u64, elements: u32, next_chain_offset: u8) -> Self {
        Self {
            address,
            length: elements * SGE_SIZE as u32,
            next_chain_offset,
            flags: flags::CHAIN_ELEMENT | flags::SYSTEM_ADDR,
        }
    }

    /// The zero-length terminator used when there is no data phase.
    #[must_use]
    pub const fn empty() -> Self {
        Self::simple(0, 0).end_of_list()
    }

    /// Mark as the last element of the list.
    #[must_use]
    pub const fn end_of_list(mut self) -> Self {
        self.flags |= flags::END_OF_LIST;
        self
    }

    /// Whether this is a chain element.
    #[must_use]
    pub const fn is_chain(&self) -> bool {
        self.flags & flags::ELEMENT_TYPE_MASK == flags::CHAIN_ELEMENT
    }

    /// Whether this element ends the list.
    #[must_use]
    pub const fn is_end_of_list(&self) -> bool {
        self.flags & flags::END_OF_LIST != 0
    }

    /// Number of elements a chain element declares.
    #[must_use]
    pub const fn chain_elements(&self) -> usize {
        self.length as usize / SGE_SIZE
    }

    /// Write the element into the first 16 bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) {
        put_u64(out, 0, self.address);
        put_u32(out, 8, self.length);
        out[12] = 0;
        out[13] = 0;
        out[14] = self.next_chain_offset;
        out[15] = self.flags;
    }

    /// Encode to a fresh array.
    #[must_use]
    pub fn encode(&self) -> [u8; SGE_SIZE] {
        let mut out = [0u8; SGE_SIZE];
        self.encode_into(&mut out);
        out
    }

    /// Read an element from the first 16 bytes of `b`.
    ///
    /// # Panics
    ///
    /// Panics if `b` is shorter than [`SGE_SIZE`].
    #[must_use]
    pub fn decode(b: &[u8]) -> Self {
        Self {
            address: u64_at(b, 0),
            length: u32_at(b, 8),
            next_chain_offset: b[14],
            flags: b[15],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_element_layout() {
        let raw = Sge::simple(0x1_0000_2000, 512).end_of_list().encode();
        assert_eq!(&raw[0..8], &0x1_0000_2000u64.to_le_bytes());
        assert_eq!(&raw[8..12], &512u32.to_le_bytes());
        assert_eq!(raw[15], flags::END_OF_LIST);
    }

    #[test]
    fn chain_element_declares_bytes() {
        let sge = Sge::chain(0x8000, 7, 6);
        assert!(sge.is_chain());
        assert!(!sge.is_end_of_list());
        assert_eq!(sge.length, 112);
        assert_eq!(sge.chain_elements(), 7);
        assert_eq!(Sge::decode(&sge.encode()), sge);
    }

    #[test]
    fn empty_terminator() {
        let sge = Sge::empty();
        assert_eq!(sge.length, 0);
        assert!(sge.is_end_of_list());
        assert!(!sge.is_chain());
    }
}
