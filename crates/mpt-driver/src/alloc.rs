//! Queue and frame-pool sizing and allocation.
//!
//! Five DMA regions back the engine:
//!
//! | Region | Layout |
//! |--------|--------|
//! | queues | reply free queue (`depth` × u32), then reply post queue (`depth` × u64) |
//! | replies | `depth` reply frames of `ReplyFrameSize` × 4 bytes |
//! | requests | one request frame per SMID, SMID 0 unused |
//! | chains | `max_chains` frames of request-frame size |
//! | sense | one 252-byte sense buffer per SMID |
//!
//! Everything inside a region is addressed by index. A `QueueSet` is
//! replaced wholesale when fresh facts change its sizing, and kept (same
//! allocations) otherwise.

#![allow(clippy::cast_possible_truncation)]

use crate::config::ControllerConfig;
use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::{MptError, Result};
use crate::pool::{ChainIndex, Smid};
use mpt_chip::descriptor::UNUSED_WORD;
use mpt_chip::mpi::{self, SENSE_BUFFER_LEN};
use mpt_chip::msg::{IocFacts, IocInit};
use mpt_chip::regs::who_init;
use mpt_chip::sge::SGE_SIZE;

const QUEUE_ALIGN: usize = 16;

/// Largest post queue depth that is a multiple of 16 and fits a `u16`.
const MAX_QUEUE_DEPTH: u16 = 65520;

/// Pool and queue sizes derived from one facts snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizing {
    /// Request slots including the unusable SMID 0.
    pub num_reqs: u16,
    /// Slots `1..=num_prireqs` are high priority.
    pub num_prireqs: u16,
    /// Reply frames handed to the IOC.
    pub num_replies: u16,
    /// Depth of both reply queues.
    pub queue_depth: u16,
    /// Request (and chain) frame size in bytes.
    pub request_frame_bytes: usize,
    /// Reply frame size in bytes.
    pub reply_frame_bytes: usize,
    /// Chain frames in the pool.
    pub num_chains: u32,
    /// `IOCRequestFrameSize` in dwords, echoed in IOC Init.
    pub request_frame_dwords: u16,
}

impl QueueSizing {
    /// Size the pools for `facts` within the limits of `cfg`.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::InvalidState`] if the facts leave no usable
    /// slot or reply, and [`MptError::InvalidRequest`] if the configuration
    /// asks for no chain frames.
    pub fn compute(facts: &IocFacts, cfg: &ControllerConfig) -> Result<Self> {
        let num_reqs = cfg.max_requests.min(facts.request_credit);
        if num_reqs < 2 {
            return Err(MptError::invalid_state(format!(
                "{num_reqs} request slots (credit {})",
                facts.request_credit
            )));
        }
        let num_prireqs = cfg
            .max_prio_requests
            .min(facts.high_priority_credit)
            .min(num_reqs - 2);

        let wanted = cfg.max_replies.saturating_add(cfg.max_event_replies);
        let num_replies = wanted
            .min(facts.max_reply_descriptor_post_queue_depth)
            .min(MAX_QUEUE_DEPTH)
            .saturating_sub(1);
        if num_replies == 0 {
            return Err(MptError::invalid_state(format!(
                "post queue depth {} leaves no reply frames",
                facts.max_reply_descriptor_post_queue_depth
            )));
        }
        let queue_depth = (num_replies + 1).div_ceil(16) * 16;

        if cfg.max_chains == 0 {
            return Err(MptError::invalid_request("max_chains must be at least 1"));
        }

        Ok(Self {
            num_reqs,
            num_prireqs,
            num_replies,
            queue_depth,
            request_frame_bytes: facts.request_frame_bytes(),
            reply_frame_bytes: facts.reply_frame_bytes(),
            num_chains: cfg.max_chains,
            request_frame_dwords: facts.ioc_request_frame_size,
        })
    }

    /// SGEs that fit a chain frame.
    pub const fn chain_capacity(&self) -> usize {
        self.request_frame_bytes / SGE_SIZE
    }

    fn post_queue_offset(&self) -> usize {
        (usize::from(self.queue_depth) * 4).next_multiple_of(QUEUE_ALIGN)
    }

    fn queues_len(&self) -> usize {
        self.post_queue_offset() + usize::from(self.queue_depth) * 8
    }

    fn replies_len(&self) -> usize {
        self.reply_frame_bytes * usize::from(self.queue_depth)
    }
}

/// The DMA regions of one sizing.
#[derive(Debug, Clone)]
pub struct QueueSet {
    sizing: QueueSizing,
    queues: DmaRegion,
    replies: DmaRegion,
    requests: DmaRegion,
    chains: DmaRegion,
    sense: DmaRegion,
}

impl QueueSet {
    /// Allocate every region for `sizing`.
    ///
    /// # Errors
    ///
    /// Propagates [`MptError::DmaAllocation`]; regions already obtained are
    /// released when the partial set drops.
    pub fn allocate(allocator: &dyn DmaAllocator, sizing: QueueSizing) -> Result<Self> {
        let reqs = usize::from(sizing.num_reqs);
        let queues = allocator.allocate(sizing.queues_len())?;
        let replies = allocator.allocate(sizing.replies_len())?;
        let requests = allocator.allocate(sizing.request_frame_bytes * reqs)?;
        let chains = allocator.allocate(sizing.request_frame_bytes * sizing.num_chains as usize)?;
        let sense = allocator.allocate(SENSE_BUFFER_LEN * reqs)?;
        tracing::info!(
            "allocated {} request frames, {} replies (queue depth {}), {} chain frames",
            sizing.num_reqs,
            sizing.num_replies,
            sizing.queue_depth,
            sizing.num_chains
        );
        Ok(Self {
            sizing,
            queues,
            replies,
            requests,
            chains,
            sense,
        })
    }

    /// Sizing these regions were allocated for.
    pub const fn sizing(&self) -> &QueueSizing {
        &self.sizing
    }

    /// Whether both sets hold the very same five allocations.
    pub fn same_regions(&self, other: &Self) -> bool {
        self.queues.same_allocation(&other.queues)
            && self.replies.same_allocation(&other.replies)
            && self.requests.same_allocation(&other.requests)
            && self.chains.same_allocation(&other.chains)
            && self.sense.same_allocation(&other.sense)
    }

    /// Bus address of the reply free queue.
    pub fn free_queue_bus(&self) -> u64 {
        self.queues.bus_addr()
    }

    /// Bus address of the reply post queue.
    pub fn post_queue_bus(&self) -> u64 {
        self.queues.bus_addr() + self.sizing.post_queue_offset() as u64
    }

    /// Reset both reply queues: every post slot unused, every free-queue
    /// entry pointing at its reply frame.
    ///
    /// Returns the host free index to publish.
    pub fn init_queues(&self) -> u16 {
        let depth = usize::from(self.sizing.queue_depth);
        let post = self.sizing.post_queue_offset();
        self.queues.fill(post, depth * 8, 0xFF);
        for i in 0..depth {
            self.queues.write_u32(i * 4, self.reply_frame_bus(i) as u32);
        }
        self.sizing.num_replies
    }

    // ── Reply queues ─────────────────────────────────────────────────────

    /// Post queue descriptor `index` as (low, high) words.
    pub fn post_descriptor(&self, index: u16) -> (u32, u32) {
        let at = self.sizing.post_queue_offset() + usize::from(index) * 8;
        (self.queues.read_u32(at), self.queues.read_u32(at + 4))
    }

    /// Mark post queue descriptor `index` consumed.
    pub fn clear_post_descriptor(&self, index: u16) {
        let at = self.sizing.post_queue_offset() + usize::from(index) * 8;
        self.queues.write_u32(at, UNUSED_WORD);
        self.queues.write_u32(at + 4, UNUSED_WORD);
    }

    /// Store a reply frame address at free queue `index`.
    pub fn set_free_entry(&self, index: u16, frame_low: u32) {
        self.queues.write_u32(usize::from(index) * 4, frame_low);
    }

    /// Free queue entry `index`.
    pub fn free_entry(&self, index: u16) -> u32 {
        self.queues.read_u32(usize::from(index) * 4)
    }

    // ── Reply frames ─────────────────────────────────────────────────────

    /// Bus address of reply frame `index`.
    pub fn reply_frame_bus(&self, index: usize) -> u64 {
        self.replies.bus_addr() + (index * self.sizing.reply_frame_bytes) as u64
    }

    /// Reply frame index for the low 32 address bits an IOC reported.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::ReplyOutOfRange`] if the address is outside the
    /// pool or not on a frame boundary.
    pub fn reply_frame_index(&self, address: u32) -> Result<usize> {
        let base = self.replies.bus_addr() as u32;
        let len = self.sizing.replies_len() as u32;
        let out_of_range = || MptError::ReplyOutOfRange {
            address,
            base,
            end: base.wrapping_add(len),
        };
        let offset = address.checked_sub(base).filter(|off| *off < len).ok_or_else(out_of_range)?;
        let frame = self.sizing.reply_frame_bytes as u32;
        if offset % frame != 0 {
            return Err(out_of_range());
        }
        Ok((offset / frame) as usize)
    }

    /// Copy `len` bytes of reply frame `index`.
    pub fn read_reply(&self, index: usize, len: usize) -> Vec<u8> {
        let len = len.min(self.sizing.reply_frame_bytes);
        self.replies.to_vec(index * self.sizing.reply_frame_bytes, len)
    }

    // ── Request frames ───────────────────────────────────────────────────

    /// Region and byte offset of the request frame for `smid`.
    pub fn request_frame(&self, smid: Smid) -> (&DmaRegion, usize) {
        (
            &self.requests,
            usize::from(smid.get()) * self.sizing.request_frame_bytes,
        )
    }

    /// Bus address of the sense buffer for `smid`.
    pub fn sense_bus(&self, smid: Smid) -> u64 {
        self.sense.bus_addr() + (usize::from(smid.get()) * SENSE_BUFFER_LEN) as u64
    }

    /// Copy the sense buffer for `smid`.
    pub fn read_sense(&self, smid: Smid, len: usize) -> Vec<u8> {
        self.sense
            .to_vec(usize::from(smid.get()) * SENSE_BUFFER_LEN, len.min(SENSE_BUFFER_LEN))
    }

    // ── Chain frames ─────────────────────────────────────────────────────

    /// Region and byte offset of chain frame `index`.
    pub fn chain_frame(&self, index: ChainIndex) -> (&DmaRegion, usize) {
        (&self.chains, index.get() as usize * self.sizing.request_frame_bytes)
    }

    /// Bus address of chain frame `index`.
    pub fn chain_bus(&self, index: ChainIndex) -> u64 {
        self.chains.bus_addr() + (index.get() as usize * self.sizing.request_frame_bytes) as u64
    }

    /// Write a post queue descriptor as the IOC would.
    #[cfg(test)]
    pub(crate) fn ioc_write_post(&self, index: u16, low: u32, high: u32) {
        let at = self.sizing.post_queue_offset() + usize::from(index) * 8;
        self.queues.write_u32(at, low);
        self.queues.write_u32(at + 4, high);
    }

    /// Fill reply frame `index` as the IOC would.
    #[cfg(test)]
    pub(crate) fn ioc_write_reply(&self, index: usize, reply: &[u8]) {
        self.replies.write_bytes(index * self.sizing.reply_frame_bytes, reply);
    }

    /// IOC Init message describing these regions.
    pub fn ioc_init(&self, time_stamp: u64) -> IocInit {
        IocInit {
            who_init: who_init::HOST_DRIVER,
            msg_version: mpi::MPI2_VERSION,
            header_version: mpi::HEADER_VERSION,
            system_request_frame_size: self.sizing.request_frame_dwords,
            reply_descriptor_post_queue_depth: self.sizing.queue_depth,
            reply_free_queue_depth: self.sizing.queue_depth,
            sense_buffer_address_high: (self.sense.bus_addr() >> 32) as u32,
            system_reply_address_high: (self.replies.bus_addr() >> 32) as u32,
            system_request_frame_base_address: self.requests.bus_addr(),
            reply_descriptor_post_queue_address: self.post_queue_bus(),
            reply_free_queue_address: self.free_queue_bus(),
            time_stamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostMemory;

    fn facts() -> IocFacts {
        IocFacts {
            request_credit: 128,
            high_priority_credit: 8,
            max_reply_descriptor_post_queue_depth: 200,
            ioc_request_frame_size: 32,
            reply_frame_size: 32,
            ..IocFacts::default()
        }
    }

    fn cfg() -> ControllerConfig {
        ControllerConfig {
            max_requests: 1024,
            max_replies: 100,
            max_event_replies: 20,
            max_chains: 16,
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn sizing_clamps_to_facts() {
        let s = QueueSizing::compute(&facts(), &cfg()).unwrap();
        assert_eq!(s.num_reqs, 128);
        assert_eq!(s.num_prireqs, 8);
        assert_eq!(s.num_replies, 119);
        assert_eq!(s.queue_depth, 128);
        assert_eq!(s.request_frame_bytes, 128);
        assert_eq!(s.chain_capacity(), 8);
    }

    #[test]
    fn reply_count_limited_by_post_depth() {
        let mut f = facts();
        f.max_reply_descriptor_post_queue_depth = 64;
        let s = QueueSizing::compute(&f, &cfg()).unwrap();
        assert_eq!(s.num_replies, 63);
        assert_eq!(s.queue_depth, 64);
    }

    #[test]
    fn deepest_post_queue_fits_u16() {
        let mut f = facts();
        f.max_reply_descriptor_post_queue_depth = u16::MAX;
        let c = ControllerConfig {
            max_replies: u16::MAX,
            ..cfg()
        };
        let s = QueueSizing::compute(&f, &c).unwrap();
        assert_eq!(s.num_replies, 65519);
        assert_eq!(s.queue_depth, 65520);
    }

    #[test]
    fn degenerate_facts_rejected() {
        let mut f = facts();
        f.request_credit = 1;
        assert!(QueueSizing::compute(&f, &cfg()).is_err());
        let mut g = facts();
        g.max_reply_descriptor_post_queue_depth = 1;
        assert!(QueueSizing::compute(&g, &cfg()).is_err());
    }

    #[test]
    fn init_queues_points_free_entries_at_frames() {
        let mem = HostMemory::new();
        let s = QueueSizing::compute(&facts(), &cfg()).unwrap();
        let set = QueueSet::allocate(&mem, s).unwrap();
        assert_eq!(mem.allocation_count(), 5);
        assert_eq!(set.init_queues(), 119);
        for i in 0..s.queue_depth {
            assert_eq!(set.post_descriptor(i), (UNUSED_WORD, UNUSED_WORD));
            let frame = set.free_entry(i);
            assert_eq!(set.reply_frame_index(frame).unwrap(), usize::from(i));
        }
        assert_eq!(set.post_queue_bus() % 16, 0);
    }

    #[test]
    fn reply_address_range_checked() {
        let mem = HostMemory::new();
        let set = QueueSet::allocate(&mem, QueueSizing::compute(&facts(), &cfg()).unwrap()).unwrap();
        let base = set.reply_frame_bus(0) as u32;
        assert_eq!(set.reply_frame_index(base + 128 * 3).unwrap(), 3);
        assert!(matches!(
            set.reply_frame_index(base - 128),
            Err(MptError::ReplyOutOfRange { .. })
        ));
        assert!(set.reply_frame_index(base + 128 * 128).is_err());
        assert!(set.reply_frame_index(base + 4).is_err(), "misaligned");
    }

    #[test]
    fn ioc_init_describes_regions() {
        let mem = HostMemory::new();
        let set = QueueSet::allocate(&mem, QueueSizing::compute(&facts(), &cfg()).unwrap()).unwrap();
        let init = set.ioc_init(7);
        assert_eq!(init.reply_free_queue_address, set.free_queue_bus());
        assert_eq!(init.reply_descriptor_post_queue_address, set.post_queue_bus());
        assert_eq!(init.system_request_frame_size, 32);
        assert_eq!(init.reply_descriptor_post_queue_depth, 128);
        assert_eq!(init.time_stamp, 7);
    }

    #[test]
    fn clone_shares_allocations() {
        let mem = HostMemory::new();
        let s = QueueSizing::compute(&facts(), &cfg()).unwrap();
        let a = QueueSet::allocate(&mem, s).unwrap();
        let b = QueueSet::allocate(&mem, s).unwrap();
        assert!(a.same_regions(&a.clone()));
        assert!(!a.same_regions(&b));
    }

    #[test]
    fn partial_allocation_is_released() {
        let mem = HostMemory::new();
        mem.fail_after(3);
        let err = QueueSet::allocate(&mem, QueueSizing::compute(&facts(), &cfg()).unwrap()).unwrap_err();
        assert!(matches!(err, MptError::DmaAllocation { .. }));
        assert_eq!(mem.live_regions(), 0);
    }
}
