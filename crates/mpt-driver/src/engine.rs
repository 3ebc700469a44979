//! Request posting and reply draining.
//!
//! ```text
//!            post (descriptor FIFO)
//!   host ───────────────────────────────▶ IOC
//!    ▲                                      │
//!    │   reply post queue (descriptors)     │
//!    └───────────────────────────────────── ┤
//!    │   reply free queue (frame addresses) │
//!    └─────────────────────────────────────▶┘
//! ```
//!
//! [`Engine`] owns the queues and the command pool of one allocation. It is
//! only ever used through the controller lock.

#![allow(clippy::cast_possible_truncation)]

use crate::alloc::QueueSet;
use crate::error::{MptError, Result};
use crate::events::EventNotification;
use crate::pool::{CommandPool, CommandState, Smid};
use crate::ratelimit::RateLimiter;
use crate::regio::{RegisterIo, Registers};
use crate::request::{Completer, Completion, Outcome, Request, Submission};
use crate::sgl;
use bytes::Bytes;
use mpt_chip::descriptor::{ReplyDescriptor, RequestDescriptor};
use mpt_chip::mpi::function;
use mpt_chip::msg::{self, ScsiIoReply};
use std::sync::mpsc;

const SCSI_STATE_AUTOSENSE_VALID: u8 = 0x01;

/// Follow-up work found while draining, run after the lock is released.
#[derive(Debug)]
pub(crate) enum Deferred {
    /// Dispatch to event listeners.
    Event(EventNotification),
    /// Event re-registration after a reset finished.
    StartDiscovery,
}

/// Queues, pool and indices of one allocation.
#[derive(Debug)]
pub struct Engine {
    queues: QueueSet,
    pool: CommandPool,
    reply_post_index: u16,
    reply_free_index: u16,
    io_cmds_active: u32,
}

impl Engine {
    /// Engine over freshly allocated queues; call [`Self::init_queues`]
    /// before IOC Init.
    pub fn new(queues: QueueSet) -> Self {
        let s = *queues.sizing();
        Self {
            pool: CommandPool::new(s.num_reqs, s.num_prireqs, s.num_chains),
            queues,
            reply_post_index: 0,
            reply_free_index: 0,
            io_cmds_active: 0,
        }
    }

    /// The DMA regions.
    pub const fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// The command pool.
    pub const fn pool(&self) -> &CommandPool {
        &self.pool
    }

    /// Next post queue slot to examine.
    pub const fn reply_post_index(&self) -> u16 {
        self.reply_post_index
    }

    /// Last free queue slot handed to the IOC.
    pub const fn reply_free_index(&self) -> u16 {
        self.reply_free_index
    }

    /// Commands submitted and not yet completed.
    pub const fn io_cmds_active(&self) -> u32 {
        self.io_cmds_active
    }

    /// Reset both reply queues and the host indices.
    pub fn init_queues(&mut self) {
        self.reply_free_index = self.queues.init_queues();
        self.reply_post_index = 0;
    }

    /// Publish the host indices after IOC Init.
    pub fn publish_indices<R: RegisterIo>(&self, regs: &Registers<R>) {
        regs.set_reply_free_host_index(u32::from(self.reply_free_index));
        regs.set_reply_post_host_index(u32::from(self.reply_post_index));
    }

    /// Place `request` in a free slot and post it.
    ///
    /// # Errors
    ///
    /// - [`MptError::Exhausted`] if no slot or chain frame is free
    /// - [`MptError::InvalidRequest`] if the message does not fit the frame
    pub(crate) fn post<R: RegisterIo>(
        &mut self,
        regs: &Registers<R>,
        request: &Request,
        completer: Completer,
        chain_log: &RateLimiter,
    ) -> Result<Smid> {
        let frame_bytes = self.queues.sizing().request_frame_bytes;
        if request.frame.len() > frame_bytes || request.frame.len() < 4 {
            return Err(MptError::invalid_request(format!(
                "{}-byte message for a {frame_bytes}-byte frame",
                request.frame.len()
            )));
        }
        let smid = self.pool.alloc(request.priority)?;
        if let Err(e) = self.fill_frame(smid, request, chain_log) {
            self.pool.release(smid);
            return Err(e);
        }

        if let Some(cmd) = self.pool.command_mut(smid) {
            cmd.function = request.function();
            cmd.completer = Some(completer);
            cmd.mark_submitted();
        }
        self.io_cmds_active += 1;

        let desc = RequestDescriptor {
            request_flags: request.request_flags,
            msix_index: 0,
            smid: smid.get(),
            lmid: 0,
            dev_handle: request.dev_handle,
        };
        let (low, high) = desc.words();
        tracing::trace!("post {smid} function {:#04x}", request.function());
        regs.post_request(low, high);
        Ok(smid)
    }

    fn fill_frame(&mut self, smid: Smid, request: &Request, chain_log: &RateLimiter) -> Result<()> {
        let frame_bytes = self.queues.sizing().request_frame_bytes;
        let (region, base) = self.queues.request_frame(smid);
        region.fill(base, frame_bytes, 0);
        region.write_bytes(base, &request.frame);

        if let Some(offset) = request.sgl_offset {
            let sges = sgl::elements(&request.segments, request.direction);
            let layout = sgl::write_sgl(&mut self.pool, &self.queues, smid, &sges, offset, chain_log)?;
            if let Some(chain_offset) = layout.chain_offset {
                let (region, base) = self.queues.request_frame(smid);
                region.write_bytes(base + msg::CHAIN_OFFSET, &[chain_offset]);
            }
        } else if !request.segments.is_empty() {
            return Err(MptError::invalid_request("segments without an SGL offset"));
        }

        if request.is_scsi_io() {
            let (region, base) = self.queues.request_frame(smid);
            let sense = self.queues.sense_bus(smid) as u32;
            region.write_bytes(base + msg::SCSI_IO_SENSE_LOW, &sense.to_le_bytes());
        }
        Ok(())
    }

    /// Consume every posted reply descriptor.
    ///
    /// Caller completions are delivered here; events and other follow-ups
    /// are returned.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::ReplyOutOfRange`] if a descriptor points outside
    /// the reply pool. The queues are then inconsistent and the controller
    /// must stop.
    pub(crate) fn drain<R: RegisterIo>(&mut self, regs: &Registers<R>) -> Result<Vec<Deferred>> {
        let depth = self.queues.sizing().queue_depth;
        let start = self.reply_post_index;
        let mut deferred = Vec::new();

        loop {
            let index = self.reply_post_index;
            let (low, high) = self.queues.post_descriptor(index);
            let desc = ReplyDescriptor::decode(low, high);
            if desc == ReplyDescriptor::Unused {
                break;
            }
            self.reply_post_index = (index + 1) % depth;

            match desc {
                ReplyDescriptor::Success { smid, .. } => {
                    self.complete(smid, Outcome::Success, &mut deferred);
                }
                ReplyDescriptor::AddressReply {
                    smid,
                    frame_address,
                } => {
                    let frame = match self.queues.reply_frame_index(frame_address) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::error!("reply descriptor {index} for SMID {smid}: {e}");
                            self.queues.clear_post_descriptor(index);
                            regs.set_reply_post_host_index(u32::from(self.reply_post_index));
                            return Err(e);
                        }
                    };
                    let frame_bytes = self.queues.sizing().reply_frame_bytes;
                    let head = self.queues.read_reply(frame, 4);
                    let len = msg::reply_len(&head).clamp(msg::DEFAULT_REPLY_LEN.min(frame_bytes), frame_bytes);
                    let reply = self.queues.read_reply(frame, len);
                    if smid == 0 {
                        match EventNotification::parse(&reply) {
                            Some(ev) => deferred.push(Deferred::Event(ev)),
                            None => tracing::warn!("malformed event reply at frame {frame}"),
                        }
                    } else {
                        self.complete(smid, Outcome::Reply(Bytes::from(reply)), &mut deferred);
                    }
                    self.free_reply(regs, frame);
                }
                ReplyDescriptor::Unrecognized { kind, smid } => {
                    tracing::warn!("unhandled reply descriptor type {kind:#x} for SMID {smid}");
                }
                ReplyDescriptor::Unused => {}
            }
            self.queues.clear_post_descriptor(index);
        }

        if self.reply_post_index != start {
            regs.set_reply_post_host_index(u32::from(self.reply_post_index));
        }
        Ok(deferred)
    }

    /// Hand reply frame `frame` back to the IOC.
    pub fn free_reply<R: RegisterIo>(&mut self, regs: &Registers<R>, frame: usize) {
        let depth = self.queues.sizing().queue_depth;
        self.reply_free_index = (self.reply_free_index + 1) % depth;
        let bus = self.queues.reply_frame_bus(frame) as u32;
        self.queues.set_free_entry(self.reply_free_index, bus);
        regs.set_reply_free_host_index(u32::from(self.reply_free_index));
    }

    fn complete(&mut self, raw: u16, outcome: Outcome, deferred: &mut Vec<Deferred>) {
        let Some(smid) = Smid::new(raw) else {
            tracing::warn!("completion for SMID 0 dropped");
            return;
        };
        let Some(cmd) = self
            .pool
            .command_mut(smid)
            .filter(|c| c.state() == CommandState::Submitted)
        else {
            tracing::warn!("completion for {smid}, which is not outstanding");
            return;
        };
        let completer = cmd.completer.take();
        let function = cmd.function;

        let sense = match &outcome {
            Outcome::Reply(b) if function == function::SCSI_IO_REQUEST => ScsiIoReply::parse(b)
                .filter(|r| r.scsi_state & SCSI_STATE_AUTOSENSE_VALID != 0 && r.sense_count > 0)
                .map(|r| Bytes::from(self.queues.read_sense(smid, r.sense_count as usize))),
            _ => None,
        };

        self.pool.release(smid);
        if let Some(n) = self.io_cmds_active.checked_sub(1) {
            self.io_cmds_active = n;
        } else {
            tracing::warn!("in-flight count underflow completing {smid}");
        }

        match completer {
            Some(Completer::Caller(tx)) => {
                let _ = tx.try_send(Completion {
                    smid,
                    outcome,
                    sense,
                });
            }
            Some(Completer::EventReregistration) => {
                if outcome == Outcome::DroppedByReset {
                    tracing::debug!("event re-registration dropped by reset");
                } else {
                    deferred.push(Deferred::StartDiscovery);
                }
            }
            None => tracing::warn!("{smid} completed without a completer"),
        }
    }

    /// Complete every outstanding command with [`Outcome::DroppedByReset`].
    pub(crate) fn flush(&mut self) -> Vec<Deferred> {
        let mut deferred = Vec::new();
        let outstanding = self.pool.submitted();
        if !outstanding.is_empty() {
            tracing::info!("completing {} in-flight command(s) after reset", outstanding.len());
        }
        for smid in outstanding {
            self.complete(smid.get(), Outcome::DroppedByReset, &mut deferred);
        }
        self.io_cmds_active = 0;
        deferred
    }

    /// Carry the allocation over to a fresh engine with the same queues.
    pub(crate) fn into_queues(self) -> QueueSet {
        self.queues
    }
}

/// Channel pair for one submission.
pub(crate) fn completion_channel() -> (Completer, impl FnOnce(Smid) -> Submission) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Completer::Caller(tx), move |smid| Submission::new(smid, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::QueueSizing;
    use crate::config::ControllerConfig;
    use crate::dma::HostMemory;
    use crate::request::{Direction, Segment};
    use mpt_chip::descriptor::reply_flags;
    use mpt_chip::msg::IocFacts;
    use mpt_chip::regs;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Bar {
        writes: Mutex<Vec<(usize, u32)>>,
    }

    impl RegisterIo for Bar {
        fn read32(&self, _offset: usize) -> u32 {
            0
        }
        fn write32(&self, offset: usize, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
        }
    }

    impl Bar {
        fn writes_to(&self, offset: usize) -> Vec<u32> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(o, _)| *o == offset)
                .map(|(_, v)| *v)
                .collect()
        }
    }

    fn engine() -> (HostMemory, Engine) {
        let facts = IocFacts {
            request_credit: 16,
            max_reply_descriptor_post_queue_depth: 32,
            ioc_request_frame_size: 32,
            reply_frame_size: 32,
            ..IocFacts::default()
        };
        let cfg = ControllerConfig {
            max_chains: 8,
            ..ControllerConfig::default()
        };
        let mem = HostMemory::new();
        let set = QueueSet::allocate(&mem, QueueSizing::compute(&facts, &cfg).unwrap()).unwrap();
        let mut e = Engine::new(set);
        e.init_queues();
        (mem, e)
    }

    fn submit(e: &mut Engine, regs: &Registers<Bar>) -> Submission {
        let (completer, finish) = completion_channel();
        let req = Request::message(msg::default_reply(function::PORT_ENABLE, 0, 0).to_vec());
        let rl = RateLimiter::new(Duration::from_secs(60));
        finish(e.post(regs, &req, completer, &rl).unwrap())
    }

    fn ioc_posts(e: &Engine, at: u16, desc: ReplyDescriptor) {
        let (lo, hi) = desc.encode();
        e.queues().ioc_write_post(at, lo, hi);
    }

    #[test]
    fn empty_queue_drain_is_noop() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        assert!(e.drain(&regs).unwrap().is_empty());
        assert_eq!(e.reply_post_index(), 0);
        assert!(regs.0.writes_to(regs::REPLY_POST_HOST_INDEX).is_empty());
    }

    #[test]
    fn drains_k_descriptors_in_order() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let subs: Vec<_> = (0..3).map(|_| submit(&mut e, &regs)).collect();
        assert_eq!(e.io_cmds_active(), 3);
        for (i, s) in subs.iter().enumerate() {
            ioc_posts(&e, i as u16, ReplyDescriptor::Success { kind: reply_flags::SCSI_IO_SUCCESS, smid: s.smid().get() });
        }
        e.drain(&regs).unwrap();
        assert_eq!(e.reply_post_index(), 3);
        assert_eq!(regs.0.writes_to(regs::REPLY_POST_HOST_INDEX), vec![3]);
        for s in &subs {
            let c = s.try_completion().unwrap();
            assert_eq!(c.outcome, Outcome::Success);
            assert_eq!(c.smid, s.smid());
        }
        assert_eq!(e.io_cmds_active(), 0);
        assert_eq!(e.pool().free_count(), 15);
        // consumed slots are unused again
        assert_eq!(e.queues().post_descriptor(0), (u32::MAX, u32::MAX));
    }

    #[test]
    fn address_reply_copies_frame_and_recycles_it() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let sub = submit(&mut e, &regs);
        let frame = e.queues().reply_frame_bus(5);
        let reply = msg::default_reply(function::PORT_ENABLE, 0, 0);
        e.queues().ioc_write_reply(5, &reply);
        let free_before = e.reply_free_index();
        ioc_posts(&e, 0, ReplyDescriptor::AddressReply { smid: sub.smid().get(), frame_address: frame as u32 });
        e.drain(&regs).unwrap();
        let c = sub.try_completion().unwrap();
        assert_eq!(c.outcome, Outcome::Reply(Bytes::copy_from_slice(&reply)));
        assert!(c.is_success());
        let idx = (free_before + 1) % e.queues().sizing().queue_depth;
        assert_eq!(e.reply_free_index(), idx);
        assert_eq!(e.queues().free_entry(idx), frame as u32);
        assert_eq!(regs.0.writes_to(regs::REPLY_FREE_HOST_INDEX), vec![u32::from(idx)]);
    }

    #[test]
    fn event_reply_is_deferred() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let frame = e.queues().reply_frame_bus(2);
        e.queues().ioc_write_reply(2, &msg::event_reply(0x16, 1, false, &[0; 8]));
        ioc_posts(&e, 0, ReplyDescriptor::AddressReply { smid: 0, frame_address: frame as u32 });
        let out = e.drain(&regs).unwrap();
        assert!(matches!(&out[..], [Deferred::Event(ev)] if ev.event == 0x16 && ev.data.len() == 8));
    }

    #[test]
    fn out_of_range_reply_is_fatal() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let sub = submit(&mut e, &regs);
        ioc_posts(&e, 0, ReplyDescriptor::AddressReply { smid: sub.smid().get(), frame_address: 0x10 });
        assert!(matches!(e.drain(&regs), Err(MptError::ReplyOutOfRange { .. })));
    }

    #[test]
    fn stray_completion_ignored() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        ioc_posts(&e, 0, ReplyDescriptor::Success { kind: 0, smid: 7 });
        e.drain(&regs).unwrap();
        assert_eq!(e.reply_post_index(), 1);
        assert_eq!(e.pool().free_count(), 15);
    }

    #[test]
    fn unrecognized_descriptor_consumed_without_completion() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let sub = submit(&mut e, &regs);
        ioc_posts(&e, 0, ReplyDescriptor::Unrecognized { kind: 2, smid: sub.smid().get() });
        assert!(e.drain(&regs).unwrap().is_empty());
        assert_eq!(e.reply_post_index(), 1);
        assert_eq!(regs.0.writes_to(regs::REPLY_POST_HOST_INDEX), vec![1]);
        assert_eq!(e.queues().post_descriptor(0), (u32::MAX, u32::MAX));
        assert_eq!(e.io_cmds_active(), 1);
        assert!(sub.try_completion().is_none());
    }

    #[test]
    fn in_flight_count_does_not_wrap() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let sub = submit(&mut e, &regs);
        e.io_cmds_active = 0;
        ioc_posts(&e, 0, ReplyDescriptor::Success { kind: reply_flags::SCSI_IO_SUCCESS, smid: sub.smid().get() });
        e.drain(&regs).unwrap();
        assert_eq!(e.io_cmds_active(), 0);
        assert_eq!(sub.try_completion().unwrap().outcome, Outcome::Success);
        assert_eq!(e.pool().free_count(), 15);
    }

    #[test]
    fn flush_drops_everything() {
        let (_mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let subs: Vec<_> = (0..4).map(|_| submit(&mut e, &regs)).collect();
        e.flush();
        for s in subs {
            assert_eq!(s.try_completion().unwrap().outcome, Outcome::DroppedByReset);
        }
        assert!(e.pool().submitted().is_empty());
        assert_eq!(e.io_cmds_active(), 0);
    }

    #[test]
    fn scsi_io_gets_sense_address_and_sgl() {
        let (mem, mut e) = engine();
        let regs = Registers(Bar::default());
        let io = msg::ScsiIoRequest {
            dev_handle: 9,
            data_length: 4096,
            control: msg::scsi_control::READ,
            cdb_len: 10,
            ..msg::ScsiIoRequest::default()
        };
        let segs: Vec<_> = (0..5).map(|i| Segment { address: 0x8000 + i * 0x1000, length: 0x1000 }).collect();
        let req = Request::scsi_io(&io).with_segments(segs, Direction::Read);
        let (completer, finish) = completion_channel();
        let rl = RateLimiter::new(Duration::from_secs(60));
        let sub = finish(e.post(&regs, &req, completer, &rl).unwrap());
        let (region, base) = e.queues().request_frame(sub.smid());
        assert_eq!(region.read_u32(base + msg::SCSI_IO_SENSE_LOW), e.queues().sense_bus(sub.smid()) as u32);
        assert_eq!(region.to_vec(base + msg::CHAIN_OFFSET, 1)[0], 7);
        assert_eq!(e.pool().command(sub.smid()).unwrap().chains().len(), 1);
        let (lo, hi) = (
            regs.0.writes_to(regs::REQUEST_DESCRIPTOR_POST_LOW),
            regs.0.writes_to(regs::REQUEST_DESCRIPTOR_POST_HIGH),
        );
        let d = RequestDescriptor::from_words(lo[0], hi[0]);
        assert_eq!(d.smid, sub.smid().get());
        assert_eq!(d.dev_handle, 9);
        assert_eq!(mem.live_regions(), 5);
    }
}
