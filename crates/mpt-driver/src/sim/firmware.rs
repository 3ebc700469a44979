//! Message handling inside the simulated IOC.

#![allow(clippy::cast_possible_truncation)]

use super::Ioc;
use crate::dma::{DmaRegion, HostMemory};
use crate::request::Segment;
use mpt_chip::descriptor::{reply_flags, ReplyDescriptor, RequestDescriptor, UNUSED_WORD};
use mpt_chip::mpi::{function, ioc_status, IocState};
use mpt_chip::msg::{
    self, config_action, page_type, ConfigRequest, IocInit, IocPage8, ScsiIoReply, SCSI_IO_SENSE_LOW,
    SCSI_IO_SGL_OFFSET0,
};
use mpt_chip::regs::his;
use mpt_chip::sge::{Sge, SGE_SIZE};

const MAX_SGES: usize = 4096;
const SCSI_STATUS_CHECK_CONDITION: u8 = 0x02;
const SCSI_STATE_AUTOSENSE_VALID: u8 = 0x01;

/// One SCSI IO the IOC received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRecord {
    /// Slot the request occupied.
    pub smid: u16,
    /// Target device handle.
    pub dev_handle: u16,
    /// First CDB byte.
    pub opcode: u8,
    /// `Control` word (data direction).
    pub control: u32,
    /// Buffers found by walking the SGL, chains followed.
    pub segments: Vec<Segment>,
}

/// How to fail a SCSI IO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoFailure {
    /// IOCStatus of the reply.
    pub ioc_status: u16,
    /// SCSI status byte; check condition when sense is given and this is 0.
    pub scsi_status: u8,
    /// Autosense bytes written to the slot's sense buffer.
    pub sense: Vec<u8>,
}

/// Queue state established by IOC Init.
#[derive(Debug)]
pub(super) struct Queues {
    init: IocInit,
    requests: (DmaRegion, usize),
    post: (DmaRegion, usize),
    free: (DmaRegion, usize),
    frame_bytes: usize,
    depth: u16,
    pub(super) post_index: u16,
    free_index: u16,
}

fn walk_sgl(memory: &HostMemory, frame: &[u8], offset: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut buf = frame.to_vec();
    let mut at = offset;
    for _ in 0..MAX_SGES {
        if at + SGE_SIZE > buf.len() {
            tracing::warn!("sim: SGL runs off its frame");
            break;
        }
        let sge = Sge::decode(&buf[at..]);
        if sge.is_chain() {
            let len = sge.length as usize;
            let Some((region, off)) = memory.resolve(sge.address, len) else {
                tracing::warn!("sim: chain element at unmapped {:#x}", sge.address);
                break;
            };
            buf = region.to_vec(off, len);
            at = 0;
            continue;
        }
        if sge.length > 0 {
            segments.push(Segment {
                address: sge.address,
                length: sge.length,
            });
        }
        if sge.is_end_of_list() {
            break;
        }
        at += SGE_SIZE;
    }
    segments
}

impl Ioc {
    /// Answer a request received over the doorbell.
    pub(super) fn handshake_reply(&mut self, request: &[u8]) -> Vec<u8> {
        match msg::function_of(request) {
            function::IOC_FACTS => self.facts.encode().to_vec(),
            function::IOC_INIT => {
                let status = IocInit::parse(request).map_or(ioc_status::INVALID_FIELD, |init| self.ioc_init(init));
                msg::default_reply(function::IOC_INIT, status, 0).to_vec()
            }
            other => msg::default_reply(other, ioc_status::INVALID_FUNCTION, 0).to_vec(),
        }
    }

    fn ioc_init(&mut self, init: IocInit) -> u16 {
        if self.state != IocState::Ready {
            tracing::warn!("sim: IOC Init in state {:?}", self.state);
            return ioc_status::INVALID_STATE;
        }
        let depth = init.reply_descriptor_post_queue_depth;
        if depth == 0 || depth % 16 != 0 || init.reply_free_queue_depth != depth {
            return ioc_status::INVALID_FIELD;
        }
        if init.system_request_frame_size != self.facts.ioc_request_frame_size {
            return ioc_status::INVALID_FIELD;
        }
        let frame_bytes = usize::from(init.system_request_frame_size) * 4;
        let d = usize::from(depth);
        let (Some(requests), Some(post), Some(free)) = (
            self.memory.resolve(init.system_request_frame_base_address, frame_bytes),
            self.memory.resolve(init.reply_descriptor_post_queue_address, d * 8),
            self.memory.resolve(init.reply_free_queue_address, d * 4),
        ) else {
            tracing::warn!("sim: IOC Init names unmapped memory");
            return ioc_status::INVALID_FIELD;
        };

        self.queues = Some(Queues {
            init,
            requests,
            post,
            free,
            frame_bytes,
            depth,
            post_index: 0,
            free_index: 0,
        });
        self.state = IocState::Operational;
        self.initialized_by_host = true;
        self.stats.ioc_inits += 1;
        tracing::debug!("sim: operational, queue depth {depth}");
        ioc_status::SUCCESS
    }

    /// Handle one request descriptor.
    pub(super) fn process(&mut self, desc: RequestDescriptor) {
        let Some(q) = &self.queues else { return };
        let smid = desc.smid;
        let frame_at = q.requests.1 + usize::from(smid) * q.frame_bytes;
        if smid == 0 || frame_at + q.frame_bytes > q.requests.0.len() {
            tracing::warn!("sim: descriptor for invalid SMID {smid}");
            return;
        }
        let frame = q.requests.0.to_vec(frame_at, q.frame_bytes);
        self.stats.requests += 1;

        match msg::function_of(&frame) {
            function::SCSI_IO_REQUEST => self.scsi_io(smid, &frame),
            function::EVENT_NOTIFICATION => {
                if let Some(masks) = msg::parse_event_masks(&frame) {
                    self.event_masks = masks;
                }
                let reply = msg::default_reply(function::EVENT_NOTIFICATION, ioc_status::SUCCESS, 0);
                self.address_reply(smid, &reply);
            }
            function::CONFIG => self.config(smid, &frame),
            other => {
                let reply = msg::default_reply(other, ioc_status::SUCCESS, 0);
                self.address_reply(smid, &reply);
            }
        }
    }

    fn scsi_io(&mut self, smid: u16, frame: &[u8]) {
        let segments = walk_sgl(&self.memory, frame, usize::from(frame[SCSI_IO_SGL_OFFSET0]) * 4);
        let dev_handle = u16::from_le_bytes([frame[0], frame[1]]);
        self.io_log.push(IoRecord {
            smid,
            dev_handle,
            opcode: frame[64],
            control: u32::from_le_bytes([frame[60], frame[61], frame[62], frame[63]]),
            segments,
        });

        let Some(failure) = self.next_failure.take() else {
            self.post(ReplyDescriptor::Success {
                kind: reply_flags::SCSI_IO_SUCCESS,
                smid,
            });
            return;
        };

        let mut scsi_state = 0;
        if !failure.sense.is_empty() {
            let low = u32::from_le_bytes([
                frame[SCSI_IO_SENSE_LOW],
                frame[SCSI_IO_SENSE_LOW + 1],
                frame[SCSI_IO_SENSE_LOW + 2],
                frame[SCSI_IO_SENSE_LOW + 3],
            ]);
            let high = self.queues.as_ref().map_or(0, |q| q.init.sense_buffer_address_high);
            let bus = u64::from(high) << 32 | u64::from(low);
            match self.memory.resolve(bus, failure.sense.len()) {
                Some((region, off)) => {
                    region.write_bytes(off, &failure.sense);
                    scsi_state |= SCSI_STATE_AUTOSENSE_VALID;
                }
                None => tracing::warn!("sim: sense buffer {bus:#x} unmapped"),
            }
        }
        let scsi_status = if failure.scsi_status == 0 && !failure.sense.is_empty() {
            SCSI_STATUS_CHECK_CONDITION
        } else {
            failure.scsi_status
        };
        let reply = ScsiIoReply {
            dev_handle,
            scsi_status,
            scsi_state,
            ioc_status: failure.ioc_status,
            log_info: 0,
            transfer_count: 0,
            sense_count: failure.sense.len() as u32,
            response_info: 0,
        };
        self.address_reply(smid, &reply.encode());
    }

    fn config(&mut self, smid: u16, frame: &[u8]) {
        let Some((req, sge)) = ConfigRequest::parse(frame) else {
            return;
        };
        let is_page8 = req.action == config_action::PAGE_READ_CURRENT
            && req.page_type == page_type::IOC
            && req.page_number == IocPage8::NUMBER;
        let status = if !is_page8 {
            ioc_status::CONFIG_INVALID_PAGE
        } else if let Some((region, off)) = self.memory.resolve(sge.address, IocPage8::LEN) {
            region.write_bytes(off, &self.ioc_page8.encode());
            ioc_status::SUCCESS
        } else {
            tracing::warn!("sim: config buffer {:#x} unmapped", sge.address);
            ioc_status::INVALID_SGL
        };
        self.address_reply(smid, &msg::config_reply(&req, status));
    }

    /// Deliver an event if the host asked for it.
    pub(super) fn post_event(&mut self, code: u16, data: &[u8]) -> bool {
        if self.state != IocState::Operational {
            return false;
        }
        let word = usize::from(code / 32);
        if word >= self.event_masks.len() || self.event_masks[word] & (1 << (code % 32)) != 0 {
            return false;
        }
        self.event_context += 1;
        let reply = msg::event_reply(code, self.event_context, false, data);
        if self.address_reply(0, &reply) {
            self.stats.events_posted += 1;
            true
        } else {
            false
        }
    }

    /// Take a free reply frame, fill it and post an address reply.
    fn address_reply(&mut self, smid: u16, reply: &[u8]) -> bool {
        let misdirect = std::mem::take(&mut self.misdirect_next);
        let reply_bytes = self.facts.reply_frame_bytes();
        let host_free = self.reply_free_host_index;
        let Some(q) = &mut self.queues else { return false };
        if u32::from(q.free_index) == host_free {
            tracing::warn!("sim: no free reply frame for SMID {smid}");
            self.stats.replies_dropped += 1;
            return false;
        }
        let low = q.free.0.read_u32(q.free.1 + usize::from(q.free_index) * 4);
        q.free_index = (q.free_index + 1) % q.depth;

        let bus = u64::from(q.init.system_reply_address_high) << 32 | u64::from(low);
        let len = reply.len().min(reply_bytes);
        match self.memory.resolve(bus, len) {
            Some((region, off)) => region.write_bytes(off, &reply[..len]),
            None => tracing::warn!("sim: reply frame {bus:#x} unmapped"),
        }
        let frame_address = if misdirect { low.wrapping_add(0x1000_0000) } else { low };
        self.post(ReplyDescriptor::AddressReply { smid, frame_address })
    }

    fn post(&mut self, desc: ReplyDescriptor) -> bool {
        let Some(q) = &mut self.queues else { return false };
        let at = q.post.1 + usize::from(q.post_index) * 8;
        if q.post.0.read_u32(at) != UNUSED_WORD {
            tracing::warn!("sim: reply post queue full at {}", q.post_index);
            return false;
        }
        let (low, high) = desc.encode();
        q.post.0.write_u32(at + 4, high);
        q.post.0.write_u32(at, low);
        q.post_index = (q.post_index + 1) % q.depth;
        self.interrupt_status |= his::REPLY_DESCRIPTOR_INTERRUPT;
        true
    }
}
