//! MPI 2 message layouts.
//!
//! Every message begins with the same four bytes: a function-specific byte
//! or half-word, `ChainOffset` (requests) or `MsgLength` (replies) at byte 2,
//! and `Function` at byte 3. Replies carry `IOCStatus` at byte 14 and
//! `IOCLogInfo` at byte 16.
//!
//! Layouts are encoded to and decoded from byte slices. Decoders return
//! `None` when the slice is shorter than the fixed part of the message.

use crate::le::{put_u16, put_u32, put_u64, u16_at, u32_at, u64_at};
use crate::mpi::{function, ioc_status, EVENT_MASK_WORDS};
use crate::sge::{Sge, SGE_SIZE};

// ── Common header ────────────────────────────────────────────────────────────

/// Byte offset of `ChainOffset` in a request.
pub const CHAIN_OFFSET: usize = 2;
/// Byte offset of `MsgLength` in a reply.
pub const MSG_LENGTH: usize = 2;
/// Byte offset of `Function`.
pub const FUNCTION: usize = 3;
/// Byte offset of `IOCStatus` in a reply.
pub const IOC_STATUS: usize = 14;
/// Byte offset of `IOCLogInfo` in a reply.
pub const IOC_LOG_INFO: usize = 16;
/// Size of the default reply (`MsgLength` 5).
pub const DEFAULT_REPLY_LEN: usize = 20;

/// Function code of a message.
#[must_use]
pub fn function_of(msg: &[u8]) -> u8 {
    msg[FUNCTION]
}

/// Reply length in bytes, from `MsgLength` (32-bit words).
#[must_use]
pub fn reply_len(reply: &[u8]) -> usize {
    usize::from(reply[MSG_LENGTH]) * 4
}

/// Status portion of a reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyStatus {
    /// Function the reply answers.
    pub function: u8,
    /// `IOCStatus` with the log-info flag stripped.
    pub ioc_status: u16,
    /// `IOCLogInfo`, zero unless the IOC flagged it valid.
    pub log_info: u32,
}

impl ReplyStatus {
    /// Read the status fields of any reply.
    #[must_use]
    pub fn parse(reply: &[u8]) -> Option<Self> {
        if reply.len() < DEFAULT_REPLY_LEN {
            return None;
        }
        let raw = u16_at(reply, IOC_STATUS);
        let log_info = if raw & ioc_status::LOG_INFO_AVAILABLE != 0 {
            u32_at(reply, IOC_LOG_INFO)
        } else {
            0
        };
        Some(Self {
            function: reply[FUNCTION],
            ioc_status: raw & ioc_status::MASK,
            log_info,
        })
    }

    /// Whether `IOCStatus` is success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.ioc_status == ioc_status::SUCCESS
    }
}

/// Encode the 20-byte default reply used for simple acknowledgements.
#[must_use]
pub fn default_reply(function: u8, ioc_status: u16, log_info: u32) -> [u8; DEFAULT_REPLY_LEN] {
    let mut out = [0u8; DEFAULT_REPLY_LEN];
    out[MSG_LENGTH] = (DEFAULT_REPLY_LEN / 4) as u8;
    out[FUNCTION] = function;
    let flag = if log_info == 0 { 0 } else { ioc_status::LOG_INFO_AVAILABLE };
    put_u16(&mut out, IOC_STATUS, ioc_status | flag);
    put_u32(&mut out, IOC_LOG_INFO, log_info);
    out
}

// ── IOC Facts ────────────────────────────────────────────────────────────────

/// Size of the IOC Facts request.
pub const IOC_FACTS_REQUEST_LEN: usize = 12;
/// Size of the IOC Facts reply.
pub const IOC_FACTS_REPLY_LEN: usize = 64;

/// Encode an IOC Facts request.
#[must_use]
pub fn ioc_facts_request() -> [u8; IOC_FACTS_REQUEST_LEN] {
    let mut out = [0u8; IOC_FACTS_REQUEST_LEN];
    out[FUNCTION] = function::IOC_FACTS;
    out
}

/// IOC Facts reply: the controller's capacities for this boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct IocFacts {
    pub msg_version: u16,
    pub header_version: u16,
    pub ioc_number: u8,
    pub ioc_exceptions: u16,
    pub ioc_status: u16,
    pub ioc_log_info: u32,
    pub max_chain_depth: u8,
    pub who_init: u8,
    pub number_of_ports: u8,
    pub max_msix_vectors: u8,
    pub request_credit: u16,
    pub product_id: u16,
    pub ioc_capabilities: u32,
    pub fw_version: u32,
    /// Request frame size in 32-bit words.
    pub ioc_request_frame_size: u16,
    /// Max chain segment size in 16-byte elements (MPI 2.5).
    pub max_chain_segment_size: u16,
    pub max_initiators: u16,
    pub max_targets: u16,
    pub max_sas_expanders: u16,
    pub max_enclosures: u16,
    pub protocol_flags: u16,
    pub high_priority_credit: u16,
    pub max_reply_descriptor_post_queue_depth: u16,
    /// Reply frame size in 32-bit words.
    pub reply_frame_size: u8,
    pub max_volumes: u8,
    pub max_dev_handle: u16,
    pub max_persistent_entries: u16,
    pub min_dev_handle: u16,
}

impl IocFacts {
    /// Decode a reply read from the doorbell.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < IOC_FACTS_REPLY_LEN {
            return None;
        }
        Some(Self {
            msg_version: u16_at(buf, 0),
            header_version: u16_at(buf, 4),
            ioc_number: buf[6],
            ioc_exceptions: u16_at(buf, 12),
            ioc_status: u16_at(buf, IOC_STATUS),
            ioc_log_info: u32_at(buf, IOC_LOG_INFO),
            max_chain_depth: buf[20],
            who_init: buf[21],
            number_of_ports: buf[22],
            max_msix_vectors: buf[23],
            request_credit: u16_at(buf, 24),
            product_id: u16_at(buf, 26),
            ioc_capabilities: u32_at(buf, 28),
            fw_version: u32_at(buf, 32),
            ioc_request_frame_size: u16_at(buf, 36),
            max_chain_segment_size: u16_at(buf, 38),
            max_initiators: u16_at(buf, 40),
            max_targets: u16_at(buf, 42),
            max_sas_expanders: u16_at(buf, 44),
            max_enclosures: u16_at(buf, 46),
            protocol_flags: u16_at(buf, 48),
            high_priority_credit: u16_at(buf, 50),
            max_reply_descriptor_post_queue_depth: u16_at(buf, 52),
            reply_frame_size: buf[54],
            max_volumes: buf[55],
            max_dev_handle: u16_at(buf, 56),
            max_persistent_entries: u16_at(buf, 58),
            min_dev_handle: u16_at(buf, 60),
        })
    }

    /// Encode as the IOC would send it.
    #[must_use]
    pub fn encode(&self) -> [u8; IOC_FACTS_REPLY_LEN] {
        let mut b = [0u8; IOC_FACTS_REPLY_LEN];
        put_u16(&mut b, 0, self.msg_version);
        b[MSG_LENGTH] = (IOC_FACTS_REPLY_LEN / 4) as u8;
        b[FUNCTION] = function::IOC_FACTS;
        put_u16(&mut b, 4, self.header_version);
        b[6] = self.ioc_number;
        put_u16(&mut b, 12, self.ioc_exceptions);
        put_u16(&mut b, IOC_STATUS, self.ioc_status);
        put_u32(&mut b, IOC_LOG_INFO, self.ioc_log_info);
        b[20] = self.max_chain_depth;
        b[21] = self.who_init;
        b[22] = self.number_of_ports;
        b[23] = self.max_msix_vectors;
        put_u16(&mut b, 24, self.request_credit);
        put_u16(&mut b, 26, self.product_id);
        put_u32(&mut b, 28, self.ioc_capabilities);
        put_u32(&mut b, 32, self.fw_version);
        put_u16(&mut b, 36, self.ioc_request_frame_size);
        put_u16(&mut b, 38, self.max_chain_segment_size);
        put_u16(&mut b, 40, self.max_initiators);
        put_u16(&mut b, 42, self.max_targets);
        put_u16(&mut b, 44, self.max_sas_expanders);
        put_u16(&mut b, 46, self.max_enclosures);
        put_u16(&mut b, 48, self.protocol_flags);
        put_u16(&mut b, 50, self.high_priority_credit);
        put_u16(&mut b, 52, self.max_reply_descriptor_post_queue_depth);
        b[54] = self.reply_frame_size;
        b[55] = self.max_volumes;
        put_u16(&mut b, 56, self.max_dev_handle);
        put_u16(&mut b, 58, self.max_persistent_entries);
        put_u16(&mut b, 60, self.min_dev_handle);
        b
    }

    /// Request frame size in bytes.
    #[must_use]
    pub const fn request_frame_bytes(&self) -> usize {
        self.ioc_request_frame_size as usize * 4
    }

    /// Reply frame size in bytes.
    #[must_use]
    pub const fn reply_frame_bytes(&self) -> usize {
        self.reply_frame_size as usize * 4
    }

    /// Firmware version as `major.minor.unit.dev`.
    #[must_use]
    pub fn fw_version_string(&self) -> String {
        let v = self.fw_version.to_be_bytes();
        format!("{:02}.{:02}.{:02}.{:02}", v[0], v[1], v[2], v[3])
    }
}

// ── IOC Init ─────────────────────────────────────────────────────────────────

/// Size of the IOC Init request.
pub const IOC_INIT_REQUEST_LEN: usize = 72;

/// IOC Init request: hands the IOC the queue geometry and base addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct IocInit {
    pub who_init: u8,
    pub msg_version: u16,
    pub header_version: u16,
    /// Request frame size in 32-bit words.
    pub system_request_frame_size: u16,
    pub reply_descriptor_post_queue_depth: u16,
    pub reply_free_queue_depth: u16,
    pub sense_buffer_address_high: u32,
    pub system_reply_address_high: u32,
    pub system_request_frame_base_address: u64,
    pub reply_descriptor_post_queue_address: u64,
    pub reply_free_queue_address: u64,
    /// Milliseconds since the Unix epoch.
    pub time_stamp: u64,
}

impl IocInit {
    /// Encode the request.
    #[must_use]
    pub fn encode(&self) -> [u8; IOC_INIT_REQUEST_LEN] {
        let mut b = [0u8; IOC_INIT_REQUEST_LEN];
        b[0] = self.who_init;
        b[FUNCTION] = function::IOC_INIT;
        put_u16(&mut b, 12, self.msg_version);
        put_u16(&mut b, 14, self.header_version);
        put_u16(&mut b, 26, self.system_request_frame_size);
        put_u16(&mut b, 28, self.reply_descriptor_post_queue_depth);
        put_u16(&mut b, 30, self.reply_free_queue_depth);
        put_u32(&mut b, 32, self.sense_buffer_address_high);
        put_u32(&mut b, 36, self.system_reply_address_high);
        put_u64(&mut b, 40, self.system_request_frame_base_address);
        put_u64(&mut b, 48, self.reply_descriptor_post_queue_address);
        put_u64(&mut b, 56, self.reply_free_queue_address);
        put_u64(&mut b, 64, self.time_stamp);
        b
    }

    /// Decode a request, as the IOC sees it.
    #[must_use]
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < IOC_INIT_REQUEST_LEN || b[FUNCTION] != function::IOC_INIT {
            return None;
        }
        Some(Self {
            who_init: b[0],
            msg_version: u16_at(b, 12),
            header_version: u16_at(b, 14),
            system_request_frame_size: u16_at(b, 26),
            reply_descriptor_post_queue_depth: u16_at(b, 28),
            reply_free_queue_depth: u16_at(b, 30),
            sense_buffer_address_high: u32_at(b, 32),
            system_reply_address_high: u32_at(b, 36),
            system_request_frame_base_address: u64_at(b, 40),
            reply_descriptor_post_queue_address: u64_at(b, 48),
            reply_free_queue_address: u64_at(b, 56),
            time_stamp: u64_at(b, 64),
        })
    }
}

// ── Event Notification ───────────────────────────────────────────────────────

/// Size of the Event Notification request.
pub const EVENT_NOTIFICATION_REQUEST_LEN: usize = 44;
/// Offset of `EventMasks[0]` in the request.
pub const EVENT_MASKS: usize = 20;
/// Size of the fixed part of an Event Notification reply.
pub const EVENT_REPLY_HEADER_LEN: usize = 28;

/// Encode an Event Notification request. A set mask bit suppresses the event.
#[must_use]
pub fn event_notification_request(
    masks: &[u32; EVENT_MASK_WORDS],
) -> [u8; EVENT_NOTIFICATION_REQUEST_LEN] {
    let mut b = [0u8; EVENT_NOTIFICATION_REQUEST_LEN];
    b[FUNCTION] = function::EVENT_NOTIFICATION;
    for (i, m) in masks.iter().enumerate() {
        put_u32(&mut b, EVENT_MASKS + i * 4, *m);
    }
    b
}

/// Decode the suppression masks from an Event Notification request.
#[must_use]
pub fn parse_event_masks(b: &[u8]) -> Option<[u32; EVENT_MASK_WORDS]> {
    if b.len() < EVENT_NOTIFICATION_REQUEST_LEN || b[FUNCTION] != function::EVENT_NOTIFICATION {
        return None;
    }
    let mut masks = [0u32; EVENT_MASK_WORDS];
    for (i, m) in masks.iter_mut().enumerate() {
        *m = u32_at(b, EVENT_MASKS + i * 4);
    }
    Some(masks)
}

/// Fixed part of an Event Notification reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReplyHeader {
    /// Event code.
    pub event: u16,
    /// Host must send Event Acknowledge.
    pub ack_required: bool,
    /// IOCStatus (masked).
    pub ioc_status: u16,
    /// IOCLogInfo.
    pub log_info: u32,
    /// Firmware context echoed in the acknowledgement.
    pub event_context: u32,
    /// Length of the event data in bytes.
    pub data_len: usize,
}

impl EventReplyHeader {
    /// Decode the header. `data_len` is clamped to what `b` holds.
    #[must_use]
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < EVENT_REPLY_HEADER_LEN {
            return None;
        }
        let declared = usize::from(u16_at(b, 0)) * 4;
        Some(Self {
            event: u16_at(b, 20),
            ack_required: b[6] != 0,
            ioc_status: u16_at(b, IOC_STATUS) & ioc_status::MASK,
            log_info: u32_at(b, IOC_LOG_INFO),
            event_context: u32_at(b, 24),
            data_len: declared.min(b.len() - EVENT_REPLY_HEADER_LEN),
        })
    }
}

/// Encode an Event Notification reply carrying `data` (padded to dwords).
#[must_use]
pub fn event_reply(event: u16, context: u32, ack_required: bool, data: &[u8]) -> Vec<u8> {
    let data_dwords = data.len().div_ceil(4);
    let mut b = vec![0u8; EVENT_REPLY_HEADER_LEN + data_dwords * 4];
    put_u16(&mut b, 0, data_dwords as u16);
    b[MSG_LENGTH] = (b.len() / 4) as u8;
    b[FUNCTION] = function::EVENT_NOTIFICATION;
    b[6] = u8::from(ack_required);
    put_u16(&mut b, 20, event);
    put_u32(&mut b, 24, context);
    b[EVENT_REPLY_HEADER_LEN..EVENT_REPLY_HEADER_LEN + data.len()].copy_from_slice(data);
    b
}

// ── Config ───────────────────────────────────────────────────────────────────

/// Config actions.
pub mod config_action {
    /// Return only the page header.
    pub const PAGE_HEADER: u8 = 0x00;
    /// Read the current page.
    pub const PAGE_READ_CURRENT: u8 = 0x01;
}

/// Config page types.
pub mod page_type {
    /// IOC pages.
    pub const IOC: u8 = 0x01;
    /// Manufacturing pages.
    pub const MANUFACTURING: u8 = 0x09;
}

/// Size of a Config request with its page-buffer SGE.
pub const CONFIG_REQUEST_LEN: usize = 28 + SGE_SIZE;
/// Offset of the page-buffer SGE in a Config request.
pub const CONFIG_SGL_OFFSET: usize = 28;
/// Size of a Config reply.
pub const CONFIG_REPLY_LEN: usize = 24;

/// Config request addressing one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ConfigRequest {
    pub action: u8,
    pub page_type: u8,
    pub page_number: u8,
    pub page_version: u8,
    /// Page length in 32-bit words.
    pub page_length: u8,
    pub page_address: u32,
}

impl ConfigRequest {
    /// Encode the request without its SGE; the caller appends the buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; CONFIG_REQUEST_LEN] {
        let mut b = [0u8; CONFIG_REQUEST_LEN];
        b[0] = self.action;
        b[FUNCTION] = function::CONFIG;
        b[20] = self.page_version;
        b[21] = self.page_length;
        b[22] = self.page_number;
        b[23] = self.page_type;
        put_u32(&mut b, 24, self.page_address);
        b
    }

    /// Decode a request and its page-buffer SGE.
    #[must_use]
    pub fn parse(b: &[u8]) -> Option<(Self, Sge)> {
        if b.len() < CONFIG_REQUEST_LEN || b[FUNCTION] != function::CONFIG {
            return None;
        }
        let req = Self {
            action: b[0],
            page_version: b[20],
            page_length: b[21],
            page_number: b[22],
            page_type: b[23],
            page_address: u32_at(b, 24),
        };
        Some((req, Sge::decode(&b[CONFIG_SGL_OFFSET..])))
    }
}

/// Encode a Config reply echoing the page header.
#[must_use]
pub fn config_reply(req: &ConfigRequest, ioc_status: u16) -> [u8; CONFIG_REPLY_LEN] {
    let mut b = [0u8; CONFIG_REPLY_LEN];
    b[0] = req.action;
    b[MSG_LENGTH] = (CONFIG_REPLY_LEN / 4) as u8;
    b[FUNCTION] = function::CONFIG;
    put_u16(&mut b, IOC_STATUS, ioc_status);
    b[20] = req.page_version;
    b[21] = req.page_length;
    b[22] = req.page_number;
    b[23] = req.page_type;
    b
}

/// IOC Page 8: persistent device mapping policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct IocPage8 {
    pub num_devs_per_enclosure: u8,
    pub max_persistent_entries: u16,
    pub max_num_physical_mapped_ids: u16,
    pub flags: u16,
    pub ir_volume_mapping_flags: u16,
}

impl IocPage8 {
    /// Page size in bytes.
    pub const LEN: usize = 24;
    /// Page number within the IOC page type.
    pub const NUMBER: u8 = 8;
    /// Page version this layout describes.
    pub const VERSION: u8 = 0x02;

    /// Decode the page body (including its 4-byte header).
    #[must_use]
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < Self::LEN {
            return None;
        }
        Some(Self {
            num_devs_per_enclosure: b[4],
            max_persistent_entries: u16_at(b, 8),
            max_num_physical_mapped_ids: u16_at(b, 10),
            flags: u16_at(b, 12),
            ir_volume_mapping_flags: u16_at(b, 16),
        })
    }

    /// Encode the page with its header.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0] = Self::VERSION;
        b[1] = (Self::LEN / 4) as u8;
        b[2] = Self::NUMBER;
        b[3] = page_type::IOC;
        b[4] = self.num_devs_per_enclosure;
        put_u16(&mut b, 8, self.max_persistent_entries);
        put_u16(&mut b, 10, self.max_num_physical_mapped_ids);
        put_u16(&mut b, 12, self.flags);
        put_u16(&mut b, 16, self.ir_volume_mapping_flags);
        b
    }
}

// ── SCSI IO ──────────────────────────────────────────────────────────────────

/// Offset of the SGL in a SCSI IO request.
pub const SCSI_IO_SGL_OFFSET: usize = 96;
/// Offset of `SenseBufferLowAddress`.
pub const SCSI_IO_SENSE_LOW: usize = 12;
/// Offset of `SenseBufferLength`.
pub const SCSI_IO_SENSE_LEN: usize = 18;
/// Offset of `SGLOffset0` (in 32-bit words).
pub const SCSI_IO_SGL_OFFSET0: usize = 20;
/// Size of a SCSI IO reply.
pub const SCSI_IO_REPLY_LEN: usize = 52;

/// Data direction bits in the SCSI IO `Control` word.
pub mod scsi_control {
    /// No data phase.
    pub const NO_DATA: u32 = 0x0000_0000;
    /// Host to device.
    pub const WRITE: u32 = 0x0100_0000;
    /// Device to host.
    pub const READ: u32 = 0x0200_0000;
    /// Both directions.
    pub const BIDIRECTIONAL: u32 = 0x0300_0000;
    /// Simple queue tag.
    pub const SIMPLEQ: u32 = 0x0000_0000;
}

/// Fixed part of a SCSI IO request (everything before the SGL).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ScsiIoRequest {
    pub dev_handle: u16,
    pub data_length: u32,
    pub bidirectional_data_length: u32,
    pub lun: [u8; 8],
    pub control: u32,
    pub cdb: [u8; 32],
    pub cdb_len: u8,
}

impl ScsiIoRequest {
    /// Encode the fixed part into the first [`SCSI_IO_SGL_OFFSET`] bytes of `b`.
    ///
    /// The sense buffer address is left zero; the engine patches it per slot.
    pub fn encode_into(&self, b: &mut [u8]) {
        b[..SCSI_IO_SGL_OFFSET].fill(0);
        put_u16(b, 0, self.dev_handle);
        b[FUNCTION] = function::SCSI_IO_REQUEST;
        b[SCSI_IO_SENSE_LEN] = crate::mpi::SENSE_BUFFER_LEN as u8;
        b[SCSI_IO_SGL_OFFSET0] = (SCSI_IO_SGL_OFFSET / 4) as u8;
        put_u32(b, 28, self.data_length);
        put_u32(b, 32, self.bidirectional_data_length);
        put_u16(b, 36, u16::from(self.cdb_len));
        b[52..60].copy_from_slice(&self.lun);
        put_u32(b, 60, self.control);
        b[64..96].copy_from_slice(&self.cdb);
    }
}

/// SCSI IO error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ScsiIoReply {
    pub dev_handle: u16,
    pub scsi_status: u8,
    pub scsi_state: u8,
    pub ioc_status: u16,
    pub log_info: u32,
    pub transfer_count: u32,
    pub sense_count: u32,
    pub response_info: u32,
}

impl ScsiIoReply {
    /// Decode the reply.
    #[must_use]
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < SCSI_IO_REPLY_LEN || b[FUNCTION] != function::SCSI_IO_REQUEST {
            return None;
        }
        Some(Self {
            dev_handle: u16_at(b, 0),
            scsi_status: b[12],
            scsi_state: b[13],
            ioc_status: u16_at(b, IOC_STATUS) & ioc_status::MASK,
            log_info: u32_at(b, IOC_LOG_INFO),
            transfer_count: u32_at(b, 20),
            sense_count: u32_at(b, 24),
            response_info: u32_at(b, 28),
        })
    }

    /// Encode the reply.
    #[must_use]
    pub fn encode(&self) -> [u8; SCSI_IO_REPLY_LEN] {
        let mut b = [0u8; SCSI_IO_REPLY_LEN];
        put_u16(&mut b, 0, self.dev_handle);
        b[MSG_LENGTH] = (SCSI_IO_REPLY_LEN / 4) as u8;
        b[FUNCTION] = function::SCSI_IO_REQUEST;
        b[12] = self.scsi_status;
        b[13] = self.scsi_state;
        put_u16(&mut b, IOC_STATUS, self.ioc_status);
        put_u32(&mut b, IOC_LOG_INFO, self.log_info);
        put_u32(&mut b, 20, self.transfer_count);
        put_u32(&mut b, 24, self.sense_count);
        put_u32(&mut b, 28, self.response_info);
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_facts() -> IocFacts {
        IocFacts {
            msg_version: crate::mpi::MPI2_VERSION,
            header_version: crate::mpi::HEADER_VERSION,
            max_chain_depth: 128,
            request_credit: 1024,
            product_id: 0x2713,
            ioc_capabilities: 0x0000_3C9C,
            fw_version: 0x1400_0700,
            ioc_request_frame_size: 32,
            max_targets: 1024,
            high_priority_credit: 8,
            max_reply_descriptor_post_queue_depth: 2048,
            reply_frame_size: 32,
            max_dev_handle: 1100,
            ..IocFacts::default()
        }
    }

    #[test]
    fn facts_encode_sets_header() {
        let raw = sample_facts().encode();
        assert_eq!(function_of(&raw), function::IOC_FACTS);
        assert_eq!(reply_len(&raw), IOC_FACTS_REPLY_LEN);
    }

    #[test]
    fn facts_fields_land_at_wire_offsets() {
        let raw = sample_facts().encode();
        assert_eq!(u16_at(&raw, 24), 1024);
        assert_eq!(u16_at(&raw, 36), 32);
        assert_eq!(raw[54], 32);
        assert_eq!(u16_at(&raw, 52), 2048);
        let back = IocFacts::parse(&raw).unwrap();
        assert_eq!(back.request_frame_bytes(), 128);
        assert_eq!(back.fw_version_string(), "20.00.07.00");
    }

    #[test]
    fn short_facts_reply_is_rejected() {
        assert!(IocFacts::parse(&[0u8; 20]).is_none());
    }

    #[test]
    fn ioc_init_layout() {
        let init = IocInit {
            who_init: crate::regs::who_init::HOST_DRIVER,
            system_request_frame_size: 32,
            reply_descriptor_post_queue_depth: 64,
            reply_free_queue_depth: 64,
            system_request_frame_base_address: 0x1_2345_6000,
            reply_descriptor_post_queue_address: 0x1_0000_0100,
            reply_free_queue_address: 0x1_0000_0000,
            ..IocInit::default()
        };
        let raw = init.encode();
        assert_eq!(raw[0], 4);
        assert_eq!(raw[FUNCTION], function::IOC_INIT);
        assert_eq!(u64_at(&raw, 40), 0x1_2345_6000);
        assert_eq!(IocInit::parse(&raw), Some(init));
    }

    #[test]
    fn event_reply_data_is_padded() {
        let raw = event_reply(crate::mpi::event::SAS_DISCOVERY, 7, true, &[1, 2, 3, 4, 5]);
        assert_eq!(raw.len(), 36);
        assert_eq!(reply_len(&raw), 36);
        let hdr = EventReplyHeader::parse(&raw).unwrap();
        assert_eq!(hdr.event, crate::mpi::event::SAS_DISCOVERY);
        assert!(hdr.ack_required);
        assert_eq!(hdr.event_context, 7);
        assert_eq!(hdr.data_len, 8);
    }

    #[test]
    fn default_reply_flags_log_info() {
        let raw = default_reply(function::IOC_INIT, ioc_status::INVALID_FIELD, 0x3112_0101);
        let status = ReplyStatus::parse(&raw).unwrap();
        assert_eq!(status.ioc_status, ioc_status::INVALID_FIELD);
        assert_eq!(status.log_info, 0x3112_0101);
        assert!(!status.is_success());
    }

    #[test]
    fn ioc_page8_header() {
        let page = IocPage8 {
            num_devs_per_enclosure: 24,
            max_persistent_entries: 128,
            ..IocPage8::default()
        };
        let raw = page.encode();
        assert_eq!(raw[2], IocPage8::NUMBER);
        assert_eq!(raw[3], page_type::IOC);
        assert_eq!(IocPage8::parse(&raw), Some(page));
    }

    #[test]
    fn scsi_io_fixed_part() {
        let mut cdb = [0u8; 32];
        cdb[0] = 0x28;
        let req = ScsiIoRequest {
            dev_handle: 9,
            data_length: 4096,
            bidirectional_data_length: 0,
            lun: [0; 8],
            control: scsi_control::READ,
            cdb,
            cdb_len: 10,
        };
        let mut frame = [0xAAu8; 128];
        req.encode_into(&mut frame);
        assert_eq!(frame[SCSI_IO_SGL_OFFSET0], 24);
        assert_eq!(frame[SCSI_IO_SENSE_LEN], 252);
        assert_eq!(frame[64], 0x28);
        assert_eq!(u32_at(&frame, 60), scsi_control::READ);
        assert_eq!(frame[SCSI_IO_SGL_OFFSET], 0xAA, "SGL area untouched");
    }
}
