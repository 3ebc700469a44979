//! MPI 2 message-level constants: function codes, IOC states, status codes
//! and asynchronous event codes.

use crate::regs::doorbell;

/// MPI version reported in IOC Init (2.0).
pub const MPI2_VERSION: u16 = 0x0200;
/// MPI 2.5 version.
pub const MPI25_VERSION: u16 = 0x0205;
/// Header version this model is written against.
pub const HEADER_VERSION: u16 = 0x1E00;

/// Size of the sense buffer handed out per request slot, in bytes.
pub const SENSE_BUFFER_LEN: usize = 252;

// ── Function codes ───────────────────────────────────────────────────────────

/// Message function codes (byte 3 of every request and reply).
pub mod function {
    /// SCSI initiator IO.
    pub const SCSI_IO_REQUEST: u8 = 0x00;
    /// SCSI task management.
    pub const SCSI_TASK_MGMT: u8 = 0x01;
    /// IOC Init.
    pub const IOC_INIT: u8 = 0x02;
    /// IOC Facts.
    pub const IOC_FACTS: u8 = 0x03;
    /// Configuration page access.
    pub const CONFIG: u8 = 0x04;
    /// Port Facts.
    pub const PORT_FACTS: u8 = 0x05;
    /// Port Enable (starts discovery).
    pub const PORT_ENABLE: u8 = 0x06;
    /// Event Notification (sets the event mask).
    pub const EVENT_NOTIFICATION: u8 = 0x07;
    /// Event Acknowledge.
    pub const EVENT_ACK: u8 = 0x08;
    /// Diagnostic buffer post.
    pub const DIAG_BUFFER_POST: u8 = 0x1D;
    /// Message unit reset (doorbell only).
    pub const IOC_MESSAGE_UNIT_RESET: u8 = 0x40;
    /// Doorbell handshake announcement.
    pub const HANDSHAKE: u8 = 0x42;
}

// ── IOC state ────────────────────────────────────────────────────────────────

/// IOC state carried in the top nibble of the doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IocState {
    /// Held in reset or still booting.
    Reset,
    /// Firmware is up and waiting for IOC Init.
    Ready,
    /// IOC Init done; the queues are live.
    Operational,
    /// Firmware fault. The doorbell low half carries the fault code.
    Fault,
    /// Coredump in progress (MPI 2.5).
    Coredump,
    /// Any other encoding.
    Unknown(u8),
}

impl IocState {
    /// Decode the state nibble of a doorbell word.
    #[must_use]
    pub const fn from_doorbell(db: u32) -> Self {
        let nibble = ((db & doorbell::STATE_MASK) >> doorbell::STATE_SHIFT) as u8;
        match nibble {
            0x0 => Self::Reset,
            0x1 => Self::Ready,
            0x2 => Self::Operational,
            0x4 => Self::Fault,
            0x5 => Self::Coredump,
            other => Self::Unknown(other),
        }
    }

    /// Encode into the doorbell state field.
    #[must_use]
    pub const fn to_doorbell(self) -> u32 {
        let nibble: u32 = match self {
            Self::Reset => 0x0,
            Self::Ready => 0x1,
            Self::Operational => 0x2,
            Self::Fault => 0x4,
            Self::Coredump => 0x5,
            Self::Unknown(n) => n as u32 & 0xF,
        };
        nibble << doorbell::STATE_SHIFT
    }
}

/// Who-init value carried in a doorbell word.
#[must_use]
pub const fn who_init(db: u32) -> u8 {
    ((db & doorbell::WHO_INIT_MASK) >> doorbell::WHO_INIT_SHIFT) as u8
}

/// Fault code carried in a doorbell word.
#[must_use]
pub const fn fault_code(db: u32) -> u16 {
    (db & doorbell::FAULT_CODE_MASK) as u16
}

/// Known IOC fault codes.
pub mod fault {
    /// IOP temperature threshold exceeded. Not recoverable by reset.
    pub const IOP_OVER_TEMP_THRESHOLD_EXCEEDED: u16 = 0x2810;
}

// ── IOCStatus ────────────────────────────────────────────────────────────────

/// IOCStatus values (reply offset 14).
pub mod ioc_status {
    /// Strip the log-info-available flag.
    pub const MASK: u16 = 0x7FFF;
    /// Log info is valid.
    pub const LOG_INFO_AVAILABLE: u16 = 0x8000;
    /// Success.
    pub const SUCCESS: u16 = 0x0000;
    /// Function not supported.
    pub const INVALID_FUNCTION: u16 = 0x0001;
    /// IOC busy.
    pub const BUSY: u16 = 0x0002;
    /// Malformed SGL.
    pub const INVALID_SGL: u16 = 0x0003;
    /// Internal IOC error.
    pub const INTERNAL_ERROR: u16 = 0x0004;
    /// Out of IOC resources.
    pub const INSUFFICIENT_RESOURCES: u16 = 0x0006;
    /// Bad field in the request.
    pub const INVALID_FIELD: u16 = 0x0007;
    /// Invalid state for the request.
    pub const INVALID_STATE: u16 = 0x0008;
    /// Config: invalid action.
    pub const CONFIG_INVALID_ACTION: u16 = 0x0020;
    /// Config: invalid page type.
    pub const CONFIG_INVALID_TYPE: u16 = 0x0021;
    /// Config: page does not exist.
    pub const CONFIG_INVALID_PAGE: u16 = 0x0022;
    /// SCSI: recovered error.
    pub const SCSI_RECOVERED_ERROR: u16 = 0x0040;
    /// SCSI: invalid device handle.
    pub const SCSI_INVALID_DEVHANDLE: u16 = 0x0042;
    /// SCSI: device not there.
    pub const SCSI_DEVICE_NOT_THERE: u16 = 0x0043;
    /// SCSI: data overrun.
    pub const SCSI_DATA_OVERRUN: u16 = 0x0044;
    /// SCSI: data underrun.
    pub const SCSI_DATA_UNDERRUN: u16 = 0x0045;
    /// SCSI: IO data error.
    pub const SCSI_IO_DATA_ERROR: u16 = 0x0046;
    /// SCSI: protocol error.
    pub const SCSI_PROTOCOL_ERROR: u16 = 0x0047;
    /// SCSI: task terminated.
    pub const SCSI_TASK_TERMINATED: u16 = 0x0048;
    /// SCSI: IOC terminated the IO.
    pub const SCSI_IOC_TERMINATED: u16 = 0x004B;
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Number of 32-bit words in an event mask.
pub const EVENT_MASK_WORDS: usize = 4;

/// Highest event code addressable by the mask.
pub const MAX_EVENT_CODE: u16 = (EVENT_MASK_WORDS * 32) as u16 - 1;

/// Asynchronous event codes.
pub mod event {
    /// Firmware log data.
    pub const LOG_DATA: u16 = 0x0001;
    /// IOC state change.
    pub const STATE_CHANGE: u16 = 0x0002;
    /// Hard reset received on a port.
    pub const HARD_RESET_RECEIVED: u16 = 0x0005;
    /// Event replay has changed.
    pub const EVENT_CHANGE: u16 = 0x000A;
    /// Task set full.
    pub const TASK_SET_FULL: u16 = 0x000E;
    /// SAS device status change.
    pub const SAS_DEVICE_STATUS_CHANGE: u16 = 0x000F;
    /// IR operation status.
    pub const IR_OPERATION_STATUS: u16 = 0x0014;
    /// SAS discovery started or finished.
    pub const SAS_DISCOVERY: u16 = 0x0016;
    /// SAS broadcast primitive.
    pub const SAS_BROADCAST_PRIMITIVE: u16 = 0x0017;
    /// SAS initiator device status change.
    pub const SAS_INIT_DEVICE_STATUS_CHANGE: u16 = 0x0018;
    /// SAS topology change list.
    pub const SAS_TOPOLOGY_CHANGE_LIST: u16 = 0x001C;
    /// SAS enclosure device status change.
    pub const SAS_ENCL_DEVICE_STATUS_CHANGE: u16 = 0x001D;
    /// IR volume.
    pub const IR_VOLUME: u16 = 0x001E;
    /// IR physical disk.
    pub const IR_PHYSICAL_DISK: u16 = 0x001F;
    /// IR configuration change list.
    pub const IR_CONFIGURATION_CHANGE_LIST: u16 = 0x0020;
    /// Log entry added.
    pub const LOG_ENTRY_ADDED: u16 = 0x0021;
    /// SAS PHY counter.
    pub const SAS_PHY_COUNTER: u16 = 0x0022;
    /// GPIO interrupt.
    pub const GPIO_INTERRUPT: u16 = 0x0023;
    /// Temperature threshold crossed.
    pub const TEMP_THRESHOLD: u16 = 0x0027;
}
