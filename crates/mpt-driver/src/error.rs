//! Error types for Fusion-MPT controller operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, MptError>;

/// Errors that can occur while driving the IOC
#[derive(Debug, Error)]
pub enum MptError {
    /// Doorbell already in use, or a reset is in progress
    #[error("Busy: {reason}")]
    Busy {
        /// What was busy
        reason: String,
    },

    /// A bounded wait ran out
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout {
        /// Operation that was waiting
        operation: String,
        /// Budget that was exhausted, in milliseconds
        duration_ms: u64,
    },

    /// No free command slot or chain frame
    #[error("Out of {resource}")]
    Exhausted {
        /// Resource that ran out
        resource: &'static str,
    },

    /// The IOC is owned by a PCI peer
    #[error("IOC is owned by a PCI peer")]
    ExclusiveOwnership,

    /// A reply descriptor points outside the reply frame pool
    #[error("Reply frame address {address:#010x} outside pool [{base:#010x}, {end:#010x})")]
    ReplyOutOfRange {
        /// Low 32 bits reported by the IOC
        address: u32,
        /// Pool start (low 32 bits)
        base: u32,
        /// Pool end (low 32 bits)
        end: u32,
    },

    /// The IOC reported a non-success status in a reply
    #[error("Function {function:#04x} failed: IOCStatus {status:#06x}, log info {log_info:#010x}")]
    IocStatus {
        /// Function of the failed request
        function: u8,
        /// IOCStatus (masked)
        status: u16,
        /// IOCLogInfo
        log_info: u32,
    },

    /// The IOC entered the fault state
    #[error("IOC fault {code:#06x}")]
    Fault {
        /// Fault code from the doorbell
        code: u16,
    },

    /// The IOC exceeded its temperature threshold
    #[error("IOC over temperature (fault {code:#06x}); controller stopped")]
    ThermalShutdown {
        /// Fault code from the doorbell
        code: u16,
    },

    /// The controller gave up after an unrecoverable error
    #[error("Controller failed: {reason}")]
    ControllerFailed {
        /// What brought it down
        reason: String,
    },

    /// The IOC is in a state the operation cannot handle
    #[error("IOC in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Malformed request from the caller
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong
        reason: String,
    },

    /// DMA memory could not be allocated or mapped
    #[error("DMA allocation failed: {reason}")]
    DmaAllocation {
        /// Reason for failure
        reason: String,
    },

    /// Device not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No Fusion-MPT controllers detected on the system
    #[error("No Fusion-MPT controllers detected")]
    NoDevicesFound,

    /// Device index out of range
    #[error("Device index {index} out of range (have {count} devices)")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of available devices
        count: usize,
    },

    /// I/O error during sysfs or VFIO access
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// VFIO or MMIO plumbing failed
    #[error("Hardware error: {reason}")]
    HardwareError {
        /// Reason for failure
        reason: String,
    },
}

impl MptError {
    /// Create a busy error
    pub fn busy(reason: impl Into<String>) -> Self {
        Self::Busy {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a controller failed error
    pub fn controller_failed(reason: impl Into<String>) -> Self {
        Self::ControllerFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a DMA allocation error
    pub fn dma_allocation(reason: impl Into<String>) -> Self {
        Self::DmaAllocation {
            reason: reason.into(),
        }
    }

    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a hardware error
    pub fn hardware_error(reason: impl Into<String>) -> Self {
        Self::HardwareError {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call later can succeed without intervention.
    ///
    /// True for a busy doorbell or reset, and for slot/chain exhaustion.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Exhausted { .. })
    }
}
