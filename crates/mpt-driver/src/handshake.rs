//! Doorbell handshake.
//!
//! Before the queues exist the host talks to the IOC one word at a time
//! through the doorbell register:
//!
//! ```text
//! host                                    IOC
//!  │  clear HIS                            │
//!  │  HANDSHAKE | dwords ────────────────▶ │  sets USED, raises IOC2SYS
//!  │  clear HIS, wait SYS2IOC clear        │
//!  │  dword 0 ───────────────────────────▶ │  ack
//!  │  ...                                  │
//!  │  dword n-1 ─────────────────────────▶ │  ack, builds reply
//!  │ ◀──────────────────────── word16 0    │  IOC2SYS per word
//!  │  clear HIS                            │
//!  │ ◀──────────────────────── word16 1    │  MsgLength in low byte
//!  │  ...                                  │
//!  │ ◀─────────────────────── (done)       │  clears USED, IOC2SYS
//!  │  clear HIS                            │
//! ```
//!
//! Only one exchange can be in flight: every exchange takes `&mut Doorbell`,
//! and the controller keeps its `Doorbell` behind its lock.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{MptError, Result};
use crate::regio::{RegisterIo, Registers};
use crate::wait::{PollConfig, WaitMode};
use mpt_chip::mpi::{fault_code, function, IocState};
use mpt_chip::regs::{doorbell, his};
use std::time::Duration;

/// Poll budgets for the doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellTimings {
    /// Poll interval while waiting for IOC2SYS.
    pub int_interval: Duration,
    /// Budget for each IOC2SYS wait.
    pub int_budget: Duration,
    /// Poll interval while waiting for an acknowledgement, sleeping.
    pub ack_interval: Duration,
    /// Poll interval while waiting for an acknowledgement, spinning.
    pub ack_spin_interval: Duration,
    /// Budget for each acknowledgement.
    pub ack_budget: Duration,
}

impl Default for DoorbellTimings {
    fn default() -> Self {
        Self {
            int_interval: Duration::from_millis(2),
            int_budget: Duration::from_secs(10),
            ack_interval: Duration::from_millis(1),
            ack_spin_interval: Duration::from_micros(500),
            ack_budget: Duration::from_secs(5),
        }
    }
}

/// Owner of the doorbell register.
#[derive(Debug, Default)]
pub struct Doorbell {
    timings: DoorbellTimings,
}

impl Doorbell {
    /// Doorbell with the given budgets.
    pub const fn new(timings: DoorbellTimings) -> Self {
        Self { timings }
    }

    /// Current budgets.
    pub const fn timings(&self) -> &DoorbellTimings {
        &self.timings
    }

    fn wait_int<R: RegisterIo>(&self, regs: &Registers<R>, mode: WaitMode) -> Result<()> {
        let cfg = PollConfig::new(self.timings.int_interval, self.timings.int_budget, mode);
        cfg.poll(|| Ok((regs.interrupt_status() & his::IOC2SYS_DB_STATUS != 0).then_some(())))?
            .ok_or_else(|| MptError::timeout("doorbell interrupt", self.timings.int_budget))
    }

    fn wait_ack<R: RegisterIo>(&self, regs: &Registers<R>, mode: WaitMode) -> Result<()> {
        let interval = match mode {
            WaitMode::Sleep => self.timings.ack_interval,
            WaitMode::Spin => self.timings.ack_spin_interval,
        };
        let cfg = PollConfig::new(interval, self.timings.ack_budget, mode);
        cfg.poll(|| {
            let status = regs.interrupt_status();
            if status & his::SYS2IOC_DB_STATUS == 0 {
                return Ok(Some(()));
            }
            if status & his::IOC2SYS_DB_STATUS != 0 {
                let db = regs.doorbell();
                if IocState::from_doorbell(db) == IocState::Fault {
                    return Err(MptError::Fault {
                        code: fault_code(db),
                    });
                }
            }
            Ok(None)
        })?
        .ok_or_else(|| MptError::timeout("doorbell acknowledge", self.timings.ack_budget))
    }

    fn read_word<R: RegisterIo>(&self, regs: &Registers<R>, mode: WaitMode) -> Result<u16> {
        self.wait_int(regs, mode)?;
        let word = (regs.doorbell() & doorbell::DATA_MASK) as u16;
        regs.clear_interrupt_status();
        Ok(word)
    }

    /// Send `request` and read the reply into `reply`.
    ///
    /// `request` must be a whole number of dwords. The reply is read until
    /// its declared `MsgLength` or until `reply` is full; anything the IOC
    /// sends beyond the buffer is drained and discarded. Returns the number
    /// of reply bytes stored.
    ///
    /// # Errors
    ///
    /// - [`MptError::Busy`] if the doorbell is already in use
    /// - [`MptError::Timeout`] if any step is not acknowledged in time
    /// - [`MptError::Fault`] if the IOC faults while acknowledging
    pub fn request_sync<R: RegisterIo>(
        &mut self,
        regs: &Registers<R>,
        request: &[u8],
        reply: &mut [u8],
        mode: WaitMode,
    ) -> Result<usize> {
        let dwords = request.len() / 4;
        if request.len() % 4 != 0 || dwords == 0 || dwords > 0xFF {
            return Err(MptError::invalid_request(format!(
                "handshake request of {} bytes",
                request.len()
            )));
        }
        if reply.len() < 4 {
            return Err(MptError::invalid_request("handshake reply buffer under 4 bytes"));
        }

        regs.clear_interrupt_status();
        if regs.doorbell() & doorbell::USED != 0 {
            return Err(MptError::busy("doorbell in use"));
        }

        let announce = u32::from(function::HANDSHAKE) << doorbell::FUNCTION_SHIFT
            | (dwords as u32) << doorbell::ADD_DWORDS_SHIFT;
        regs.set_doorbell(announce);

        if self.wait_int(regs, mode).is_err() || regs.doorbell() & doorbell::USED == 0 {
            tracing::warn!("doorbell handshake not accepted");
            return Err(MptError::timeout("doorbell handshake start", self.timings.int_budget));
        }
        regs.clear_interrupt_status();
        self.wait_ack(regs, mode)?;

        for chunk in request.chunks_exact(4) {
            regs.set_doorbell(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            self.wait_ack(regs, mode)?;
        }

        let w0 = self.read_word(regs, mode)?;
        let w1 = self.read_word(regs, mode)?;
        reply[0..2].copy_from_slice(&w0.to_le_bytes());
        reply[2..4].copy_from_slice(&w1.to_le_bytes());

        // MsgLength is byte 2 of the reply: low byte of the second word.
        let ioc_dwords = usize::from(w1 & 0xFF);
        let buf_dwords = reply.len() / 4;
        if ioc_dwords > buf_dwords {
            tracing::warn!(
                "handshake reply of {ioc_dwords} dwords exceeds {buf_dwords}-dword buffer, discarding residual"
            );
        }
        let keep = ioc_dwords.min(buf_dwords) * 2;
        for i in 2..keep {
            let w = self.read_word(regs, mode)?;
            reply[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
        }
        for _ in keep.max(2)..ioc_dwords * 2 {
            self.read_word(regs, mode)?;
        }

        self.wait_int(regs, mode)?;
        if regs.doorbell() & doorbell::USED != 0 {
            tracing::warn!("doorbell still in use after handshake");
        }
        regs.clear_interrupt_status();

        Ok(keep.max(2) * 2)
    }

    /// Reclaim the IOC from the operational state with a message unit reset.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::Timeout`] or [`MptError::Fault`] if the IOC does
    /// not acknowledge.
    pub fn message_unit_reset<R: RegisterIo>(
        &mut self,
        regs: &Registers<R>,
        mode: WaitMode,
    ) -> Result<()> {
        tracing::debug!("sending message unit reset");
        regs.set_doorbell(u32::from(function::IOC_MESSAGE_UNIT_RESET) << doorbell::FUNCTION_SHIFT);
        self.wait_ack(regs, mode)
    }
}
