//! Diagnostic reset and the transition to `Ready`.
//!
//! Both loops are bounded by [`ResetTimings`]; the iteration counts come
//! from the budgets, so an IOC that never shows the expected bits produces
//! [`MptError::Timeout`] rather than a hang.

use crate::error::{MptError, Result};
use crate::handshake::Doorbell;
use crate::regio::{RegisterIo, Registers};
use crate::wait::{PollConfig, WaitMode};
use mpt_chip::mpi::{fault_code, who_init, IocState};
use mpt_chip::regs::{diag, doorbell, who_init as owner, FLUSH_KEY, UNLOCK_KEYS};
use std::time::Duration;

/// Budgets for reset and bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTimings {
    /// Attempts at the unlock sequence.
    pub unlock_attempts: u32,
    /// Wait after each unlock sequence before checking write-enable.
    pub unlock_wait: Duration,
    /// First wait after setting reset-adapter.
    pub first_reset_wait: Duration,
    /// Later waits while the adapter resets.
    pub reset_poll_interval: Duration,
    /// Total time allowed for the adapter to come out of reset.
    pub reset_budget: Duration,
    /// Delay between transition-to-ready probes.
    pub ready_interval: Duration,
    /// Total time allowed to reach `Ready`.
    pub ready_budget: Duration,
}

impl Default for ResetTimings {
    fn default() -> Self {
        Self {
            unlock_attempts: 20,
            unlock_wait: Duration::from_millis(100),
            first_reset_wait: Duration::from_millis(256),
            reset_poll_interval: Duration::from_millis(50),
            reset_budget: Duration::from_secs(300),
            ready_interval: Duration::from_millis(50),
            ready_budget: Duration::from_secs(60),
        }
    }
}

impl ResetTimings {
    /// Maximum transition-to-ready probes.
    pub fn ready_attempts(&self) -> u64 {
        PollConfig::new(self.ready_interval, self.ready_budget, WaitMode::Sleep).max_polls()
    }
}

/// Hard-reset the IOC through the host diagnostic register.
///
/// # Errors
///
/// Returns [`MptError::Timeout`] if the register never unlocks or the
/// adapter never leaves reset.
pub fn diag_reset<R: RegisterIo>(
    regs: &Registers<R>,
    timings: &ResetTimings,
    mode: WaitMode,
) -> Result<()> {
    tracing::info!("diagnostic reset");
    regs.clear_interrupt_status();

    let mut diag_reg = None;
    for attempt in 0..timings.unlock_attempts {
        for key in UNLOCK_KEYS {
            regs.set_write_sequence(key);
        }
        mode.pause(timings.unlock_wait);
        let reg = regs.host_diagnostic();
        if reg & diag::DIAG_WRITE_ENABLE != 0 {
            tracing::debug!("diagnostic register unlocked after {} attempt(s)", attempt + 1);
            diag_reg = Some(reg);
            break;
        }
    }
    let Some(reg) = diag_reg else {
        tracing::error!("diagnostic register never unlocked");
        let total = timings.unlock_wait * timings.unlock_attempts;
        return Err(MptError::timeout("diagnostic unlock", total));
    };

    regs.set_host_diagnostic(reg | diag::RESET_ADAPTER);

    let polls = PollConfig::new(timings.reset_poll_interval, timings.reset_budget, mode).max_polls();
    let mut recovered = false;
    for i in 0..polls {
        mode.pause(if i == 0 {
            timings.first_reset_wait
        } else {
            timings.reset_poll_interval
        });
        if regs.host_diagnostic() & diag::RESET_ADAPTER != 0 {
            continue;
        }
        if regs.ioc_state() != IocState::Reset {
            recovered = true;
            break;
        }
    }
    if !recovered {
        tracing::error!("IOC did not come out of diagnostic reset");
        return Err(MptError::timeout("adapter reset", timings.reset_budget));
    }

    regs.set_write_sequence(FLUSH_KEY);
    tracing::info!("diagnostic reset complete, IOC {:?}", regs.ioc_state());
    Ok(())
}

/// Drive the IOC into the `Ready` state.
///
/// A busy doorbell or a fault forces a diagnostic reset, an operational IOC
/// is reclaimed with a message unit reset, and an IOC still in reset is
/// given time.
///
/// # Errors
///
/// - [`MptError::ExclusiveOwnership`] if a PCI peer owns the IOC
/// - [`MptError::InvalidState`] for an unknown state encoding
/// - [`MptError::Timeout`] if `Ready` is not reached within the budget
pub fn transition_ready<R: RegisterIo>(
    regs: &Registers<R>,
    doorbell_owner: &mut Doorbell,
    timings: &ResetTimings,
    mode: WaitMode,
) -> Result<()> {
    let attempts = timings.ready_attempts();
    for attempt in 0..attempts {
        let db = regs.doorbell();
        tracing::trace!("transition_ready attempt {attempt}: doorbell {db:#010x}");

        if who_init(db) == owner::PCI_PEER {
            tracing::error!("IOC is owned by a PCI peer");
            return Err(MptError::ExclusiveOwnership);
        }
        if db & doorbell::USED != 0 {
            diag_reset(regs, timings, mode)?;
            mode.pause(timings.ready_interval);
            continue;
        }

        match IocState::from_doorbell(db) {
            IocState::Ready => {
                tracing::debug!("IOC ready after {} probe(s)", attempt + 1);
                return Ok(());
            }
            IocState::Fault => {
                tracing::warn!("IOC in fault state {:#06x}, resetting", fault_code(db));
                diag_reset(regs, timings, mode)?;
            }
            IocState::Operational => {
                doorbell_owner.message_unit_reset(regs, mode)?;
            }
            IocState::Reset => {}
            state @ (IocState::Coredump | IocState::Unknown(_)) => {
                tracing::error!("IOC in unexpected state {state:?}");
                return Err(MptError::invalid_state(format!("{state:?}")));
            }
        }
        mode.pause(timings.ready_interval);
    }
    Err(MptError::timeout("transition to ready", timings.ready_budget))
}
