//! Software model of a Fusion-MPT IOC.
//!
//! [`SimulatedIoc`] implements [`RegisterIo`] over a model of the system
//! register window, so the whole engine runs without hardware. The model
//! covers what the engine relies on:
//!
//! - the doorbell handshake, one 16-bit reply word per interrupt
//! - message unit reset and the diagnostic unlock/reset sequence
//! - IOC Facts and IOC Init, with the queue addresses resolved through the
//!   shared [`HostMemory`]
//! - request descriptors, processed synchronously when the high half is
//!   written, answered through the reply free and reply post queues
//! - event notifications filtered by the mask the host registered
//!
//! Faults are injected through the setters (`inject_fault`,
//! `stick_doorbell`, `break_unlock`, ...). The model is intentionally
//! strict about ordering: a descriptor posted before IOC Init is dropped,
//! and IOC Init naming memory the host never allocated is rejected.

mod firmware;

pub use firmware::{IoFailure, IoRecord};

use crate::dma::HostMemory;
use crate::regio::RegisterIo;
use firmware::Queues;
use mpt_chip::descriptor::RequestDescriptor;
use mpt_chip::mpi::{function, IocState, EVENT_MASK_WORDS, HEADER_VERSION, MPI2_VERSION};
use mpt_chip::msg::{IocFacts, IocPage8};
use mpt_chip::regs::{self, diag, doorbell, his, him, who_init, FLUSH_KEY, UNLOCK_KEYS};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Counters kept by the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Completed diagnostic resets.
    pub diag_resets: u32,
    /// Complete unlock key sequences written, successful or not.
    pub unlock_sequences: u32,
    /// Message unit resets accepted.
    pub message_unit_resets: u32,
    /// IOC Init requests accepted.
    pub ioc_inits: u32,
    /// Request descriptors processed.
    pub requests: u64,
    /// Event notifications delivered.
    pub events_posted: u64,
    /// Address replies dropped for lack of a free reply frame.
    pub replies_dropped: u64,
}

#[derive(Debug)]
enum Handshake {
    Idle,
    Receiving { expected: usize, words: Vec<u32> },
    Replying(VecDeque<u16>),
}

#[derive(Debug)]
struct Ioc {
    memory: HostMemory,
    facts: IocFacts,
    facts_after_reset: Option<IocFacts>,
    ioc_page8: IocPage8,

    state: IocState,
    fault_code: u16,
    peer_owned: bool,
    initialized_by_host: bool,

    handshake: Handshake,
    interrupt_status: u32,
    interrupt_mask: u32,
    write_enable: bool,
    key_position: usize,
    reset_stuck: bool,

    reply_free_host_index: u32,
    reply_post_host_index: u32,
    pending_low: u32,
    queues: Option<Queues>,

    event_masks: [u32; EVENT_MASK_WORDS],
    event_context: u32,
    hold: bool,
    held: VecDeque<RequestDescriptor>,
    next_failure: Option<IoFailure>,
    misdirect_next: bool,
    io_log: Vec<IoRecord>,

    stick_doorbell: bool,
    silence_doorbell: bool,
    break_unlock: bool,
    stick_in_reset: bool,

    stats: SimStats,
}

/// A Fusion-MPT IOC in software.
///
/// Cloning yields another handle to the same IOC.
#[derive(Debug, Clone)]
pub struct SimulatedIoc {
    inner: Arc<Mutex<Ioc>>,
}

impl Default for SimulatedIoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Facts of a SAS2308-class IOC.
pub fn default_facts() -> IocFacts {
    IocFacts {
        msg_version: MPI2_VERSION,
        header_version: HEADER_VERSION,
        max_chain_depth: 128,
        number_of_ports: 1,
        max_msix_vectors: 16,
        request_credit: 1024,
        product_id: 0x2713,
        ioc_capabilities: 0x0000_3C9C,
        fw_version: 0x1400_0700,
        ioc_request_frame_size: 32,
        max_initiators: 32,
        max_targets: 1024,
        max_sas_expanders: 64,
        max_enclosures: 65,
        protocol_flags: 0x0002,
        high_priority_credit: 128,
        max_reply_descriptor_post_queue_depth: 2048,
        reply_frame_size: 32,
        max_volumes: 2,
        max_dev_handle: 1100,
        max_persistent_entries: 128,
        min_dev_handle: 9,
        ..IocFacts::default()
    }
}

impl SimulatedIoc {
    /// A `Ready` IOC reporting [`default_facts`].
    pub fn new() -> Self {
        Self::with_facts(default_facts())
    }

    /// A `Ready` IOC reporting `facts`.
    pub fn with_facts(facts: IocFacts) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ioc {
                memory: HostMemory::new(),
                facts,
                facts_after_reset: None,
                ioc_page8: IocPage8 {
                    num_devs_per_enclosure: 24,
                    max_persistent_entries: 128,
                    max_num_physical_mapped_ids: 1,
                    flags: 0x0002,
                    ir_volume_mapping_flags: 0,
                },
                state: IocState::Ready,
                fault_code: 0,
                peer_owned: false,
                initialized_by_host: false,
                handshake: Handshake::Idle,
                interrupt_status: 0,
                interrupt_mask: him::ENGINE,
                write_enable: false,
                key_position: 0,
                reset_stuck: false,
                reply_free_host_index: 0,
                reply_post_host_index: 0,
                pending_low: 0,
                queues: None,
                event_masks: [u32::MAX; EVENT_MASK_WORDS],
                event_context: 0,
                hold: false,
                held: VecDeque::new(),
                next_failure: None,
                misdirect_next: false,
                io_log: Vec::new(),
                stick_doorbell: false,
                silence_doorbell: false,
                break_unlock: false,
                stick_in_reset: false,
                stats: SimStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ioc> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// DMA memory the IOC can see. Hand this to the controller as its
    /// allocator.
    pub fn memory(&self) -> HostMemory {
        self.lock().memory.clone()
    }

    /// Facts the IOC reports.
    pub fn facts(&self) -> IocFacts {
        self.lock().facts
    }

    /// Report `facts` from now on.
    pub fn set_facts(&self, facts: IocFacts) {
        self.lock().facts = facts;
    }

    /// Report `facts` after the next diagnostic reset.
    pub fn set_facts_after_reset(&self, facts: IocFacts) {
        self.lock().facts_after_reset = Some(facts);
    }

    /// IOC Page 8 returned to config reads.
    pub fn set_ioc_page8(&self, page: IocPage8) {
        self.lock().ioc_page8 = page;
    }

    /// Counters.
    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    /// Current IOC state.
    pub fn state(&self) -> IocState {
        self.lock().state
    }

    /// Whether the engine's interrupts are masked.
    pub fn interrupts_masked(&self) -> bool {
        self.lock().interrupt_mask & him::ENGINE == him::ENGINE
    }

    /// Suppression masks from the last Event Notification.
    pub fn event_masks(&self) -> [u32; EVENT_MASK_WORDS] {
        self.lock().event_masks
    }

    /// SCSI IO requests seen so far.
    pub fn io_log(&self) -> Vec<IoRecord> {
        self.lock().io_log.clone()
    }

    // ── Fault injection ──────────────────────────────────────────────────

    /// Keep the doorbell `USED` bit set.
    pub fn stick_doorbell(&self, on: bool) {
        self.lock().stick_doorbell = on;
    }

    /// Ignore every doorbell write.
    pub fn silence_doorbell(&self, on: bool) {
        self.lock().silence_doorbell = on;
    }

    /// Never grant diagnostic write access.
    pub fn break_unlock(&self, on: bool) {
        self.lock().break_unlock = on;
    }

    /// Never come out of a diagnostic reset.
    pub fn stick_in_reset(&self, on: bool) {
        self.lock().stick_in_reset = on;
    }

    /// Enter the fault state with `code`.
    pub fn inject_fault(&self, code: u16) {
        let mut ioc = self.lock();
        tracing::debug!("sim: fault {code:#06x}");
        ioc.state = IocState::Fault;
        ioc.fault_code = code;
        ioc.handshake = Handshake::Idle;
    }

    /// Put the IOC in `state` without any side effects.
    pub fn force_state(&self, state: IocState) {
        let mut ioc = self.lock();
        ioc.state = state;
        if state == IocState::Operational {
            ioc.initialized_by_host = true;
        }
    }

    /// Make the IOC operational under a PCI peer.
    pub fn set_peer_owned(&self, on: bool) {
        let mut ioc = self.lock();
        ioc.peer_owned = on;
        if on {
            ioc.state = IocState::Operational;
        }
    }

    /// Accept requests but hold their replies until
    /// [`Self::release_completions`] or the next diagnostic reset.
    pub fn hold_completions(&self, on: bool) {
        self.lock().hold = on;
    }

    /// Process every held request. Returns how many there were.
    pub fn release_completions(&self) -> usize {
        let mut ioc = self.lock();
        ioc.hold = false;
        let held: Vec<_> = ioc.held.drain(..).collect();
        let n = held.len();
        for desc in held {
            ioc.process(desc);
        }
        n
    }

    /// Requests waiting for [`Self::release_completions`].
    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Answer the next SCSI IO with `failure`.
    pub fn fail_next_io(&self, failure: IoFailure) {
        self.lock().next_failure = Some(failure);
    }

    /// Report the next address reply at a frame outside the pool.
    pub fn misdirect_next_reply(&self) {
        self.lock().misdirect_next = true;
    }

    /// Deliver event `code` unless the host masked it. Returns whether it
    /// was posted.
    pub fn post_event(&self, code: u16, data: &[u8]) -> bool {
        self.lock().post_event(code, data)
    }
}

impl Ioc {
    fn doorbell_value(&self) -> u32 {
        let owner = if self.peer_owned {
            who_init::PCI_PEER
        } else if self.initialized_by_host {
            who_init::HOST_DRIVER
        } else {
            who_init::NONE
        };
        let mut db = self.state.to_doorbell() | u32::from(owner) << doorbell::WHO_INIT_SHIFT;
        match &self.handshake {
            Handshake::Idle => {}
            Handshake::Receiving { .. } => db |= doorbell::USED,
            Handshake::Replying(words) => {
                db |= doorbell::USED | u32::from(words.front().copied().unwrap_or(0));
            }
        }
        if self.state == IocState::Fault {
            db |= u32::from(self.fault_code);
        }
        if self.stick_doorbell {
            db |= doorbell::USED;
        }
        db
    }

    fn write_doorbell(&mut self, value: u32) {
        if self.silence_doorbell {
            return;
        }
        if let Handshake::Receiving { expected, words } = &mut self.handshake {
            words.push(value);
            if words.len() == *expected {
                let request: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
                let reply = self.handshake_reply(&request);
                let words = reply
                    .chunks(2)
                    .map(|c| u16::from_le_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
                    .collect();
                self.handshake = Handshake::Replying(words);
                self.interrupt_status |= his::IOC2SYS_DB_STATUS;
            }
            return;
        }

        #[allow(clippy::cast_possible_truncation)]
        let func = (value >> doorbell::FUNCTION_SHIFT) as u8;
        match func {
            function::HANDSHAKE if self.state != IocState::Fault => {
                let dwords = ((value >> doorbell::ADD_DWORDS_SHIFT) & 0xFF) as usize;
                self.handshake = Handshake::Receiving {
                    expected: dwords,
                    words: Vec::with_capacity(dwords),
                };
                self.interrupt_status |= his::IOC2SYS_DB_STATUS;
            }
            function::IOC_MESSAGE_UNIT_RESET
                if matches!(self.state, IocState::Operational | IocState::Ready) =>
            {
                tracing::debug!("sim: message unit reset");
                self.stats.message_unit_resets += 1;
                self.drop_queues();
                self.state = IocState::Ready;
            }
            other => tracing::debug!("sim: ignoring doorbell function {other:#04x}"),
        }
    }

    fn clear_doorbell_interrupt(&mut self) {
        self.interrupt_status &= !his::IOC2SYS_DB_STATUS;
        if let Handshake::Replying(words) = &mut self.handshake {
            words.pop_front();
            if words.is_empty() {
                self.handshake = Handshake::Idle;
            }
            self.interrupt_status |= his::IOC2SYS_DB_STATUS;
        }
    }

    fn write_sequence(&mut self, key: u32) {
        if key == FLUSH_KEY {
            self.write_enable = false;
        }
        if key == UNLOCK_KEYS[self.key_position] {
            self.key_position += 1;
        } else {
            self.key_position = usize::from(key == UNLOCK_KEYS[0]);
        }
        if self.key_position == UNLOCK_KEYS.len() {
            self.key_position = 0;
            self.stats.unlock_sequences += 1;
            self.write_enable = !self.break_unlock;
        }
    }

    fn host_diagnostic(&self) -> u32 {
        let mut v = 0;
        if self.write_enable {
            v |= diag::DIAG_WRITE_ENABLE;
        }
        if self.reset_stuck {
            v |= diag::RESET_ADAPTER;
        }
        v
    }

    fn write_host_diagnostic(&mut self, value: u32) {
        if !self.write_enable || value & diag::RESET_ADAPTER == 0 {
            return;
        }
        if self.stick_in_reset {
            tracing::debug!("sim: adapter reset never completes");
            self.reset_stuck = true;
            self.state = IocState::Reset;
            self.drop_queues();
            return;
        }
        self.diag_reset();
    }

    fn diag_reset(&mut self) {
        tracing::debug!("sim: diagnostic reset");
        self.stats.diag_resets += 1;
        self.drop_queues();
        if let Some(f) = self.facts_after_reset.take() {
            self.facts = f;
        }
        self.state = IocState::Ready;
        self.fault_code = 0;
        self.initialized_by_host = false;
        self.handshake = Handshake::Idle;
        self.interrupt_status = 0;
        self.interrupt_mask = him::ENGINE;
        self.hold = false;
        self.event_masks = [u32::MAX; EVENT_MASK_WORDS];
    }

    fn drop_queues(&mut self) {
        self.queues = None;
        self.held.clear();
        self.reply_free_host_index = 0;
        self.reply_post_host_index = 0;
        self.interrupt_status &= !his::REPLY_DESCRIPTOR_INTERRUPT;
    }

    fn post_descriptor(&mut self, high: u32) {
        let desc = RequestDescriptor::from_words(self.pending_low, high);
        if self.state != IocState::Operational || self.queues.is_none() {
            tracing::warn!("sim: descriptor for SMID {} before IOC Init, dropped", desc.smid);
            return;
        }
        if self.hold {
            self.held.push_back(desc);
        } else {
            self.process(desc);
        }
    }
}

impl RegisterIo for SimulatedIoc {
    fn read32(&self, offset: usize) -> u32 {
        let ioc = self.lock();
        match offset {
            regs::DOORBELL => ioc.doorbell_value(),
            regs::HOST_DIAGNOSTIC => ioc.host_diagnostic(),
            regs::HOST_INTERRUPT_STATUS => ioc.interrupt_status,
            regs::HOST_INTERRUPT_MASK => ioc.interrupt_mask,
            regs::REPLY_FREE_HOST_INDEX => ioc.reply_free_host_index,
            regs::REPLY_POST_HOST_INDEX => ioc.reply_post_host_index,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut ioc = self.lock();
        match offset {
            regs::DOORBELL => ioc.write_doorbell(value),
            regs::WRITE_SEQUENCE => ioc.write_sequence(value),
            regs::HOST_DIAGNOSTIC => ioc.write_host_diagnostic(value),
            regs::HOST_INTERRUPT_STATUS => ioc.clear_doorbell_interrupt(),
            regs::HOST_INTERRUPT_MASK => ioc.interrupt_mask = value,
            regs::REPLY_FREE_HOST_INDEX => ioc.reply_free_host_index = value,
            regs::REPLY_POST_HOST_INDEX => {
                ioc.reply_post_host_index = value;
                if ioc.queues.as_ref().is_some_and(|q| u32::from(q.post_index) == value) {
                    ioc.interrupt_status &= !his::REPLY_DESCRIPTOR_INTERRUPT;
                }
            }
            regs::REQUEST_DESCRIPTOR_POST_LOW => ioc.pending_low = value,
            regs::REQUEST_DESCRIPTOR_POST_HIGH => ioc.post_descriptor(value),
            _ => tracing::trace!("sim: write {value:#x} to unmodelled register {offset:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regio::Registers;

    #[test]
    fn starts_ready_and_masked() {
        let sim = SimulatedIoc::new();
        let regs = Registers(sim.clone());
        assert_eq!(regs.ioc_state(), IocState::Ready);
        assert!(sim.interrupts_masked());
        assert_eq!(regs.doorbell() & doorbell::USED, 0);
    }

    #[test]
    fn unlock_needs_the_whole_sequence() {
        let sim = SimulatedIoc::new();
        let regs = Registers(sim.clone());
        for key in &UNLOCK_KEYS[..6] {
            regs.set_write_sequence(*key);
        }
        assert_eq!(regs.host_diagnostic() & diag::DIAG_WRITE_ENABLE, 0);
        regs.set_write_sequence(UNLOCK_KEYS[6]);
        assert_ne!(regs.host_diagnostic() & diag::DIAG_WRITE_ENABLE, 0);
        regs.set_write_sequence(FLUSH_KEY);
        assert_eq!(regs.host_diagnostic() & diag::DIAG_WRITE_ENABLE, 0);
        assert_eq!(sim.stats().unlock_sequences, 1);
    }

    #[test]
    fn locked_diagnostic_ignores_reset() {
        let sim = SimulatedIoc::new();
        sim.inject_fault(0x0042);
        let regs = Registers(sim.clone());
        regs.set_host_diagnostic(diag::RESET_ADAPTER);
        assert_eq!(sim.state(), IocState::Fault);
        assert_eq!(regs.doorbell() & doorbell::FAULT_CODE_MASK, 0x0042);
        assert_eq!(sim.stats().diag_resets, 0);
    }

    #[test]
    fn facts_change_after_reset() {
        let sim = SimulatedIoc::new();
        let mut next = sim.facts();
        next.request_credit = 256;
        sim.set_facts_after_reset(next);
        let regs = Registers(sim.clone());
        for key in UNLOCK_KEYS {
            regs.set_write_sequence(key);
        }
        regs.set_host_diagnostic(diag::RESET_ADAPTER);
        assert_eq!(sim.facts().request_credit, 256);
    }

    #[test]
    fn descriptors_before_init_are_dropped() {
        let sim = SimulatedIoc::new();
        let regs = Registers(sim.clone());
        regs.post_request(0x0001_0008, 0);
        assert_eq!(sim.stats().requests, 0);
    }

    #[test]
    fn masked_events_are_not_posted() {
        let sim = SimulatedIoc::new();
        assert!(!sim.post_event(mpt_chip::mpi::event::SAS_DISCOVERY, &[]));
        assert_eq!(sim.stats().events_posted, 0);
    }
}
