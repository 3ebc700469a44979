//! The controller: bring-up, submission, completion and recovery.
//!
//! ```text
//! attach ──▶ transition_ready ──▶ facts/alloc/IOC Init ──▶ unmask
//!        ──▶ IOC Page 8 ──▶ mapping_rebuild ──▶ event mask ──▶ start_discovery
//!
//! reinit ──▶ mask ──▶ diag reset ──▶ restore_pci_state ──▶ flush (DroppedByReset)
//!        ──▶ on_reinit ──▶ facts/alloc/IOC Init ──▶ mapping_teardown ──▶ unmask
//!        ──▶ IOC Page 8 ──▶ mapping_rebuild ──▶ event mask (async) ──▶ start_discovery
//! ```
//!
//! One mutex guards the engine, the doorbell and the event registry. Hooks
//! and event listeners always run with it released, so they may call back
//! into the controller.

use crate::alloc::{QueueSet, QueueSizing};
use crate::config::{ControllerConfig, FatalPolicy};
use crate::config_page::{self, StaticConfig};
use crate::dma::DmaAllocator;
use crate::engine::{completion_channel, Deferred, Engine};
use crate::error::{MptError, Result};
use crate::events::{self, EventHandle, EventListener, EventMask, EventNotification, EventRegistry};
use crate::facts::{self, IocCapabilities};
use crate::handshake::Doorbell;
use crate::ratelimit::RateLimiter;
use crate::regio::{RegisterIo, Registers};
use crate::request::{Completer, Completion, Request, Submission};
use crate::reset;
use crate::wait::WaitMode;
use mpt_chip::mpi::{fault, fault_code, IocState};
use mpt_chip::msg::{self, IocFacts, IocPage8};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const CHAIN_LOG_PERIOD: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper-layer collaborators. Every method defaults to doing nothing.
pub trait HostHooks: Send + Sync {
    /// Begin target discovery (port enable).
    fn start_discovery(&self) {}
    /// Resume I/O held back while a reset was in progress.
    fn release_pending_io(&self) {}
    /// Restore PCI configuration saved before the reset.
    fn restore_pci_state(&self) {}
    /// A reset has invalidated every in-flight command.
    fn on_reinit(&self) {}
    /// Drop device mapping state that the reset made stale.
    fn mapping_teardown(&self) {}
    /// Rebuild device mapping from the static configuration.
    fn mapping_rebuild(&self, _config: &StaticConfig) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl HostHooks for NoHooks {}

/// Health of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Accepting requests.
    Operational,
    /// Recovering; requests fail with `Busy`.
    Degraded,
    /// Stopped; requests fail with `ControllerFailed`.
    Failed,
}

impl ControllerState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Operational => 0,
            Self::Degraded => 1,
            Self::Failed => 2,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Operational,
            1 => Self::Degraded,
            _ => Self::Failed,
        }
    }
}

/// Snapshot of pool and queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStats {
    /// Commands posted and not completed.
    pub io_cmds_active: u32,
    /// Free normal slots.
    pub free_requests: usize,
    /// Free high-priority slots.
    pub free_high_priority: usize,
    /// Free chain frames.
    pub free_chains: u32,
    /// Fewest free chain frames seen since the pool was built.
    pub chain_low_water: u32,
    /// Host reply post index.
    pub reply_post_index: u16,
    /// Host reply free index.
    pub reply_free_index: u16,
}

struct Inner {
    doorbell: Doorbell,
    facts: IocFacts,
    engine: Option<Engine>,
    events: EventRegistry,
    static_config: StaticConfig,
    release_pending_io: bool,
    attached: bool,
}

enum Action {
    Dispatch(Vec<EventListener>, EventNotification),
    StartDiscovery,
}

/// A Fusion-MPT IOC driven through register window `R`.
pub struct Controller<R: RegisterIo> {
    regs: Registers<R>,
    allocator: Arc<dyn DmaAllocator>,
    hooks: Arc<dyn HostHooks>,
    config: ControllerConfig,
    inner: Mutex<Inner>,
    resetting: AtomicBool,
    state: AtomicU8,
    chain_log: RateLimiter,
}

impl<R: RegisterIo> std::fmt::Debug for Controller<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .field("resetting", &self.is_resetting())
            .finish_non_exhaustive()
    }
}

/// Fetch facts, size and (re)allocate, initialise the queues and send IOC
/// Init. `previous` is the facts and engine of the last bring-up; its
/// regions are reused unless the facts changed.
fn iocfacts_allocate<R: RegisterIo>(
    regs: &Registers<R>,
    doorbell: &mut Doorbell,
    allocator: &dyn DmaAllocator,
    config: &ControllerConfig,
    previous: Option<(IocFacts, Engine)>,
    attaching: bool,
) -> Result<(IocFacts, Engine)> {
    let facts = facts::get_iocfacts(regs, doorbell, WaitMode::Sleep)?;
    tracing::info!(
        "IOC firmware {}, request credit {}, capabilities {:?}",
        facts.fw_version_string(),
        facts.request_credit,
        facts::capabilities(&facts)
    );

    if attaching && !facts::capabilities(&facts).contains(IocCapabilities::EVENT_REPLAY) {
        tracing::info!("IOC lacks event replay, resetting before use");
        reset::diag_reset(regs, &config.reset, WaitMode::Sleep)?;
        reset::transition_ready(regs, doorbell, &config.reset, WaitMode::Sleep)?;
    }

    let queues = match previous {
        Some((old, engine)) if !facts::requires_reallocation(&old, &facts) => {
            tracing::debug!("IOC Facts unchanged, keeping allocations");
            engine.into_queues()
        }
        previous => {
            drop(previous);
            let sizing = QueueSizing::compute(&facts, config)?;
            QueueSet::allocate(allocator, sizing)?
        }
    };

    let mut engine = Engine::new(queues);
    engine.init_queues();
    let init = engine.queues().ioc_init(facts::timestamp_ms());
    facts::send_iocinit(regs, doorbell, &init, WaitMode::Sleep)?;
    engine.publish_indices(regs);
    Ok((facts, engine))
}

impl<R: RegisterIo> Controller<R> {
    /// Bring the IOC up and return a running controller.
    ///
    /// # Errors
    ///
    /// Any bring-up failure is returned as is; nothing is retried.
    pub fn attach(
        regs: R,
        allocator: Arc<dyn DmaAllocator>,
        hooks: Arc<dyn HostHooks>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let regs = Registers(regs);
        let mut doorbell = Doorbell::new(config.doorbell);

        reset::transition_ready(&regs, &mut doorbell, &config.reset, WaitMode::Sleep)?;
        let (facts, engine) =
            iocfacts_allocate(&regs, &mut doorbell, allocator.as_ref(), &config, None, true)?;

        let ctrl = Self {
            regs,
            allocator,
            hooks,
            config,
            inner: Mutex::new(Inner {
                doorbell,
                facts,
                engine: Some(engine),
                events: EventRegistry::new(),
                static_config: StaticConfig::default(),
                release_pending_io: false,
                attached: false,
            }),
            resetting: AtomicBool::new(false),
            state: AtomicU8::new(ControllerState::Operational.to_u8()),
            chain_log: RateLimiter::new(CHAIN_LOG_PERIOD),
        };
        ctrl.regs.unmask_interrupts();

        let static_config = ctrl.read_static_config()?;
        ctrl.hooks.mapping_rebuild(&static_config);
        ctrl.send_event_mask()?;
        ctrl.lock().attached = true;
        ctrl.hooks.start_discovery();

        tracing::info!("controller attached");
        Ok(ctrl)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register window.
    pub const fn registers(&self) -> &Registers<R> {
        &self.regs
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ControllerState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Whether a reset is in progress.
    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    /// Facts of the current bring-up.
    pub fn facts(&self) -> IocFacts {
        self.lock().facts
    }

    /// Configuration read at the last bring-up.
    pub fn static_config(&self) -> StaticConfig {
        self.lock().static_config
    }

    /// Engine configuration.
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Handle on the current DMA regions.
    pub fn queue_set(&self) -> Option<QueueSet> {
        self.lock().engine.as_ref().map(|e| e.queues().clone())
    }

    /// Pool and queue counters.
    pub fn stats(&self) -> Option<ControllerStats> {
        let inner = self.lock();
        let e = inner.engine.as_ref()?;
        Some(ControllerStats {
            io_cmds_active: e.io_cmds_active(),
            free_requests: e.pool().free_count(),
            free_high_priority: e.pool().free_high_count(),
            free_chains: e.pool().free_chains(),
            chain_low_water: e.pool().chain_low_water(),
            reply_post_index: e.reply_post_index(),
            reply_free_index: e.reply_free_index(),
        })
    }

    fn check_usable(&self) -> Result<()> {
        match self.state() {
            ControllerState::Failed => Err(MptError::controller_failed("controller has failed")),
            _ if self.is_resetting() => Err(MptError::busy("reset in progress")),
            _ => Ok(()),
        }
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Post `request`.
    ///
    /// # Errors
    ///
    /// - [`MptError::Busy`] during a reset
    /// - [`MptError::Exhausted`] with no free slot or chain frame
    /// - [`MptError::ControllerFailed`] once the controller has failed
    pub fn submit(&self, request: Request) -> Result<Submission> {
        self.check_usable()?;
        let (completer, finish) = completion_channel();
        let mut inner = self.lock();
        self.check_usable()?;
        let engine = inner
            .engine
            .as_mut()
            .ok_or_else(|| MptError::controller_failed("no queues"))?;
        let smid = engine.post(&self.regs, &request, completer, &self.chain_log)?;
        Ok(finish(smid))
    }

    fn post_internal(&self, request: &Request, completer: Completer) -> Result<()> {
        let mut inner = self.lock();
        let engine = inner
            .engine
            .as_mut()
            .ok_or_else(|| MptError::controller_failed("no queues"))?;
        engine.post(&self.regs, request, completer, &self.chain_log)?;
        Ok(())
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// Interrupt entry point: drain the reply post queue.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::ReplyOutOfRange`] if the IOC reported a reply
    /// frame outside the pool; the controller is then failed.
    pub fn handle_interrupt(&self) -> Result<()> {
        self.drain()
    }

    fn drain(&self) -> Result<()> {
        if self.is_resetting() || self.state() == ControllerState::Failed {
            return Ok(());
        }
        let actions = {
            let mut inner = self.lock();
            let Some(engine) = inner.engine.as_mut() else {
                return Ok(());
            };
            match engine.drain(&self.regs) {
                Ok(deferred) => resolve(&inner.events, deferred),
                Err(e) => {
                    drop(inner);
                    self.mark_failed(&e.to_string());
                    return Err(e);
                }
            }
        };
        self.run(actions);
        Ok(())
    }

    fn run(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dispatch(listeners, event) => {
                    events::dispatch(&listeners, &event);
                }
                Action::StartDiscovery => self.hooks.start_discovery(),
            }
        }
    }

    fn poll_completion(&self, submission: &Submission, budget: Duration) -> Result<Completion> {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(c) = submission.try_completion() {
                return Ok(c);
            }
            if self.state() == ControllerState::Failed {
                return Err(MptError::controller_failed("controller failed while waiting"));
            }
            self.drain()?;
            if let Some(c) = submission.try_completion() {
                return Ok(c);
            }
            if Instant::now() >= deadline {
                return Err(MptError::timeout(
                    format!("{}", submission.smid()),
                    budget,
                ));
            }
            WaitMode::Sleep.pause(POLL_INTERVAL);
        }
    }

    /// Drain the reply queue until `submission` completes.
    ///
    /// On timeout the controller is reset (once it has finished attaching)
    /// and [`MptError::Timeout`] is returned; the submission then holds its
    /// `DroppedByReset` completion.
    ///
    /// # Errors
    ///
    /// - [`MptError::Timeout`] if no completion arrived in `timeout`
    ///   (default: the configured command timeout)
    /// - [`MptError::ControllerFailed`] if the controller fails meanwhile
    pub fn wait_command(&self, submission: &Submission, timeout: Option<Duration>) -> Result<Completion> {
        let budget = timeout.unwrap_or(self.config.command_timeout);
        match self.poll_completion(submission, budget) {
            Err(e @ MptError::Timeout { .. }) => {
                tracing::error!("{} timed out after {budget:?}", submission.smid());
                if self.lock().attached {
                    if let Err(re) = self.reinit() {
                        tracing::error!("recovery after timeout failed: {re}");
                    }
                }
                Err(e)
            }
            other => other,
        }
    }

    // ── Events ───────────────────────────────────────────────────────────

    /// Listen for the events in `mask`.
    ///
    /// # Errors
    ///
    /// Propagates failures sending the new mask. During a reset the mask is
    /// sent by the reset itself.
    pub fn register_events(&self, mask: EventMask, listener: EventListener) -> Result<EventHandle> {
        let handle = self.lock().events.register(mask, listener);
        self.send_event_mask_unless_resetting()?;
        Ok(handle)
    }

    /// Stop listening.
    ///
    /// # Errors
    ///
    /// Propagates failures sending the new mask.
    pub fn deregister_events(&self, handle: EventHandle) -> Result<()> {
        if !self.lock().events.deregister(handle) {
            tracing::warn!("deregistering unknown event handle {handle:?}");
        }
        self.send_event_mask_unless_resetting()
    }

    /// Suppression mask currently implied by the registrations.
    pub fn event_mask(&self) -> EventMask {
        self.lock().events.hardware_mask()
    }

    fn send_event_mask_unless_resetting(&self) -> Result<()> {
        match self.send_event_mask() {
            Err(MptError::Busy { .. }) if self.is_resetting() => Ok(()),
            other => other,
        }
    }

    fn event_request(&self) -> Request {
        let mask = self.lock().events.hardware_mask();
        Request::message(msg::event_notification_request(&mask.words()).to_vec())
    }

    fn send_event_mask(&self) -> Result<()> {
        self.check_usable()?;
        let sub = self.submit(self.event_request())?;
        let completion = self.wait_command(&sub, None)?;
        if let Some(status) = completion.reply_status().filter(|s| !s.is_success()) {
            return Err(MptError::IocStatus {
                function: status.function,
                status: status.ioc_status,
                log_info: status.log_info,
            });
        }
        Ok(())
    }

    // ── Static configuration ─────────────────────────────────────────────

    fn read_static_config(&self) -> Result<StaticConfig> {
        let buffer = self.allocator.allocate(IocPage8::LEN)?;
        let sub = self.submit(config_page::ioc_page8_request(&buffer))?;
        let completion = self.poll_completion(&sub, self.config.command_timeout)?;
        let cfg = config_page::parse_ioc_page8(&completion, &buffer)?;
        self.lock().static_config = cfg;
        Ok(cfg)
    }

    // ── Recovery ─────────────────────────────────────────────────────────

    fn mark_failed(&self, reason: &str) {
        self.set_state(ControllerState::Failed);
        self.regs.mask_interrupts();
        tracing::error!("controller failed: {reason}");
        let actions = {
            let mut inner = self.lock();
            let deferred = inner.engine.as_mut().map(Engine::flush).unwrap_or_default();
            resolve(&inner.events, deferred)
        };
        drop(actions);
        self.resetting.store(false, Ordering::Release);
        if self.config.fatal_policy == FatalPolicy::Halt {
            tracing::error!("fatal policy is halt, aborting");
            std::process::abort();
        }
    }

    /// Hard-reset the IOC and rebuild everything on top of it.
    ///
    /// In-flight commands complete with `DroppedByReset`. A call while a
    /// reset is already running returns immediately.
    ///
    /// # Errors
    ///
    /// Any failure is fatal: the controller moves to
    /// [`ControllerState::Failed`] and the error is returned (or the process
    /// aborts under [`FatalPolicy::Halt`]).
    pub fn reinit(&self) -> Result<()> {
        if self.state() == ControllerState::Failed {
            return Err(MptError::controller_failed("controller has failed"));
        }
        if self.resetting.swap(true, Ordering::AcqRel) {
            tracing::debug!("reinit already in progress");
            return Ok(());
        }
        self.set_state(ControllerState::Degraded);
        tracing::info!("reinitializing controller");
        self.regs.mask_interrupts();

        let reset = {
            let _inner = self.lock();
            reset::diag_reset(&self.regs, &self.config.reset, WaitMode::Sleep)
        };
        if let Err(e) = reset {
            self.mark_failed(&format!("diagnostic reset during reinit: {e}"));
            return Err(e);
        }
        self.hooks.restore_pci_state();

        let actions = {
            let mut inner = self.lock();
            let deferred = inner.engine.as_mut().map(Engine::flush).unwrap_or_default();
            resolve(&inner.events, deferred)
        };
        self.run(actions);
        self.hooks.on_reinit();

        let realloc = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let previous = inner.engine.take().map(|e| (inner.facts, e));
            iocfacts_allocate(
                &self.regs,
                &mut inner.doorbell,
                self.allocator.as_ref(),
                &self.config,
                previous,
                false,
            )
            .map(|(facts, engine)| {
                inner.facts = facts;
                inner.engine = Some(engine);
            })
        };
        if let Err(e) = realloc {
            self.mark_failed(&format!("bring-up during reinit: {e}"));
            return Err(e);
        }

        self.hooks.mapping_teardown();
        self.resetting.store(false, Ordering::Release);
        self.regs.unmask_interrupts();

        match self.read_static_config() {
            Ok(cfg) => self.hooks.mapping_rebuild(&cfg),
            Err(e) => tracing::warn!("IOC Page 8 read after reset failed: {e}"),
        }

        let request = self.event_request();
        if let Err(e) = self.post_internal(&request, Completer::EventReregistration) {
            tracing::warn!("event re-registration failed: {e}");
        }

        self.lock().release_pending_io = true;
        self.set_state(ControllerState::Operational);
        tracing::info!("reinit complete");
        Ok(())
    }

    /// Periodic check: restart a faulted IOC, stop an overheated one.
    ///
    /// # Errors
    ///
    /// - [`MptError::ThermalShutdown`] if the IOC faulted on temperature
    /// - [`MptError::ControllerFailed`] if the controller had already failed
    /// - errors from [`Self::reinit`]
    pub fn health_check(&self) -> Result<()> {
        if self.state() == ControllerState::Failed {
            return Err(MptError::controller_failed("controller has failed"));
        }
        if self.is_resetting() {
            return Ok(());
        }
        let db = self.regs.doorbell();
        if IocState::from_doorbell(db) != IocState::Fault {
            return Ok(());
        }
        let code = fault_code(db);
        if code == fault::IOP_OVER_TEMP_THRESHOLD_EXCEEDED {
            tracing::error!("IOC temperature threshold exceeded, stopping controller");
            self.mark_failed(&format!("thermal fault {code:#06x}"));
            return Err(MptError::ThermalShutdown { code });
        }
        tracing::warn!("IOC fault {code:#06x}, reinitializing");
        self.reinit()
    }

    /// The discovery layer finished. After a reset this releases held I/O
    /// once.
    pub fn discovery_complete(&self) {
        let release = std::mem::take(&mut self.lock().release_pending_io);
        if release {
            tracing::debug!("releasing I/O held across reset");
            self.hooks.release_pending_io();
        }
    }
}

impl<R: RegisterIo> Drop for Controller<R> {
    fn drop(&mut self) {
        self.regs.mask_interrupts();
    }
}

fn resolve(registry: &EventRegistry, deferred: Vec<Deferred>) -> Vec<Action> {
    deferred
        .into_iter()
        .map(|d| match d {
            Deferred::Event(ev) => Action::Dispatch(registry.listeners_for(ev.event), ev),
            Deferred::StartDiscovery => Action::StartDiscovery,
        })
        .collect()
}
