//! Shared setup for the controller tests.

#![allow(dead_code)]

use mpt_driver::handshake::DoorbellTimings;
use mpt_driver::reset::ResetTimings;
use mpt_driver::{Controller, ControllerConfig, HostHooks, NoHooks, SimulatedIoc, StaticConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Small pools and millisecond budgets.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        max_requests: 32,
        max_prio_requests: 4,
        max_replies: 48,
        max_event_replies: 8,
        max_chains: 16,
        command_timeout: Duration::from_secs(2),
        periodic_interval: Duration::from_millis(10),
        doorbell: DoorbellTimings {
            int_interval: Duration::from_micros(50),
            int_budget: Duration::from_millis(50),
            ack_interval: Duration::from_micros(50),
            ack_spin_interval: Duration::from_micros(50),
            ack_budget: Duration::from_millis(50),
        },
        reset: ResetTimings {
            unlock_attempts: 3,
            unlock_wait: Duration::from_millis(1),
            first_reset_wait: Duration::from_millis(1),
            reset_poll_interval: Duration::from_millis(1),
            reset_budget: Duration::from_millis(50),
            ready_interval: Duration::from_millis(1),
            ready_budget: Duration::from_millis(50),
        },
        ..ControllerConfig::default()
    }
}

/// Counts every hook call.
#[derive(Debug, Default)]
pub struct CountingHooks {
    pub start_discovery: AtomicU32,
    pub release_pending_io: AtomicU32,
    pub restore_pci_state: AtomicU32,
    pub on_reinit: AtomicU32,
    pub mapping_teardown: AtomicU32,
    pub mapping_rebuild: AtomicU32,
}

impl CountingHooks {
    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

impl HostHooks for CountingHooks {
    fn start_discovery(&self) {
        self.start_discovery.fetch_add(1, Ordering::SeqCst);
    }
    fn release_pending_io(&self) {
        self.release_pending_io.fetch_add(1, Ordering::SeqCst);
    }
    fn restore_pci_state(&self) {
        self.restore_pci_state.fetch_add(1, Ordering::SeqCst);
    }
    fn on_reinit(&self) {
        self.on_reinit.fetch_add(1, Ordering::SeqCst);
    }
    fn mapping_teardown(&self) {
        self.mapping_teardown.fetch_add(1, Ordering::SeqCst);
    }
    fn mapping_rebuild(&self, _config: &StaticConfig) {
        self.mapping_rebuild.fetch_add(1, Ordering::SeqCst);
    }
}

/// Route engine logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh IOC and a controller attached to it.
pub fn attach() -> (SimulatedIoc, Controller<SimulatedIoc>) {
    attach_with(Arc::new(NoHooks), fast_config())
}

pub fn attach_with(
    hooks: Arc<dyn HostHooks>,
    config: ControllerConfig,
) -> (SimulatedIoc, Controller<SimulatedIoc>) {
    init_tracing();
    let sim = SimulatedIoc::new();
    let ctrl = Controller::attach(sim.clone(), Arc::new(sim.memory()), hooks, config)
        .expect("attach to simulated IOC");
    (sim, ctrl)
}
