//! Event registration, delivery and re-registration after reset.

mod common;

use common::{attach, attach_with, fast_config};
use mpt_chip::mpi::event;
use mpt_driver::{
    Controller, ControllerConfig, ControllerState, EventListener, EventMask, EventNotification,
    MptError, NoHooks, SimulatedIoc,
};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

fn recorder() -> (Arc<Mutex<Vec<EventNotification>>>, EventListener) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: EventListener = Arc::new(move |ev: &EventNotification| {
        sink.lock().unwrap().push(ev.clone());
    });
    (seen, listener)
}

fn unmasked(sim: &SimulatedIoc, code: u16) -> bool {
    let words = sim.event_masks();
    words[usize::from(code / 32)] & (1 << (code % 32)) == 0
}

#[test]
fn registered_event_reaches_listener() {
    let (sim, ctrl) = attach();
    let (seen, listener) = recorder();
    ctrl.register_events(EventMask::of(&[event::SAS_DISCOVERY]), listener)
        .unwrap();

    assert!(unmasked(&sim, event::SAS_DISCOVERY));
    assert!(!unmasked(&sim, event::LOG_DATA));
    assert!(!sim.post_event(event::LOG_DATA, &[0; 4]));

    let data = [1, 0, 0, 0, 0x10, 0, 0, 0];
    assert!(sim.post_event(event::SAS_DISCOVERY, &data));
    ctrl.handle_interrupt().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event, event::SAS_DISCOVERY);
    assert_eq!(&seen[0].data[..], &data[..]);
    assert!(!seen[0].ack_required);
}

#[test]
fn every_interested_listener_runs_in_order() {
    let (sim, ctrl) = attach();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let order = Arc::clone(&order);
        let listener: EventListener = Arc::new(move |_: &EventNotification| {
            order.lock().unwrap().push(tag);
        });
        ctrl.register_events(EventMask::of(&[event::SAS_TOPOLOGY_CHANGE_LIST]), listener)
            .unwrap();
    }
    let (other, listener) = recorder();
    ctrl.register_events(EventMask::of(&[event::IR_OPERATION_STATUS]), listener)
        .unwrap();

    assert!(sim.post_event(event::SAS_TOPOLOGY_CHANGE_LIST, &[0; 8]));
    ctrl.handle_interrupt().unwrap();

    assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    assert!(other.lock().unwrap().is_empty());
}

#[test]
fn deregistering_masks_the_event_again() {
    let (sim, ctrl) = attach();
    let (_, listener) = recorder();
    let handle = ctrl
        .register_events(EventMask::of(&[event::SAS_DEVICE_STATUS_CHANGE]), listener)
        .unwrap();
    assert!(unmasked(&sim, event::SAS_DEVICE_STATUS_CHANGE));

    ctrl.deregister_events(handle).unwrap();
    assert!(!unmasked(&sim, event::SAS_DEVICE_STATUS_CHANGE));
    assert_eq!(ctrl.event_mask(), EventMask::all());
}

#[test]
fn registrations_survive_reinit() {
    let (sim, ctrl) = attach();
    let (seen, listener) = recorder();
    ctrl.register_events(EventMask::of(&[event::SAS_DISCOVERY]), listener)
        .unwrap();

    ctrl.reinit().unwrap();
    assert!(unmasked(&sim, event::SAS_DISCOVERY));

    assert!(sim.post_event(event::SAS_DISCOVERY, &[0; 4]));
    ctrl.handle_interrupt().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn listener_may_call_back_into_controller() {
    let (sim, ctrl) = attach();
    let ctrl = Arc::new(ctrl);
    let slot: Arc<OnceLock<Weak<Controller<SimulatedIoc>>>> = Arc::new(OnceLock::new());
    let active = Arc::new(Mutex::new(None));

    let (s, a) = (Arc::clone(&slot), Arc::clone(&active));
    let listener: EventListener = Arc::new(move |_: &EventNotification| {
        if let Some(ctrl) = s.get().and_then(Weak::upgrade) {
            *a.lock().unwrap() = ctrl.stats().map(|st| st.io_cmds_active);
        }
    });
    slot.set(Arc::downgrade(&ctrl)).unwrap();
    ctrl.register_events(EventMask::of(&[event::STATE_CHANGE]), listener)
        .unwrap();

    assert!(sim.post_event(event::STATE_CHANGE, &[0; 4]));
    ctrl.handle_interrupt().unwrap();
    assert_eq!(*active.lock().unwrap(), Some(0));
}

#[test]
fn event_frames_are_recycled() {
    let (sim, ctrl) = attach();
    let (seen, listener) = recorder();
    ctrl.register_events(EventMask::of(&[event::LOG_DATA]), listener)
        .unwrap();

    let replies = usize::from(ctrl.queue_set().unwrap().sizing().num_replies);
    for _ in 0..replies * 2 {
        assert!(sim.post_event(event::LOG_DATA, &[0; 4]));
        ctrl.handle_interrupt().unwrap();
    }
    assert_eq!(seen.lock().unwrap().len(), replies * 2);
    assert_eq!(sim.stats().replies_dropped, 0);
}

#[test]
fn unanswered_mask_update_resets_the_ioc() {
    let config = ControllerConfig {
        command_timeout: Duration::from_millis(20),
        ..fast_config()
    };
    let (sim, ctrl) = attach_with(Arc::new(NoHooks), config);
    let (_, listener) = recorder();
    sim.hold_completions(true);

    let err = ctrl
        .register_events(EventMask::of(&[event::SAS_DISCOVERY]), listener)
        .unwrap_err();
    assert!(matches!(err, MptError::Timeout { .. }));
    assert_eq!(sim.stats().diag_resets, 1);
    assert_eq!(ctrl.state(), ControllerState::Operational);
    // the registration stands and was replayed by the reset
    assert!(unmasked(&sim, event::SAS_DISCOVERY));
}
