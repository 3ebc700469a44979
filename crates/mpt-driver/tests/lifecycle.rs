//! Bring-up, submission and completion against the simulated IOC.

mod common;

use bytes::Bytes;
use common::{attach, attach_with, fast_config, CountingHooks};
use mpt_chip::mpi::{ioc_status, IocState};
use mpt_chip::msg::{scsi_control, IocPage8, ScsiIoRequest};
use mpt_driver::sim::IoFailure;
use mpt_driver::{
    Controller, ControllerState, Direction, MptError, NoHooks, Outcome, Request, Segment,
    SimulatedIoc,
};
use std::sync::Arc;

fn read10(dev_handle: u16, len: u32) -> Request {
    let mut cdb = [0u8; 32];
    cdb[0] = 0x28;
    Request::scsi_io(&ScsiIoRequest {
        dev_handle,
        data_length: len,
        control: scsi_control::READ | scsi_control::SIMPLEQ,
        cdb,
        cdb_len: 10,
        ..ScsiIoRequest::default()
    })
}

fn segments(n: usize) -> Vec<Segment> {
    (0..n)
        .map(|i| Segment {
            address: 0x2_0000_0000 + (i as u64) * 0x1000,
            length: 512,
        })
        .collect()
}

#[test]
fn attach_brings_ioc_operational() {
    let hooks = Arc::new(CountingHooks::default());
    let (sim, ctrl) = attach_with(hooks.clone(), fast_config());

    assert_eq!(ctrl.state(), ControllerState::Operational);
    assert_eq!(sim.state(), IocState::Operational);
    assert!(!sim.interrupts_masked());
    assert_eq!(sim.stats().ioc_inits, 1);
    assert_eq!(sim.stats().diag_resets, 0);
    assert_eq!(ctrl.facts().request_credit, sim.facts().request_credit);

    assert_eq!(CountingHooks::get(&hooks.mapping_rebuild), 1);
    assert_eq!(CountingHooks::get(&hooks.start_discovery), 1);
    assert_eq!(CountingHooks::get(&hooks.on_reinit), 0);

    let stats = ctrl.stats().unwrap();
    assert_eq!(stats.io_cmds_active, 0);
    assert_eq!(stats.free_chains, 16);
}

#[test]
fn static_config_comes_from_ioc_page8() {
    let sim = SimulatedIoc::new();
    let page = IocPage8 {
        num_devs_per_enclosure: 12,
        max_persistent_entries: 64,
        max_num_physical_mapped_ids: 2,
        flags: 0x0006,
        ir_volume_mapping_flags: 0x0001,
    };
    sim.set_ioc_page8(page);
    let ctrl = Controller::attach(
        sim.clone(),
        Arc::new(sim.memory()),
        Arc::new(NoHooks),
        fast_config(),
    )
    .unwrap();
    assert_eq!(ctrl.static_config().ioc_page8, page);
}

#[test]
fn scsi_io_completes_with_success_descriptor() {
    let (sim, ctrl) = attach();
    let segs = segments(1);
    let sub = ctrl
        .submit(read10(9, 512).with_segments(segs.clone(), Direction::Read))
        .unwrap();

    let completion = ctrl.wait_command(&sub, None).unwrap();
    assert_eq!(completion.smid, sub.smid());
    assert_eq!(completion.outcome, Outcome::Success);
    assert!(completion.is_success());
    assert_eq!(completion.sense, None);

    let log = sim.io_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].dev_handle, 9);
    assert_eq!(log[0].opcode, 0x28);
    assert_eq!(log[0].segments, segs);
    assert_eq!(ctrl.stats().unwrap().io_cmds_active, 0);
}

#[test]
fn long_sgl_is_chained_and_chains_return() {
    let (sim, ctrl) = attach();
    let free_before = ctrl.stats().unwrap().free_chains;
    let segs = segments(20);
    let sub = ctrl
        .submit(read10(9, 20 * 512).with_segments(segs.clone(), Direction::Read))
        .unwrap();
    assert!(ctrl.stats().unwrap().free_chains < free_before);

    let completion = ctrl.wait_command(&sub, None).unwrap();
    assert!(completion.is_success());
    assert_eq!(sim.io_log()[0].segments, segs);

    let stats = ctrl.stats().unwrap();
    assert_eq!(stats.free_chains, free_before);
    assert!(stats.chain_low_water < free_before);
}

#[test]
fn failed_io_carries_reply_and_sense() {
    let (sim, ctrl) = attach();
    let sense = vec![0x70, 0, 0x05, 0, 0, 0, 0, 0x0A, 0, 0, 0, 0, 0x24, 0];
    sim.fail_next_io(IoFailure {
        ioc_status: ioc_status::SUCCESS,
        scsi_status: 0,
        sense: sense.clone(),
    });

    let sub = ctrl
        .submit(read10(9, 512).with_segments(segments(1), Direction::Read))
        .unwrap();
    let completion = ctrl.wait_command(&sub, None).unwrap();

    assert!(matches!(completion.outcome, Outcome::Reply(_)));
    let reply = completion.scsi_reply().unwrap();
    assert_eq!(reply.scsi_status, 0x02);
    assert_eq!(reply.sense_count as usize, sense.len());
    assert_eq!(completion.sense, Some(Bytes::from(sense)));
}

#[test]
fn ioc_error_status_is_reported() {
    let (sim, ctrl) = attach();
    sim.fail_next_io(IoFailure {
        ioc_status: ioc_status::SCSI_DEVICE_NOT_THERE,
        ..IoFailure::default()
    });
    let sub = ctrl.submit(read10(0x30, 0)).unwrap();
    let completion = ctrl.wait_command(&sub, None).unwrap();
    assert!(!completion.is_success());
    assert_eq!(
        completion.reply_status().unwrap().ioc_status,
        ioc_status::SCSI_DEVICE_NOT_THERE
    );
    assert_eq!(completion.sense, None);
}

#[test]
fn slots_run_out_then_come_back() {
    let (sim, ctrl) = attach();
    sim.hold_completions(true);

    let free = ctrl.stats().unwrap().free_requests;
    let subs: Vec<_> = (0..free)
        .map(|_| ctrl.submit(read10(9, 0)).unwrap())
        .collect();
    assert!(matches!(
        ctrl.submit(read10(9, 0)),
        Err(MptError::Exhausted { .. })
    ));
    assert_eq!(ctrl.stats().unwrap().io_cmds_active as usize, free);

    assert_eq!(sim.release_completions(), free);
    ctrl.handle_interrupt().unwrap();
    for sub in &subs {
        assert_eq!(sub.try_completion().unwrap().outcome, Outcome::Success);
    }
    let stats = ctrl.stats().unwrap();
    assert_eq!(stats.free_requests, free);
    assert_eq!(stats.io_cmds_active, 0);
}

#[test]
fn high_priority_uses_reserved_slots() {
    let (_sim, ctrl) = attach();
    let high_before = ctrl.stats().unwrap().free_high_priority;
    assert!(high_before > 0);

    let sub = ctrl.submit(read10(9, 0).high_priority()).unwrap();
    assert!(sub.smid().get() as usize <= high_before);
    ctrl.wait_command(&sub, None).unwrap();
    assert_eq!(ctrl.stats().unwrap().free_high_priority, high_before);
}

#[test]
fn reply_indices_wrap_around_the_ring() {
    let (sim, ctrl) = attach();
    let depth = ctrl.queue_set().unwrap().sizing().queue_depth;

    for i in 0..usize::from(depth) * 3 {
        if i % 2 == 0 {
            sim.fail_next_io(IoFailure {
                ioc_status: ioc_status::SCSI_DATA_UNDERRUN,
                ..IoFailure::default()
            });
        }
        let sub = ctrl.submit(read10(9, 0)).unwrap();
        let completion = ctrl.wait_command(&sub, None).unwrap();
        assert_eq!(completion.smid, sub.smid());
    }
    assert_eq!(sim.stats().replies_dropped, 0);
    assert_eq!(ctrl.stats().unwrap().io_cmds_active, 0);
}

#[test]
fn dropping_controller_masks_interrupts() {
    let (sim, ctrl) = attach();
    assert!(!sim.interrupts_masked());
    drop(ctrl);
    assert!(sim.interrupts_masked());
}
