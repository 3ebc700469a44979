//! Randomised submission traffic against the simulated IOC.
//!
//! Whatever the mix of transfer sizes, failures and batching, every
//! command completes exactly once and the pools end where they started.

mod common;

use common::attach;
use mpt_chip::mpi::ioc_status;
use mpt_chip::msg::{scsi_control, ScsiIoRequest};
use mpt_driver::sim::IoFailure;
use mpt_driver::{Direction, Outcome, Request, Segment};
use proptest::prelude::*;

fn read(segments: &[Segment]) -> Request {
    let mut cdb = [0u8; 32];
    cdb[0] = 0x28;
    let len: u32 = segments.iter().map(|s| s.length).sum();
    Request::scsi_io(&ScsiIoRequest {
        dev_handle: 9,
        data_length: len,
        control: scsi_control::READ | scsi_control::SIMPLEQ,
        cdb,
        cdb_len: 10,
        ..ScsiIoRequest::default()
    })
    .with_segments(segments.to_vec(), Direction::Read)
}

fn segment() -> impl Strategy<Value = Segment> {
    (0u64..0x10_0000, 1u32..=16).prop_map(|(page, sectors)| Segment {
        address: 0x4_0000_0000 + page * 0x1000,
        length: sectors * 512,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_sgl_reaches_the_ioc_intact(segs in prop::collection::vec(segment(), 1..60)) {
        let (sim, ctrl) = attach();
        let free_before = ctrl.stats().unwrap().free_chains;

        let sub = ctrl.submit(read(&segs)).unwrap();
        let completion = ctrl.wait_command(&sub, None).unwrap();

        prop_assert!(completion.is_success());
        prop_assert_eq!(&sim.io_log()[0].segments, &segs);
        prop_assert_eq!(ctrl.stats().unwrap().free_chains, free_before);
    }

    #[test]
    fn mixed_traffic_leaves_pools_whole(
        ops in prop::collection::vec((any::<bool>(), 1usize..24), 1..40)
    ) {
        let (sim, ctrl) = attach();
        let before = ctrl.stats().unwrap();

        for (fail, n) in ops {
            if fail {
                sim.fail_next_io(IoFailure {
                    ioc_status: ioc_status::SCSI_DATA_UNDERRUN,
                    ..IoFailure::default()
                });
            }
            let segs: Vec<Segment> = (0..n)
                .map(|i| Segment { address: 0x4_0000_0000 + (i as u64) * 0x1000, length: 512 })
                .collect();
            let sub = ctrl.submit(read(&segs)).unwrap();
            let completion = ctrl.wait_command(&sub, None).unwrap();
            prop_assert_eq!(completion.smid, sub.smid());
            prop_assert_eq!(completion.is_success(), !fail);
        }

        let after = ctrl.stats().unwrap();
        prop_assert_eq!(after.io_cmds_active, 0);
        prop_assert_eq!(after.free_requests, before.free_requests);
        prop_assert_eq!(after.free_chains, before.free_chains);
        prop_assert_eq!(sim.stats().replies_dropped, 0);
    }

    #[test]
    fn batched_completions_all_arrive(batch in 1usize..28) {
        let (sim, ctrl) = attach();
        let before = ctrl.stats().unwrap();
        sim.hold_completions(true);

        let subs: Vec<_> = (0..batch)
            .map(|i| {
                let seg = Segment { address: 0x4_0000_0000 + (i as u64) * 0x1000, length: 512 };
                ctrl.submit(read(&[seg])).unwrap()
            })
            .collect();
        prop_assert_eq!(ctrl.stats().unwrap().io_cmds_active as usize, batch);

        prop_assert_eq!(sim.release_completions(), batch);
        ctrl.handle_interrupt().unwrap();
        for sub in &subs {
            prop_assert_eq!(sub.try_completion().map(|c| c.outcome), Some(Outcome::Success));
        }
        prop_assert_eq!(ctrl.stats().unwrap().free_requests, before.free_requests);
    }
}
