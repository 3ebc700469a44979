//! Hardware validation tests
//!
//! Bring a real controller bound to vfio-pci up, reset it and bring it
//! back. Set `MPT_TEST_DEVICE` to the controller index (default 0).

use mpt_chip::mpi::IocState;
use mpt_driver::{Controller, ControllerConfig, ControllerState, DeviceManager, NoHooks};
use std::sync::Arc;

fn index() -> usize {
    std::env::var("MPT_TEST_DEVICE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[test]
#[ignore] // Requires hardware
fn test_discover() {
    let mgr = DeviceManager::discover().expect("Fusion-MPT controller present");
    for info in mgr.devices() {
        println!(
            "[{}] {} @ {} driver {:?}",
            info.index,
            info.variant.name(),
            info.pcie_address,
            info.driver
        );
    }
}

#[test]
#[ignore] // Requires hardware
fn test_attach_and_reinit() {
    let mgr = DeviceManager::discover().expect("discover");
    let dev = mgr.open(index()).expect("controller bound to vfio-pci");
    let regs = dev.map_registers().expect("map BAR1");
    let ctrl = Controller::attach(
        regs,
        Arc::new(dev.dma_allocator()),
        Arc::new(NoHooks),
        ControllerConfig::default(),
    )
    .expect("attach");

    assert_eq!(ctrl.state(), ControllerState::Operational);
    println!("Firmware {}", ctrl.facts().fw_version_string());
    println!("Credit   {}", ctrl.facts().request_credit);

    ctrl.reinit().expect("reinit");
    assert_eq!(ctrl.state(), ControllerState::Operational);
    assert_eq!(ctrl.registers().ioc_state(), IocState::Operational);
}
