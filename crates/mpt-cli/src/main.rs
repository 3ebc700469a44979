//! `mpt`: command-line interface for Fusion-MPT SAS controllers.
//!
//! ```text
//! USAGE:
//!   mpt enumerate                  List all controllers
//!   mpt info <device> [--attach]   Detailed info for one controller
//!   mpt bind-vfio <pcie-addr>      Bind controller to vfio-pci (root)
//!   mpt unbind-vfio <pcie-addr>    Hand controller back to mpt3sas (root)
//!   mpt iommu-group <pcie-addr>    IOMMU group of a controller
//!   mpt simulate [options]         Drive the queue engine against a software IOC
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use mpt_chip::mpi::{event, ioc_status};
use mpt_chip::msg::{scsi_control, IocFacts, ScsiIoRequest};
use mpt_driver::sim::IoFailure;
use mpt_driver::{
    Controller, ControllerConfig, DeviceManager, Direction, EventListener, EventMask,
    EventNotification, NoHooks, RegisterIo, Request, Segment, SimulatedIoc,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mpt", about = "Fusion-MPT SAS controller CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all Fusion-MPT controllers.
    Enumerate,
    /// Print detailed information for one controller.
    Info {
        /// PCIe address (e.g. 0000:03:00.0) or controller index (e.g. 0).
        device: String,
        /// Bring the IOC to OPERATIONAL and print its facts (needs vfio-pci).
        #[arg(long)]
        attach: bool,
    },
    /// Bind a controller to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
    /// Unbind a controller from vfio-pci and re-bind to mpt3sas (if loaded).
    UnbindVfio {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
    /// Query the IOMMU group for a controller.
    IommuGroup {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
    /// Run SCSI IO, events and recovery against a simulated IOC.
    Simulate {
        /// Number of READ(10) commands to issue.
        #[arg(long, default_value_t = 64)]
        ios: usize,
        /// Scatter/gather segments per command.
        #[arg(long, default_value_t = 4)]
        segments: usize,
        /// Fail every Nth command with a data underrun (0 = never).
        #[arg(long, default_value_t = 0)]
        fail_every: usize,
        /// Start from a faulted IOC.
        #[arg(long)]
        faulted: bool,
        /// Fault the IOC halfway through and recover with a health check.
        #[arg(long)]
        fault_midway: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Info { device, attach } => cmd_info(&device, attach)?,
        Cmd::BindVfio { pcie_addr } => cmd_bind_vfio(&pcie_addr)?,
        Cmd::UnbindVfio { pcie_addr } => cmd_unbind_vfio(&pcie_addr)?,
        Cmd::IommuGroup { pcie_addr } => cmd_iommu_group(&pcie_addr)?,
        Cmd::Simulate {
            ios,
            segments,
            fail_every,
            faulted,
            fault_midway,
        } => cmd_simulate(ios, segments, fail_every, faulted, fault_midway)?,
    }

    Ok(())
}

fn cmd_enumerate() -> Result<()> {
    let mgr = DeviceManager::discover()?;

    println!("Fusion-MPT controllers: {}", mgr.device_count());
    println!();

    for info in mgr.devices() {
        println!(
            "[{}] {} @ {}  ({:#06x}, {} Gb/s)",
            info.index,
            info.variant.name(),
            info.pcie_address,
            info.device_id,
            info.variant.link_gbps()
        );
        println!("     Driver {}", info.driver.as_deref().unwrap_or("none"));
        if let Some(g) = info.iommu_group {
            println!("     IOMMU  group {g}");
        }
        println!();
    }

    Ok(())
}

fn cmd_info(device: &str, attach: bool) -> Result<()> {
    let mgr = DeviceManager::discover()?;

    // Accept index or PCIe address
    let info = if let Ok(idx) = device.parse::<usize>() {
        mgr.device(idx)?.clone()
    } else {
        mgr.by_address(device)
            .ok_or_else(|| anyhow::anyhow!("Controller not found: {device}"))?
            .clone()
    };

    println!("PCIe address : {}", info.pcie_address);
    println!("Part         : {} ({:#06x})", info.variant.name(), info.device_id);
    println!("Link rate    : {} Gb/s", info.variant.link_gbps());
    println!("Driver       : {}", info.driver.as_deref().unwrap_or("none"));
    match info.iommu_group {
        Some(g) => println!("IOMMU group  : {g}"),
        None => println!("IOMMU group  : (not available, IOMMU disabled?)"),
    }

    if !attach {
        return Ok(());
    }

    let dev = mgr.open(info.index)?;
    let ctrl = Controller::attach(
        dev.map_registers()?,
        Arc::new(dev.dma_allocator()),
        Arc::new(NoHooks),
        ControllerConfig::from_env()?,
    )?;
    println!();
    print_controller(&ctrl);
    Ok(())
}

fn cmd_bind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Binding {pcie_addr} to vfio-pci ...");
    mpt_driver::vfio::bind_to_vfio(pcie_addr)?;
    let group = mpt_driver::vfio::iommu_group(pcie_addr)?;
    println!("Done. IOMMU group: {group}");
    println!("Grant access:  sudo chown $USER /dev/vfio/{group}");
    Ok(())
}

fn cmd_unbind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Unbinding {pcie_addr} from vfio-pci ...");
    mpt_driver::vfio::unbind_from_vfio(pcie_addr)?;
    println!("Done.");
    Ok(())
}

fn cmd_iommu_group(pcie_addr: &str) -> Result<()> {
    let group = mpt_driver::vfio::iommu_group(pcie_addr)?;
    println!("IOMMU group for {pcie_addr}: {group}");
    println!("Device file: /dev/vfio/{group}");
    Ok(())
}

fn cmd_simulate(
    ios: usize,
    segments: usize,
    fail_every: usize,
    faulted: bool,
    fault_midway: bool,
) -> Result<()> {
    if segments == 0 {
        bail!("--segments must be at least 1");
    }

    let sim = SimulatedIoc::new();
    if faulted {
        sim.inject_fault(0x0BAD);
    }
    let ctrl = Controller::attach(
        sim.clone(),
        Arc::new(sim.memory()),
        Arc::new(NoHooks),
        ControllerConfig::from_env()?,
    )?;
    print_controller(&ctrl);

    let listener: EventListener = Arc::new(|ev: &EventNotification| {
        println!(
            "Event        : {:#06x} context {} ({} data bytes)",
            ev.event,
            ev.context,
            ev.data.len()
        );
    });
    ctrl.register_events(EventMask::of(&[event::SAS_DISCOVERY]), listener)?;

    let mut failed = 0usize;
    for i in 0..ios {
        if fault_midway && i == ios / 2 {
            sim.inject_fault(0x1234);
            ctrl.health_check()?;
            println!("Recovered    : diag reset {}", sim.stats().diag_resets);
        }
        if fail_every != 0 && (i + 1) % fail_every == 0 {
            sim.fail_next_io(IoFailure {
                ioc_status: ioc_status::SCSI_DATA_UNDERRUN,
                ..IoFailure::default()
            });
        }
        let sub = ctrl.submit(read10(i, segments))?;
        if !ctrl.wait_command(&sub, None)?.is_success() {
            failed += 1;
        }
    }

    sim.post_event(event::SAS_DISCOVERY, &[1, 0, 0, 0]);
    ctrl.handle_interrupt()?;

    println!();
    println!("Commands     : {ios} issued, {failed} failed");
    if let Some(s) = ctrl.stats() {
        println!(
            "Pools        : {} free / {} high priority / {} chains (low water {})",
            s.free_requests, s.free_high_priority, s.free_chains, s.chain_low_water
        );
        println!(
            "Reply rings  : post index {}  free index {}",
            s.reply_post_index, s.reply_free_index
        );
    }
    let st = sim.stats();
    println!(
        "IOC          : {} requests, {} events, {} diag resets, {} IOC inits",
        st.requests, st.events_posted, st.diag_resets, st.ioc_inits
    );
    Ok(())
}

fn read10(i: usize, segments: usize) -> Request {
    let mut cdb = [0u8; 32];
    cdb[0] = 0x28;
    let segs: Vec<Segment> = (0..segments)
        .map(|s| Segment {
            address: 0x1_0000_0000 + ((i * segments + s) as u64) * 0x1000,
            length: 4096,
        })
        .collect();
    #[allow(clippy::cast_possible_truncation)]
    let len = (segments * 4096) as u32;
    Request::scsi_io(&ScsiIoRequest {
        dev_handle: 9,
        data_length: len,
        control: scsi_control::READ | scsi_control::SIMPLEQ,
        cdb,
        cdb_len: 10,
        ..ScsiIoRequest::default()
    })
    .with_segments(segs, Direction::Read)
}

fn print_controller<R: RegisterIo>(ctrl: &Controller<R>) {
    let facts: IocFacts = ctrl.facts();
    let page8 = ctrl.static_config().ioc_page8;
    println!("State        : {:?}", ctrl.state());
    println!("Product ID   : {:#06x}", facts.product_id);
    println!("Firmware     : {}", facts.fw_version_string());
    println!("MPI version  : {:#06x}", facts.msg_version);
    println!(
        "Credits      : {} requests, {} high priority",
        facts.request_credit, facts.high_priority_credit
    );
    println!("Max targets  : {}", facts.max_targets);
    println!("Ports        : {}", facts.number_of_ports);
    println!(
        "IOC Page 8   : flags {:#06x}, {} persistent entries",
        page8.flags, page8.max_persistent_entries
    );
    if let Some(q) = ctrl.queue_set() {
        let s = q.sizing();
        println!(
            "Queues       : {} requests, {} replies, depth {}",
            s.num_reqs, s.num_replies, s.queue_depth
        );
    }
}
