//! Userspace queue engine for Fusion-MPT (MPI 2 / 2.5) SAS controllers.
//!
//! Covers the host side of the message-passing interface: doorbell
//! handshake, diagnostic reset, IOC Facts / IOC Init, request frame and
//! reply queue management, completion dispatch, event notification and
//! full controller re-initialisation after a fault.
//!
//! # Layers
//!
//! ```text
//! Controller            attach / submit / handle_interrupt / reinit
//!   ├─ Engine           SMID pool, chain pool, reply rings, flush
//!   ├─ Doorbell         handshake for IOC Facts / IOC Init
//!   ├─ reset            diag reset, transition to READY
//!   └─ EventRegistry    event mask, listener dispatch
//!
//! RegisterIo            MappedRegion (VFIO BAR1)  |  SimulatedIoc
//! DmaAllocator          VfioDmaAllocator (IOMMU)  |  HostMemory
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use mpt_driver::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mgr = DeviceManager::discover()?;
//! let dev = mgr.open(0)?;
//! let ctrl = Controller::attach(
//!     dev.map_registers()?,
//!     Arc::new(dev.dma_allocator()),
//!     Arc::new(NoHooks),
//!     ControllerConfig::default(),
//! )?;
//! println!("{:?}, firmware {:#010x}", ctrl.state(), ctrl.facts().fw_version);
//! # Ok(())
//! # }
//! ```
//!
//! Everything above the register and DMA seams also runs against
//! [`sim::SimulatedIoc`], a software IOC used by the tests and the
//! `mpt simulate` command.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod alloc;
mod config;
pub mod config_page;
mod controller;
mod discovery;
pub mod dma;
pub mod engine;
mod error;
pub mod events;
pub mod facts;
pub mod handshake;
mod health;
pub mod mmio;
pub mod pool;
mod ratelimit;
pub mod regio;
mod request;
pub mod reset;
pub mod sgl;
pub mod sim;
pub mod vfio;
pub mod wait;

/// Hardware identification constants (re-exported from mpt-chip).
pub mod pcie_ids {
    pub use mpt_chip::pcie::device_id;
    pub use mpt_chip::pcie::{lspci_filter, ChipVariant, ALL_DEVICE_IDS, LSI_VENDOR_ID, REGISTER_BAR};
}

pub use config::{ControllerConfig, FatalPolicy};
pub use config_page::StaticConfig;
pub use controller::{Controller, ControllerState, ControllerStats, HostHooks, NoHooks};
pub use discovery::{DeviceInfo, DeviceManager};
pub use dma::{DmaAllocator, DmaRegion, HostMemory};
pub use error::{MptError, Result};
pub use events::{EventHandle, EventListener, EventMask, EventNotification};
pub use health::HealthMonitor;
pub use mmio::MappedRegion;
pub use pool::{Priority, Smid};
pub use regio::RegisterIo;
pub use request::{Completion, Direction, Outcome, Request, Segment, Submission};
pub use sim::SimulatedIoc;
pub use vfio::{VfioDevice, VfioDmaAllocator};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Completion, Controller, ControllerConfig, ControllerState, DeviceManager, Direction,
        EventMask, EventNotification, HealthMonitor, HostHooks, MptError, NoHooks, Outcome,
        Request, Result, Segment, SimulatedIoc, VfioDevice,
    };
}
