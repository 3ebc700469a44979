//! IOC Facts and IOC Init over the doorbell.

use crate::error::{MptError, Result};
use crate::handshake::Doorbell;
use crate::regio::{RegisterIo, Registers};
use crate::wait::WaitMode;
use bitflags::bitflags;
use mpt_chip::msg::{self, IocFacts, IocInit, ReplyStatus};

bitflags! {
    /// `IOCCapabilities` from IOC Facts.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IocCapabilities: u32 {
        const TASK_SET_FULL_HANDLING = 1 << 2;
        const DIAG_TRACE_BUFFER = 1 << 3;
        const SNAPSHOT_BUFFER = 1 << 4;
        const EXTENDED_BUFFER = 1 << 5;
        const EEDP = 1 << 6;
        const BIDIRECTIONAL_TARGET = 1 << 7;
        const MULTICAST = 1 << 8;
        const TLR = 1 << 11;
        const INTEGRATED_RAID = 1 << 12;
        const EVENT_REPLAY = 1 << 13;
        const RAID_ACCELERATOR = 1 << 14;
        const MSI_X_INDEX = 1 << 15;
        const FAST_PATH_CAPABLE = 1 << 18;
        const RDPQ_ARRAY_CAPABLE = 1 << 19;
    }
}

/// Capability flags of a facts snapshot.
pub fn capabilities(facts: &IocFacts) -> IocCapabilities {
    IocCapabilities::from_bits_retain(facts.ioc_capabilities)
}

/// Fetch IOC Facts.
///
/// # Errors
///
/// Propagates handshake errors; returns [`MptError::IocStatus`] on a
/// non-success reply and [`MptError::InvalidState`] if the IOC reports a
/// geometry the engine cannot use.
pub fn get_iocfacts<R: RegisterIo>(
    regs: &Registers<R>,
    doorbell: &mut Doorbell,
    mode: WaitMode,
) -> Result<IocFacts> {
    let mut reply = [0u8; msg::IOC_FACTS_REPLY_LEN];
    let got = doorbell.request_sync(regs, &msg::ioc_facts_request(), &mut reply, mode)?;
    let facts = IocFacts::parse(&reply)
        .filter(|_| got == msg::IOC_FACTS_REPLY_LEN)
        .ok_or_else(|| MptError::invalid_state(format!("IOC Facts reply of {got} bytes")))?;

    if let Some(status) = ReplyStatus::parse(&reply).filter(|s| !s.is_success()) {
        return Err(MptError::IocStatus {
            function: status.function,
            status: status.ioc_status,
            log_info: status.log_info,
        });
    }
    if facts.request_credit < 2 || facts.ioc_request_frame_size == 0 || facts.reply_frame_size == 0 {
        return Err(MptError::invalid_state(format!(
            "unusable facts: credit {}, request frame {} dwords, reply frame {} dwords",
            facts.request_credit, facts.ioc_request_frame_size, facts.reply_frame_size
        )));
    }

    tracing::debug!(
        "IOC Facts: fw {}, credit {}, hi-pri {}, post depth {}, frame {}B, reply {}B, chain depth {}, caps {:?}",
        facts.fw_version_string(),
        facts.request_credit,
        facts.high_priority_credit,
        facts.max_reply_descriptor_post_queue_depth,
        facts.request_frame_bytes(),
        facts.reply_frame_bytes(),
        facts.max_chain_depth,
        capabilities(&facts)
    );
    Ok(facts)
}

/// Whether a fresh facts snapshot changes anything the allocations were
/// sized from.
pub fn requires_reallocation(old: &IocFacts, new: &IocFacts) -> bool {
    let checks: [(&str, u32, u32); 16] = [
        ("MsgVersion", old.msg_version.into(), new.msg_version.into()),
        ("HeaderVersion", old.header_version.into(), new.header_version.into()),
        ("MaxChainDepth", old.max_chain_depth.into(), new.max_chain_depth.into()),
        ("RequestCredit", old.request_credit.into(), new.request_credit.into()),
        ("ProductID", old.product_id.into(), new.product_id.into()),
        ("IOCCapabilities", old.ioc_capabilities, new.ioc_capabilities),
        (
            "IOCRequestFrameSize",
            old.ioc_request_frame_size.into(),
            new.ioc_request_frame_size.into(),
        ),
        ("MaxTargets", old.max_targets.into(), new.max_targets.into()),
        ("MaxSasExpanders", old.max_sas_expanders.into(), new.max_sas_expanders.into()),
        ("MaxEnclosures", old.max_enclosures.into(), new.max_enclosures.into()),
        (
            "HighPriorityCredit",
            old.high_priority_credit.into(),
            new.high_priority_credit.into(),
        ),
        (
            "MaxReplyDescriptorPostQueueDepth",
            old.max_reply_descriptor_post_queue_depth.into(),
            new.max_reply_descriptor_post_queue_depth.into(),
        ),
        ("ReplyFrameSize", old.reply_frame_size.into(), new.reply_frame_size.into()),
        ("MaxVolumes", old.max_volumes.into(), new.max_volumes.into()),
        ("MaxDevHandle", old.max_dev_handle.into(), new.max_dev_handle.into()),
        (
            "MaxPersistentEntries",
            old.max_persistent_entries.into(),
            new.max_persistent_entries.into(),
        ),
    ];
    let mut changed = false;
    for (name, before, after) in checks {
        if before != after {
            tracing::info!("IOC Facts {name} changed: {before:#x} -> {after:#x}");
            changed = true;
        }
    }
    changed
}

/// Send IOC Init.
///
/// # Errors
///
/// Propagates handshake errors; returns [`MptError::IocStatus`] if the IOC
/// rejects the queue geometry.
pub fn send_iocinit<R: RegisterIo>(
    regs: &Registers<R>,
    doorbell: &mut Doorbell,
    init: &IocInit,
    mode: WaitMode,
) -> Result<()> {
    let mut reply = [0u8; msg::DEFAULT_REPLY_LEN];
    doorbell.request_sync(regs, &init.encode(), &mut reply, mode)?;
    let status = ReplyStatus::parse(&reply)
        .ok_or_else(|| MptError::invalid_state("short IOC Init reply"))?;
    if !status.is_success() {
        tracing::error!("IOC Init rejected: {status:?}");
        return Err(MptError::IocStatus {
            function: status.function,
            status: status.ioc_status,
            log_info: status.log_info,
        });
    }
    tracing::debug!(
        "IOC Init accepted: post depth {}, free depth {}",
        init.reply_descriptor_post_queue_depth,
        init.reply_free_queue_depth
    );
    Ok(())
}

/// Milliseconds since the Unix epoch, for the IOC Init timestamp.
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::DoorbellTimings;
    use crate::sim::SimulatedIoc;
    use std::time::Duration;

    fn doorbell() -> Doorbell {
        Doorbell::new(DoorbellTimings {
            int_interval: Duration::from_micros(10),
            int_budget: Duration::from_millis(2),
            ack_interval: Duration::from_micros(10),
            ack_spin_interval: Duration::from_micros(10),
            ack_budget: Duration::from_millis(2),
        })
    }

    #[test]
    fn fetches_facts() {
        let sim = SimulatedIoc::new();
        let regs = Registers(sim.clone());
        let facts = get_iocfacts(&regs, &mut doorbell(), WaitMode::Spin).unwrap();
        assert_eq!(facts, sim.facts());
        assert!(capabilities(&facts).contains(IocCapabilities::EVENT_REPLAY));
    }

    #[test]
    fn unchanged_facts_keep_allocations() {
        let sim = SimulatedIoc::new();
        let a = sim.facts();
        assert!(!requires_reallocation(&a, &a));
    }

    #[test]
    fn any_sizing_field_forces_reallocation() {
        let a = SimulatedIoc::new().facts();
        let mut b = a;
        b.request_credit += 1;
        assert!(requires_reallocation(&a, &b));
        let mut c = a;
        c.reply_frame_size += 1;
        assert!(requires_reallocation(&a, &c));
        let mut d = a;
        d.fw_version += 1;
        assert!(!requires_reallocation(&a, &d), "firmware version is not a sizing field");
    }

    #[test]
    fn rejected_init() {
        let sim = SimulatedIoc::new();
        let regs = Registers(sim.clone());
        // no queues behind these addresses
        let init = IocInit {
            system_request_frame_size: 32,
            reply_descriptor_post_queue_depth: 16,
            reply_free_queue_depth: 16,
            system_request_frame_base_address: 0xDEAD_0000,
            ..IocInit::default()
        };
        let err = send_iocinit(&regs, &mut doorbell(), &init, WaitMode::Spin).unwrap_err();
        assert!(matches!(err, MptError::IocStatus { .. }));
    }
}
