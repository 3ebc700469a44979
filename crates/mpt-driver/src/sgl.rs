//! Scatter/gather list construction.
//!
//! Elements go into the request frame starting at the message's SGL offset.
//! When they do not fit, the last slot of the frame becomes a chain element
//! pointing at a chain frame, and so on down the list:
//!
//! ```text
//! request frame            chain frame 0               chain frame 1
//! ┌────────────┐        ┌──────────────────┐        ┌──────────────────┐
//! │ header     │   ┌───▶│ simple           │   ┌───▶│ simple           │
//! │ simple     │   │    │ ...              │   │    │ simple (EOL)     │
//! │ chain ─────┼───┘    │ chain (C, off C-1)┼──┘    └──────────────────┘
//! └────────────┘        └──────────────────┘
//! ```
//!
//! A chain element declares the exact remaining count when the rest fits in
//! the next frame, otherwise the frame's full capacity with the next chain
//! element at its last slot.

#![allow(clippy::cast_possible_truncation)]

use crate::alloc::QueueSet;
use crate::error::{MptError, Result};
use crate::pool::{ChainIndex, CommandPool, Smid};
use crate::ratelimit::RateLimiter;
use crate::request::{Direction, Segment};
use mpt_chip::sge::{Sge, SGE_SIZE};

/// Wire elements for `segments`.
///
/// Bidirectional transfers carry every segment twice, host-to-device first.
pub fn elements(segments: &[Segment], direction: Direction) -> Vec<Sge> {
    let per = if direction == Direction::Bidirectional { 2 } else { 1 };
    let mut out = Vec::with_capacity(segments.len() * per);
    for seg in segments {
        for _ in 0..per {
            out.push(Sge::simple(seg.address, seg.length));
        }
    }
    out
}

/// Chain frames needed for `n` elements with first-frame capacity `first`
/// and chain-frame capacity `chain`.
pub const fn chain_frames_needed(n: usize, first: usize, chain: usize) -> usize {
    if n <= first || chain < 2 {
        0
    } else {
        (n - first).div_ceil(chain - 1)
    }
}

/// Result of writing an SGL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SglLayout {
    /// Header `ChainOffset` byte, in 16-byte units; `None` if no chain.
    pub chain_offset: Option<u8>,
    /// Chain frames attached to the command.
    pub chain_frames: usize,
}

/// Write `sges` into the request frame of `smid` at `sgl_offset`, taking
/// chain frames from `pool` as needed and attaching them to the command.
///
/// # Errors
///
/// - [`MptError::InvalidRequest`] if the frame geometry cannot hold a chain
/// - [`MptError::Exhausted`] if the chain pool runs dry; frames taken so
///   far are returned first
pub fn write_sgl(
    pool: &mut CommandPool,
    queues: &QueueSet,
    smid: Smid,
    sges: &[Sge],
    sgl_offset: usize,
    exhaustion_log: &RateLimiter,
) -> Result<SglLayout> {
    let frame_bytes = queues.sizing().request_frame_bytes;
    let first_cap = frame_bytes.saturating_sub(sgl_offset) / SGE_SIZE;
    let chain_cap = frame_bytes / SGE_SIZE;
    if first_cap == 0 || sgl_offset % 4 != 0 {
        return Err(MptError::invalid_request(format!(
            "SGL offset {sgl_offset} in a {frame_bytes}-byte frame"
        )));
    }

    let (req_region, req_base) = queues.request_frame(smid);
    if sges.is_empty() {
        req_region.write_bytes(req_base + sgl_offset, &Sge::empty().encode());
        return Ok(SglLayout {
            chain_offset: None,
            chain_frames: 0,
        });
    }
    if sges.len() > first_cap && sgl_offset % SGE_SIZE != 0 {
        return Err(MptError::invalid_request(format!(
            "SGL offset {sgl_offset} cannot carry a chain offset in {SGE_SIZE}-byte units"
        )));
    }
    if sges.len() > first_cap && (first_cap < 2 || chain_cap < 2) {
        return Err(MptError::invalid_request(format!(
            "{} elements need chaining but frame capacities are {first_cap}/{chain_cap}",
            sges.len()
        )));
    }

    let chain_offset = if sges.len() > first_cap {
        let units = (sgl_offset + (first_cap - 1) * SGE_SIZE) / SGE_SIZE;
        Some(u8::try_from(units).map_err(|_| MptError::invalid_request("chain offset beyond 255 units"))?)
    } else {
        None
    };

    let mut taken: Vec<ChainIndex> = Vec::new();
    let mut region = req_region;
    let mut at = req_base + sgl_offset;
    let mut cap = first_cap;
    let mut rest = sges;

    loop {
        if rest.len() <= cap {
            let last = rest.len() - 1;
            for (i, sge) in rest.iter().enumerate() {
                let sge = if i == last { sge.end_of_list() } else { *sge };
                region.write_bytes(at + i * SGE_SIZE, &sge.encode());
            }
            break;
        }

        let Some(chain) = pool.alloc_chain() else {
            for c in taken {
                pool.free_chain(c);
            }
            if exhaustion_log.allow() {
                tracing::warn!(
                    "out of chain frames ({} in pool), {smid} needs {}",
                    pool.num_chains(),
                    chain_frames_needed(sges.len(), first_cap, chain_cap)
                );
            }
            return Err(MptError::Exhausted {
                resource: "chain frames",
            });
        };
        taken.push(chain);

        let (head, tail) = rest.split_at(cap - 1);
        for (i, sge) in head.iter().enumerate() {
            region.write_bytes(at + i * SGE_SIZE, &sge.encode());
        }
        let link = if tail.len() <= chain_cap {
            Sge::chain(queues.chain_bus(chain), tail.len() as u32, 0)
        } else {
            Sge::chain(queues.chain_bus(chain), chain_cap as u32, (chain_cap - 1) as u8)
        };
        region.write_bytes(at + (cap - 1) * SGE_SIZE, &link.encode());

        let (chain_region, chain_base) = queues.chain_frame(chain);
        region = chain_region;
        at = chain_base;
        cap = chain_cap;
        rest = tail;
    }

    let chain_frames = taken.len();
    if let Some(cmd) = pool.command_mut(smid) {
        cmd.chains.extend(taken);
    }
    Ok(SglLayout {
        chain_offset,
        chain_frames,
    })
}
