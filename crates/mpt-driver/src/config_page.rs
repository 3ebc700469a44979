//! Static configuration read from IOC config pages.

use crate::dma::DmaRegion;
use crate::error::{MptError, Result};
use crate::request::{Completion, Direction, Outcome, Request, Segment};
use mpt_chip::msg::{config_action, page_type, ConfigRequest, IocPage8, CONFIG_SGL_OFFSET};

#[allow(clippy::cast_possible_truncation)]
const PAGE8_DWORDS: u8 = (IocPage8::LEN / 4) as u8;

/// Settings the mapping layer is rebuilt from after bring-up and every
/// reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticConfig {
    /// IOC Page 8 (device mapping policy).
    pub ioc_page8: IocPage8,
}

/// Config request reading IOC Page 8 into `buffer`.
pub(crate) fn ioc_page8_request(buffer: &DmaRegion) -> Request {
    let req = ConfigRequest {
        action: config_action::PAGE_READ_CURRENT,
        page_type: page_type::IOC,
        page_number: IocPage8::NUMBER,
        page_version: IocPage8::VERSION,
        page_length: PAGE8_DWORDS,
        page_address: 0,
    };
    #[allow(clippy::cast_possible_truncation)]
    let segment = Segment {
        address: buffer.bus_addr(),
        length: IocPage8::LEN as u32,
    };
    Request::message(req.encode()[..CONFIG_SGL_OFFSET].to_vec())
        .with_sgl_at(CONFIG_SGL_OFFSET)
        .with_segments(vec![segment], Direction::Read)
}

/// Decode the page the IOC wrote into `buffer`.
///
/// # Errors
///
/// - [`MptError::IocStatus`] if the IOC rejected the read
/// - [`MptError::InvalidState`] if the command was dropped or the page is
///   malformed
pub(crate) fn parse_ioc_page8(completion: &Completion, buffer: &DmaRegion) -> Result<StaticConfig> {
    match &completion.outcome {
        Outcome::DroppedByReset => {
            return Err(MptError::invalid_state("config read dropped by reset"));
        }
        Outcome::Reply(_) => {
            if let Some(status) = completion.reply_status().filter(|s| !s.is_success()) {
                return Err(MptError::IocStatus {
                    function: status.function,
                    status: status.ioc_status,
                    log_info: status.log_info,
                });
            }
        }
        Outcome::Success => {}
    }
    let raw = buffer.to_vec(0, IocPage8::LEN);
    if raw[2] != IocPage8::NUMBER || raw[3] & 0x0F != page_type::IOC {
        return Err(MptError::invalid_state(format!(
            "config buffer holds page type {:#x} number {}",
            raw[3], raw[2]
        )));
    }
    let page = IocPage8::parse(&raw).ok_or_else(|| MptError::invalid_state("short IOC Page 8"))?;
    tracing::debug!("IOC Page 8: {page:?}");
    Ok(StaticConfig { ioc_page8: page })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, HostMemory};
    use crate::pool::Smid;
    use bytes::Bytes;
    use mpt_chip::mpi::{function, ioc_status};
    use mpt_chip::msg;

    fn completion(outcome: Outcome) -> Completion {
        Completion {
            smid: Smid::new(3).unwrap(),
            outcome,
            sense: None,
        }
    }

    #[test]
    fn request_targets_page8() {
        let buf = HostMemory::new().allocate(64).unwrap();
        let req = ioc_page8_request(&buf);
        assert_eq!(req.function(), function::CONFIG);
        assert_eq!(req.sgl_offset, Some(CONFIG_SGL_OFFSET));
        assert_eq!(req.segments[0].address, buf.bus_addr());
        let mut full = req.frame.clone();
        full.resize(msg::CONFIG_REQUEST_LEN, 0);
        let (parsed, _) = ConfigRequest::parse(&full).unwrap();
        assert_eq!(parsed.page_number, 8);
        assert_eq!(parsed.page_type, page_type::IOC);
    }

    #[test]
    fn parses_written_page() {
        let buf = HostMemory::new().allocate(64).unwrap();
        let page = IocPage8 {
            max_persistent_entries: 128,
            flags: 0x6,
            ..IocPage8::default()
        };
        buf.write_bytes(0, &page.encode());
        let cfg = parse_ioc_page8(&completion(Outcome::Success), &buf).unwrap();
        assert_eq!(cfg.ioc_page8, page);
    }

    #[test]
    fn rejected_read() {
        let buf = HostMemory::new().allocate(64).unwrap();
        let reply = msg::default_reply(function::CONFIG, ioc_status::CONFIG_INVALID_PAGE, 0);
        let err = parse_ioc_page8(&completion(Outcome::Reply(Bytes::copy_from_slice(&reply))), &buf)
            .unwrap_err();
        assert!(matches!(err, MptError::IocStatus { status: 0x22, .. }));
    }

    #[test]
    fn blank_buffer_is_not_a_page() {
        let buf = HostMemory::new().allocate(64).unwrap();
        assert!(parse_ioc_page8(&completion(Outcome::Success), &buf).is_err());
    }
}
