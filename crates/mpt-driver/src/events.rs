//! Asynchronous event registration and dispatch.
//!
//! The IOC is told which events to suppress: a set bit in the hardware mask
//! means "do not send". The mask is the AND of the complements of every
//! registered interest mask, so an event wanted by anyone gets through.

use bytes::Bytes;
use mpt_chip::mpi::{EVENT_MASK_WORDS, MAX_EVENT_CODE};
use mpt_chip::msg::{EventReplyHeader, EVENT_REPLY_HEADER_LEN};
use std::fmt;
use std::sync::Arc;

/// Set of event codes 0..128.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventMask([u32; EVENT_MASK_WORDS]);

impl EventMask {
    /// No events.
    pub const fn empty() -> Self {
        Self([0; EVENT_MASK_WORDS])
    }

    /// Every event.
    pub const fn all() -> Self {
        Self([u32::MAX; EVENT_MASK_WORDS])
    }

    /// Mask holding `codes`. Codes above 127 are ignored.
    pub fn of(codes: &[u16]) -> Self {
        codes.iter().fold(Self::empty(), |m, &c| m.with(c))
    }

    /// Add `code`.
    #[must_use]
    pub fn with(mut self, code: u16) -> Self {
        if code <= MAX_EVENT_CODE {
            let code = usize::from(code);
            self.0[code / 32] |= 1 << (code % 32);
        }
        self
    }

    /// Whether `code` is in the set.
    pub fn contains(&self, code: u16) -> bool {
        code <= MAX_EVENT_CODE && {
            let code = usize::from(code);
            self.0[code / 32] & (1 << (code % 32)) != 0
        }
    }

    /// Raw words, event `n` at bit `n % 32` of word `n / 32`.
    pub const fn words(&self) -> [u32; EVENT_MASK_WORDS] {
        self.0
    }

    /// From raw words.
    pub const fn from_words(words: [u32; EVENT_MASK_WORDS]) -> Self {
        Self(words)
    }
}

/// One asynchronous event from the IOC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotification {
    /// Event code.
    pub event: u16,
    /// The IOC expects an Event Acknowledge.
    pub ack_required: bool,
    /// IOCStatus of the notification.
    pub ioc_status: u16,
    /// IOCLogInfo.
    pub log_info: u32,
    /// Firmware event context.
    pub context: u32,
    /// Event data.
    pub data: Bytes,
}

impl EventNotification {
    /// Decode an Event Notification reply frame.
    pub fn parse(reply: &[u8]) -> Option<Self> {
        let h = EventReplyHeader::parse(reply)?;
        let data = Bytes::copy_from_slice(
            &reply[EVENT_REPLY_HEADER_LEN..EVENT_REPLY_HEADER_LEN + h.data_len],
        );
        Some(Self {
            event: h.event,
            ack_required: h.ack_required,
            ioc_status: h.ioc_status,
            log_info: h.log_info,
            context: h.event_context,
            data,
        })
    }
}

/// Callback for events.
pub type EventListener = Arc<dyn Fn(&EventNotification) + Send + Sync>;

/// Registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

struct Registration {
    handle: EventHandle,
    mask: EventMask,
    listener: EventListener,
}

/// Ordered list of registrations.
#[derive(Default)]
pub struct EventRegistry {
    next: u64,
    entries: Vec<Registration>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("registrations", &self.entries.len())
            .field("hardware_mask", &self.hardware_mask())
            .finish()
    }
}

impl EventRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `mask`.
    pub fn register(&mut self, mask: EventMask, listener: EventListener) -> EventHandle {
        let handle = EventHandle(self.next);
        self.next += 1;
        self.entries.push(Registration {
            handle,
            mask,
            listener,
        });
        handle
    }

    /// Remove a registration; `false` if it was not present.
    pub fn deregister(&mut self, handle: EventHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|r| r.handle != handle);
        self.entries.len() != before
    }

    /// Suppression mask for the IOC.
    pub fn hardware_mask(&self) -> EventMask {
        let mut words = [u32::MAX; EVENT_MASK_WORDS];
        for r in &self.entries {
            for (w, m) in words.iter_mut().zip(r.mask.words()) {
                *w &= !m;
            }
        }
        EventMask(words)
    }

    /// Listeners interested in `code`, in registration order.
    pub fn listeners_for(&self, code: u16) -> Vec<EventListener> {
        self.entries
            .iter()
            .filter(|r| r.mask.contains(code))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run every listener for `event`. Returns how many ran.
pub(crate) fn dispatch(listeners: &[EventListener], event: &EventNotification) -> usize {
    if listeners.is_empty() {
        tracing::debug!("unhandled event {:#06x}", event.event);
    }
    for l in listeners {
        l(event);
    }
    listeners.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpt_chip::mpi::event;
    use mpt_chip::msg;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, EventListener) {
        let n = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&n);
        let listener: EventListener = Arc::new(move |_: &EventNotification| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        (n, listener)
    }

    #[test]
    fn mask_bits() {
        let m = EventMask::of(&[event::SAS_DISCOVERY, event::IR_VOLUME, 100]);
        assert!(m.contains(event::SAS_DISCOVERY));
        assert!(m.contains(100));
        assert!(!m.contains(event::LOG_DATA));
        assert_eq!(m.words()[3], 1 << 4);
        assert_eq!(EventMask::of(&[200]), EventMask::empty());
    }

    #[test]
    fn hardware_mask_is_and_of_complements() {
        let mut reg = EventRegistry::new();
        assert_eq!(reg.hardware_mask(), EventMask::all());
        let (_, l) = counter();
        let a = reg.register(EventMask::of(&[1, 2]), Arc::clone(&l));
        reg.register(EventMask::of(&[2, 33]), l);
        let hw = reg.hardware_mask();
        assert_eq!(hw.words()[0], !0b110);
        assert_eq!(hw.words()[1], !0b10);
        assert!(reg.deregister(a));
        assert!(!reg.deregister(a));
        assert!(reg.hardware_mask().contains(1));
    }

    #[test]
    fn dispatch_to_matching_only() {
        let mut reg = EventRegistry::new();
        let (hits_a, a) = counter();
        let (hits_b, b) = counter();
        reg.register(EventMask::of(&[event::SAS_DISCOVERY]), a);
        reg.register(EventMask::of(&[event::IR_VOLUME]), b);
        let n = EventNotification::parse(&msg::event_reply(event::SAS_DISCOVERY, 9, false, &[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(n.context, 9);
        assert_eq!(&n.data[..], &[1, 2, 3, 4]);
        assert_eq!(dispatch(&reg.listeners_for(n.event), &n), 1);
        assert_eq!(hits_a.load(Ordering::Relaxed), 1);
        assert_eq!(hits_b.load(Ordering::Relaxed), 0);
        assert_eq!(dispatch(&reg.listeners_for(event::LOG_DATA), &n), 0);
    }
}
