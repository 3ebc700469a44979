//! Requests, submissions and completions.
//!
//! A [`Request`] is the message frame plus its data segments. Submitting it
//! yields a [`Submission`], which receives exactly one [`Completion`]:
//! the IOC's answer, or [`Outcome::DroppedByReset`] if a reset got there
//! first.

use crate::pool::{Priority, Smid};
use bytes::Bytes;
use mpt_chip::descriptor::request_flags;
use mpt_chip::mpi::function;
use mpt_chip::msg::{self, scsi_control, ScsiIoReply, ScsiIoRequest, SCSI_IO_SGL_OFFSET};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::Duration;

/// One contiguous DMA buffer of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Bus address.
    pub address: u64,
    /// Length in bytes.
    pub length: u32,
}

/// Data phase direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// No data.
    #[default]
    None,
    /// Device to host.
    Read,
    /// Host to device.
    Write,
    /// Both; every segment is described once per direction.
    Bidirectional,
}

impl Direction {
    fn from_scsi_control(control: u32) -> Self {
        match control & scsi_control::BIDIRECTIONAL {
            scsi_control::READ => Self::Read,
            scsi_control::WRITE => Self::Write,
            scsi_control::BIDIRECTIONAL => Self::Bidirectional,
            _ => Self::None,
        }
    }
}

/// A message ready to be placed in a request frame.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) frame: Vec<u8>,
    pub(crate) sgl_offset: Option<usize>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) direction: Direction,
    pub(crate) priority: Priority,
    pub(crate) request_flags: u8,
    pub(crate) dev_handle: u16,
}

impl Request {
    /// Arbitrary message; no SGL unless [`Self::with_sgl_at`] is used.
    pub fn message(frame: impl Into<Vec<u8>>) -> Self {
        Self {
            frame: frame.into(),
            sgl_offset: None,
            segments: Vec::new(),
            direction: Direction::None,
            priority: Priority::Normal,
            request_flags: request_flags::DEFAULT,
            dev_handle: 0,
        }
    }

    /// SCSI IO request; the SGL follows the CDB block and the engine
    /// points the frame at the slot's sense buffer.
    pub fn scsi_io(io: &ScsiIoRequest) -> Self {
        let mut frame = vec![0u8; SCSI_IO_SGL_OFFSET];
        io.encode_into(&mut frame);
        Self {
            frame,
            sgl_offset: Some(SCSI_IO_SGL_OFFSET),
            segments: Vec::new(),
            direction: Direction::from_scsi_control(io.control),
            priority: Priority::Normal,
            request_flags: request_flags::SCSI_IO,
            dev_handle: io.dev_handle,
        }
    }

    /// Place the SGL at byte `offset` of the frame.
    #[must_use]
    pub fn with_sgl_at(mut self, offset: usize) -> Self {
        self.sgl_offset = Some(offset);
        self
    }

    /// Data segments of the transfer.
    #[must_use]
    pub fn with_segments(mut self, segments: Vec<Segment>, direction: Direction) -> Self {
        self.segments = segments;
        self.direction = direction;
        self
    }

    /// Use a high-priority slot and descriptor.
    #[must_use]
    pub fn high_priority(mut self) -> Self {
        self.priority = Priority::High;
        self.request_flags = request_flags::HIGH_PRIORITY;
        self
    }

    /// Function code of the message.
    pub fn function(&self) -> u8 {
        if self.frame.len() > msg::FUNCTION {
            msg::function_of(&self.frame)
        } else {
            0
        }
    }

    /// Whether this is a SCSI IO request.
    pub fn is_scsi_io(&self) -> bool {
        self.request_flags == request_flags::SCSI_IO && self.function() == function::SCSI_IO_REQUEST
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Success descriptor, no reply frame.
    Success,
    /// Reply frame contents.
    Reply(Bytes),
    /// A reset invalidated the command before the IOC answered.
    DroppedByReset,
}

/// The single completion of a submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Slot the command occupied.
    pub smid: Smid,
    /// Result.
    pub outcome: Outcome,
    /// Autosense data of a SCSI IO reply, if the IOC reported any.
    pub sense: Option<Bytes>,
}

impl Completion {
    /// Whether the IOC completed the command without error.
    pub fn is_success(&self) -> bool {
        match &self.outcome {
            Outcome::Success => true,
            Outcome::Reply(b) => msg::ReplyStatus::parse(b).is_some_and(|s| s.is_success()),
            Outcome::DroppedByReset => false,
        }
    }

    /// Status header of the reply frame, if there was one.
    pub fn reply_status(&self) -> Option<msg::ReplyStatus> {
        match &self.outcome {
            Outcome::Reply(b) => msg::ReplyStatus::parse(b),
            _ => None,
        }
    }

    /// SCSI IO reply fields, if the reply frame holds one.
    pub fn scsi_reply(&self) -> Option<ScsiIoReply> {
        match &self.outcome {
            Outcome::Reply(b) if msg::function_of(b) == function::SCSI_IO_REQUEST => ScsiIoReply::parse(b),
            _ => None,
        }
    }
}

/// Receiving end of a submitted command.
#[derive(Debug)]
pub struct Submission {
    smid: Smid,
    rx: Receiver<Completion>,
}

impl Submission {
    pub(crate) fn new(smid: Smid, rx: Receiver<Completion>) -> Self {
        Self { smid, rx }
    }

    /// Slot the command occupies.
    pub const fn smid(&self) -> Smid {
        self.smid
    }

    /// The completion, if it has arrived.
    pub fn try_completion(&self) -> Option<Completion> {
        match self.rx.try_recv() {
            Ok(c) => Some(c),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Block until the completion arrives or `timeout` passes.
    ///
    /// Someone else must be draining the reply queue, for instance an
    /// interrupt handler calling `Controller::handle_interrupt`.
    pub fn wait(&self, timeout: Duration) -> Option<Completion> {
        match self.rx.recv_timeout(timeout) {
            Ok(c) => Some(c),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Where a command's completion goes.
#[derive(Debug)]
pub(crate) enum Completer {
    /// A caller holding a [`Submission`].
    Caller(SyncSender<Completion>),
    /// Event mask re-sent after a reset; completing it restarts discovery.
    EventReregistration,
}
