//! Command slots and chain frames.
//!
//! One [`Command`] per request frame, indexed by SMID. Free slots sit in two
//! FIFO lists (normal and high priority); chain frames in a third. Nothing
//! here waits: an empty list is [`MptError::Exhausted`].

use crate::error::{MptError, Result};
use crate::request::Completer;
use std::collections::VecDeque;
use std::fmt;

/// Slot id of a request frame. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Smid(u16);

impl Smid {
    /// Wrap a raw slot id; `None` for the reserved slot 0.
    pub const fn new(raw: u16) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Raw slot id.
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Smid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SMID {}", self.0)
    }
}

/// Index of a chain frame within the chain pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainIndex(u32);

impl ChainIndex {
    /// Wrap a raw index.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw index.
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Which free list a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Ordinary requests.
    Normal,
    /// Slots reserved for task management and similar.
    High,
}

/// Where a command is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// On a free list.
    Free,
    /// Taken, frame being filled.
    Allocated,
    /// Posted; the IOC owns the frame.
    Submitted,
}

/// One request slot.
#[derive(Debug)]
pub struct Command {
    smid: u16,
    priority: Priority,
    state: CommandState,
    /// Chain frames attached to the request, in link order.
    pub(crate) chains: Vec<ChainIndex>,
    /// Function code of the posted request.
    pub(crate) function: u8,
    pub(crate) completer: Option<Completer>,
}

impl Command {
    fn new(smid: u16, priority: Priority) -> Self {
        Self {
            smid,
            priority,
            state: CommandState::Free,
            chains: Vec::new(),
            function: 0,
            completer: None,
        }
    }

    /// Slot id.
    pub const fn smid(&self) -> u16 {
        self.smid
    }

    /// Originating free list.
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Current state.
    pub const fn state(&self) -> CommandState {
        self.state
    }

    /// Chain frames attached.
    pub fn chains(&self) -> &[ChainIndex] {
        &self.chains
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = CommandState::Submitted;
    }
}

/// The slot and chain-frame pools of one allocation.
#[derive(Debug)]
pub struct CommandPool {
    commands: Vec<Command>,
    free: VecDeque<Smid>,
    free_high: VecDeque<Smid>,
    chains_free: VecDeque<ChainIndex>,
    num_chains: u32,
    chain_low_water: u32,
}

impl CommandPool {
    /// Pool of `num_reqs` slots (SMID 0 unused); `1..=num_prireqs` are high
    /// priority.
    pub fn new(num_reqs: u16, num_prireqs: u16, num_chains: u32) -> Self {
        let mut commands = Vec::with_capacity(usize::from(num_reqs));
        commands.push(Command::new(0, Priority::Normal));
        let mut free = VecDeque::new();
        let mut free_high = VecDeque::new();
        for raw in 1..num_reqs {
            let priority = if raw <= num_prireqs {
                Priority::High
            } else {
                Priority::Normal
            };
            commands.push(Command::new(raw, priority));
            match priority {
                Priority::High => free_high.push_back(Smid(raw)),
                Priority::Normal => free.push_back(Smid(raw)),
            }
        }
        Self {
            commands,
            free,
            free_high,
            chains_free: (0..num_chains).map(ChainIndex).collect(),
            num_chains,
            chain_low_water: num_chains,
        }
    }

    /// Take the head of the `priority` free list.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::Exhausted`] if the list is empty.
    pub fn alloc(&mut self, priority: Priority) -> Result<Smid> {
        let (list, resource) = match priority {
            Priority::Normal => (&mut self.free, "request slots"),
            Priority::High => (&mut self.free_high, "high priority request slots"),
        };
        let smid = list.pop_front().ok_or(MptError::Exhausted { resource })?;
        let cmd = &mut self.commands[usize::from(smid.0)];
        cmd.state = CommandState::Allocated;
        cmd.function = 0;
        Ok(smid)
    }

    /// Return a slot and its chain frames to their free lists.
    ///
    /// Releasing a slot that is already free is ignored.
    pub fn release(&mut self, smid: Smid) {
        let Some(cmd) = self.commands.get_mut(usize::from(smid.0)) else {
            tracing::warn!("release of unknown {smid}");
            return;
        };
        if cmd.state == CommandState::Free {
            tracing::warn!("{smid} released twice");
            return;
        }
        cmd.state = CommandState::Free;
        cmd.completer = None;
        let chains = std::mem::take(&mut cmd.chains);
        match cmd.priority {
            Priority::High => self.free_high.push_back(smid),
            Priority::Normal => self.free.push_back(smid),
        }
        for chain in chains {
            self.free_chain(chain);
        }
    }

    /// Take a chain frame, tracking the low-water mark.
    pub fn alloc_chain(&mut self) -> Option<ChainIndex> {
        let chain = self.chains_free.pop_front()?;
        self.chain_low_water = self.chain_low_water.min(self.free_chains());
        Some(chain)
    }

    /// Return a chain frame.
    pub fn free_chain(&mut self, chain: ChainIndex) {
        self.chains_free.push_back(chain);
    }

    /// The command in `smid`, if the id is in range.
    pub fn command(&self, smid: Smid) -> Option<&Command> {
        self.commands.get(usize::from(smid.0))
    }

    pub(crate) fn command_mut(&mut self, smid: Smid) -> Option<&mut Command> {
        self.commands.get_mut(usize::from(smid.0))
    }

    /// Slots currently submitted to the IOC, ascending.
    pub fn submitted(&self) -> Vec<Smid> {
        self.commands
            .iter()
            .filter(|c| c.state == CommandState::Submitted)
            .map(|c| Smid(c.smid))
            .collect()
    }

    /// Slots including SMID 0.
    pub fn capacity(&self) -> usize {
        self.commands.len()
    }

    /// Free normal slots.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Free high-priority slots.
    pub fn free_high_count(&self) -> usize {
        self.free_high.len()
    }

    /// Free chain frames.
    pub fn free_chains(&self) -> u32 {
        u32::try_from(self.chains_free.len()).unwrap_or(u32::MAX)
    }

    /// Chain frames in the pool.
    pub const fn num_chains(&self) -> u32 {
        self.num_chains
    }

    /// Fewest free chain frames seen.
    pub const fn chain_low_water(&self) -> u32 {
        self.chain_low_water
    }

    /// Free normal slots in list order.
    pub fn free_list(&self) -> impl Iterator<Item = Smid> + '_ {
        self.free.iter().copied()
    }
}
