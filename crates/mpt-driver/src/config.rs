//! Engine configuration knobs.

use crate::error::{MptError, Result};
use crate::handshake::DoorbellTimings;
use crate::reset::ResetTimings;
use std::time::Duration;

/// What happens when the controller fails after bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Mark the controller failed and return the error.
    #[default]
    Report,
    /// Abort the process.
    Halt,
}

impl std::str::FromStr for FatalPolicy {
    type Err = MptError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "halt" => Ok(Self::Halt),
            other => Err(MptError::invalid_request(format!("unknown fatal policy '{other}'"))),
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on request frames (clamped to the IOC's credit).
    pub max_requests: u16,
    /// Upper bound on high-priority request frames.
    pub max_prio_requests: u16,
    /// Reply frames for normal I/O.
    pub max_replies: u16,
    /// Reply frames set aside for events.
    pub max_event_replies: u16,
    /// Chain frames in the pool.
    pub max_chains: u32,
    /// `wait_command` budget.
    pub command_timeout: Duration,
    /// Health check period.
    pub periodic_interval: Duration,
    /// Doorbell handshake budgets.
    pub doorbell: DoorbellTimings,
    /// Reset and transition budgets.
    pub reset: ResetTimings,
    /// Failure handling after bring-up.
    pub fatal_policy: FatalPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1024,
            max_prio_requests: 128,
            max_replies: 2048,
            max_event_replies: 32,
            max_chains: 2048,
            command_timeout: Duration::from_secs(60),
            periodic_interval: Duration::from_secs(1),
            doorbell: DoorbellTimings::default(),
            reset: ResetTimings::default(),
            fatal_policy: FatalPolicy::Report,
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `MPT_*` environment variables.
    ///
    /// Recognised: `MPT_MAX_CHAINS`, `MPT_MAX_REQUESTS`, `MPT_MAX_REPLIES`,
    /// `MPT_COMMAND_TIMEOUT_SECS`, `MPT_FATAL_POLICY`.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::InvalidRequest`] for a value that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an explicit lookup.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::InvalidRequest`] for a value that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = parse_var(&lookup, "MPT_MAX_CHAINS")? {
            cfg.max_chains = v;
        }
        if let Some(v) = parse_var(&lookup, "MPT_MAX_REQUESTS")? {
            cfg.max_requests = v;
        }
        if let Some(v) = parse_var(&lookup, "MPT_MAX_REPLIES")? {
            cfg.max_replies = v;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MPT_COMMAND_TIMEOUT_SECS")? {
            cfg.command_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = parse_var(&lookup, "MPT_FATAL_POLICY")? {
            cfg.fatal_policy = policy;
        }
        Ok(cfg)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| MptError::invalid_request(format!("{key}={raw} does not parse")))
        })
        .transpose()
}
