//! Per-address probes used by discovery workers.
//!
//! Supports ICMP ping, SNMP GET over UDP, TCP connect and snmpwalk replay.

mod ping;
mod snmp;
mod tcp;
mod walk;

pub use ping::*;
pub use snmp::*;
pub use tcp::*;
pub use walk::*;

use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("malformed answer: {0}")]
    Decode(String),
}

impl ProbeError {
    /// True when the host simply did not answer.
    pub fn is_silence(&self) -> bool {
        matches!(self, ProbeError::Timeout(_))
    }
}
