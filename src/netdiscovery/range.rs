//! IPv4 range iteration state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

use super::credentials::{loose_string, Credential};

/// Range construction errors. The job logs them and skips the range.
#[derive(Error, Debug, PartialEq)]
pub enum RangeError {
    #[error("IPv4 range not supported: {start}-{end}")]
    InvalidAddress { start: String, end: String },
    #[error("Skipping empty range: {start}-{end}")]
    Empty { start: String, end: String },
}

/// A range as supplied by the server or the local configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default, alias = "NAME", deserialize_with = "loose_string")]
    pub name: Option<String>,
    #[serde(default, alias = "ENTITY")]
    pub entity: Option<Value>,
    #[serde(default, alias = "IPSTART", deserialize_with = "loose_string")]
    pub start: Option<String>,
    #[serde(default, alias = "IPEND", deserialize_with = "loose_string")]
    pub end: Option<String>,
    #[serde(default, alias = "PORT")]
    pub ports: Option<Value>,
    #[serde(default, alias = "PROTOCOL")]
    pub domains: Option<Value>,
}

impl RangeConfig {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: Some(start.to_string()),
            end: Some(end.to_string()),
            ..Default::default()
        }
    }
}

/// SNMP transport domains, declared in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnmpDomain {
    Udp,
    UdpIpv4,
    UdpIpv6,
    Tcp,
    TcpIpv4,
    TcpIpv6,
}

impl SnmpDomain {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(SnmpDomain::Udp),
            "udp/ipv4" => Some(SnmpDomain::UdpIpv4),
            "udp/ipv6" => Some(SnmpDomain::UdpIpv6),
            "tcp" => Some(SnmpDomain::Tcp),
            "tcp/ipv4" => Some(SnmpDomain::TcpIpv4),
            "tcp/ipv6" => Some(SnmpDomain::TcpIpv6),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnmpDomain::Udp => "udp",
            SnmpDomain::UdpIpv4 => "udp/ipv4",
            SnmpDomain::UdpIpv6 => "udp/ipv6",
            SnmpDomain::Tcp => "tcp",
            SnmpDomain::TcpIpv4 => "tcp/ipv4",
            SnmpDomain::TcpIpv6 => "tcp/ipv6",
        }
    }

    /// Whether our UDP client can use this domain against an IPv4 host.
    pub fn is_udp_ipv4(&self) -> bool {
        matches!(self, SnmpDomain::Udp | SnmpDomain::UdpIpv4)
    }
}

impl fmt::Display for SnmpDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split an int, string, comma-joined string or list into trimmed items.
fn split_items(value: &Value) -> Vec<String> {
    let given: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(|v| crate::event::value_string(Some(v))).collect(),
        other => crate::event::value_string(Some(other)).into_iter().collect(),
    };
    given
        .iter()
        .flat_map(|s| s.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Valid ports, deduplicated and sorted. Invalid entries are dropped.
pub fn normalize_ports(value: Option<&Value>) -> Vec<u16> {
    let Some(value) = value else {
        return Vec::new();
    };
    split_items(value)
        .iter()
        .filter_map(|p| p.parse::<u32>().ok())
        .filter(|p| (1..=65535).contains(p))
        .map(|p| p as u16)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Known domains in canonical preference order, whatever the input order.
pub fn normalize_domains(value: Option<&Value>) -> Vec<SnmpDomain> {
    let Some(value) = value else {
        return Vec::new();
    };
    split_items(value)
        .iter()
        .filter_map(|d| SnmpDomain::parse(d))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Iteration state over one IPv4 range.
#[derive(Debug, Clone)]
pub struct RangeQueue {
    pub name: String,
    pub entity: Option<Value>,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    cursor: u64,
    exhausted: bool,
    pub size: u64,
    pub ports: Vec<u16>,
    pub domains: Vec<SnmpDomain>,
    pub snmp_credentials: Vec<Credential>,
    pub remote_credentials: Vec<Credential>,
    pub walk: Option<PathBuf>,
}

impl RangeQueue {
    pub fn build(
        config: &RangeConfig,
        snmp_credentials: Vec<Credential>,
        remote_credentials: Vec<Credential>,
        walk: Option<PathBuf>,
    ) -> Result<Self, RangeError> {
        let start_str = config.start.clone().unwrap_or_default();
        let end_str = config.end.clone().unwrap_or_default();

        let (start, end) = match (start_str.trim().parse::<Ipv4Addr>(), end_str.trim().parse::<Ipv4Addr>()) {
            (Ok(s), Ok(e)) => (s, e),
            _ => {
                return Err(RangeError::InvalidAddress {
                    start: start_str,
                    end: end_str,
                })
            }
        };

        let size = u32::from(end) as i64 - u32::from(start) as i64 + 1;
        if size <= 0 {
            return Err(RangeError::Empty {
                start: start_str,
                end: end_str,
            });
        }

        Ok(Self {
            name: config.name.clone().unwrap_or_default(),
            entity: config.entity.clone(),
            start,
            end,
            cursor: u32::from(start) as u64,
            exhausted: false,
            size: size as u64,
            ports: normalize_ports(config.ports.as_ref()),
            domains: normalize_domains(config.domains.as_ref()),
            snmp_credentials,
            remote_credentials,
            walk,
        })
    }

    /// Next address to hand out, advancing the cursor.
    pub fn next_address(&mut self) -> Option<Ipv4Addr> {
        if self.exhausted {
            return None;
        }
        let ip = Ipv4Addr::from(self.cursor as u32);
        self.cursor += 1;
        if self.cursor > u32::from(self.end) as u64 {
            self.exhausted = true;
        }
        Some(ip)
    }

    /// True once the cursor went past the end address.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl fmt::Display for RangeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
