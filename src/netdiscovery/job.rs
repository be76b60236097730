//! Pull-based address queue for one discovery job.
//!
//! The coordinator owns the job, pulls addresses with [`NetDiscoveryJob::nextip`]
//! while [`NetDiscoveryJob::max_in_queue`] allows it, and reports each finished
//! address with [`NetDiscoveryJob::done`]. Workers never touch the queue.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use super::credentials::{validate, Credential, ValidCredentials};
use super::range::{RangeConfig, RangeQueue};
use crate::event::{is_true, value_i64};

/// Credentials as sent with a job: one list for every range, or one list per
/// range name.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JobCredentials {
    Shared(Vec<Credential>),
    PerRange(BTreeMap<String, Vec<Credential>>),
}

/// Keep the entries of a list that decode as `T`, logging the others.
pub fn lenient_entries<T: DeserializeOwned>(value: Value, what: &str) -> Vec<T> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Null => return Vec::new(),
        other => {
            tracing::warn!("Skipping invalid {} list: {}", what, other);
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            if !entry.is_object() {
                tracing::warn!("Skipping invalid {}: {}", what, entry);
                return None;
            }
            match serde_json::from_value(entry) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!("Skipping invalid {}: {}", what, e);
                    None
                }
            }
        })
        .collect()
}

fn lenient_ranges<'de, D>(deserializer: D) -> Result<Vec<RangeConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_entries(Value::deserialize(deserializer)?, "range"))
}

impl<'de> Deserialize<'de> for JobCredentials {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Object(map) => JobCredentials::PerRange(
                map.into_iter()
                    .map(|(name, list)| (name, lenient_entries(list, "credential")))
                    .collect(),
            ),
            list => JobCredentials::Shared(lenient_entries(list, "credential")),
        })
    }
}

impl Default for JobCredentials {
    fn default() -> Self {
        JobCredentials::Shared(Vec::new())
    }
}

/// Job description as found in a server answer or built from local options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetDiscoveryJobConfig {
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "lenient_ranges")]
    pub ranges: Vec<RangeConfig>,
    #[serde(default)]
    pub credentials: JobCredentials,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub netscan: bool,
    #[serde(default)]
    pub control: bool,
    #[serde(default)]
    pub localtask: bool,
}

/// Live iteration state, built on first use.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    pub in_queue: u64,
    pub done: u64,
    pub size: u64,
    pub started: bool,
    pub ranges: VecDeque<RangeQueue>,
    pub snmp_credentials: Vec<Credential>,
    pub remote_credentials: Vec<Credential>,
}

#[derive(Debug, Clone)]
pub struct NetDiscoveryJob {
    pid: u64,
    timeout: u64,
    max_threads: u64,
    netscan: bool,
    control: bool,
    localtask: bool,
    ranges: Vec<RangeConfig>,
    credentials: JobCredentials,
    snmpwalk: Option<PathBuf>,
    queue: Option<JobQueue>,
}

impl NetDiscoveryJob {
    pub fn new(config: NetDiscoveryJobConfig) -> Self {
        let param = |key: &str| value_i64(config.params.get(key));
        let flag = |key: &str, given: bool| given || is_true(config.params.get(key));

        Self {
            pid: param("PID").unwrap_or(0).max(0) as u64,
            timeout: param("TIMEOUT").filter(|t| *t > 0).unwrap_or(60) as u64,
            max_threads: param("THREADS_DISCOVERY").filter(|t| *t > 0).unwrap_or(1) as u64,
            netscan: flag("NETSCAN", config.netscan),
            control: flag("CONTROL", config.control),
            localtask: flag("LOCALTASK", config.localtask),
            ranges: config.ranges,
            credentials: config.credentials,
            snmpwalk: config.file,
            queue: None,
        }
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Per-address probe timeout, in seconds.
    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn max_threads(&self) -> u64 {
        self.max_threads
    }

    pub fn netscan(&self) -> bool {
        self.netscan
    }

    pub fn control(&self) -> bool {
        self.control
    }

    pub fn localtask(&self) -> bool {
        self.localtask
    }

    pub fn snmpwalk(&self) -> Option<&PathBuf> {
        self.snmpwalk.as_ref()
    }

    fn queue(&mut self) -> &mut JobQueue {
        if self.queue.is_none() {
            self.queue = Some(self.build_queue());
        }
        self.queue.get_or_insert_with(JobQueue::default)
    }

    fn build_queue(&self) -> JobQueue {
        let shared = match &self.credentials {
            JobCredentials::Shared(list) => validate(list),
            JobCredentials::PerRange(_) => ValidCredentials::default(),
        };

        let mut queue = JobQueue {
            snmp_credentials: shared.snmp.clone(),
            remote_credentials: shared.remote.clone(),
            ..Default::default()
        };

        for config in &self.ranges {
            let valid = match &self.credentials {
                JobCredentials::Shared(_) => shared.clone(),
                // An unmatched range name gets no credentials at all
                JobCredentials::PerRange(map) => config
                    .name
                    .as_deref()
                    .and_then(|name| map.get(name))
                    .map(|list| validate(list))
                    .unwrap_or_default(),
            };

            match RangeQueue::build(config, valid.snmp, valid.remote, self.snmpwalk.clone()) {
                Ok(range) => {
                    tracing::debug!("initializing block {}", range);
                    queue.size += range.size;
                    queue.ranges.push_back(range);
                }
                Err(e) => tracing::error!("{}", e),
            }
        }

        queue
    }

    /// Ranges still to serve, building the queue on first call.
    pub fn ranges(&mut self) -> &VecDeque<RangeQueue> {
        &self.queue().ranges
    }

    /// Returns the previous started flag and sets it.
    pub fn started(&mut self) -> bool {
        let queue = self.queue();
        std::mem::replace(&mut queue.started, true)
    }

    /// Next address to probe.
    ///
    /// When the front range is exhausted it is dropped and this call returns
    /// `None`; the following call serves the next range. Callers loop while
    /// [`NetDiscoveryJob::range`] is still `Some`.
    pub fn nextip(&mut self) -> Option<Ipv4Addr> {
        let queue = self.queue();
        let front = queue.ranges.front_mut()?;
        if front.is_exhausted() {
            queue.ranges.pop_front();
            return None;
        }
        let ip = front.next_address()?;
        queue.in_queue += 1;
        Some(ip)
    }

    /// Report one address as finished. True once every address is done.
    pub fn done(&mut self) -> bool {
        let queue = self.queue();
        queue.in_queue = queue.in_queue.saturating_sub(1);
        queue.done += 1;
        queue.done >= queue.size
    }

    /// Whether as many addresses are in flight as the job allows threads.
    pub fn max_in_queue(&mut self) -> bool {
        let max = self.max_threads;
        self.queue().in_queue >= max
    }

    /// The range currently served, if any.
    pub fn range(&mut self) -> Option<&RangeQueue> {
        self.queue().ranges.front()
    }

    pub fn queuesize(&mut self) -> u64 {
        self.queue().size
    }

    pub fn in_queue(&mut self) -> u64 {
        self.queue().in_queue
    }

    pub fn done_count(&mut self) -> u64 {
        self.queue().done
    }

    /// Job-wide SNMP credentials, empty when credentials are given per range.
    pub fn snmp_credentials(&mut self) -> &[Credential] {
        &self.queue().snmp_credentials
    }

    pub fn remote_credentials(&mut self) -> &[Credential] {
        &self.queue().remote_credentials
    }
}
