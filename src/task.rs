//! Task dispatch.
//!
//! Maps task names to the task kinds this agent knows, runs a task in a
//! worker and reports back to the daemon through the message channel.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::client::{Client, ClientError, Contact};
use crate::config::AgentConfig;
use crate::event::{Event, EventParams};
use crate::target::TargetKind;

/// Task names the scheduler knows about, in planning order.
pub const KNOWN_TASKS: &[&str] = &[
    "inventory",
    "netdiscovery",
    "netinventory",
    "remoteinventory",
    "esx",
    "wakeonlan",
    "deploy",
    "collect",
];

/// Task error types.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{0} task module is not available")]
    NotAvailable(String),
    #[error("server communication failed: {0}")]
    Client(#[from] ClientError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid task configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Inventory,
    NetDiscovery,
    NetInventory,
    RemoteInventory,
    Esx,
    WakeOnLan,
    Deploy,
    Collect,
    /// Unknown task, with its module name.
    Other(String),
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn task_table() -> &'static HashMap<&'static str, TaskKind> {
    static TABLE: OnceLock<HashMap<&'static str, TaskKind>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("inventory", TaskKind::Inventory),
            ("netdiscovery", TaskKind::NetDiscovery),
            ("netinventory", TaskKind::NetInventory),
            ("remoteinventory", TaskKind::RemoteInventory),
            ("esx", TaskKind::Esx),
            ("wakeonlan", TaskKind::WakeOnLan),
            ("deploy", TaskKind::Deploy),
            ("collect", TaskKind::Collect),
        ])
    })
}

impl TaskKind {
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        task_table()
            .get(name.as_str())
            .cloned()
            .unwrap_or_else(|| TaskKind::Other(capitalize(&name)))
    }

    /// Module name, as used in logs.
    pub fn module(&self) -> String {
        match self {
            TaskKind::Inventory => "Inventory".to_string(),
            TaskKind::NetDiscovery => "NetDiscovery".to_string(),
            TaskKind::NetInventory => "NetInventory".to_string(),
            TaskKind::RemoteInventory => "RemoteInventory".to_string(),
            TaskKind::Esx => "ESX".to_string(),
            TaskKind::WakeOnLan => "WakeOnLan".to_string(),
            TaskKind::Deploy => "Deploy".to_string(),
            TaskKind::Collect => "Collect".to_string(),
            TaskKind::Other(module) => module.clone(),
        }
    }

    /// Lower case task name.
    pub fn name(&self) -> String {
        self.module().to_lowercase()
    }

    /// Whether this build can run the task.
    pub fn is_available(&self) -> bool {
        matches!(self, TaskKind::NetDiscovery)
    }
}

/// Installed task modules, announced to the server.
pub fn installed_tasks() -> Vec<String> {
    KNOWN_TASKS
        .iter()
        .filter(|t| TaskKind::from_name(t).is_available())
        .map(|t| t.to_string())
        .collect()
}

/// Everything a worker gets from the daemon. Values only, no shared state.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: TaskKind,
    pub target_id: String,
    pub target_kind: TargetKind,
    pub deviceid: String,
    pub config: Arc<AgentConfig>,
    pub event: Option<Event>,
    pub response: Option<Contact>,
    /// Cache left by the previous run of the same task
    pub cache: Option<Value>,
    pub client: Client,
}

impl TaskContext {
    /// Local output directory, for local targets.
    pub fn local_path(&self) -> Option<&PathBuf> {
        match &self.target_kind {
            TargetKind::Local { path } => Some(path),
            TargetKind::Server { .. } => None,
        }
    }

    pub fn server_url(&self) -> Option<&str> {
        match &self.target_kind {
            TargetKind::Server { url } => Some(url),
            TargetKind::Local { .. } => None,
        }
    }
}

/// What a finished task hands back to the daemon.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub cache: Option<Value>,
}

/// Message sent from a worker to the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMessage {
    AgentCache { task: String, cache: Value },
    TaskEvent { task: String, event: EventParams },
}

impl TaskMessage {
    /// Parse `AGENTCACHE,<task>,<json>` or `TASKEVENT,<task>,<json>`.
    pub fn parse(message: &str) -> Option<Self> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"(?s)^(AGENTCACHE|TASKEVENT),([^,]*),(.*)$").unwrap());

        let caps = re.captures(message)?;
        let task = caps[2].to_string();
        match &caps[1] {
            "AGENTCACHE" => {
                let cache = serde_json::from_str(&caps[3]).ok()?;
                Some(TaskMessage::AgentCache { task, cache })
            }
            _ => {
                let event = serde_json::from_str(&caps[3]).ok()?;
                Some(TaskMessage::TaskEvent { task, event })
            }
        }
    }

    pub fn encode(&self) -> String {
        match self {
            TaskMessage::AgentCache { task, cache } => format!("AGENTCACHE,{},{}", task, cache),
            TaskMessage::TaskEvent { task, event } => {
                let dump: serde_json::Map<String, Value> =
                    event.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                format!("TASKEVENT,{},{}", task, Value::Object(dump))
            }
        }
    }
}

/// Run the task selected by the context.
pub async fn run_task_real(ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
    match &ctx.task {
        TaskKind::NetDiscovery => crate::netdiscovery::run(ctx).await,
        other => Err(TaskError::NotAvailable(other.module())),
    }
}

/// Worker body: run the task, forward its cache, log failures.
pub async fn run_worker(ctx: TaskContext, messages: UnboundedSender<String>) {
    let task = ctx.task.name();
    match &ctx.event {
        Some(event) => tracing::info!("target {}: running task {}: {} event", ctx.target_id, task, event.name()),
        None => tracing::info!("target {}: running task {}", ctx.target_id, task),
    }

    match run_task_real(&ctx).await {
        Ok(outcome) => {
            if let Some(cache) = outcome.cache {
                let message = TaskMessage::AgentCache {
                    task: task.clone(),
                    cache,
                };
                if messages.send(message.encode()).is_err() {
                    tracing::debug!("target {}: daemon gone, dropping {} cache", ctx.target_id, task);
                }
            }
            tracing::debug!("target {}: task {} finished", ctx.target_id, task);
        }
        Err(TaskError::NotAvailable(module)) => {
            tracing::info!("target {}: {} task module is not available", ctx.target_id, module);
        }
        Err(e) => tracing::error!("target {}: task {} failed: {}", ctx.target_id, task, e),
    }
}
