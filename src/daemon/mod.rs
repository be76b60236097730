//! Agent daemon: the cooperative scheduling loop.
//!
//! One loop owns every target. Each iteration services one target: a pending
//! event or a due run. Tasks run in spawned workers that report back through
//! the message channel; signals and the HTTP listener talk to the loop through
//! the command channel.

mod pidfile;

pub use pidfile::*;

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{Client, ClientError, Contact, ContactRequest};
use crate::config::AgentConfig;
use crate::db::{DbError, Store};
use crate::event::{is_true, Event, EventKind};
use crate::target::{Target, TargetKind, TargetOptions};
use crate::task::{installed_tasks, run_worker, TaskContext, TaskKind, TaskMessage, KNOWN_TASKS};
use crate::web::{HttpListener, ListenerSettings};

/// Daemon error types.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("can't write PID file {path}: {source}")]
    PidFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("an agent is already running with PID {0}")]
    AlreadyRunning(u32),
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

/// Requests sent to the loop from outside.
#[derive(Debug, Clone)]
pub enum DaemonCommand {
    /// Plan every target now.
    RunNow,
    Reinit,
    Terminate,
    /// Event raised by the HTTP listener.
    Event(Event),
}

/// A spawned task worker.
#[derive(Debug)]
pub struct ChildTask {
    pub name: String,
    pub target_id: String,
    pub handle: JoinHandle<()>,
}

enum Wake {
    Timeout,
    Command(DaemonCommand),
    Message(String),
}

const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Back-off applied when a server can't be reached.
const NETWORK_ERROR_DELAY: u64 = 60;

/// Tasks planned by a configuration, in order.
pub fn planned_tasks(config: &AgentConfig) -> Vec<String> {
    let tasks: Vec<String> = if config.tasks.is_empty() {
        KNOWN_TASKS.iter().map(|t| t.to_string()).collect()
    } else {
        config.tasks.clone()
    };
    tasks.into_iter().filter(|t| !config.no_task.contains(t)).collect()
}

/// Target ids and destinations declared by a configuration.
fn declared_targets(config: &AgentConfig) -> Vec<(String, TargetKind)> {
    let servers = config
        .server
        .iter()
        .enumerate()
        .map(|(i, url)| (format!("server{}", i), TargetKind::Server { url: url.clone() }));
    let locals = config
        .local
        .iter()
        .enumerate()
        .map(|(i, path)| (format!("local{}", i), TargetKind::Local { path: path.clone() }));
    servers.chain(locals).collect()
}

pub struct Daemon {
    config: Arc<AgentConfig>,
    store: Store,
    client: Client,
    deviceid: String,
    targets: Vec<Target>,
    run_queue: VecDeque<String>,
    children: Option<HashMap<u64, ChildTask>>,
    next_child_id: u64,
    caches: HashMap<String, Value>,
    commands_tx: UnboundedSender<DaemonCommand>,
    commands_rx: UnboundedReceiver<DaemonCommand>,
    messages_tx: UnboundedSender<String>,
    messages_rx: UnboundedReceiver<String>,
    status: watch::Sender<String>,
    pidfile: Option<PidFile>,
    httpd: Option<HttpListener>,
    runnow: bool,
    terminate: bool,
    run_optimization: bool,
    last_config_load: i64,
    sleep_interval: Duration,
}

impl Daemon {
    pub fn new(config: AgentConfig, store: Store) -> Result<Self, DaemonError> {
        let client = Client::new(Duration::from_secs(config.timeout.max(1)))?;
        let deviceid = store.deviceid()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel("waiting".to_string());

        let mut daemon = Self {
            config: Arc::new(config),
            store,
            client,
            deviceid,
            targets: Vec::new(),
            run_queue: VecDeque::new(),
            children: Some(HashMap::new()),
            next_child_id: 0,
            caches: HashMap::new(),
            commands_tx,
            commands_rx,
            messages_tx,
            messages_rx,
            status,
            pidfile: None,
            httpd: None,
            runnow: false,
            terminate: false,
            run_optimization: true,
            last_config_load: Utc::now().timestamp(),
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
        };
        daemon.load_targets();
        Ok(daemon)
    }

    pub fn with_sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    /// Sender for signal forwarding and the HTTP listener.
    pub fn commands(&self) -> UnboundedSender<DaemonCommand> {
        self.commands_tx.clone()
    }

    pub fn status(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    pub fn deviceid(&self) -> &str {
        &self.deviceid
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target_mut(&mut self, id: &str) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.id() == id)
    }

    pub fn cache(&self, task: &str) -> Option<&Value> {
        self.caches.get(task)
    }

    pub fn running_tasks(&self) -> usize {
        self.children.as_ref().map_or(0, HashMap::len)
    }

    /// Build targets from the configuration, keeping existing ones whose
    /// destination did not change.
    fn load_targets(&mut self) {
        let tasks = planned_tasks(&self.config);
        let mut previous: Vec<Target> = std::mem::take(&mut self.targets);

        for (id, kind) in declared_targets(&self.config) {
            let target = match previous.iter().position(|t| t.id() == id && *t.kind() == kind) {
                Some(pos) => previous.swap_remove(pos),
                None => {
                    let options = TargetOptions {
                        max_delay: self.config.delaytime,
                        err_max_delay: self.config.delaytime,
                        initial_delay: Some(self.config.delaytime),
                        planned_tasks: Vec::new(),
                    };
                    Target::new(&id, kind, options, Some(self.store.clone()))
                }
            };
            self.targets.push(target);
        }
        for target in &mut self.targets {
            target.set_planned_tasks(tasks.clone());
        }

        for dropped in previous {
            tracing::info!("target {}: removed from configuration", dropped.id());
        }
        self.forget_stale_states();
        self.run_queue.retain(|id| self.targets.iter().any(|t| t.id() == id));

        if self.targets.is_empty() {
            tracing::error!("No target defined, use server or local");
        }
    }

    /// Drop stored schedules of targets no longer declared.
    fn forget_stale_states(&self) {
        let states = match self.store.get_target_states() {
            Ok(states) => states,
            Err(e) => {
                tracing::error!("can't list target states: {}", e);
                return;
            }
        };
        for state in states {
            if self.targets.iter().any(|t| t.id() == state.id) {
                continue;
            }
            tracing::debug!("target {}: forgetting stored state", state.id);
            if let Err(e) = self.store.delete_target_state(&state.id) {
                tracing::error!("target {}: can't forget state: {}", state.id, e);
            }
        }
    }

    /// Create the PID file, if one is configured.
    pub fn create_daemon(&mut self) -> Result<(), DaemonError> {
        if let Some(path) = self.config.pidfile_path() {
            self.pidfile = Some(PidFile::create(&path)?);
        }
        Ok(())
    }

    pub async fn init(&mut self) -> Result<(), DaemonError> {
        self.create_daemon()?;
        self.load_http_interface().await;
        tracing::info!("GLPI Agent starting with device id {}", self.deviceid);
        for target in &self.targets {
            tracing::info!(
                "target {}: {} {}, next run {}",
                target.id(),
                target.kind().type_name(),
                target.kind().endpoint(),
                target.formatted_next_run_date()
            );
        }
        Ok(())
    }

    /// Start, restart or stop the HTTP listener to match the configuration.
    pub async fn load_http_interface(&mut self) {
        if self.config.no_httpd {
            if let Some(httpd) = self.httpd.take() {
                httpd.stop().await;
            }
            return;
        }

        let settings = ListenerSettings::from_config(&self.config);
        if self.httpd.as_ref().is_some_and(|h| *h.settings() == settings) {
            return;
        }
        if let Some(httpd) = self.httpd.take() {
            httpd.stop().await;
        }
        match HttpListener::start(settings, self.commands(), self.status()).await {
            Ok(httpd) => self.httpd = Some(httpd),
            Err(e) => tracing::error!("HTTP: {}", e),
        }
    }

    /// Reload the configuration file and refresh targets.
    fn reload_config(&mut self) {
        let mut config = (*self.config).clone();
        if let Err(e) = config.reload() {
            tracing::error!("Failed to reload configuration: {}", e);
            self.last_config_load = Utc::now().timestamp();
            return;
        }
        self.config = Arc::new(config);
        self.last_config_load = Utc::now().timestamp();
        self.load_targets();
    }

    pub async fn reload_conf_if_needed(&mut self) {
        let interval = self.config.conf_reload_interval as i64;
        if interval > 0 && Utc::now().timestamp() - self.last_config_load > interval {
            tracing::debug!("Reloading configuration");
            self.reload_config();
            self.load_http_interface().await;
        }
    }

    /// Reload configuration without touching running tasks.
    pub async fn reinit(&mut self) {
        tracing::info!("GLPI Agent reinitialization");
        if let Some(pidfile) = &self.pidfile {
            if let Err(e) = pidfile.touch() {
                tracing::warn!("can't touch PID file {}: {}", pidfile.path().display(), e);
            }
        }
        self.reload_config();
        self.load_http_interface().await;
        self.run_optimization = true;
        tracing::info!("GLPI Agent reinitialized");
    }

    /// Plan every target now.
    pub fn run_now(&mut self) {
        self.runnow = true;
    }

    pub fn terminating(&self) -> bool {
        self.terminate
    }

    /// Loop until terminated or out of targets, then clean up.
    pub async fn run(&mut self) {
        while self.run_once().await {}
        self.terminate().await;
    }

    /// One loop iteration. Returns false when the loop must stop.
    pub async fn run_once(&mut self) -> bool {
        if self.terminate {
            return false;
        }

        if std::mem::take(&mut self.runnow) {
            for target in &mut self.targets {
                target.set_next_run_date_from_now(0);
            }
        }

        self.reload_conf_if_needed().await;
        if self.targets.is_empty() {
            return false;
        }

        if self.run_queue.is_empty() {
            self.run_queue = self.targets.iter().map(|t| t.id().to_string()).collect();
        }
        let Some(id) = self.run_queue.pop_front() else {
            return false;
        };

        if let Some(idx) = self.targets.iter().position(|t| t.id() == id) {
            self.service_target(idx).await;
        }
        if self.terminate {
            return false;
        }

        if self.targets.len() <= 1 {
            self.optimize();
        }

        self.sleep().await;
        !self.terminate
    }

    async fn service_target(&mut self, idx: usize) {
        if self.targets[idx].paused() {
            self.targets[idx].set_responses(None);
            return;
        }

        if let Some(event) = self.targets[idx].next_event().cloned() {
            self.targets[idx].del_event(&event);
            if event.is(EventKind::Job) {
                tracing::debug!("target {}: dropping {}", self.targets[idx].id(), event);
                return;
            }
            self.handle_event(idx, event).await;
            return;
        }

        if self.targets[idx].next_run_date() <= Utc::now().timestamp() {
            match self.run_target(idx).await {
                Ok(()) => self.targets[idx].reset_next_run_date(),
                Err(e) if e.is_network() => {
                    tracing::error!("target {}: {}", self.targets[idx].id(), e);
                    self.targets[idx].set_next_run_date_from_now(NETWORK_ERROR_DELAY);
                }
                Err(e) => {
                    tracing::error!("target {}: {}", self.targets[idx].id(), e);
                    self.targets[idx].reset_next_run_date();
                }
            }
            tracing::debug!(
                "target {}: next run {}",
                self.targets[idx].id(),
                self.targets[idx].formatted_next_run_date()
            );
        }
    }

    async fn handle_event(&mut self, idx: usize, event: Event) {
        let target = &self.targets[idx];
        if event.is(EventKind::TaskRun) && target.is_glpi_server() && target.responses().is_none() {
            if let Err(e) = self.contact(idx).await {
                tracing::error!(
                    "target {}: Failed to handle run event for {}: {}",
                    self.targets[idx].id(),
                    event.task(),
                    e
                );
                return;
            }
        }

        self.run_target_event(idx, &event);

        if event.is(EventKind::TaskRun) && is_true(event.get("reschedule")) {
            let target = &mut self.targets[idx];
            target.reset_next_run_date();
            target.set_responses(None);
            tracing::debug!("target {}: rescheduled to {}", target.id(), target.formatted_next_run_date());
        }
    }

    /// Dispatch one event for a target.
    pub fn run_target_event(&mut self, idx: usize, event: &Event) {
        let task = TaskKind::from_name(event.task());
        let id = self.targets[idx].id().to_string();
        if !event.is(EventKind::RunNow) {
            tracing::debug!("target {}: {} event for {} task", id, event.name(), task.module());
        }

        match event.kind() {
            Some(EventKind::Init) => {}
            Some(EventKind::RunNow) => self.targets[idx].trigger_run_tasks_now(event),
            _ => {
                let target = &self.targets[idx];
                let response = if target.task_server(&task.name()) == "glpi" {
                    target.responses().cloned()
                } else {
                    None
                };
                self.run_task(idx, &task.name(), Some(event.clone()), response);
            }
        }
    }

    /// CONTACT the server of a target and remember its answer.
    async fn contact(&mut self, idx: usize) -> Result<Contact, ClientError> {
        let target = &self.targets[idx];
        let TargetKind::Server { url } = target.kind() else {
            return Err(ClientError::Invalid("not a server target".to_string()));
        };

        let request = ContactRequest {
            deviceid: self.deviceid.clone(),
            installed_tasks: installed_tasks(),
            enabled_tasks: target.planned_tasks().to_vec(),
            httpd_port: (!self.config.no_httpd).then_some(self.config.httpd_port),
            tag: self.config.tag.clone(),
        };
        let contact = self.client.contact(url, &request).await?;

        let target = &mut self.targets[idx];
        target.set_next_run_on_expiration(contact.expiration());
        for (task, entry) in &contact.tasks {
            target.set_task_server(task, entry.server.as_deref().unwrap_or("glpi"));
        }
        target.set_responses(Some(contact.clone()));
        Ok(contact)
    }

    /// Full run of a target: contact the server if needed, then start every
    /// planned task.
    pub async fn run_target(&mut self, idx: usize) -> Result<(), ClientError> {
        let target = &self.targets[idx];
        tracing::info!(
            "target {}: {} {}",
            target.id(),
            target.kind().type_name(),
            target.kind().endpoint()
        );

        let mut tasks = target.planned_tasks().to_vec();
        if target.is_type("server") {
            if !target.is_glpi_server() {
                return Err(ClientError::Invalid("only GLPI servers are supported".to_string()));
            }
            let contact = self.contact(idx).await?;
            tasks.retain(|t| contact.task(t).is_some());
            if tasks.is_empty() {
                tracing::info!("target {}: no task requested by the server", self.targets[idx].id());
            }
        }

        for task in tasks {
            if self.terminate || self.targets[idx].paused() {
                break;
            }
            let target = &self.targets[idx];
            let response = if target.task_server(&task) == "glpi" {
                target.responses().cloned()
            } else {
                None
            };
            self.run_task(idx, &task, None, response);
        }
        Ok(())
    }

    /// Spawn a worker for one task.
    pub fn run_task(&mut self, idx: usize, task: &str, event: Option<Event>, response: Option<Contact>) {
        let target = &self.targets[idx];
        let Some(children) = &self.children else {
            tracing::error!("target {}: can't start {} task, agent is terminating", target.id(), task);
            return;
        };
        if children.values().any(|c| c.target_id == target.id() && c.name == task) {
            tracing::debug!("target {}: {} task is already running", target.id(), task);
            return;
        }

        let ctx = TaskContext {
            task: TaskKind::from_name(task),
            target_id: target.id().to_string(),
            target_kind: target.kind().clone(),
            deviceid: self.deviceid.clone(),
            config: self.config.clone(),
            event,
            response,
            cache: self.caches.get(task).cloned(),
            client: self.client.clone(),
        };
        let child = ChildTask {
            name: task.to_string(),
            target_id: target.id().to_string(),
            handle: tokio::spawn(run_worker(ctx, self.messages_tx.clone())),
        };

        self.next_child_id += 1;
        if let Some(children) = &mut self.children {
            children.insert(self.next_child_id, child);
        }
        self.update_status();
    }

    /// Handle a worker message. Returns false when it can't be parsed.
    pub fn events_cb(&mut self, message: &str) -> bool {
        match TaskMessage::parse(message) {
            Some(TaskMessage::AgentCache { task, cache }) => {
                tracing::trace!("{} task cache updated", task);
                self.caches.insert(task, cache);
                true
            }
            Some(TaskMessage::TaskEvent { task, event }) => {
                let event = Event::from_message(&event);
                if event.name().is_empty() {
                    tracing::debug!("Ignoring unnamed event from {} task", task);
                    return false;
                }
                for target in &mut self.targets {
                    if event.target().is_empty() || event.target() == target.id() {
                        target.add_event(event.clone(), false);
                    }
                }
                true
            }
            None => false,
        }
    }

    fn handle_command(&mut self, command: DaemonCommand) -> Option<DaemonCommand> {
        match command {
            DaemonCommand::RunNow => {
                tracing::info!("Run now requested");
                self.run_now();
            }
            DaemonCommand::Terminate => self.terminate = true,
            DaemonCommand::Event(event) => {
                if !event.httpd_triggerable() {
                    tracing::warn!("Refusing {} from HTTP request", event);
                    return None;
                }
                for target in &mut self.targets {
                    if event.target().is_empty() || event.target() == target.id() {
                        target.add_event(event.clone(), false);
                    }
                }
            }
            // Needs the async context of the caller
            DaemonCommand::Reinit => return Some(DaemonCommand::Reinit),
        }
        None
    }

    async fn dispatch(&mut self, wake: Wake) {
        match wake {
            Wake::Timeout => {}
            Wake::Command(command) => {
                if let Some(DaemonCommand::Reinit) = self.handle_command(command) {
                    self.reinit().await;
                }
            }
            Wake::Message(message) => {
                if !self.events_cb(&message) {
                    tracing::debug!("Dropping malformed task message");
                }
            }
        }
    }

    /// Wait for the sleep interval or the next command or message, then
    /// drain both channels and reap finished workers.
    pub async fn sleep(&mut self) {
        let wake = tokio::select! {
            _ = tokio::time::sleep(self.sleep_interval) => Wake::Timeout,
            Some(command) = self.commands_rx.recv() => Wake::Command(command),
            Some(message) = self.messages_rx.recv() => Wake::Message(message),
        };
        self.dispatch(wake).await;

        while let Ok(message) = self.messages_rx.try_recv() {
            self.dispatch(Wake::Message(message)).await;
        }
        while let Ok(command) = self.commands_rx.try_recv() {
            self.dispatch(Wake::Command(command)).await;
        }

        self.reap_children();
    }

    pub fn reap_children(&mut self) {
        let Some(children) = &mut self.children else {
            return;
        };
        children.retain(|_, child| {
            let finished = child.handle.is_finished();
            if finished {
                tracing::debug!("target {}: {} worker done", child.target_id, child.name);
            }
            !finished
        });
        self.update_status();
    }

    fn update_status(&self) {
        let running: Vec<&str> = self
            .children
            .iter()
            .flat_map(|children| children.values().map(|c| c.name.as_str()))
            .collect();
        let status = if running.is_empty() {
            "waiting".to_string()
        } else {
            format!("running task {}", running.join(", "))
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Idle-service hook: releases spare map capacity once per reinit. It is
    /// the place for further memory trimming of a long-running agent.
    fn optimize(&mut self) {
        if !self.run_optimization {
            return;
        }
        self.run_optimization = false;
        self.caches.shrink_to_fit();
        if let Some(children) = &mut self.children {
            children.shrink_to_fit();
        }
        tracing::debug!("Idle service optimization done");
    }

    /// Stop workers and the listener, remove the PID file.
    pub async fn terminate(&mut self) {
        self.terminate = true;
        if let Some(children) = self.children.take() {
            for child in children.into_values() {
                if !child.handle.is_finished() {
                    tracing::debug!("target {}: stopping {} task", child.target_id, child.name);
                    child.handle.abort();
                }
            }
        }
        if let Some(httpd) = self.httpd.take() {
            httpd.stop().await;
        }
        if let Some(pidfile) = self.pidfile.take() {
            pidfile.remove();
        }
        self.status.send_replace("terminated".to_string());
        tracing::info!("GLPI Agent exiting");
    }
}

/// Forward process signals to the daemon: USR1 runs now, HUP reinits,
/// TERM and INT terminate.
#[cfg(unix)]
pub fn forward_signals(commands: UnboundedSender<DaemonCommand>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                _ = usr1.recv() => DaemonCommand::RunNow,
                _ = hup.recv() => DaemonCommand::Reinit,
                _ = term.recv() => DaemonCommand::Terminate,
                _ = int.recv() => DaemonCommand::Terminate,
            };
            let stop = matches!(command, DaemonCommand::Terminate);
            if commands.send(command).is_err() || stop {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::{NamedTempFile, TempDir};

    struct Fixture {
        _db: NamedTempFile,
        dir: TempDir,
        daemon: Daemon,
    }

    fn fixture(configure: impl FnOnce(&mut AgentConfig, &Path)) -> Fixture {
        let db = NamedTempFile::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig {
            no_httpd: true,
            vardir: dir.path().join("var"),
            ..Default::default()
        };
        configure(&mut config, dir.path());
        let store = Store::new(db.path()).unwrap();
        let daemon = Daemon::new(config, store)
            .unwrap()
            .with_sleep_interval(Duration::from_millis(20));
        Fixture { _db: db, dir, daemon }
    }

    fn walk_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("device.walk");
        std::fs::write(&path, "SNMPv2-MIB::sysDescr.0 = STRING: \"Lab printer\"\n").unwrap();
        path
    }

    async fn wait_for_workers(daemon: &mut Daemon) {
        for _ in 0..250 {
            daemon.sleep().await;
            if daemon.running_tasks() == 0 {
                return;
            }
        }
        panic!("workers did not finish");
    }

    #[test]
    fn test_planned_tasks() {
        let mut config = AgentConfig::default();
        assert_eq!(planned_tasks(&config).len(), KNOWN_TASKS.len());
        config.tasks = vec!["netdiscovery".into(), "inventory".into()];
        config.no_task = vec!["inventory".into()];
        assert_eq!(planned_tasks(&config), vec!["netdiscovery".to_string()]);
    }

    #[tokio::test]
    async fn test_targets_from_config() {
        let f = fixture(|config, dir| {
            config.server = vec!["https://glpi.example.com/".into()];
            config.local = vec![dir.join("out")];
        });
        let ids: Vec<&str> = f.daemon.targets().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["server0", "local0"]);
        assert_eq!(f.daemon.targets()[0].planned_tasks().len(), KNOWN_TASKS.len());
        assert_eq!(f.daemon.targets()[1].planned_tasks().len(), 3);
        assert!(f.daemon.targets()[0].next_run_date() > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_no_target_stops_loop() {
        let mut f = fixture(|_, _| {});
        assert!(!f.daemon.run_once().await);
    }

    #[tokio::test]
    async fn test_due_target_runs_and_is_rescheduled() {
        let mut f = fixture(|config, dir| {
            config.local = vec![dir.join("out")];
            config.tasks = vec!["netdiscovery".into()];
            config.netdiscovery_range = vec!["192.0.2.10-192.0.2.11".into()];
            config.netdiscovery_walk = Some(walk_file(dir));
        });

        f.daemon.run_now();
        assert!(f.daemon.run_once().await);
        wait_for_workers(&mut f.daemon).await;

        let target = &f.daemon.targets()[0];
        assert!(target.next_run_date() > Utc::now().timestamp());
        assert_eq!(f.daemon.cache("netdiscovery").unwrap()["jobs"][0]["devices"], 2);

        let results: Vec<_> = std::fs::read_dir(f.dir.path().join("out")).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(*f.daemon.status().borrow(), "waiting");
    }

    #[tokio::test]
    async fn test_unreachable_server_backs_off() {
        let mut f = fixture(|config, _| {
            config.server = vec!["http://127.0.0.1:9/".into()];
            config.timeout = 5;
        });

        f.daemon.run_now();
        assert!(f.daemon.run_once().await);

        let now = Utc::now().timestamp();
        let next = f.daemon.targets()[0].next_run_date();
        assert!((now + 55..=now + 65).contains(&next), "next run {} for now {}", next, now);
        assert!(f.daemon.targets()[0].responses().is_none());
        assert_eq!(f.daemon.running_tasks(), 0);

        // The loop keeps servicing the target afterwards
        assert!(f.daemon.run_once().await);
    }

    #[tokio::test]
    async fn test_optimization_runs_once_per_reinit() {
        let mut f = fixture(|config, dir| {
            config.local = vec![dir.join("out")];
        });
        assert!(f.daemon.run_optimization);

        assert!(f.daemon.run_once().await);
        assert!(!f.daemon.run_optimization);

        f.daemon.reinit().await;
        assert!(f.daemon.run_optimization);
    }

    #[tokio::test]
    async fn test_non_glpi_server_is_refused() {
        let mut f = fixture(|config, _| {
            config.server = vec!["http://127.0.0.1:9/".into()];
        });
        f.daemon.target_mut("server0").unwrap().set_glpi_server(false);

        let err = f.daemon.run_target(0).await.unwrap_err();
        assert!(matches!(err, ClientError::Invalid(_)));
        assert!(!err.is_network());
        assert_eq!(f.daemon.running_tasks(), 0);
    }

    #[tokio::test]
    async fn test_run_now_event_fans_out() {
        let mut f = fixture(|config, dir| {
            config.local = vec![dir.join("out")];
            config.tasks = vec!["inventory".into(), "netdiscovery".into()];
        });

        let event = Event::from_pairs([("runnow", json!(1))]);
        f.daemon.commands().send(DaemonCommand::Event(event)).unwrap();
        f.daemon.sleep().await;
        assert_eq!(f.daemon.targets()[0].events().len(), 1);

        // First iteration turns the run-now event into task runs
        assert!(f.daemon.run_once().await);
        let tasks: Vec<&str> = f.daemon.targets()[0].events().iter().map(|e| e.task()).collect();
        assert_eq!(tasks, vec!["inventory", "netdiscovery"]);

        assert!(f.daemon.run_once().await);
        assert!(f.daemon.run_once().await);
        assert!(f.daemon.targets()[0].events().is_empty());
        wait_for_workers(&mut f.daemon).await;
    }

    #[tokio::test]
    async fn test_reschedule_flag_on_task_run() {
        let mut f = fixture(|config, dir| {
            config.local = vec![dir.join("out")];
        });
        let before = f.daemon.targets()[0].next_run_date();

        let target = f.daemon.target_mut("local0").unwrap();
        target.add_event(
            Event::from_pairs([("taskrun", json!(1)), ("task", json!("deploy")), ("reschedule", json!(1))]),
            true,
        );

        assert!(f.daemon.run_once().await);
        let target = &f.daemon.targets()[0];
        assert!(target.events().is_empty());
        assert!(target.next_run_date() > Utc::now().timestamp() + 60);
        assert_ne!(target.next_run_date(), before);
        wait_for_workers(&mut f.daemon).await;
    }

    #[tokio::test]
    async fn test_events_cb() {
        let mut f = fixture(|config, dir| {
            config.local = vec![dir.join("a"), dir.join("b")];
        });

        assert!(f.daemon.events_cb("AGENTCACHE,netdiscovery,{\"last_run\":1}"));
        assert_eq!(f.daemon.cache("netdiscovery"), Some(&json!({"last_run": 1})));

        let event = Event::from_pairs([("taskrun", json!(1)), ("task", json!("netdiscovery")), ("target", json!("local1"))]);
        let message = TaskMessage::TaskEvent {
            task: "netdiscovery".into(),
            event: event.dump_for_message(),
        };
        assert!(f.daemon.events_cb(&message.encode()));
        assert!(f.daemon.targets()[0].events().is_empty());
        assert_eq!(f.daemon.targets()[1].events().len(), 1);

        assert!(!f.daemon.events_cb("TASKEVENT,netdiscovery"));
        assert!(!f.daemon.events_cb("garbage"));
    }

    #[tokio::test]
    async fn test_commands() {
        let mut f = fixture(|config, dir| {
            config.local = vec![dir.join("out")];
        });
        let commands = f.daemon.commands();

        commands.send(DaemonCommand::RunNow).unwrap();
        f.daemon.sleep().await;
        assert!(f.daemon.runnow);

        // Events not meant for HTTP are refused
        let init = Event::from_pairs([("init", json!(1)), ("task", json!("inventory"))]);
        commands.send(DaemonCommand::Event(init)).unwrap();
        f.daemon.sleep().await;
        assert!(f.daemon.targets()[0].events().is_empty());

        commands.send(DaemonCommand::Terminate).unwrap();
        tokio::time::timeout(Duration::from_secs(10), f.daemon.run()).await.unwrap();
        assert!(f.daemon.terminating());
    }

    #[tokio::test]
    async fn test_terminate_removes_pidfile_and_refuses_tasks() {
        let mut f = fixture(|config, dir| {
            config.local = vec![dir.join("out")];
            config.pidfile = Some(String::new());
        });
        f.daemon.init().await.unwrap();
        let pidfile = f.dir.path().join("var").join("glpi-agent.pid");
        assert!(pidfile.exists());

        f.daemon.terminate().await;
        assert!(!pidfile.exists());
        assert_eq!(*f.daemon.status().borrow(), "terminated");

        f.daemon.run_task(0, "netdiscovery", None, None);
        assert_eq!(f.daemon.running_tasks(), 0);
        assert!(!f.daemon.run_once().await);
    }

    #[tokio::test]
    async fn test_reinit_reloads_targets() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let conf = dir.path().join("agent.cfg");
        std::fs::write(&conf, format!("local = {}\nno-httpd = 1\n", first.display())).unwrap();

        let db = NamedTempFile::new().unwrap();
        let config = AgentConfig::load_from(Some(conf.as_path()), Vec::<(String, String)>::new()).unwrap();
        let mut daemon = Daemon::new(config, Store::new(db.path()).unwrap()).unwrap();
        assert_eq!(daemon.targets().len(), 1);
        let planned = daemon.targets()[0].next_run_date();

        std::fs::write(
            &conf,
            format!("local = {},{}\nno-httpd = 1\n", first.display(), second.display()),
        )
        .unwrap();

        daemon.reinit().await;
        let ids: Vec<&str> = daemon.targets().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["local0", "local1"]);
        assert_eq!(daemon.targets()[0].next_run_date(), planned);

        std::fs::write(&conf, format!("local = {}\nno-httpd = 1\n", second.display())).unwrap();
        daemon.reinit().await;
        assert_eq!(daemon.targets().len(), 1);
        assert!(daemon.store.get_target_state("local1").unwrap().is_none());
        assert_eq!(
            *daemon.targets()[0].kind(),
            TargetKind::Local { path: second.clone() }
        );
    }
}
