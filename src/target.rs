//! Targets: where results go and when tasks run.
//!
//! A target is either a GLPI server or a local directory. It owns its run
//! schedule, a queue of pending events and the last server answer.

use chrono::{Local, TimeZone, Utc};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::client::Contact;
use crate::db::{Store, TargetState};
use crate::event::{Event, EventKind};

/// Maximum number of queued events per target.
pub const MAX_EVENTS: usize = 1024;

/// Seconds before an event with the same name is accepted again.
const EVENT_FLOOD_DELAY: i64 = 15;

/// Tasks a local target can run.
const LOCAL_TASKS: &[&str] = &["inventory", "remoteinventory", "netdiscovery"];

/// `timeref + seconds`, saturating at the end of time.
fn seconds_after(timeref: i64, seconds: u64) -> i64 {
    timeref.saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX))
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetKind {
    Server { url: String },
    Local { path: PathBuf },
}

impl TargetKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            TargetKind::Server { .. } => "server",
            TargetKind::Local { .. } => "local",
        }
    }

    /// URL or path identifying the destination.
    pub fn endpoint(&self) -> String {
        match self {
            TargetKind::Server { url } => url.clone(),
            TargetKind::Local { path } => path.display().to_string(),
        }
    }
}

/// Construction parameters.
#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub max_delay: u64,
    /// Upper bound for error backoff
    pub err_max_delay: u64,
    /// Random delay applied before the first run
    pub initial_delay: Option<u64>,
    pub planned_tasks: Vec<String>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            max_delay: 3600,
            err_max_delay: 3600,
            initial_delay: None,
            planned_tasks: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Target {
    id: String,
    kind: TargetKind,
    max_delay: u64,
    err_max_delay: u64,
    initial_delay: Option<u64>,
    next_run_date: i64,
    base_run_date: i64,
    next_run_delay: u64,
    expiration: Option<u64>,
    paused: bool,
    events: Vec<Event>,
    next_event: HashMap<String, i64>,
    responses: Option<Contact>,
    planned_tasks: Vec<String>,
    task_servers: HashMap<String, String>,
    is_glpi_server: bool,
    store: Option<Store>,
}

impl Target {
    pub fn new(id: &str, kind: TargetKind, options: TargetOptions, store: Option<Store>) -> Self {
        let is_server = matches!(kind, TargetKind::Server { .. });
        let mut target = Self {
            id: id.to_string(),
            kind,
            max_delay: options.max_delay.max(1),
            err_max_delay: options.err_max_delay.max(1),
            initial_delay: options.initial_delay.filter(|d| *d > 0),
            next_run_date: 0,
            base_run_date: 0,
            next_run_delay: 0,
            expiration: None,
            paused: false,
            events: Vec::new(),
            next_event: HashMap::new(),
            responses: None,
            planned_tasks: Vec::new(),
            task_servers: HashMap::new(),
            is_glpi_server: is_server,
            store,
        };
        target.set_planned_tasks(options.planned_tasks);

        let configured_max_delay = target.max_delay;
        target.load_state();
        if !is_server {
            target.max_delay = configured_max_delay;
        }

        let now = now();
        let last_expected = now - target.max_delay as i64;
        if target.initial_delay.is_some() && target.next_run_date != 0 && target.next_run_date >= last_expected {
            target.initial_delay = None;
        }
        if target.base_run_date == 0 || target.base_run_date <= last_expected {
            target.base_run_date = now + target.initial_delay.unwrap_or(target.max_delay) as i64;
        }
        if target.next_run_date == 0 || target.next_run_date < last_expected {
            target.next_run_date = target.compute_next_run_date(now);
        }
        target.save_state();

        let run = if is_server { "server contact" } else { "tasks run" };
        tracing::debug!("target {}: next {} planned {}", target.id, run, target.formatted_next_run_date());
        target.initial_delay = None;

        target
    }

    fn load_state(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.get_target_state(&self.id) {
            Ok(Some(state)) if state.endpoint == self.kind.endpoint() => {
                self.max_delay = state.max_delay.max(1);
                self.next_run_date = state.next_run_date;
                self.base_run_date = state.base_run_date;
                self.is_glpi_server = state.is_glpi_server;
            }
            Ok(_) => {}
            Err(e) => tracing::error!("target {}: can't load state: {}", self.id, e),
        }
    }

    fn save_state(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let state = TargetState {
            id: self.id.clone(),
            target_type: self.kind.type_name().to_string(),
            endpoint: self.kind.endpoint(),
            max_delay: self.max_delay,
            next_run_date: self.next_run_date,
            base_run_date: self.base_run_date,
            is_glpi_server: self.is_glpi_server,
            updated_at: None,
        };
        if let Err(e) = store.save_target_state(&state) {
            tracing::error!("target {}: can't save state: {}", self.id, e);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    pub fn is_type(&self, type_name: &str) -> bool {
        self.kind.type_name() == type_name
    }

    pub fn is_glpi_server(&self) -> bool {
        self.is_type("server") && self.is_glpi_server
    }

    pub fn set_glpi_server(&mut self, value: bool) {
        self.is_glpi_server = value;
        self.save_state();
    }

    pub fn max_delay(&self) -> u64 {
        self.max_delay
    }

    pub fn set_max_delay(&mut self, max_delay: u64) {
        self.max_delay = max_delay.max(1);
        self.save_state();
    }

    pub fn next_run_date(&self) -> i64 {
        self.next_run_date
    }

    pub fn base_run_date(&self) -> i64 {
        self.base_run_date
    }

    /// Plan the next run `delay` seconds from now.
    ///
    /// Consecutive calls with a delay double the previous one, bounded by the
    /// max delay and the error max delay.
    pub fn set_next_run_date_from_now(&mut self, delay: u64) {
        let mut delay = delay;
        if delay > 0 {
            if self.next_run_delay > 0 {
                delay = self.next_run_delay.saturating_mul(2);
            }
            delay = delay.min(self.max_delay).min(self.err_max_delay);
            self.next_run_delay = delay;
        }
        self.next_run_date = seconds_after(now(), delay);
        self.base_run_date = self.next_run_date;
        self.save_state();
        self.initial_delay = None;
    }

    /// Plan the next run from the server expiration. The following
    /// [`Target::reset_next_run_date`] keeps that date.
    pub fn set_next_run_on_expiration(&mut self, expiration: u64) {
        self.next_run_date = seconds_after(now(), expiration);
        self.base_run_date = self.next_run_date;
        self.save_state();
        self.expiration = Some(expiration);
    }

    /// Schedule the next regular run.
    pub fn reset_next_run_date(&mut self) {
        if self.expiration.take().is_some() {
            return;
        }

        let now = now();
        let max_delay = self.max_delay as i64;
        let mut timeref = if self.base_run_date != 0 { self.base_run_date } else { now };
        if timeref < now - max_delay || timeref > now + max_delay {
            timeref = now;
        }

        self.next_run_delay = 0;
        self.next_run_date = self.compute_next_run_date(timeref);
        self.base_run_date = timeref + max_delay;
        self.save_state();
    }

    /// Randomized run date after `timeref`.
    pub fn compute_next_run_date(&mut self, timeref: i64) -> i64 {
        let mut rng = rand::thread_rng();

        if let Some(initial) = self.initial_delay.take() {
            let reduction = (rng.gen::<f64>() * initial as f64 / 2.0) as i64;
            return timeref + initial as i64 - reduction;
        }

        let max_random_delay = if self.max_delay < 21600 {
            self.max_delay as f64 / 6.0
        } else if self.max_delay > 86400 {
            self.max_delay as f64 / 24.0
        } else {
            3600.0
        };
        timeref + self.max_delay as i64 - (rng.gen::<f64>() * max_random_delay) as i64
    }

    pub fn formatted_next_run_date(&self) -> String {
        if self.next_run_date > 1 {
            if let Some(date) = Local.timestamp_opt(self.next_run_date, 0).single() {
                return date.format("%a %b %e %H:%M:%S %Y").to_string();
            }
        }
        "now".to_string()
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn responses(&self) -> Option<&Contact> {
        self.responses.as_ref()
    }

    pub fn set_responses(&mut self, responses: Option<Contact>) {
        self.responses = responses;
    }

    pub fn planned_tasks(&self) -> &[String] {
        &self.planned_tasks
    }

    pub fn set_planned_tasks(&mut self, tasks: Vec<String>) {
        let tasks = tasks.into_iter().map(|t| t.to_lowercase());
        self.planned_tasks = match self.kind {
            TargetKind::Local { .. } => tasks.filter(|t| LOCAL_TASKS.contains(&t.as_str())).collect(),
            TargetKind::Server { .. } => tasks.collect(),
        };
    }

    /// Server handling a task, `glpi` unless the server said otherwise.
    pub fn task_server(&self, task: &str) -> &str {
        self.task_servers.get(task).map(String::as_str).unwrap_or("glpi")
    }

    pub fn set_task_server(&mut self, task: &str, server: &str) {
        self.task_servers.insert(task.to_string(), server.to_string());
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// First queued event if its run date is reached.
    pub fn next_event(&self) -> Option<&Event> {
        self.next_event_at(now())
    }

    fn next_event_at(&self, now: i64) -> Option<&Event> {
        self.events.first().filter(|e| now >= e.rundate())
    }

    /// Queue an event. Returns false when the event is refused.
    ///
    /// Unless `safe` is set, an event name is only accepted once every 15 seconds.
    pub fn add_event(&mut self, mut event: Event, safe: bool) -> bool {
        if event.name().is_empty() {
            return false;
        }

        match event.kind() {
            Some(EventKind::RunNow) | Some(EventKind::TaskRun) => {
                if event.task().is_empty() {
                    tracing::debug!("target {}: Not supported {} event without task", self.id, event.name());
                    return false;
                }
                let plural = if event.task() == "all" || event.task().contains(',') { "s" } else { "" };
                tracing::debug!(
                    "target {}: Adding {} event for {} task{}",
                    self.id,
                    event.name(),
                    event.task(),
                    plural
                );
            }
            Some(EventKind::Partial) => {
                if event.category().is_empty() {
                    tracing::debug!(
                        "target {}: Not supported partial inventory request without selected category",
                        self.id
                    );
                    return false;
                }
                tracing::debug!("target {}: Partial inventory event on category: {}", self.id, event.category());
                self.events.retain(|e| !e.is(EventKind::Partial));
            }
            Some(EventKind::Maintenance) => {
                if event.task().is_empty() {
                    tracing::debug!("target {}: Not supported maintenance request without selected task", self.id);
                    return false;
                }
                let before = self.events.len();
                self.events.retain(|e| {
                    !(e.is(EventKind::Maintenance) && e.task() == event.task() && e.target() == event.target())
                });
                let action = if self.events.len() < before { "Replacing" } else { "New" };
                tracing::debug!("target {}: {} {} event on {} task", self.id, action, event.name(), event.task());
            }
            Some(EventKind::Job) => {
                tracing::debug!(
                    "target {}: Adding {} job event as {} task",
                    self.id,
                    event.name(),
                    event.task()
                );
            }
            _ => {
                tracing::debug!("target {}: Not supported event request: {}", self.id, event.dump_as_string());
                return false;
            }
        }

        if self.events.len() >= MAX_EVENTS {
            tracing::debug!("target {}: Event requests overflow, skipping new event", self.id);
            return false;
        }

        let now = now();
        if !safe {
            if let Some(next) = self.next_event.get(event.name()) {
                if now < *next {
                    tracing::debug!("target {}: Skipping too early new {} event", self.id, event.name());
                    return false;
                }
            }
            self.next_event.insert(event.name().to_string(), now + EVENT_FLOOD_DELAY);
        }

        if !event.is(EventKind::Job) {
            event.set_rundate(seconds_after(now, event.delay()));
            if event.delay() > 0 {
                tracing::trace!("target {}: Event scheduled in {} seconds", self.id, event.delay());
            }
        }

        // Stable sort keeps insertion order between equal run dates
        self.events.push(event);
        self.events.sort_by_key(|e| e.rundate());
        true
    }

    /// Remove queued events matching `event`.
    ///
    /// Init, maintenance and task run events only match on the same task.
    pub fn del_event(&mut self, event: &Event) {
        if event.name().is_empty() {
            return;
        }
        self.next_event.remove(event.name());

        let match_task = event.is(EventKind::Init) || event.is(EventKind::Maintenance) || event.is(EventKind::TaskRun);
        self.events
            .retain(|e| !(e.name() == event.name() && (!match_task || e.task() == event.task())));
    }

    /// Turn a run-now event into one task run event per requested planned task.
    pub fn trigger_run_tasks_now(&mut self, event: &Event) {
        if !event.is(EventKind::RunNow) || self.planned_tasks.is_empty() {
            return;
        }

        let all = event.task() == "all";
        let tasks: Vec<String> = if all {
            self.planned_tasks.clone()
        } else {
            event.task().split(',').map(|t| t.trim().to_lowercase()).collect()
        };
        let mut reschedule_index = if all { tasks.len() } else { 0 };

        for task in tasks {
            reschedule_index = reschedule_index.saturating_sub(1);
            if !self.planned_tasks.contains(&task) {
                continue;
            }

            let mut params: Vec<(&str, Value)> = vec![
                ("taskrun", Value::from("yes")),
                ("task", Value::from(task.clone())),
                ("delay", Value::from(0)),
            ];
            if all && reschedule_index == 0 {
                params.push(("reschedule", Value::from("1")));
            }
            if task == "inventory" {
                if let Some(full) = event.get("full") {
                    params.push(("full", full.clone()));
                } else if let Some(partial) = event.get("partial") {
                    params.push(("partial", partial.clone()));
                } else {
                    params.push(("full", Value::from("1")));
                }
            }

            self.add_event(Event::from_pairs(params), true);
        }

        self.responses = None;
    }
}
