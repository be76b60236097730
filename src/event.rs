//! Scheduling events.
//!
//! An event tells a target why and when a task should run. Events are built
//! from a loose parameter map, either locally (signal, HTTP request, target
//! schedule) or from a message sent back by a task worker.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Parameter map used to build events and carried by them.
pub type EventParams = BTreeMap<String, Value>;

/// Why a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Service startup.
    Init,
    /// Immediate run requested by signal or HTTP.
    RunNow,
    /// Run of a single planned task.
    TaskRun,
    /// Partial inventory request.
    Partial,
    /// Internal maintenance.
    Maintenance,
    /// Toolbox managed job.
    Job,
}

impl EventKind {
    fn flag(&self) -> &'static str {
        match self {
            EventKind::Init => "init",
            EventKind::RunNow => "runnow",
            EventKind::TaskRun => "taskrun",
            EventKind::Partial => "partial",
            EventKind::Maintenance => "maintenance",
            EventKind::Job => "job",
        }
    }

    const ALL: [EventKind; 6] = [
        EventKind::Init,
        EventKind::RunNow,
        EventKind::TaskRun,
        EventKind::Partial,
        EventKind::Maintenance,
        EventKind::Job,
    ];
}

/// A scheduling trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: Option<EventKind>,
    name: String,
    task: String,
    category: String,
    target: String,
    delay: u64,
    rundate: i64,
    httpd: bool,
    params: EventParams,
}

/// Accepts `true`, `1`, and the strings "yes", "1" or "true" in any case.
pub fn is_true(value: Option<&Value>) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)^(yes|1|true)$").unwrap());

    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => re.is_match(s),
        _ => false,
    }
}

/// Read a value as a string, numbers included.
pub fn value_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

/// Read a value as an integer, numeric strings included.
pub fn value_i64(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value_string(value).filter(|s| !s.is_empty())
}

impl Event {
    /// Build an event from a parameter map.
    ///
    /// Selectors are checked in the order init, runnow, taskrun, partial,
    /// maintenance, job; the first truthy one decides the kind. When none
    /// matches the event stays under-specified: no kind and an empty name.
    pub fn new(params: &EventParams) -> Self {
        let mut event = Event {
            kind: None,
            name: String::new(),
            task: String::new(),
            category: String::new(),
            target: String::new(),
            delay: 0,
            rundate: 0,
            httpd: false,
            params: EventParams::new(),
        };

        let get = |key: &str| params.get(key);
        let delay = value_i64(get("delay")).unwrap_or(0).max(0) as u64;
        let rundate = value_i64(get("rundate")).unwrap_or(0);

        if is_true(get("init")) {
            event.kind = Some(EventKind::Init);
            event.name = "init".to_string();
            event.task = value_string(get("task")).unwrap_or_default();
            event.rundate = rundate;
        } else if is_true(get("runnow")) {
            event.kind = Some(EventKind::RunNow);
            event.name = "run now".to_string();
            event.task = non_empty(get("task"))
                .or_else(|| non_empty(get("tasks")))
                .unwrap_or_else(|| "all".to_string());
            event.delay = delay;
            event.httpd = true;
            event.params = params
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "runnow" | "task" | "tasks" | "delay"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        } else if is_true(get("taskrun")) {
            event.kind = Some(EventKind::TaskRun);
            event.name = "run".to_string();
            event.task = value_string(get("task")).unwrap_or_default();
            event.delay = delay;
            event.httpd = true;
            event.params.insert(
                "reschedule".to_string(),
                get("reschedule").cloned().unwrap_or(Value::from(0)),
            );
            if event.task == "inventory" {
                let full = if params.contains_key("full") {
                    is_true(get("full"))
                } else if params.contains_key("partial") {
                    !is_true(get("partial"))
                } else {
                    true
                };
                event.params.insert("full".to_string(), Value::from(full as u8));
            }
        } else if is_true(get("partial")) {
            event.kind = Some(EventKind::Partial);
            event.name = "partial inventory".to_string();
            event.task = "inventory".to_string();
            event.category = value_string(get("category")).unwrap_or_default();
            event.httpd = true;
            event.params = params
                .iter()
                .filter(|(k, _)| k.as_str() != "partial")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        } else if is_true(get("maintenance")) {
            event.kind = Some(EventKind::Maintenance);
            event.name = non_empty(get("name")).unwrap_or_else(|| "maintenance".to_string());
            event.task = value_string(get("task")).unwrap_or_default();
            event.delay = delay;
        } else if let Some(name) = non_empty(get("name")).filter(|_| is_true(get("job"))) {
            event.kind = Some(EventKind::Job);
            event.name = name;
            event.rundate = rundate;
            event.task = non_empty(get("task")).unwrap_or_else(|| "unknown".to_string());
        }

        if let Some(target) = value_string(get("target")) {
            event.target = target;
        }

        event
    }

    /// Build an event from key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let params: EventParams = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(&params)
    }

    /// Rebuild an event from the output of [`Event::dump_for_message`].
    pub fn from_message(dump: &EventParams) -> Self {
        let get = |key: &str| dump.get(key);
        let kind = EventKind::ALL.into_iter().find(|k| is_true(get(k.flag())));

        Event {
            kind,
            name: value_string(get("name")).unwrap_or_default(),
            task: value_string(get("task")).unwrap_or_default(),
            category: value_string(get("category")).unwrap_or_default(),
            target: value_string(get("target")).unwrap_or_default(),
            delay: value_i64(get("delay")).unwrap_or(0).max(0) as u64,
            rundate: value_i64(get("rundate")).unwrap_or(0),
            httpd: is_true(get("httpd")),
            params: match get("params") {
                Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                _ => EventParams::new(),
            },
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }

    pub fn is(&self, kind: EventKind) -> bool {
        self.kind == Some(kind)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Id of the target this event is meant for, empty for any target.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    pub fn rundate(&self) -> i64 {
        self.rundate
    }

    pub fn set_rundate(&mut self, rundate: i64) -> i64 {
        self.rundate = rundate;
        self.rundate
    }

    /// Whether the embedded HTTP listener may raise this event.
    pub fn httpd_triggerable(&self) -> bool {
        self.httpd
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        if key.is_empty() {
            return None;
        }
        self.params.get(key)
    }

    /// Flatten the event for the inter-task message channel.
    pub fn dump_for_message(&self) -> EventParams {
        let mut dump = EventParams::new();
        for kind in EventKind::ALL {
            dump.insert(kind.flag().to_string(), Value::from((self.kind == Some(kind)) as u8));
        }
        dump.insert("name".to_string(), Value::from(self.name.clone()));
        dump.insert("task".to_string(), Value::from(self.task.clone()));
        dump.insert("category".to_string(), Value::from(self.category.clone()));
        dump.insert("target".to_string(), Value::from(self.target.clone()));
        dump.insert("delay".to_string(), Value::from(self.delay));
        dump.insert("rundate".to_string(), Value::from(self.rundate));
        dump.insert("httpd".to_string(), Value::from(self.httpd as u8));
        dump.insert(
            "params".to_string(),
            Value::Object(self.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        dump
    }

    /// Scalar entries of [`Event::dump_for_message`] as `k=v&k=v`.
    pub fn dump_as_string(&self) -> String {
        self.dump_for_message()
            .iter()
            .filter_map(|(k, v)| match v {
                Value::Object(_) | Value::Array(_) => None,
                Value::String(s) => Some(format!("{}={}", k, s)),
                other => Some(format!("{}={}", k, other)),
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.map(|k| k.flag()).unwrap_or("unknown");
        write!(f, "{} event (type={}, task={})", self.name, kind, self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variant_precedence() {
        let event = Event::from_pairs([("init", json!(1)), ("runnow", json!(1)), ("task", json!("inventory"))]);
        assert_eq!(event.kind(), Some(EventKind::Init));
        assert_eq!(event.name(), "init");

        let event = Event::from_pairs([("runnow", json!(1)), ("task", json!("inventory"))]);
        assert_eq!(event.kind(), Some(EventKind::RunNow));
        assert_eq!(event.task(), "inventory");
        assert_eq!(event.delay(), 0);
        assert!(event.httpd_triggerable());
    }

    #[test]
    fn test_boolean_values() {
        assert!(is_true(Some(&json!("YES"))));
        assert!(is_true(Some(&json!("True"))));
        assert!(is_true(Some(&json!("1"))));
        assert!(is_true(Some(&json!(1))));
        assert!(is_true(Some(&json!(true))));
        assert!(!is_true(Some(&json!("no"))));
        assert!(!is_true(Some(&json!(2))));
        assert!(!is_true(Some(&json!("yes please"))));
        assert!(!is_true(None));
    }

    #[test]
    fn test_runnow_defaults_and_params() {
        let event = Event::from_pairs([("runnow", json!("yes")), ("delay", json!(30)), ("full", json!("yes"))]);
        assert_eq!(event.task(), "all");
        assert_eq!(event.delay(), 30);
        assert_eq!(event.get("full"), Some(&json!("yes")));
        assert!(event.get("runnow").is_none());
        assert!(event.get("delay").is_none());

        let event = Event::from_pairs([("runnow", json!(1)), ("tasks", json!("inventory,netdiscovery"))]);
        assert_eq!(event.task(), "inventory,netdiscovery");
    }

    #[test]
    fn test_taskrun_inventory_full_flag() {
        let event = Event::from_pairs([("taskrun", json!(1)), ("task", json!("inventory"))]);
        assert_eq!(event.get("full"), Some(&json!(1)));
        assert_eq!(event.get("reschedule"), Some(&json!(0)));

        let event = Event::from_pairs([("taskrun", json!(1)), ("task", json!("inventory")), ("partial", json!("yes"))]);
        assert_eq!(event.get("full"), Some(&json!(0)));

        let event = Event::from_pairs([
            ("taskrun", json!(1)),
            ("task", json!("netdiscovery")),
            ("reschedule", json!("1")),
        ]);
        assert!(event.get("full").is_none());
        assert!(is_true(event.get("reschedule")));
    }

    #[test]
    fn test_partial_maintenance_and_job() {
        let event = Event::from_pairs([("partial", json!("yes")), ("category", json!("hardware,network"))]);
        assert_eq!(event.kind(), Some(EventKind::Partial));
        assert_eq!(event.task(), "inventory");
        assert_eq!(event.category(), "hardware,network");

        let event = Event::from_pairs([("maintenance", json!("yes")), ("task", json!("deploy")), ("delay", json!(60))]);
        assert_eq!(event.name(), "maintenance");
        assert_eq!(event.delay(), 60);
        assert!(!event.httpd_triggerable());

        let event = Event::from_pairs([("job", json!(1)), ("name", json!("scheduled")), ("rundate", json!(1700000000))]);
        assert_eq!(event.kind(), Some(EventKind::Job));
        assert_eq!(event.task(), "unknown");
        assert_eq!(event.rundate(), 1700000000);

        // A job selector without a name matches nothing
        let event = Event::from_pairs([("job", json!(1))]);
        assert_eq!(event.kind(), None);
        assert_eq!(event.name(), "");
    }

    #[test]
    fn test_rundate_setter() {
        let mut event = Event::from_pairs([("init", json!(1)), ("task", json!("inventory"))]);
        assert_eq!(event.rundate(), 0);
        assert_eq!(event.set_rundate(42), 42);
        assert_eq!(event.rundate(), 42);
    }

    #[test]
    fn test_message_dump_rebuilds_event() {
        let event = Event::from_pairs([
            ("runnow", json!(1)),
            ("task", json!("netdiscovery")),
            ("target", json!("server0")),
            ("full", json!("yes")),
        ]);
        let rebuilt = Event::from_message(&event.dump_for_message());
        assert_eq!(rebuilt, event);
    }

    #[test]
    fn test_dump_as_string_skips_nested() {
        let event = Event::from_pairs([("maintenance", json!(1)), ("task", json!("deploy"))]);
        let dump = event.dump_as_string();
        assert!(dump.contains("maintenance=1"));
        assert!(dump.contains("task=deploy"));
        assert!(!dump.contains("params"));
    }
}
