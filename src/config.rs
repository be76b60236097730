//! Agent configuration.
//!
//! Values come from built-in defaults, then the configuration file, then
//! `GLPI_AGENT_*` environment variables.

use ::config::{Config, Environment, File, FileFormat, Source, Value};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ENV_PREFIX: &str = "GLPI_AGENT";
const DEFAULT_CONF_FILE: &str = "etc/agent.cfg";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file {0} does not exist")]
    Missing(PathBuf),
    #[error("can't load configuration: {0}")]
    Source(#[from] ::config::ConfigError),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
    #[error("no target defined, use server or local")]
    NoTarget,
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// GLPI server URLs
    pub server: Vec<String>,
    /// Directories receiving local results
    pub local: Vec<PathBuf>,
    /// Tasks to plan, in order. Empty means every known task.
    pub tasks: Vec<String>,
    pub no_task: Vec<String>,
    /// Maximum initial delay before the first run, in seconds
    pub delaytime: u64,
    /// Seconds between configuration reloads, 0 disables
    pub conf_reload_interval: u64,
    pub no_httpd: bool,
    pub httpd_ip: Option<String>,
    pub httpd_port: u16,
    /// IPs or IPv4 CIDR blocks allowed to trigger runs over HTTP
    pub httpd_trust: Vec<String>,
    pub vardir: PathBuf,
    /// `None` means no PID file, an empty string means the default path
    pub pidfile: Option<String>,
    /// HTTP client timeout, in seconds
    pub timeout: u64,
    pub tag: Option<String>,
    pub debug: u8,
    pub netdiscovery_range: Vec<String>,
    pub netdiscovery_community: Vec<String>,
    pub netdiscovery_threads: u64,
    pub netdiscovery_timeout: u64,
    pub netdiscovery_port: Vec<String>,
    pub netdiscovery_domain: Vec<String>,
    pub netdiscovery_walk: Option<PathBuf>,
    /// File the configuration was read from
    pub source: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: Vec::new(),
            local: Vec::new(),
            tasks: Vec::new(),
            no_task: Vec::new(),
            delaytime: 3600,
            conf_reload_interval: 0,
            no_httpd: false,
            httpd_ip: None,
            httpd_port: 62354,
            httpd_trust: Vec::new(),
            vardir: PathBuf::from("var"),
            pidfile: None,
            timeout: 180,
            tag: None,
            debug: 0,
            netdiscovery_range: Vec::new(),
            netdiscovery_community: Vec::new(),
            netdiscovery_threads: 1,
            netdiscovery_timeout: 1,
            netdiscovery_port: Vec::new(),
            netdiscovery_domain: Vec::new(),
            netdiscovery_walk: None,
            source: None,
        }
    }
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "yes" | "true" | "on")
}

/// Scalar configuration value as text, without a trailing ` # comment`.
fn value_string(value: Value) -> Option<String> {
    let value = value.into_string().ok()?;
    let value = match value.find(" #") {
        Some(pos) => &value[..pos],
        None => &value,
    };
    Some(value.trim().to_string())
}

impl AgentConfig {
    /// Load configuration from the default file location and environment.
    ///
    /// Environment variables:
    /// - `GLPI_AGENT_CONF_FILE`: configuration file (default: "etc/agent.cfg" when present)
    /// - `GLPI_AGENT_<KEY>`: any key, upper case with `_` for `-`
    pub fn load() -> Result<Self, ConfigError> {
        let file = match env::var("GLPI_AGENT_CONF_FILE") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_CONF_FILE)).filter(|p| p.exists()),
        };
        Self::load_from(file.as_deref(), env::vars())
    }

    /// Load from an explicit file and set of environment variables.
    pub fn load_from<I>(file: Option<&Path>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut builder = Config::builder();
        if let Some(path) = file {
            if !path.is_file() {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Ini));
        }
        let vars: HashMap<String, String> = vars.into_iter().collect();
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).source(Some(vars)));

        let mut cfg = Self::default();
        for (key, value) in builder.build()?.collect()? {
            // Environment keys arrive as `no_httpd`, file keys as `no-httpd`
            let key = key.to_ascii_lowercase().replace('_', "-");
            if key == "conf-file" {
                continue;
            }
            match value_string(value) {
                Some(value) => cfg.set(&key, &value)?,
                None => tracing::warn!("Config: ignoring section or list {}", key),
            }
        }
        cfg.source = file.map(Path::to_path_buf);

        cfg.finalize();
        Ok(cfg)
    }

    /// Re-read the same sources.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        let file = self.source.clone();
        *self = Self::load_from(file.as_deref(), env::vars())?;
        Ok(())
    }

    /// Set one option by its configuration key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        };
        let number = |v: &str| v.trim().parse::<u64>().map_err(|_| invalid());

        match key {
            "server" => self.server = list(value),
            "local" => self.local = list(value).into_iter().map(PathBuf::from).collect(),
            "tasks" => self.tasks = list(value).into_iter().map(|t| t.to_lowercase()).collect(),
            "no-task" => self.no_task = list(value).into_iter().map(|t| t.to_lowercase()).collect(),
            "delaytime" => self.delaytime = number(value)?,
            "conf-reload-interval" => self.conf_reload_interval = number(value)?,
            "no-httpd" => self.no_httpd = flag(value),
            "httpd-ip" => self.httpd_ip = Some(value.trim().to_string()).filter(|v| !v.is_empty()),
            "httpd-port" => {
                self.httpd_port = value.trim().parse::<u16>().ok().filter(|p| *p > 0).ok_or_else(invalid)?
            }
            "httpd-trust" => self.httpd_trust = list(value),
            "vardir" => self.vardir = PathBuf::from(value.trim()),
            "pidfile" => self.pidfile = Some(value.trim().to_string()),
            "timeout" => self.timeout = number(value)?,
            "tag" => self.tag = Some(value.to_string()).filter(|v| !v.is_empty()),
            "debug" => self.debug = number(value)?.min(2) as u8,
            "netdiscovery-range" => self.netdiscovery_range = list(value),
            "netdiscovery-community" => self.netdiscovery_community = list(value),
            "netdiscovery-threads" => self.netdiscovery_threads = number(value)?.max(1),
            "netdiscovery-timeout" => self.netdiscovery_timeout = number(value)?.max(1),
            "netdiscovery-port" => self.netdiscovery_port = list(value),
            "netdiscovery-domain" => self.netdiscovery_domain = list(value),
            "netdiscovery-walk" => {
                self.netdiscovery_walk = Some(PathBuf::from(value.trim())).filter(|p| !p.as_os_str().is_empty())
            }
            other => tracing::warn!("Config: unknown configuration directive {}", other),
        }
        Ok(())
    }

    fn finalize(&mut self) {
        if self.conf_reload_interval != 0 && self.conf_reload_interval < 60 {
            self.conf_reload_interval = 60;
        }
    }

    /// Whether `task` is planned by this configuration.
    pub fn task_enabled(&self, task: &str) -> bool {
        (self.tasks.is_empty() || self.tasks.iter().any(|t| t == task)) && !self.no_task.iter().any(|t| t == task)
    }

    /// Default log filter for the configured debug level.
    pub fn log_directive(&self) -> &'static str {
        match self.debug {
            0 => "glpi_agent=info",
            1 => "glpi_agent=debug",
            _ => "glpi_agent=trace",
        }
    }

    /// PID file path, if any.
    pub fn pidfile_path(&self) -> Option<PathBuf> {
        match self.pidfile.as_deref() {
            None => None,
            Some("") => Some(self.vardir.join("glpi-agent.pid")),
            Some(path) => Some(PathBuf::from(path)),
        }
    }
}
