//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schedule state of a target, kept across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub id: String,
    /// "server" or "local"
    pub target_type: String,
    /// Server URL or local path the state belongs to
    pub endpoint: String,
    pub max_delay: u64,
    pub next_run_date: i64,
    pub base_run_date: i64,
    pub is_glpi_server: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            id: String::new(),
            target_type: "server".to_string(),
            endpoint: String::new(),
            max_delay: 3600,
            next_run_date: 0,
            base_run_date: 0,
            is_glpi_server: false,
            updated_at: None,
        }
    }
}
