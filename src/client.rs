//! GLPI native protocol client.
//!
//! Sends CONTACT requests to a GLPI server and posts task results.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

pub const AGENT_NAME: &str = "GLPI-Agent";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client error types.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server answered HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("can't decode answer: {0}")]
    Decode(String),
    #[error("invalid answer: {0}")]
    Invalid(String),
}

impl ClientError {
    /// Whether the server could not be reached at all.
    pub fn is_network(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ClientError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ClientError::Network(e.to_string())
        }
    }
}

/// Per task entry of a CONTACT answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactTask {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub jobs: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// CONTACT answer from a GLPI server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub expiration: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, ContactTask>,
}

/// Longest expiration honored, in seconds.
pub const MAX_EXPIRATION: u64 = 365 * 86400;

impl Contact {
    /// Expiration in seconds, 0 when missing or malformed, capped to
    /// [`MAX_EXPIRATION`].
    pub fn expiration(&self) -> u64 {
        let seconds = match &self.expiration {
            Some(Value::Number(n)) => n.as_u64().map(|h| h.saturating_mul(3600)).unwrap_or(0),
            Some(Value::String(s)) => parse_expiration(s),
            _ => 0,
        };
        seconds.min(MAX_EXPIRATION)
    }

    /// A usable answer carries a status and a positive expiration.
    pub fn is_valid(&self) -> bool {
        !self.status.is_empty() && self.expiration() > 0
    }

    pub fn task(&self, name: &str) -> Option<&ContactTask> {
        self.tasks.get(name)
    }
}

/// Parse `N[smhd]` into seconds. A bare number counts hours.
pub fn parse_expiration(value: &str) -> u64 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(\d+)([smhd]?)$").unwrap());

    let Some(caps) = re.captures(value.trim()) else {
        return 0;
    };
    let count: u64 = caps[1].parse().unwrap_or(0);
    let unit = match &caps[2] {
        "s" => 1,
        "m" => 60,
        "d" => 86400,
        _ => 3600,
    };
    count.saturating_mul(unit)
}

/// Identity the agent announces in CONTACT requests.
#[derive(Debug, Clone, Default)]
pub struct ContactRequest {
    pub deviceid: String,
    pub installed_tasks: Vec<String>,
    pub enabled_tasks: Vec<String>,
    pub httpd_port: Option<u16>,
    pub tag: Option<String>,
}

impl ContactRequest {
    pub fn to_json(&self) -> Value {
        let mut message = json!({
            "action": "contact",
            "deviceid": self.deviceid,
            "name": AGENT_NAME,
            "version": AGENT_VERSION,
            "installed-tasks": self.installed_tasks,
            "enabled-tasks": self.enabled_tasks,
        });
        if let Some(port) = self.httpd_port {
            message["httpd-port"] = json!(port);
        }
        if let Some(tag) = self.tag.as_deref().filter(|t| !t.is_empty()) {
            message["tag"] = json!(tag);
        }
        message
    }
}

/// HTTP client for one agent.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
}

impl Client {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("{}-v{}", AGENT_NAME, AGENT_VERSION))
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(Self { http })
    }

    async fn post(&self, url: &str, deviceid: &str, message: &Value) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(url)
            .header("GLPI-Agent-ID", deviceid)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Send a CONTACT request and validate the answer.
    pub async fn contact(&self, url: &str, request: &ContactRequest) -> Result<Contact, ClientError> {
        let answer = self.post(url, &request.deviceid, &request.to_json()).await?;
        let contact: Contact =
            serde_json::from_value(answer).map_err(|e| ClientError::Decode(e.to_string()))?;

        if contact.status == "error" {
            return Err(ClientError::Invalid(
                contact.message.unwrap_or_else(|| "server reported an error".to_string()),
            ));
        }
        if !contact.is_valid() {
            return Err(ClientError::Invalid("missing status or expiration".to_string()));
        }
        Ok(contact)
    }

    /// Post task results as `{action, deviceid, content}`.
    pub async fn submit(&self, url: &str, deviceid: &str, action: &str, content: Value) -> Result<Value, ClientError> {
        let message = json!({
            "action": action,
            "deviceid": deviceid,
            "content": content,
        });
        self.post(url, deviceid, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    #[test]
    fn test_parse_expiration() {
        assert_eq!(parse_expiration("30s"), 30);
        assert_eq!(parse_expiration("5m"), 300);
        assert_eq!(parse_expiration("2h"), 7200);
        assert_eq!(parse_expiration("1d"), 86400);
        assert_eq!(parse_expiration("24"), 86400);
        assert_eq!(parse_expiration("1w"), 0);
        assert_eq!(parse_expiration("-3"), 0);
        assert_eq!(parse_expiration(""), 0);
    }

    #[test]
    fn test_contact_validity() {
        let contact: Contact = serde_json::from_value(json!({
            "status": "ok",
            "expiration": "12h",
            "tasks": {
                "inventory": {"server": "glpi", "version": "1.0"},
                "netdiscovery": {"server": "glpiinventory", "jobs": []}
            }
        }))
        .unwrap();
        assert!(contact.is_valid());
        assert_eq!(contact.expiration(), 43200);
        assert_eq!(contact.task("netdiscovery").and_then(|t| t.server.as_deref()), Some("glpiinventory"));

        let contact: Contact = serde_json::from_value(json!({"status": "ok", "expiration": 2})).unwrap();
        assert_eq!(contact.expiration(), 7200);

        let contact: Contact = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert!(!contact.is_valid());
    }

    #[test]
    fn test_oversized_expiration_is_capped() {
        let contact: Contact =
            serde_json::from_value(json!({"status": "ok", "expiration": 10_000_000_000_000_000u64})).unwrap();
        assert_eq!(contact.expiration(), MAX_EXPIRATION);
        assert!(contact.is_valid());

        let contact: Contact = serde_json::from_value(json!({"status": "ok", "expiration": "106751991167300d"})).unwrap();
        assert_eq!(contact.expiration(), MAX_EXPIRATION);
        assert_eq!(parse_expiration("99999999999999999999"), 0);
    }

    #[test]
    fn test_contact_request_message() {
        let request = ContactRequest {
            deviceid: "host-2024-01-01-00-00-00".into(),
            installed_tasks: vec!["netdiscovery".into()],
            enabled_tasks: vec!["netdiscovery".into()],
            httpd_port: Some(62354),
            tag: Some(String::new()),
        };
        let message = request.to_json();
        assert_eq!(message["action"], "contact");
        assert_eq!(message["httpd-port"], 62354);
        assert!(message.get("tag").is_none());
    }

    #[test]
    fn test_error_classes() {
        assert!(ClientError::Network("refused".into()).is_network());
        assert!(!ClientError::Invalid("bad".into()).is_network());
        assert!(!ClientError::Http { status: 500, message: String::new() }.is_network());
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_contact_round_trip() {
        let app = Router::new().route(
            "/",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["action"], "contact");
                Json(json!({"status": "ok", "expiration": "1h", "tasks": {"netdiscovery": {"server": "glpi"}}}))
            }),
        );
        let url = serve(app).await;

        let client = Client::new(Duration::from_secs(5)).unwrap();
        let request = ContactRequest {
            deviceid: "test".into(),
            ..Default::default()
        };
        let contact = client.contact(&url, &request).await.unwrap();
        assert_eq!(contact.expiration(), 3600);
        assert!(contact.task("netdiscovery").is_some());
    }

    #[tokio::test]
    async fn test_contact_invalid_answer() {
        let app = Router::new().route("/", post(|| async { Json(json!({"status": "error", "message": "unknown agent"})) }));
        let url = serve(app).await;

        let client = Client::new(Duration::from_secs(5)).unwrap();
        let err = client.contact(&url, &ContactRequest::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::Invalid(ref m) if m == "unknown agent"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let client = Client::new(Duration::from_secs(2)).unwrap();
        let err = client.contact(&url, &ContactRequest::default()).await.unwrap_err();
        assert!(err.is_network());
    }
}
