//! HTTP request handlers.

use super::AppState;
use crate::client::{AGENT_NAME, AGENT_VERSION};
use crate::daemon::DaemonCommand;
use crate::event::{Event, EventParams};

use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const INDEX_TEMPLATE: &str = r#"<html>
<head><title>{{name}}</title></head>
<body>
<h1>{{name}}</h1>
<p>This is {{name}} {{version}}<br/>
The current status is {{status}}</p>
{{actions}}
</body>
</html>
"#;

const FORCE_LINK: &str = r#"<p><a href="/now">Force an Inventory</a></p>"#;

/// Whether `peer` may trigger runs: loopback, or listed in `trust` as an
/// address or an IPv4 CIDR block.
pub fn is_trusted(peer: IpAddr, trust: &[String]) -> bool {
    let peer = match peer {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    if peer.is_loopback() {
        return true;
    }

    trust.iter().any(|entry| {
        let entry = entry.trim();
        if let Ok(addr) = entry.parse::<IpAddr>() {
            return addr == peer;
        }
        let (Some((network, prefix)), IpAddr::V4(peer)) = (entry.split_once('/'), peer) else {
            return false;
        };
        match (network.parse::<Ipv4Addr>(), prefix.parse::<u32>()) {
            (Ok(network), Ok(prefix)) if prefix <= 32 => {
                let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
                u32::from(network) & mask == u32::from(peer) & mask
            }
            _ => false,
        }
    })
}

pub async fn handle_index(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    let actions = if is_trusted(peer.ip(), &state.trust) { FORCE_LINK } else { "" };

    let page = INDEX_TEMPLATE
        .replace("{{name}}", AGENT_NAME)
        .replace("{{version}}", AGENT_VERSION)
        .replace("{{status}}", &status)
        .replace("{{actions}}", actions);

    Html(page)
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    format!("status: {}", status)
}

/// Request an immediate run. Query parameters become run-now event
/// parameters; without any, every target is planned now.
pub async fn handle_now(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_trusted(peer.ip(), &state.trust) {
        tracing::debug!("HTTP: /now request from {} refused", peer.ip());
        return (StatusCode::FORBIDDEN, "Access denied").into_response();
    }

    let command = if query.is_empty() {
        DaemonCommand::RunNow
    } else {
        let mut params: EventParams = query.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
        params.insert("runnow".to_string(), Value::from(1));
        DaemonCommand::Event(Event::new(&params))
    };

    tracing::info!("HTTP: run requested by {}", peer.ip());
    if state.commands.send(command).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Agent is stopping").into_response();
    }
    (StatusCode::OK, "Done.").into_response()
}
