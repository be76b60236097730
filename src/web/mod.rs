//! Embedded HTTP listener.
//!
//! Serves the agent status and lets trusted peers request an immediate run.

mod handlers;

pub use handlers::*;

use crate::config::AgentConfig;
use crate::daemon::DaemonCommand;

use axum::{routing::get, Router};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc::UnboundedSender, oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Listener error types.
#[derive(Error, Debug)]
pub enum WebError {
    #[error("invalid listening address: {0}")]
    Address(String),
    #[error("can't listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub commands: UnboundedSender<DaemonCommand>,
    pub status: watch::Receiver<String>,
    pub trust: Arc<Vec<String>>,
}

/// Settings that require a restart when they change.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSettings {
    pub ip: Option<String>,
    pub port: u16,
    pub trust: Vec<String>,
}

impl ListenerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            ip: config.httpd_ip.clone(),
            port: config.httpd_port,
            trust: config.httpd_trust.clone(),
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr, WebError> {
        let ip = match self.ip.as_deref() {
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Some(ip) => ip.parse().map_err(|_| WebError::Address(ip.to_string()))?,
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/", get(handlers::handle_index))
        .route("/status", get(handlers::handle_status))
        .route("/now", get(handlers::handle_now))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running listener.
pub struct HttpListener {
    settings: ListenerSettings,
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl HttpListener {
    pub async fn start(
        settings: ListenerSettings,
        commands: UnboundedSender<DaemonCommand>,
        status: watch::Receiver<String>,
    ) -> Result<Self, WebError> {
        let addr = settings.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| WebError::Bind { addr, source })?;
        let addr = listener.local_addr().map_err(|source| WebError::Bind { addr, source })?;

        let router = routes(AppState {
            commands,
            status,
            trust: Arc::new(settings.trust.clone()),
        });
        let (shutdown, stop) = oneshot::channel::<()>();

        tracing::info!("HTTP: listening on {}", addr);
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = stop.await;
                });
            if let Err(e) = server.await {
                tracing::error!("HTTP: listener failed: {}", e);
            }
        });

        Ok(Self {
            settings,
            addr,
            shutdown,
            handle,
        })
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::error!("HTTP: listener task failed: {}", e);
        }
        tracing::info!("HTTP: listener on {} stopped", self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn settings(trust: &[&str]) -> ListenerSettings {
        ListenerSettings {
            ip: Some("127.0.0.1".into()),
            port: 0,
            trust: trust.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_status_and_now() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_status_tx, status) = watch::channel("waiting".to_string());
        let listener = HttpListener::start(settings(&[]), tx, status).await.unwrap();
        let base = format!("http://{}", listener.local_addr());

        let body = reqwest::get(format!("{}/status", base)).await.unwrap().text().await.unwrap();
        assert_eq!(body, "status: waiting");

        let index = reqwest::get(format!("{}/", base)).await.unwrap().text().await.unwrap();
        assert!(index.contains("The current status is waiting"));
        assert!(index.contains("/now"));

        let response = reqwest::get(format!("{}/now", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(matches!(rx.recv().await, Some(DaemonCommand::RunNow)));

        let response = reqwest::get(format!("{}/now?task=netdiscovery", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        match rx.recv().await {
            Some(DaemonCommand::Event(event)) => {
                assert_eq!(event.name(), "run now");
                assert_eq!(event.task(), "netdiscovery");
            }
            other => panic!("unexpected command {:?}", other),
        }

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_status_tx, status) = watch::channel(String::new());
        let mut bad = settings(&[]);
        bad.ip = Some("not-an-ip".into());
        assert!(matches!(
            HttpListener::start(bad, tx, status).await,
            Err(WebError::Address(_))
        ));
    }
}
