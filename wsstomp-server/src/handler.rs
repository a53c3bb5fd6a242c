use crate::session::{Session, SessionReport, SessionSettings};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use wsstomp_proto::ids::generate_id;
use wsstomp_proto::{Delivery, WsStream};

/// Upgrades inbound connections and runs one session per connection
pub struct ConnectionHandler {
    settings: Arc<SessionSettings>,
    path: String,
    sink: Option<mpsc::Sender<Delivery>>,
}

impl ConnectionHandler {
    pub fn new(settings: SessionSettings, path: String) -> Self {
        Self {
            settings: Arc::new(settings),
            path,
            sink: None,
        }
    }

    /// Forwards deliveries from every session to `sink`
    pub fn with_sink(mut self, sink: mpsc::Sender<Delivery>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Handles a client connection
    pub async fn handle(
        &self,
        stream: TcpStream,
        remote_addr: String,
        stop: CancellationToken,
    ) -> Option<SessionReport> {
        let conn_id = generate_id();
        info!("Connection {} from {}", conn_id, remote_addr);

        let path = self.path.as_str();
        let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() == path {
                return Ok(response);
            }
            warn!("Rejecting upgrade for {} from {}", request.uri().path(), remote_addr);
            let mut reject = ErrorResponse::new(Some("not found".to_string()));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            Err(reject)
        };

        let upgrade = tokio::select! {
            _ = stop.cancelled() => {
                info!("Connection {} dropped before upgrade: shutting down", conn_id);
                return None;
            }
            upgrade = tokio_tungstenite::accept_hdr_async(stream, check_path) => upgrade,
        };

        let ws = match upgrade {
            Ok(ws) => ws,
            Err(e) => {
                error!("Failed to upgrade connection {} to WebSocket: {}", conn_id, e);
                return None;
            }
        };

        info!("WebSocket connection {} established", conn_id);

        let mut session = Session::new(conn_id.clone(), WsStream::new(ws), self.settings.clone(), stop);
        if let Some(sink) = &self.sink {
            session = session.with_sink(sink.clone());
        }

        let report = session.run().await;
        match &report.failure {
            Some(e) => info!(
                "Connection {} closed after {} messages: {}",
                conn_id, report.delivered, e
            ),
            None => info!("Connection {} closed after {} messages", conn_id, report.delivered),
        }

        Some(report)
    }
}

/// Accepts connections until `shutdown` fires, then waits for every session
/// to finish its teardown.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    max_conns: Option<usize>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let tracker = TaskTracker::new();
    let limit = max_conns.map(|n| Arc::new(Semaphore::new(n)));

    loop {
        // Acquire connection slot
        let permit = match &limit {
            Some(limit) => tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limit.clone().acquire_owned() => Some(permit?),
            },
            None => None,
        };

        // Accept connection
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let handler = handler.clone();
        let stop = shutdown.child_token();

        // Spawn connection handler
        tracker.spawn(async move {
            handler.handle(stream, remote_addr.to_string(), stop).await;
            drop(permit); // Release connection slot
        });
    }

    tracker.close();
    info!("Stopped accepting; waiting for {} sessions", tracker.len());
    tracker.wait().await;

    Ok(())
}
