use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wsstomp_proto::{
    AckMode, CloseReason, ConnectOptions, Delivery, FrameTransport, ProtocolError, StompClient,
    WsStream,
};

/// Parameters shared by every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub destination: String,
    pub ack_mode: AckMode,
    pub connect: ConnectOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Subscribed,
    Receiving,
    Closed,
}

/// Teardown steps, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Unsubscribe,
    Disconnect,
    CloseTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Subscribe,
    Receive,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport read failed: {0}")]
    TransportRead(ProtocolError),

    #[error("transport write failed: {0}")]
    TransportWrite(ProtocolError),

    #[error("STOMP connect failed: {0}")]
    ProtocolConnect(ProtocolError),

    #[error("STOMP subscribe failed: {0}")]
    ProtocolSubscribe(ProtocolError),

    #[error("message delivery failed: {0}")]
    MessageDelivery(ProtocolError),
}

impl SessionError {
    fn classify(phase: Phase, err: ProtocolError) -> Self {
        match err {
            ProtocolError::Write(_) => SessionError::TransportWrite(err),
            _ if err.is_transport() => SessionError::TransportRead(err),
            _ => match phase {
                Phase::Connect => SessionError::ProtocolConnect(err),
                Phase::Subscribe => SessionError::ProtocolSubscribe(err),
                Phase::Receive => SessionError::MessageDelivery(err),
            },
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub struct SessionReport {
    pub conn_id: String,
    pub final_state: SessionState,
    /// `None` when the session was stopped
    pub failure: Option<SessionError>,
    pub teardown: Vec<TeardownStep>,
    pub delivered: u64,
}

/// Drives one STOMP session over one WebSocket connection
pub struct Session<T> {
    conn_id: String,
    transport: WsStream<T>,
    settings: Arc<SessionSettings>,
    state: watch::Sender<SessionState>,
    sink: Option<mpsc::Sender<Delivery>>,
    stop: CancellationToken,
}

impl<T: FrameTransport> Session<T> {
    pub fn new(
        conn_id: String,
        transport: WsStream<T>,
        settings: Arc<SessionSettings>,
        stop: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            conn_id,
            transport,
            settings,
            state,
            sink: None,
            stop,
        }
    }

    /// Forwards every delivery to `sink` in addition to logging it
    pub fn with_sink(mut self, sink: mpsc::Sender<Delivery>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Runs connect, subscribe and the receive loop, then tears down in
    /// order: unsubscribe, disconnect, close. Each step reachable from the
    /// point of failure is attempted once, whatever the previous step did.
    pub async fn run(self) -> SessionReport {
        let Session {
            conn_id,
            mut transport,
            settings,
            state,
            sink,
            stop,
        } = self;

        let mut teardown = Vec::new();
        let mut delivered = 0;

        state.send_replace(SessionState::Connecting);

        let connected = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            result = StompClient::connect(&mut transport, settings.connect.clone()) => Some(result),
        };

        let failure = match connected {
            None => {
                info!("Session {}: stopped while connecting", conn_id);
                None
            }
            Some(Err(e)) => {
                let err = SessionError::classify(Phase::Connect, e);
                error!("Session {}: {}", conn_id, err);
                Some(err)
            }
            Some(Ok(mut client)) => {
                state.send_replace(SessionState::Connected);
                info!("Session {}: STOMP connection established", conn_id);

                let subscribed = tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    result = client.subscribe(&settings.destination, settings.ack_mode) => Some(result),
                };

                let outcome = match subscribed {
                    None => {
                        info!("Session {}: stopped while subscribing", conn_id);
                        None
                    }
                    Some(Err(e)) => {
                        let err = SessionError::classify(Phase::Subscribe, e);
                        error!("Session {}: {}", conn_id, err);
                        Some(err)
                    }
                    Some(Ok(sub_id)) => {
                        state.send_replace(SessionState::Subscribed);
                        info!(
                            "Session {}: subscribed to {} ({})",
                            conn_id, settings.destination, settings.ack_mode
                        );

                        state.send_replace(SessionState::Receiving);
                        let outcome =
                            receive_loop(&conn_id, &mut client, sink.as_ref(), &stop, &mut delivered)
                                .await;

                        teardown.push(TeardownStep::Unsubscribe);
                        if let Err(e) = client.unsubscribe(&sub_id).await {
                            warn!("Session {}: unsubscribe failed: {}", conn_id, e);
                        }
                        outcome
                    }
                };

                teardown.push(TeardownStep::Disconnect);
                if let Err(e) = client.disconnect().await {
                    warn!("Session {}: disconnect failed: {}", conn_id, e);
                }
                outcome
            }
        };

        teardown.push(TeardownStep::CloseTransport);
        transport.close(CloseReason::Abnormal).await;
        state.send_replace(SessionState::Closed);

        debug!("Session {} teardown: {:?}", conn_id, teardown);

        SessionReport {
            conn_id,
            final_state: SessionState::Closed,
            failure,
            teardown,
            delivered,
        }
    }
}

async fn receive_loop<S>(
    conn_id: &str,
    client: &mut StompClient<S>,
    sink: Option<&mpsc::Sender<Delivery>>,
    stop: &CancellationToken,
    delivered: &mut u64,
) -> Option<SessionError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                info!("Session {}: stopped", conn_id);
                return None;
            }
            next = client.next_message() => next,
        };

        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                let err = SessionError::classify(Phase::Receive, e);
                error!("Session {}: error receiving message: {}", conn_id, err);
                return Some(err);
            }
        };

        info!(
            "Session {}: received message {} from {}: {}",
            conn_id,
            delivery.message_id,
            delivery.destination,
            delivery.body_text()
        );
        *delivered += 1;

        if let Some(sink) = sink {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!("Session {}: stopped while forwarding {}", conn_id, delivery.message_id);
                    // Not processed; hand it back to the broker.
                    if let Err(e) = client.nack(&delivery).await {
                        warn!("Session {}: failed to reject {}: {}", conn_id, delivery.message_id, e);
                    }
                    return None;
                }
                sent = sink.send(delivery.clone()) => {
                    if sent.is_err() {
                        debug!("Session {}: delivery sink closed, dropping message", conn_id);
                    }
                }
            }
        }

        if let Err(e) = client.ack(&delivery).await {
            let err = SessionError::classify(Phase::Receive, e);
            error!("Session {}: failed to acknowledge {}: {}", conn_id, delivery.message_id, err);
            return Some(err);
        }
    }
}
