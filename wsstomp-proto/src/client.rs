use crate::codec::{StompCodec, StompItem, DEFAULT_MAX_FRAME_SIZE};
use crate::frame::{header, AckMode, Command, Frame};
use crate::heartbeat::{HeartBeat, Negotiated};
use crate::{ProtocolError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Value of the CONNECT `host` header
    pub host: String,
    pub heartbeat: HeartBeat,
    /// Slack allowed on top of the negotiated inbound interval
    pub heartbeat_grace: Duration,
    /// How long SUBSCRIBE and DISCONNECT wait for their RECEIPT
    pub receipt_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "/".to_string(),
            heartbeat: HeartBeat::symmetric(Duration::from_secs(10)),
            heartbeat_grace: Duration::from_secs(5),
            receipt_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
    pub ack: AckMode,
}

/// A MESSAGE frame delivered to one of our subscriptions
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: String,
    pub destination: String,
    pub message_id: String,
    pub ack_mode: AckMode,
    /// Value to put in the ACK frame's `id` header
    pub ack_id: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Client side of a STOMP session over any byte stream
pub struct StompClient<S> {
    framed: Framed<S, StompCodec>,
    heartbeat: Negotiated,
    heartbeat_grace: Duration,
    receipt_timeout: Duration,
    send_tick: Option<Interval>,
    last_inbound: Instant,
    subscriptions: HashMap<String, Subscription>,
    backlog: VecDeque<Frame>,
    next_id: u64,
    healthy: bool,
    session: Option<String>,
}

impl<S> StompClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends CONNECT and waits for CONNECTED
    pub async fn connect(stream: S, options: ConnectOptions) -> Result<Self> {
        let mut framed = Framed::new(stream, StompCodec::new(options.max_frame_size));

        framed
            .send(StompItem::Frame(Frame::connect(&options.host, options.heartbeat)))
            .await
            .map_err(write_error)?;
        debug!("Sent CONNECT to {}", options.host);

        let reply = loop {
            match framed.next().await {
                Some(Ok(StompItem::Heartbeat)) => continue,
                Some(Ok(StompItem::Frame(frame))) => break frame,
                Some(Err(e)) => return Err(e),
                None => return Err(ProtocolError::ConnectionClosed),
            }
        };

        match reply.command {
            Command::Connected => {}
            Command::Error => return Err(ProtocolError::ConnectRejected(reply.error_message())),
            other => return Err(ProtocolError::UnexpectedFrame(other.to_string())),
        }

        let remote = reply
            .header(header::HEART_BEAT)
            .map(HeartBeat::parse)
            .transpose()?
            .unwrap_or_default();
        let heartbeat = options.heartbeat.negotiate(&remote);

        let send_tick = heartbeat.send_every.map(|period| {
            let mut tick = time::interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        let session = reply.header(header::SESSION).map(str::to_string);
        info!(
            "STOMP connected (version: {}, session: {}, heartbeat: {:?})",
            reply.header(header::VERSION).unwrap_or("1.0"),
            session.as_deref().unwrap_or("-"),
            heartbeat
        );

        Ok(Self {
            framed,
            heartbeat,
            heartbeat_grace: options.heartbeat_grace,
            receipt_timeout: options.receipt_timeout,
            send_tick,
            last_inbound: Instant::now(),
            subscriptions: HashMap::new(),
            backlog: VecDeque::new(),
            next_id: 0,
            healthy: true,
            session,
        })
    }

    pub fn heartbeat(&self) -> Negotiated {
        self.heartbeat
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Subscribes to `destination` and waits for the broker's receipt.
    /// Returns the subscription id.
    pub async fn subscribe(&mut self, destination: &str, ack: AckMode) -> Result<String> {
        let id = self.allocate_id("sub");
        let receipt = self.allocate_id("rcpt");

        self.send(Frame::subscribe(&id, destination, ack).with_header(header::RECEIPT, receipt.as_str()))
            .await?;
        self.wait_for_receipt(&receipt).await?;

        debug!("Subscribed {} to {} (ack: {})", id, destination, ack);
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                destination: destination.to_string(),
                ack,
            },
        );

        Ok(id)
    }

    pub async fn unsubscribe(&mut self, id: &str) -> Result<()> {
        if self.subscriptions.remove(id).is_none() {
            return Err(ProtocolError::UnknownSubscription(id.to_string()));
        }

        self.send(Frame::unsubscribe(id)).await?;
        debug!("Unsubscribed {}", id);

        Ok(())
    }

    /// Waits for the next MESSAGE on a live subscription
    pub async fn next_message(&mut self) -> Result<Delivery> {
        loop {
            let frame = match self.backlog.pop_front() {
                Some(frame) => frame,
                None => self.next_frame().await?,
            };

            match frame.command {
                Command::Message => {
                    if let Some(delivery) = self.to_delivery(frame) {
                        return Ok(delivery);
                    }
                }
                Command::Receipt => {
                    trace!("Ignoring receipt {:?}", frame.header(header::RECEIPT_ID));
                }
                Command::Error => {
                    self.healthy = false;
                    return Err(ProtocolError::BrokerError(frame.error_message()));
                }
                other => warn!("Ignoring unexpected {} frame", other),
            }
        }
    }

    /// Acknowledges a delivery. Nothing is sent for automatic acknowledgement.
    pub async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        if !delivery.ack_mode.requires_ack() {
            return Ok(());
        }
        self.send(Frame::ack(&delivery.ack_id)).await
    }

    pub async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        if !delivery.ack_mode.requires_ack() {
            return Ok(());
        }
        self.send(Frame::nack(&delivery.ack_id)).await
    }

    /// Sends DISCONNECT (when the stream is still usable), waits for the
    /// receipt, then shuts the stream down. The shutdown always happens.
    pub async fn disconnect(mut self) -> Result<()> {
        let outcome = if self.healthy {
            let receipt = self.allocate_id("disconnect");
            match self.send(Frame::disconnect(&receipt)).await {
                Ok(()) => self.wait_for_receipt(&receipt).await,
                Err(e) => Err(e),
            }
        } else {
            debug!("Skipping DISCONNECT on a failed connection");
            Ok(())
        };

        let mut stream = self.framed.into_inner();
        if let Err(e) = stream.shutdown().await {
            debug!("Stream shutdown failed: {}", e);
        }

        outcome
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        let result = self
            .framed
            .send(StompItem::Frame(frame))
            .await
            .map_err(write_error);
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    /// Reads the next frame, sending and checking heartbeats while waiting
    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            let deadline = self
                .heartbeat
                .expect_every
                .map(|period| self.last_inbound + period + self.heartbeat_grace);

            tokio::select! {
                item = self.framed.next() => {
                    self.last_inbound = Instant::now();
                    match item {
                        Some(Ok(StompItem::Heartbeat)) => trace!("Received heartbeat"),
                        Some(Ok(StompItem::Frame(frame))) => return Ok(frame),
                        Some(Err(e)) => {
                            self.healthy = false;
                            return Err(e);
                        }
                        None => {
                            self.healthy = false;
                            return Err(ProtocolError::ConnectionClosed);
                        }
                    }
                }
                _ = tick(&mut self.send_tick) => {
                    trace!("Sending heartbeat");
                    if let Err(e) = self.framed.send(StompItem::Heartbeat).await {
                        self.healthy = false;
                        return Err(write_error(e));
                    }
                }
                _ = sleep_until(deadline) => {
                    self.healthy = false;
                    let waited = self.last_inbound.elapsed();
                    warn!("No data from broker for {:?}", waited);
                    return Err(ProtocolError::HeartbeatTimeout(waited));
                }
            }
        }
    }

    async fn wait_for_receipt(&mut self, receipt: &str) -> Result<()> {
        let deadline = Instant::now() + self.receipt_timeout;

        loop {
            let frame = match time::timeout_at(deadline, self.next_frame()).await {
                Ok(frame) => frame?,
                Err(_) => return Err(ProtocolError::ReceiptTimeout(receipt.to_string())),
            };

            match frame.command {
                Command::Receipt if frame.header(header::RECEIPT_ID) == Some(receipt) => {
                    return Ok(())
                }
                Command::Receipt => debug!("Ignoring receipt {:?}", frame.header(header::RECEIPT_ID)),
                Command::Message => self.backlog.push_back(frame),
                Command::Error => {
                    self.healthy = false;
                    return Err(ProtocolError::BrokerError(frame.error_message()));
                }
                other => warn!("Ignoring unexpected {} frame", other),
            }
        }
    }

    fn to_delivery(&self, frame: Frame) -> Option<Delivery> {
        let Some(subscription) = frame
            .header(header::SUBSCRIPTION)
            .and_then(|id| self.subscriptions.get(id))
        else {
            warn!(
                "Dropping message for unknown subscription {:?}",
                frame.header(header::SUBSCRIPTION)
            );
            return None;
        };

        let message_id = frame.header(header::MESSAGE_ID).unwrap_or_default().to_string();
        let ack_id = frame
            .header(header::ACK)
            .map(str::to_string)
            .unwrap_or_else(|| message_id.clone());

        Some(Delivery {
            subscription: subscription.id.clone(),
            destination: frame
                .header(header::DESTINATION)
                .unwrap_or(&subscription.destination)
                .to_string(),
            message_id,
            ack_mode: subscription.ack,
            ack_id,
            headers: frame.headers,
            body: frame.body,
            received_at: Utc::now(),
        })
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        let id = format!("{}-{}", prefix, self.next_id);
        self.next_id += 1;
        id
    }
}

fn write_error(e: ProtocolError) -> ProtocolError {
    match e {
        ProtocolError::Io(e) => ProtocolError::Write(e),
        other => other,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
