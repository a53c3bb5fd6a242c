//! Broker side of a STOMP conversation.
//!
//! Enough of a broker to answer a client: CONNECTED, receipts, MESSAGE
//! delivery to active subscriptions. It keeps no queues and persists nothing.

use crate::codec::{StompCodec, StompItem};
use crate::frame::{header, AckMode, Command, Frame};
use crate::heartbeat::{HeartBeat, Negotiated};
use crate::ids::generate_id;
use crate::{ProtocolError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// What a client frame meant to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Subscribed {
        id: String,
        destination: String,
        ack: AckMode,
    },
    Unsubscribed {
        id: String,
    },
    Acked {
        id: String,
    },
    Nacked {
        id: String,
    },
    Sent {
        destination: String,
        body: Bytes,
    },
    Disconnected,
    Other(Command),
}

pub struct BrokerSession<S> {
    framed: Framed<S, StompCodec>,
    heartbeat: Negotiated,
    subscriptions: HashMap<String, (String, AckMode)>,
    message_seq: u64,
}

impl<S> BrokerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Waits for CONNECT (or STOMP) and answers with CONNECTED
    pub async fn accept(stream: S, heartbeat: HeartBeat, max_frame_size: usize) -> Result<Self> {
        let mut framed = Framed::new(stream, StompCodec::new(max_frame_size));

        let connect = loop {
            match framed.next().await {
                Some(Ok(StompItem::Heartbeat)) => continue,
                Some(Ok(StompItem::Frame(frame))) => break frame,
                Some(Err(e)) => return Err(e),
                None => return Err(ProtocolError::ConnectionClosed),
            }
        };

        if !matches!(connect.command, Command::Connect | Command::Stomp) {
            return Err(ProtocolError::UnexpectedFrame(connect.command.to_string()));
        }

        let remote = connect
            .header(header::HEART_BEAT)
            .map(HeartBeat::parse)
            .transpose()?
            .unwrap_or_default();
        let negotiated = heartbeat.negotiate(&remote);

        let session = generate_id();
        framed
            .send(StompItem::Frame(Frame::connected(&session, heartbeat)))
            .await?;

        info!(
            "Accepted STOMP client (host: {}, session: {}, heartbeat: {:?})",
            connect.header(header::HOST).unwrap_or("-"),
            session,
            negotiated
        );

        Ok(Self {
            framed,
            heartbeat: negotiated,
            subscriptions: HashMap::new(),
            message_seq: 0,
        })
    }

    pub fn heartbeat(&self) -> Negotiated {
        self.heartbeat
    }

    /// Reads the next item. `None` is a heartbeat. Safe to cancel.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        match self.framed.next().await {
            Some(Ok(StompItem::Heartbeat)) => Ok(None),
            Some(Ok(StompItem::Frame(frame))) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Applies a client frame and sends the receipt it asked for, if any
    pub async fn handle(&mut self, frame: Frame) -> Result<BrokerEvent> {
        let event = match frame.command {
            Command::Subscribe => {
                let id = required(&frame, header::ID)?;
                let destination = required(&frame, header::DESTINATION)?;
                let ack = frame
                    .header(header::ACK)
                    .map(str::parse::<AckMode>)
                    .transpose()?
                    .unwrap_or_default();
                self.subscriptions.insert(id.clone(), (destination.clone(), ack));
                debug!("Client subscribed {} to {}", id, destination);
                BrokerEvent::Subscribed { id, destination, ack }
            }
            Command::Unsubscribe => {
                let id = required(&frame, header::ID)?;
                if self.subscriptions.remove(&id).is_none() {
                    warn!("Client unsubscribed unknown id {}", id);
                }
                BrokerEvent::Unsubscribed { id }
            }
            Command::Ack => BrokerEvent::Acked {
                id: required(&frame, header::ID)?,
            },
            Command::Nack => BrokerEvent::Nacked {
                id: required(&frame, header::ID)?,
            },
            Command::Send => BrokerEvent::Sent {
                destination: required(&frame, header::DESTINATION)?,
                body: frame.body.clone(),
            },
            Command::Disconnect => BrokerEvent::Disconnected,
            other => BrokerEvent::Other(other),
        };

        if let Some(receipt) = frame.header(header::RECEIPT) {
            self.framed
                .send(StompItem::Frame(Frame::receipt(receipt)))
                .await?;
        }

        Ok(event)
    }

    /// Waits for the next client frame and handles it
    pub async fn next_event(&mut self) -> Result<BrokerEvent> {
        loop {
            if let Some(frame) = self.recv().await? {
                return self.handle(frame).await;
            }
        }
    }

    /// Delivers `body` to one subscription. Returns the message id.
    pub async fn publish(&mut self, subscription: &str, body: impl Into<Bytes>) -> Result<String> {
        let (destination, ack) = self
            .subscriptions
            .get(subscription)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownSubscription(subscription.to_string()))?;

        self.message_seq += 1;
        let message_id = format!("msg-{}", self.message_seq);

        let mut frame = Frame::message(subscription, &message_id, &destination, body);
        if ack.requires_ack() {
            frame = frame.with_header(header::ACK, message_id.as_str());
        }
        self.framed.send(StompItem::Frame(frame)).await?;

        debug!("Published {} to {} ({})", message_id, destination, subscription);
        Ok(message_id)
    }

    /// Delivers `body` to every active subscription. Returns how many got it.
    pub async fn publish_all(&mut self, body: impl Into<Bytes>) -> Result<usize> {
        let body = body.into();
        let ids: Vec<String> = self.subscriptions.keys().cloned().collect();

        for id in &ids {
            self.publish(id, body.clone()).await?;
        }

        Ok(ids.len())
    }

    pub async fn send_error(&mut self, message: &str) -> Result<()> {
        self.framed
            .send(StompItem::Frame(Frame::error(message)))
            .await
    }

    pub async fn send_heartbeat(&mut self) -> Result<()> {
        self.framed.send(StompItem::Heartbeat).await
    }

    pub async fn close(self) {
        let mut stream = self.framed.into_inner();
        if let Err(e) = stream.shutdown().await {
            debug!("Stream shutdown failed: {}", e);
        }
    }
}

fn required(frame: &Frame, name: &str) -> Result<String> {
    frame.header(name).map(str::to_string).ok_or_else(|| {
        ProtocolError::MalformedFrame(format!("{} frame missing {} header", frame.command, name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_FRAME_SIZE;
    use crate::testing::in_memory_pair;

    #[tokio::test]
    async fn test_rejects_non_connect_opening() {
        let (client, broker_side) = in_memory_pair(64 * 1024).await;
        let mut client = Framed::new(client, StompCodec::default());

        let broker = tokio::spawn(BrokerSession::accept(
            broker_side,
            HeartBeat::disabled(),
            DEFAULT_MAX_FRAME_SIZE,
        ));
        client
            .send(StompItem::Frame(Frame::send("/queue/test", "too early")))
            .await
            .unwrap();

        let result = broker.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::UnexpectedFrame(_))));
    }

    #[tokio::test]
    async fn test_subscribe_receipt_and_publish_all() {
        let (client, broker_side) = in_memory_pair(64 * 1024).await;
        let mut client = Framed::new(client, StompCodec::default());

        let broker = tokio::spawn(async move {
            let mut broker = BrokerSession::accept(broker_side, HeartBeat::disabled(), DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            let first = broker.next_event().await.unwrap();
            let second = broker.next_event().await.unwrap();
            let delivered = broker.publish_all("fanout").await.unwrap();
            (first, second, delivered, broker)
        });

        client
            .send(StompItem::Frame(Frame::connect("/", HeartBeat::disabled())))
            .await
            .unwrap();
        client
            .send(StompItem::Frame(
                Frame::subscribe("a", "/queue/one", AckMode::Auto).with_header(header::RECEIPT, "r1"),
            ))
            .await
            .unwrap();
        client
            .send(StompItem::Frame(Frame::subscribe("b", "/topic/two", AckMode::Client)))
            .await
            .unwrap();

        let (first, second, delivered, _broker) = broker.await.unwrap();
        assert_eq!(
            first,
            BrokerEvent::Subscribed {
                id: "a".to_string(),
                destination: "/queue/one".to_string(),
                ack: AckMode::Auto,
            }
        );
        assert!(matches!(second, BrokerEvent::Subscribed { ack: AckMode::Client, .. }));
        assert_eq!(delivered, 2);

        let mut frames = Vec::new();
        while frames.len() < 4 {
            if let StompItem::Frame(frame) = client.next().await.unwrap().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames[0].command, Command::Connected);
        assert_eq!(frames[1].command, Command::Receipt);
        assert_eq!(frames[1].header(header::RECEIPT_ID), Some("r1"));

        let client_ack = frames[2..]
            .iter()
            .find(|f| f.header(header::SUBSCRIPTION) == Some("b"))
            .unwrap();
        assert_eq!(client_ack.header(header::ACK), client_ack.header(header::MESSAGE_ID));
        assert!(frames[2..].iter().all(|f| &f.body[..] == b"fanout"));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_subscription() {
        let (client, broker_side) = in_memory_pair(64 * 1024).await;
        let mut client = Framed::new(client, StompCodec::default());
        client
            .send(StompItem::Frame(Frame::connect("/", HeartBeat::disabled())))
            .await
            .unwrap();

        let mut broker = BrokerSession::accept(broker_side, HeartBeat::disabled(), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();

        let result = broker.publish("nope", "x").await;
        assert!(matches!(result, Err(ProtocolError::UnknownSubscription(_))));
    }
}
