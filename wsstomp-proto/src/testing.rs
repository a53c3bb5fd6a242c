//! In-memory transports for exercising the adapter and the STOMP engines
//! without sockets.

use crate::transport::WsStream;
use futures::{Sink, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

pub type MemoryStream = WsStream<WebSocketStream<DuplexStream>>;

/// Two ends of a real WebSocket connection over an in-memory pipe.
/// The first element plays the server role, the second the client role.
pub async fn in_memory_pair(max_buf_size: usize) -> (MemoryStream, MemoryStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
    (WsStream::new(server), WsStream::new(client))
}

/// Message transport backed by channels. Whatever the peer pushes is
/// received; whatever is sent can be inspected through the peer.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Result<Message, WsError>>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// The scripted side of a [`ChannelTransport`]. Dropping it severs the
/// connection.
pub struct ChannelPeer {
    inbound: mpsc::UnboundedSender<Result<Message, WsError>>,
    outbound: mpsc::UnboundedReceiver<Message>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                inbound: in_rx,
                outbound: out_tx,
            },
            ChannelPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

impl Stream for ChannelTransport {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<Message> for ChannelTransport {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.outbound
            .send(item)
            .map_err(|_| WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl ChannelPeer {
    pub fn push(&self, message: Message) {
        let _ = self.inbound.send(Ok(message));
    }

    pub fn fail(&self, error: WsError) {
        let _ = self.inbound.send(Err(error));
    }

    pub async fn next_sent(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<Message> {
        self.outbound.try_recv().ok()
    }
}
