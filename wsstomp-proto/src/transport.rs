//! Byte-stream view of a WebSocket connection.
//!
//! [`WsStream`] implements `AsyncRead`/`AsyncWrite` on top of anything that
//! sends and receives whole WebSocket messages, so a byte-oriented protocol
//! engine can run over it unchanged.
//!
//! Reads never span two messages: a read returns bytes from the current
//! inbound message only, and whatever did not fit in the caller's buffer is
//! kept for the next read. Every write becomes exactly one outbound message.

use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

/// A connection that exchanges whole WebSocket messages.
pub trait FrameTransport:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin
{
}

impl<T> FrameTransport for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin
{
}

/// Status sent to the peer when the adapter closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Teardown after an internal failure (1006).
    Abnormal,
    /// The protocol layer shut the stream down (1014).
    BadGateway,
}

impl CloseReason {
    pub fn code(self) -> CloseCode {
        match self {
            CloseReason::Abnormal => CloseCode::from(1006),
            CloseReason::BadGateway => CloseCode::from(1014),
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            CloseReason::Abnormal => "abnormal closure",
            CloseReason::BadGateway => "stomp session closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
}

pub struct WsStream<T> {
    inner: T,
    pending: Bytes,
    state: State,
    close_reason: CloseReason,
    read_waker: Option<Waker>,
}

impl<T: FrameTransport> WsStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            state: State::Open,
            close_reason: CloseReason::BadGateway,
            read_waker: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state != State::Open
    }

    /// Closes the connection with `reason`. Safe to call more than once and
    /// after the peer has gone; failures are logged, never returned.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.state == State::Open {
            self.close_reason = reason;
        }
        if let Err(e) = self.shutdown().await {
            debug!("WebSocket close failed: {}", e);
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn mark_closed(&mut self) {
        self.state = State::Closed;
        self.pending = Bytes::new();
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "websocket is closed")
}

impl<T: FrameTransport> AsyncRead for WsStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.state != State::Open {
                return Poll::Ready(Err(closed_error()));
            }

            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let message = match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => {
                    this.read_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                Poll::Ready(Some(Ok(message))) => message,
                Poll::Ready(Some(Err(e))) => {
                    this.mark_closed();
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                Poll::Ready(None) => {
                    this.mark_closed();
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "websocket stream ended",
                    )));
                }
            };

            match message {
                Message::Text(text) => this.pending = Bytes::copy_from_slice(text.as_bytes()),
                Message::Binary(data) => this.pending = data,
                Message::Close(frame) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    this.mark_closed();
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "websocket closed by peer",
                    )));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("Skipping control frame");
                }
            }
        }
    }
}

impl<T: FrameTransport> AsyncWrite for WsStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.state != State::Open {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "websocket is closed",
            )));
        }

        if let Err(e) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            return Poll::Ready(Err(io::Error::other(e)));
        }

        // STOMP is text; anything that is not UTF-8 goes out as binary.
        let message = match std::str::from_utf8(buf) {
            Ok(text) => Message::text(text.to_owned()),
            Err(_) => Message::binary(Bytes::copy_from_slice(buf)),
        };

        match Pin::new(&mut this.inner).start_send(message) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.state == State::Closed {
            return Poll::Ready(Err(closed_error()));
        }

        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.state == State::Open {
            if let Err(e) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
                debug!("WebSocket already unusable at close: {}", e);
                this.mark_closed();
                return Poll::Ready(Ok(()));
            }

            let frame = CloseFrame {
                code: this.close_reason.code(),
                reason: this.close_reason.text().into(),
            };
            if let Err(e) = Pin::new(&mut this.inner).start_send(Message::Close(Some(frame))) {
                debug!("Failed to send close frame: {}", e);
                this.mark_closed();
                return Poll::Ready(Ok(()));
            }

            debug!("Closing WebSocket: {:?}", this.close_reason);
            this.state = State::Closing;
            // Nothing may be read once the close frame is queued.
            if let Some(waker) = this.read_waker.take() {
                waker.wake();
            }
        }

        if this.state == State::Closing {
            if let Err(e) = ready!(Pin::new(&mut this.inner).poll_close(cx)) {
                debug!("WebSocket close handshake failed: {}", e);
            }
            this.mark_closed();
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{in_memory_pair, ChannelTransport};
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_returns_whole_frame() {
        let (transport, peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        peer.push(Message::text("CONNECTED\n\n\0"));

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"CONNECTED\n\n\0");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_served_across_reads() {
        let (transport, peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        peer.push(Message::binary(&b"0123456789"[..]));
        peer.push(Message::text("ab"));

        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0123");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"4567");

        // The tail of the first frame is not merged with the next one.
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"89");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ab");
    }

    #[tokio::test]
    async fn test_control_frames_are_skipped() {
        let (transport, peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        peer.push(Message::Ping(Bytes::from_static(b"p")));
        peer.push(Message::text("x"));

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x");
    }

    #[tokio::test]
    async fn test_write_sends_one_text_frame() {
        let (transport, mut peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        let n = stream.write(b"SEND\n\nhello\0").await.unwrap();
        assert_eq!(n, 12);

        assert_eq!(peer.next_sent().await, Some(Message::text("SEND\n\nhello\0")));
    }

    #[tokio::test]
    async fn test_non_utf8_write_goes_out_as_binary() {
        let (transport, mut peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        stream.write_all(&[0xff, 0x00]).await.unwrap();

        assert_eq!(peer.next_sent().await, Some(Message::binary(vec![0xff, 0x00])));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_carries_code() {
        let (transport, mut peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        stream.close(CloseReason::Abnormal).await;
        stream.close(CloseReason::BadGateway).await;
        assert!(stream.is_closed());

        let Some(Message::Close(Some(frame))) = peer.next_sent().await else {
            panic!("expected a close frame");
        };
        assert_eq!(u16::from(frame.code), 1006);

        // Only one close frame goes out.
        assert_eq!(peer.try_next_sent(), None);
    }

    #[tokio::test]
    async fn test_shutdown_uses_bad_gateway() {
        let (transport, mut peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        stream.shutdown().await.unwrap();

        let Some(Message::Close(Some(frame))) = peer.next_sent().await else {
            panic!("expected a close frame");
        };
        assert_eq!(u16::from(frame.code), 1014);
    }

    #[tokio::test]
    async fn test_read_and_write_fail_after_close() {
        let (transport, peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        peer.push(Message::text("late"));
        stream.close(CloseReason::Abnormal).await;

        let mut buf = [0u8; 8];
        assert!(stream.read(&mut buf).await.is_err());
        assert!(stream.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_fails_read() {
        let (transport, peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        peer.push(Message::Close(None));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(stream.is_closed());

        // Closing afterwards is still fine.
        stream.close(CloseReason::Abnormal).await;
    }

    #[tokio::test]
    async fn test_transport_error_fails_read() {
        let (transport, peer) = ChannelTransport::pair();
        let mut stream = WsStream::new(transport);

        peer.fail(WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));

        let mut buf = [0u8; 8];
        assert!(stream.read(&mut buf).await.is_err());
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (transport, _peer) = ChannelTransport::pair();
        let (mut reader, mut writer) = tokio::io::split(WsStream::new(transport));

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.shutdown().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read should unblock")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_over_real_websocket() {
        let (mut server, client) = in_memory_pair(64 * 1024).await;
        let mut client = client.into_inner();

        client.send(Message::text("ping")).await.unwrap();

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.write_all(b"pong").await.unwrap();
        server.flush().await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Message::text("pong"));

        server.close(CloseReason::Abnormal).await;
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
    }
}
