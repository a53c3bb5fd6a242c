pub mod broker;
pub mod client;
pub mod codec;
pub mod frame;
pub mod heartbeat;
pub mod ids;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use broker::{BrokerEvent, BrokerSession};
pub use client::{ConnectOptions, Delivery, StompClient, Subscription};
pub use codec::{StompCodec, StompItem, DEFAULT_MAX_FRAME_SIZE};
pub use frame::{AckMode, Command, Frame};
pub use heartbeat::{HeartBeat, Negotiated};
pub use transport::{CloseReason, FrameTransport, WsStream};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write failed: {0}")]
    Write(std::io::Error),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Connect rejected by broker: {0}")]
    ConnectRejected(String),

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("No heartbeat received within {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("Timed out waiting for receipt {0}")]
    ReceiptTimeout(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// True when the error came from the underlying stream rather than the
    /// STOMP conversation itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::Write(_) | ProtocolError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
