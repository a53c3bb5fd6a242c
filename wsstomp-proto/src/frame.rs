use crate::heartbeat::HeartBeat;
use crate::ProtocolError;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Header names used by the frames this crate builds and inspects
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const VERSION: &str = "version";
    pub const HOST: &str = "host";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const DESTINATION: &str = "destination";
    pub const ID: &str = "id";
    pub const ACK: &str = "ack";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const MESSAGE: &str = "message";
    pub const CONTENT_LENGTH: &str = "content-length";
}

pub const STOMP_VERSION: &str = "1.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED carry header values verbatim; every other
    /// frame escapes `\`, CR, LF and `:`.
    pub fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "unknown command: {:?}",
                    other
                )))
            }
        };
        Ok(command)
    }
}

/// Acknowledgement mode requested when subscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Whether deliveries under this mode need an explicit ACK frame
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown ack mode: {:?}",
                other
            ))),
        }
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the first value for `name`. Repeated headers keep the first
    /// occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heart_beat: HeartBeat) -> Self {
        Self::new(Command::Connect)
            .with_header(header::ACCEPT_VERSION, STOMP_VERSION)
            .with_header(header::HOST, host)
            .with_header(header::HEART_BEAT, heart_beat.to_header())
    }

    pub fn connected(session: &str, heart_beat: HeartBeat) -> Self {
        Self::new(Command::Connected)
            .with_header(header::VERSION, STOMP_VERSION)
            .with_header(header::SESSION, session)
            .with_header(header::HEART_BEAT, heart_beat.to_header())
            .with_header(header::SERVER, concat!("wsstomp/", env!("CARGO_PKG_VERSION")))
    }

    pub fn subscribe(id: &str, destination: &str, ack: AckMode) -> Self {
        Self::new(Command::Subscribe)
            .with_header(header::ID, id)
            .with_header(header::DESTINATION, destination)
            .with_header(header::ACK, ack.as_str())
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header(header::ID, id)
    }

    pub fn ack(id: &str) -> Self {
        Self::new(Command::Ack).with_header(header::ID, id)
    }

    pub fn nack(id: &str) -> Self {
        Self::new(Command::Nack).with_header(header::ID, id)
    }

    pub fn send(destination: &str, body: impl Into<Bytes>) -> Self {
        Self::new(Command::Send)
            .with_header(header::DESTINATION, destination)
            .with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header(header::RECEIPT, receipt)
    }

    pub fn message(
        subscription: &str,
        message_id: &str,
        destination: &str,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::new(Command::Message)
            .with_header(header::SUBSCRIPTION, subscription)
            .with_header(header::MESSAGE_ID, message_id)
            .with_header(header::DESTINATION, destination)
            .with_body(body)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Self::new(Command::Receipt).with_header(header::RECEIPT_ID, receipt_id)
    }

    pub fn error(message: &str) -> Self {
        Self::new(Command::Error).with_header(header::MESSAGE, message)
    }

    /// Text of the `message` header of an ERROR frame, falling back to the body
    pub fn error_message(&self) -> String {
        match self.header(header::MESSAGE) {
            Some(message) => message.to_string(),
            None if !self.body.is_empty() => String::from_utf8_lossy(&self.body).into_owned(),
            None => "no message".to_string(),
        }
    }
}
