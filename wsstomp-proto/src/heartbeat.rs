use crate::{ProtocolError, Result};
use std::time::Duration;

/// The `heart-beat` header: how often this side can send, and how often it
/// wants to receive. Zero disables either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub send: Duration,
    pub receive: Duration,
}

/// Intervals in effect after negotiation, from one side's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    pub send_every: Option<Duration>,
    pub expect_every: Option<Duration>,
}

impl HeartBeat {
    pub fn new(send: Duration, receive: Duration) -> Self {
        Self { send, receive }
    }

    pub fn symmetric(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (send, receive) = value
            .split_once(',')
            .ok_or_else(|| ProtocolError::MalformedFrame(format!("bad heart-beat: {:?}", value)))?;

        let millis = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ProtocolError::MalformedFrame(format!("bad heart-beat: {:?}", value)))
        };

        Ok(Self::new(millis(send)?, millis(receive)?))
    }

    pub fn to_header(&self) -> String {
        format!("{},{}", self.send.as_millis(), self.receive.as_millis())
    }

    /// Combines what we offered with what the other side answered.
    pub fn negotiate(&self, remote: &HeartBeat) -> Negotiated {
        Negotiated {
            send_every: pick(self.send, remote.receive),
            expect_every: pick(remote.send, self.receive),
        }
    }
}

fn pick(a: Duration, b: Duration) -> Option<Duration> {
    if a.is_zero() || b.is_zero() {
        None
    } else {
        Some(a.max(b))
    }
}
