use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use wsstomp_proto::{BrokerEvent, BrokerSession, Result};

/// Plays the broker side for one bridge connection.
///
/// Every input line is published to all active subscriptions. Returns once
/// the bridge disconnects; input EOF only stops publishing.
pub async fn run<S, R>(mut broker: BrokerSession<S>, input: R) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let mut lines = Some(input.lines());
    let mut heartbeat = broker.heartbeat().send_every.map(interval);

    loop {
        tokio::select! {
            line = next_line(&mut lines) => match line {
                Ok(Some(line)) => {
                    let line = line.trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let delivered = broker.publish_all(line).await?;
                    if delivered == 0 {
                        warn!("No active subscriptions, message dropped");
                    } else {
                        debug!("Published to {} subscriptions", delivered);
                    }
                }
                Ok(None) => {
                    info!("Input closed, no more messages will be published");
                    lines = None;
                }
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    lines = None;
                }
            },
            frame = broker.recv() => {
                let Some(frame) = frame? else {
                    continue;
                };
                match broker.handle(frame).await? {
                    BrokerEvent::Subscribed { id, destination, ack } => {
                        info!("Bridge subscribed {} to {} (ack: {})", id, destination, ack)
                    }
                    BrokerEvent::Unsubscribed { id } => info!("Bridge unsubscribed {}", id),
                    BrokerEvent::Acked { id } => debug!("Bridge acknowledged {}", id),
                    BrokerEvent::Nacked { id } => warn!("Bridge rejected {}", id),
                    BrokerEvent::Sent { destination, body } => {
                        info!("Bridge sent {} bytes to {}", body.len(), destination)
                    }
                    BrokerEvent::Disconnected => {
                        info!("Bridge disconnected");
                        break;
                    }
                    BrokerEvent::Other(command) => warn!("Ignoring {} frame", command),
                }
            },
            _ = tick(&mut heartbeat) => broker.send_heartbeat().await?,
        }
    }

    broker.close().await;
    Ok(())
}

fn interval(period: Duration) -> Interval {
    let mut tick = time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};
    use wsstomp_proto::testing::in_memory_pair;
    use wsstomp_proto::{AckMode, ConnectOptions, HeartBeat, StompClient, DEFAULT_MAX_FRAME_SIZE};

    #[tokio::test]
    async fn test_publishes_input_lines_until_disconnect() {
        let (bridge, peer_side) = in_memory_pair(64 * 1024).await;
        let (mut input, input_reader) = tokio::io::duplex(1024);

        let peer = tokio::spawn(async move {
            let broker = BrokerSession::accept(peer_side, HeartBeat::disabled(), DEFAULT_MAX_FRAME_SIZE).await?;
            run(broker, BufReader::new(input_reader)).await
        });

        let options = ConnectOptions {
            heartbeat: HeartBeat::disabled(),
            ..ConnectOptions::default()
        };
        let mut client = StompClient::connect(bridge, options).await.unwrap();
        client.subscribe("/queue/test", AckMode::Auto).await.unwrap();

        input.write_all(b"hello\n\nworld\n").await.unwrap();

        let first = client.next_message().await.unwrap();
        assert_eq!(first.body_text(), "hello");
        assert_eq!(first.destination, "/queue/test");
        let second = client.next_message().await.unwrap();
        assert_eq!(second.body_text(), "world");

        // Input EOF leaves the connection up.
        drop(input);
        client.disconnect().await.unwrap();

        peer.await.unwrap().unwrap();
    }
}
