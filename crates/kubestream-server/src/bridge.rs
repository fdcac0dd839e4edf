//! Streaming bridge between a session's records and its client connection
//!
//! The bridge runs three duties against one connection:
//!
//! - relay: every record becomes one text message, in engine order
//! - liveness: a ping every `ping_interval`
//! - drain: reads (and discards) inbound messages to notice close, errors and
//!   silence; any inbound message extends the `pong_wait` deadline
//!
//! Writes from the relay and liveness duties go through one lock, each bounded
//! by `write_wait`. A duty returns `Ok(())` when it ends normally (the relay's
//! source drained, or the scope was cancelled) and `Err` when it detected a
//! failure; stopping the other duties is the supervisor's job.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use kubestream_types::{ErrorFrame, LogRecord};

use crate::config::SessionTimings;
use crate::error::TransportError;
use crate::transport::WireMessage;

/// Write half of the client connection for one session
pub struct Bridge<S> {
    sink: Arc<Mutex<S>>,
    timings: SessionTimings,
    relayed: Arc<AtomicU64>,
}

impl<S> Bridge<S>
where
    S: Sink<WireMessage, Error = TransportError> + Send + Unpin + 'static,
{
    pub fn new(sink: S, timings: SessionTimings) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            timings,
            relayed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of records written so far
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// Relay duty: forward records until the engine's side of the channel closes
    pub fn relay(
        &self,
        mut records: mpsc::Receiver<LogRecord>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static + use<S> {
        let sink = Arc::clone(&self.sink);
        let relayed = Arc::clone(&self.relayed);
        let write_wait = self.timings.write_wait;

        async move {
            loop {
                let record = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    record = records.recv() => record,
                };
                let Some(record) = record else {
                    return Ok(());
                };

                write(&sink, WireMessage::Text(record.to_wire()), write_wait).await?;
                relayed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Liveness duty: ping on a fixed cadence until cancelled
    pub fn liveness(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static + use<S> {
        let sink = Arc::clone(&self.sink);
        let SessionTimings {
            ping_interval,
            write_wait,
            ..
        } = self.timings;

        async move {
            let start = tokio::time::Instant::now() + ping_interval;
            let mut ticker = tokio::time::interval_at(start, ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        write(&sink, WireMessage::Ping(Vec::new()), write_wait).await?;
                    }
                }
            }
        }
    }

    /// Drain duty: consume inbound messages until close, error, silence or cancellation
    pub fn drain<R>(
        &self,
        mut inbound: R,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static + use<S, R>
    where
        R: Stream<Item = Result<WireMessage, TransportError>> + Send + Unpin + 'static,
    {
        let pong_wait = self.timings.pong_wait;

        async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = tokio::time::timeout(pong_wait, inbound.next()) => next,
                };

                match next {
                    Err(_) => return Err(TransportError::LivenessTimeout(pong_wait)),
                    Ok(None) | Ok(Some(Ok(WireMessage::Close))) => {
                        return Err(TransportError::Closed);
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => return Err(e),
                }
            }
        }
    }

    /// Send the session's terminal error frame
    pub async fn send_error(&self, frame: &ErrorFrame) -> Result<(), TransportError> {
        write(&self.sink, WireMessage::Text(frame.to_wire()), self.timings.write_wait).await
    }

    /// Send a close frame and close the sink
    pub async fn close(&self) -> Result<(), TransportError> {
        let write_wait = self.timings.write_wait;
        write(&self.sink, WireMessage::Close, write_wait).await?;

        let mut sink = self.sink.lock().await;
        tokio::time::timeout(write_wait, sink.close())
            .await
            .map_err(|_| TransportError::WriteTimeout(write_wait))?
    }
}

/// One write under the connection lock, bounded by `write_wait`
async fn write<S>(
    sink: &Mutex<S>,
    message: WireMessage,
    write_wait: Duration,
) -> Result<(), TransportError>
where
    S: Sink<WireMessage, Error = TransportError> + Unpin,
{
    let send = async {
        let mut sink = sink.lock().await;
        sink.send(message).await
    };
    tokio::time::timeout(write_wait, send)
        .await
        .map_err(|_| TransportError::WriteTimeout(write_wait))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    type TestSink =
        futures::sink::SinkMapErr<fmpsc::Sender<WireMessage>, fn(fmpsc::SendError) -> TransportError>;

    fn sink_err(_: fmpsc::SendError) -> TransportError {
        TransportError::Closed
    }

    fn bridge(capacity: usize) -> (Bridge<TestSink>, fmpsc::Receiver<WireMessage>) {
        let (tx, rx) = fmpsc::channel(capacity);
        let sink = tx.sink_map_err(sink_err as fn(fmpsc::SendError) -> TransportError);
        (Bridge::new(sink, SessionTimings::default()), rx)
    }

    #[tokio::test]
    async fn test_relay_preserves_order_and_framing() {
        let (bridge, mut out) = bridge(16);
        let (tx, rx) = mpsc::channel(4);
        let relay = tokio::spawn(bridge.relay(rx, CancellationToken::new()));

        for i in 0..5 {
            tx.send(LogRecord::new("ns", "pod", "c", format!("line {i}"))).await.unwrap();
        }
        drop(tx);
        relay.await.unwrap().unwrap();
        assert_eq!(bridge.relayed(), 5);

        for i in 0..5 {
            let Some(WireMessage::Text(text)) = out.next().await else {
                panic!("expected text frame");
            };
            assert!(text.ends_with('\n'));
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["message"], format!("line {i}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_hits_write_deadline() {
        // A zero-capacity channel nobody reads never finishes flushing
        let (bridge, _out) = bridge(0);
        let (tx, rx) = mpsc::channel(4);
        let relay = tokio::spawn(bridge.relay(rx, CancellationToken::new()));

        for i in 0..3 {
            tx.send(LogRecord::new("ns", "pod", "c", format!("{i}"))).await.unwrap();
        }

        let result = relay.await.unwrap();
        assert!(matches!(result, Err(TransportError::WriteTimeout(d)) if d == Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_pings_on_cadence() {
        let (bridge, mut out) = bridge(16);
        let cancel = CancellationToken::new();
        let liveness = tokio::spawn(bridge.liveness(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(out.try_next().is_err(), "no ping before the first interval");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(out.next().await, Some(WireMessage::Ping(Vec::new())));

        cancel.cancel();
        liveness.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_without_activity() {
        let (bridge, _out) = bridge(16);
        let (_tx, inbound) = fmpsc::channel::<Result<WireMessage, TransportError>>(4);

        let started = tokio::time::Instant::now();
        let result = bridge.drain(inbound, CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::LivenessTimeout(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_activity_extends_deadline() {
        let (bridge, _out) = bridge(16);
        let (mut tx, inbound) = fmpsc::channel::<Result<WireMessage, TransportError>>(4);
        let started = tokio::time::Instant::now();
        let drain = tokio::spawn(bridge.drain(inbound, CancellationToken::new()));

        tokio::time::sleep(Duration::from_secs(45)).await;
        tx.send(Ok(WireMessage::Pong(Vec::new()))).await.unwrap();

        let result = drain.await.unwrap();
        assert!(matches!(result, Err(TransportError::LivenessTimeout(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(105));
    }

    #[tokio::test]
    async fn test_drain_detects_close() {
        let (bridge, _out) = bridge(16);
        let (mut tx, inbound) = fmpsc::channel::<Result<WireMessage, TransportError>>(4);
        tx.send(Ok(WireMessage::Text("ignored".into()))).await.unwrap();
        tx.send(Ok(WireMessage::Close)).await.unwrap();

        let result = bridge.drain(inbound, CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_drain_stops_on_cancel() {
        let (bridge, _out) = bridge(16);
        let (_tx, inbound) = fmpsc::channel::<Result<WireMessage, TransportError>>(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(bridge.drain(inbound, cancel).await.is_ok());
    }
}
