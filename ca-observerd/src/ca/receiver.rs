use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use super::batch::{BatchHandler, BatchSettings, Batcher};

/// Largest UDP payload
const MAX_DATAGRAM: usize = 65536;

/// Protocol-specific half of a receiver: turns datagrams into queued units.
pub trait Protocol: Send + 'static {
    type Unit: Send + 'static;

    /// Called once before the first datagram is read
    fn start<'a>(&'a mut self, _socket: &'a UdpSocket) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Units carried by one datagram received at `now`
    fn on_datagram(&mut self, data: &[u8], src: SocketAddr, now: DateTime<Utc>) -> Vec<Self::Unit>;

    /// How often `housekeeping` runs, if at all
    fn housekeeping_interval(&self) -> Option<Duration> {
        None
    }

    fn housekeeping(&mut self, _socket: &UdpSocket) {}
}

type Flush = BoxFuture<'static, (Result<()>, Duration)>;

/// Receive datagrams, batch their units and feed the batches to `handler`.
///
/// Datagram reception, the flush timer and handler completion all run on
/// this one task, so the queue needs no locking. While paused the socket is
/// not read and the kernel drops whatever no longer fits its buffer.
pub async fn run_receiver<P: Protocol>(
    socket: UdpSocket,
    mut protocol: P,
    handler: Arc<dyn BatchHandler<P::Unit>>,
    settings: BatchSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let name = settings.name;
    protocol.start(&socket).await?;

    let mut batcher = Batcher::new(settings);
    let mut in_flight: FuturesUnordered<Flush> = FuturesUnordered::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    let housekeeping_period = protocol.housekeeping_interval();
    let period = housekeeping_period.unwrap_or(Duration::from_secs(3600));
    let mut housekeeping = tokio::time::interval_at(Instant::now() + period, period);

    tracing::info!(local = ?socket.local_addr().ok(), "{} receiver starting", name);

    loop {
        let deadline = batcher.deadline();

        tokio::select! {
            res = socket.recv_from(&mut buf), if !batcher.is_paused() => {
                match res {
                    Ok((len, src)) => {
                        let units = protocol.on_datagram(&buf[..len], src, Utc::now());
                        batcher.push(units, Instant::now());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "{} recv_from failed", name);
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(batch) = batcher.take_due(Instant::now()) {
                    let handler = handler.clone();
                    in_flight.push(Box::pin(async move {
                        let started = Instant::now();
                        let result = handler.handle(batch).await;
                        (result, started.elapsed())
                    }));
                }
            }

            Some((result, elapsed)) = in_flight.next() => {
                if let Err(e) = result {
                    tracing::error!("{} handler failed: {:#}", name, e);
                }
                if batcher.complete(elapsed, Instant::now()) {
                    tracing::info!("{} receiver resuming", name);
                }
            }

            _ = housekeeping.tick(), if housekeeping_period.is_some() => {
                protocol.housekeeping(&socket);
            }

            _ = cancel.cancelled() => {
                tracing::info!(pending = batcher.len(), "{} receiver shutting down", name);
                break;
            }
        }
    }

    while let Some((result, _)) = in_flight.next().await {
        if let Err(e) = result {
            tracing::error!("{} handler failed: {:#}", name, e);
        }
    }
    let rest = batcher.drain();
    if !rest.is_empty() {
        tracing::debug!(count = rest.len(), "{} final flush", name);
        if let Err(e) = handler.handle(rest).await {
            tracing::error!("{} handler failed: {:#}", name, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// One unit per datagram: the big-endian u32 it carries
    #[derive(Default)]
    struct Numbered {
        seen: Arc<AtomicUsize>,
    }

    impl Protocol for Numbered {
        type Unit = u32;

        fn on_datagram(&mut self, data: &[u8], _src: SocketAddr, _now: DateTime<Utc>) -> Vec<u32> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            vec![u32::from_be_bytes(data[..4].try_into().unwrap())]
        }
    }

    struct Recorder {
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
        delay: Duration,
    }

    impl BatchHandler<u32> for Recorder {
        fn handle(&self, batch: Vec<u32>) -> BoxFuture<'static, Result<()>> {
            let batches = self.batches.clone();
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                batches.lock().unwrap().push(batch);
                Ok(())
            })
        }
    }

    fn settings(flush_period: Duration, max_queue: usize) -> BatchSettings {
        BatchSettings { name: "Test", flush_period, max_queue }
    }

    async fn wait_for(what: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !what() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn send_numbers(to: SocketAddr, count: u32) {
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..count {
            sender.send_to(&i.to_be_bytes(), to).unwrap();
        }
    }

    #[tokio::test]
    async fn test_overload_pauses_without_loss() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn BatchHandler<u32>> = Arc::new(Recorder { batches: batches.clone(), delay: Duration::from_millis(100) });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_receiver(
            socket,
            Numbered::default(),
            handler,
            settings(Duration::from_millis(20), 5),
            cancel.clone(),
        ));

        send_numbers(addr, 23);
        wait_for(|| batches.lock().unwrap().iter().map(Vec::len).sum::<usize>() == 23).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let batches = batches.lock().unwrap().clone();
        let all: Vec<u32> = batches.iter().flatten().copied().collect();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        assert!(batches.len() >= 4, "slow handler forces several batches: {:?}", batches);
        // reading stops as soon as the queue exceeds its bound
        assert!(batches.iter().all(|b| b.len() <= 6), "{:?}", batches);
    }

    #[tokio::test]
    async fn test_cancel_flushes_pending_units() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn BatchHandler<u32>> = Arc::new(Recorder { batches: batches.clone(), delay: Duration::ZERO });
        let protocol = Numbered::default();
        let seen = protocol.seen.clone();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_receiver(
            socket,
            protocol,
            handler,
            settings(Duration::from_secs(3600), 100),
            cancel.clone(),
        ));

        send_numbers(addr, 3);
        wait_for(|| seen.load(Ordering::SeqCst) == 3).await;
        assert!(batches.lock().unwrap().is_empty(), "flush timer has not fired");

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*batches.lock().unwrap(), vec![vec![0, 1, 2]]);
    }
}
