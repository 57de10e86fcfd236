use std::sync::Arc;
use std::thread;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::ca::batch::BatchHandler;
use crate::ca::{BeaconEvent, SearchDatagram};
use crate::config::{DbConfig, TaskConfig};
use crate::store::db::ObserverDb;
use crate::tracker::Tracker;

/// Commands sent to the store workers
pub enum StoreCommand {
    Beacons(Vec<BeaconEvent>, oneshot::Sender<Result<usize>>),
    Searches(Vec<SearchDatagram>, oneshot::Sender<Result<()>>),
    Periodic(oneshot::Sender<()>),
    Aggregate(oneshot::Sender<Result<usize>>),
    WriteConfig(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Handle to the store worker pool
#[derive(Clone)]
pub struct StoreHandle {
    tx: flume::Sender<StoreCommand>,
    workers: usize,
}

/// Worker threads, joined after shutdown
pub struct StoreWorkers {
    handles: Vec<thread::JoinHandle<()>>,
}

impl StoreWorkers {
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("Store worker panicked");
            }
        }
    }
}

impl StoreHandle {
    /// Open one connection per worker and start the worker threads.
    ///
    /// Workers pull from one shared queue, so a slow sweep on one worker
    /// does not hold up batches on the others.
    pub fn spawn(config: &DbConfig, tracker: Arc<Tracker>) -> Result<(Self, StoreWorkers)> {
        let (tx, rx) = flume::bounded::<StoreCommand>(256);
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let mut handles = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let db = ObserverDb::open(&config.db_path, config.events_max, busy_timeout)?;
            let rx = rx.clone();
            let tracker = tracker.clone();
            let handle = thread::Builder::new()
                .name(format!("store-{}", id))
                .spawn(move || worker(id, db, tracker, rx))
                .context("Failed to spawn store worker")?;
            handles.push(handle);
        }

        Ok((Self { tx, workers: config.workers }, StoreWorkers { handles }))
    }

    async fn send(&self, cmd: StoreCommand) -> Result<()> {
        self.tx
            .send_async(cmd)
            .await
            .map_err(|_| anyhow!("Store workers have shut down"))
    }

    /// Record a beacon batch. Returns the number of events logged.
    pub async fn beacons(&self, batch: Vec<BeaconEvent>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Beacons(batch, reply)).await?;
        rx.await?
    }

    /// Record a search batch
    pub async fn searches(&self, batch: Vec<SearchDatagram>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Searches(batch, reply)).await?;
        rx.await?
    }

    /// Run expiry sweeps, name resolution and stats
    pub async fn periodic(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Periodic(reply)).await?;
        rx.await?;
        Ok(())
    }

    /// Recompute the abandoned-search table
    pub async fn aggregate(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Aggregate(reply)).await?;
        rx.await?
    }

    pub async fn write_config(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::WriteConfig(reply)).await?;
        rx.await?
    }

    /// Stop every worker once the commands already queued are done
    pub async fn shutdown(&self) -> Result<()> {
        for _ in 0..self.workers {
            self.send(StoreCommand::Shutdown).await?;
        }
        Ok(())
    }
}

fn worker(id: usize, mut db: ObserverDb, tracker: Arc<Tracker>, rx: flume::Receiver<StoreCommand>) {
    tracing::debug!(worker = id, "Store worker started");

    while let Ok(cmd) = rx.recv() {
        match cmd {
            StoreCommand::Beacons(batch, reply) => {
                let result = tracker.handle_beacons(&mut db, &batch);
                let _ = reply.send(result);
            }
            StoreCommand::Searches(batch, reply) => {
                let result = tracker.handle_searches(&mut db, &batch);
                let _ = reply.send(result);
            }
            StoreCommand::Periodic(reply) => {
                tracker.periodic(&mut db, Utc::now());
                let _ = reply.send(());
            }
            StoreCommand::Aggregate(reply) => {
                let result = tracker.aggregate(&mut db);
                let _ = reply.send(result);
            }
            StoreCommand::WriteConfig(reply) => {
                let result = tracker.write_config(&mut db);
                let _ = reply.send(result);
            }
            StoreCommand::Shutdown => {
                tracing::info!(worker = id, "Store worker shutting down");
                break;
            }
        }
    }
}

impl BatchHandler<BeaconEvent> for StoreHandle {
    fn handle(&self, batch: Vec<BeaconEvent>) -> BoxFuture<'static, Result<()>> {
        let store = self.clone();
        Box::pin(async move { store.beacons(batch).await.map(|_| ()) })
    }
}

impl BatchHandler<SearchDatagram> for StoreHandle {
    fn handle(&self, batch: Vec<SearchDatagram>) -> BoxFuture<'static, Result<()>> {
        let store = self.clone();
        Box::pin(async move { store.searches(batch).await })
    }
}

/// Periodic task loop - drives sweeps and aggregation on the worker pool
pub async fn run(store: StoreHandle, config: TaskConfig, cancel: CancellationToken) -> Result<()> {
    let mut periodic_interval = tokio::time::interval(
        Duration::from_secs(config.periodic_interval_secs)
    );
    periodic_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut aggregate_interval = tokio::time::interval(
        Duration::from_secs(config.aggregate_interval_secs)
    );
    aggregate_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = periodic_interval.tick() => {
                if let Err(e) = store.periodic().await {
                    tracing::error!("Failed to run periodic tasks: {:#}", e);
                }
            }
            _ = aggregate_interval.tick() => {
                if let Err(e) = store.aggregate().await {
                    tracing::error!("Failed to aggregate dead searches: {:#}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Periodic tasks shutting down");
                break;
            }
        }
    }

    Ok(())
}
