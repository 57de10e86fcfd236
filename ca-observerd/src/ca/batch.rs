use std::mem;
use std::time::Duration;
use anyhow::Result;
use futures::future::BoxFuture;
use tokio::time::Instant;

/// Consumer of receiver batches. The receiver only observes completion and
/// how long it took.
pub trait BatchHandler<T>: Send + Sync + 'static {
    fn handle(&self, batch: Vec<T>) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Used in log messages
    pub name: &'static str,
    pub flush_period: Duration,
    pub max_queue: usize,
}

/// Pending queue of one receiver.
///
/// The first unit to arrive while no flush is pending schedules a flush one
/// `flush_period` later. Until that flush completes no other flush is
/// scheduled. Growing past `max_queue` asks the caller to stop reading from
/// the network until the flush completes.
pub struct Batcher<T> {
    settings: BatchSettings,
    queue: Vec<T>,
    flush_at: Option<Instant>,
    in_flight: bool,
    paused: bool,
}

impl<T> Batcher<T> {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            queue: Vec::new(),
            flush_at: None,
            in_flight: false,
            paused: false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// When the scheduled flush is due, if one is scheduled
    pub fn deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Enqueue units received at `now`. Returns true if reception must pause.
    pub fn push(&mut self, units: impl IntoIterator<Item = T>, now: Instant) -> bool {
        let before = self.queue.len();
        self.queue.extend(units);
        if self.queue.len() == before {
            return false;
        }

        if self.flush_at.is_none() && !self.in_flight {
            self.flush_at = Some(now + self.settings.flush_period);
        }

        if self.queue.len() > self.settings.max_queue && !self.paused {
            self.paused = true;
            tracing::warn!(queued = self.queue.len(), "{} buffer is full", self.settings.name);
            return true;
        }
        false
    }

    /// Swap out the queue if the scheduled flush is due at `now`
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<T>> {
        match self.flush_at {
            Some(at) if now >= at => {
                self.flush_at = None;
                self.in_flight = true;
                Some(mem::take(&mut self.queue))
            }
            _ => None,
        }
    }

    /// Everything still queued, for a final flush at shutdown
    pub fn drain(&mut self) -> Vec<T> {
        self.flush_at = None;
        mem::take(&mut self.queue)
    }

    /// The handler for the last batch finished after `elapsed`. Returns true
    /// if reception was paused and may resume.
    pub fn complete(&mut self, elapsed: Duration, now: Instant) -> bool {
        let period = self.settings.flush_period;
        if elapsed > period.mul_f64(0.9) {
            tracing::warn!(
                "{} processing time too high. {:?} of {:?}",
                self.settings.name,
                elapsed,
                period
            );
        }

        self.in_flight = false;
        if !self.queue.is_empty() {
            // arrivals during the flush would otherwise wait for the next datagram
            self.flush_at = Some(now + period);
        }

        mem::replace(&mut self.paused, false)
    }
}
