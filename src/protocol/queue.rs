//! Multi-queue work distribution.
//!
//! N unbounded FIFO queues, each drained by its own named OS thread. A
//! scanner thread periodically looks at every queue's length and caches the
//! index of the shortest one; `push` reads that cached index instead of
//! scanning on the hot path.
//!
//! Order is preserved per queue only. Two messages pushed to different
//! queues may be handled in either order.

use crate::error::{ProtocolError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// How often an idle worker re-checks the shutdown flag
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Work handler shared by every worker thread
pub type QueueHandler<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

/// Index of the shortest queue; ties go to the lowest index.
///
/// Returns 0 for an empty slice.
pub fn least_loaded(lengths: &[usize]) -> usize {
    lengths
        .iter()
        .enumerate()
        .min_by_key(|&(index, len)| (*len, index))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

pub struct QueueManager<T: Send + 'static> {
    name: String,
    senders: Vec<Sender<T>>,
    receivers: Vec<Receiver<T>>,
    shortest: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    // Dropping it wakes the scanner out of its wait
    scanner_stop: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    scanner: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> QueueManager<T> {
    /// Spawns `workers` worker threads and one scanner thread.
    ///
    /// # Errors
    /// `ProtocolError::ConfigError` for zero workers, `ProtocolError::Io` if
    /// a thread cannot be spawned.
    pub fn new(
        name: &str,
        workers: usize,
        scan_interval: Duration,
        handler: QueueHandler<T>,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(ProtocolError::ConfigError(
                "Queue manager needs at least one worker".into(),
            ));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shortest = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = unbounded::<T>();
            let worker_rx = rx.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || Self::run_worker(index, worker_rx, handler, shutdown))?;

            senders.push(tx);
            receivers.push(rx);
            handles.push(handle);
        }

        let (scanner_stop, stop_rx) = bounded::<()>(0);
        let scanner = {
            let receivers = receivers.clone();
            let shortest = shortest.clone();
            thread::Builder::new()
                .name(format!("{name}-scanner"))
                .spawn(move || {
                    while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(scan_interval) {
                        let lengths: Vec<usize> = receivers.iter().map(Receiver::len).collect();
                        shortest.store(least_loaded(&lengths), Ordering::Relaxed);
                    }
                })?
        };

        info!(queue = name, workers, "Queue manager started");

        Ok(Self {
            name: name.to_string(),
            senders,
            receivers,
            shortest,
            shutdown,
            scanner_stop: Some(scanner_stop),
            workers: handles,
            scanner: Some(scanner),
        })
    }

    fn run_worker(
        index: usize,
        rx: Receiver<T>,
        handler: QueueHandler<T>,
        shutdown: Arc<AtomicBool>,
    ) {
        debug!(worker = index, "Worker starting");
        loop {
            match rx.recv_timeout(IDLE_POLL) {
                Ok(item) => handler(item),
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(worker = index, "Worker stopped");
    }

    /// Queues `item` on the most recently found shortest queue.
    pub fn push(&self, item: T) -> Result<usize> {
        let index = self.shortest.load(Ordering::Relaxed) % self.senders.len();
        self.push_to(index, item)?;
        Ok(index)
    }

    /// Queues `item` on a specific queue.
    pub fn push_to(&self, index: usize, item: T) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ProtocolError::Custom(format!("queue '{}' is shut down", self.name)));
        }
        let sender = self
            .senders
            .get(index)
            .ok_or_else(|| ProtocolError::Custom(format!("no queue {index}")))?;
        sender
            .send(item)
            .map_err(|_| ProtocolError::Custom(format!("queue '{}' worker exited", self.name)))
    }

    /// Recomputes the shortest queue now.
    pub fn rescan(&self) -> usize {
        let index = least_loaded(&self.queue_lengths());
        self.shortest.store(index, Ordering::Relaxed);
        index
    }

    pub fn queue_lengths(&self) -> Vec<usize> {
        self.receivers.iter().map(Receiver::len).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Stops the workers after their queues drain and joins every thread.
    pub fn shutdown(mut self) {
        self.stop();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(queue = %self.name, "Worker thread panicked");
            }
        }
        if let Some(scanner) = self.scanner.take() {
            let _ = scanner.join();
        }
        info!(queue = %self.name, "Queue manager stopped");
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.scanner_stop = None;
        // Workers see Disconnected once their queue is empty
        self.senders.clear();
        self.receivers.clear();
    }
}

impl<T: Send + 'static> Drop for QueueManager<T> {
    fn drop(&mut self) {
        // Threads are detached here; a worker may be the one dropping us
        self.stop();
    }
}

impl<T: Send + 'static> std::fmt::Debug for QueueManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("name", &self.name)
            .field("workers", &self.senders.len())
            .field("shortest", &self.shortest.load(Ordering::Relaxed))
            .finish()
    }
}
