//! Per-mailbox background worker.
//!
//! A worker owns one spool and flushes it to the relay on a fixed cadence.
//! Each flush is a salvo: the entries present when it starts are delivered
//! one by one, and only confirmed deliveries leave the spool.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::envelope_of;
use crate::queue::{Maildir, QueueError, QueuedMessage};
use crate::relay::{DeliveryError, Relay};

/// Default time between two salvos.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} was already started")]
    AlreadyStarted(String),
}

/// Lifecycle of a worker. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Created, not started yet.
    Idle = 0,
    /// Flushing on its cadence and accepting enqueues.
    Running = 1,
    /// Asked to stop; finishing its current salvo.
    Stopping = 2,
    /// Background task terminated; no salvo will run again.
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Counters of one salvo.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SalvoReport {
    /// Relayed and removed from the spool.
    pub delivered: usize,
    /// Left in place for the next salvo.
    pub deferred: usize,
    /// Quarantined, never retried.
    pub rejected: usize,
}

impl SalvoReport {
    pub fn total(&self) -> usize {
        self.delivered + self.deferred + self.rejected
    }
}

enum Outcome {
    Delivered,
    Deferred,
    Rejected,
    Vanished,
}

/// What a salvo needs; shared between the worker handle and its task.
struct Flusher {
    name: String,
    queue: Arc<Maildir>,
    relay: Arc<dyn Relay>,
    salvo: tokio::sync::Mutex<()>,
}

impl Flusher {
    async fn salvo(&self) -> SalvoReport {
        // One consumer at a time, whether the tick or a direct flush() call.
        let _guard = self.salvo.lock().await;
        let mut report = SalvoReport::default();

        let batch = match self.queue.drain().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(mailbox = %self.name, error = %e, "salvo_drain_failed");
                return report;
            }
        };

        if batch.is_empty() {
            return report;
        }

        debug!(mailbox = %self.name, backlog = batch.len(), "salvo_started");

        for entry in &batch {
            match self.deliver(entry).await {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Deferred => report.deferred += 1,
                Outcome::Rejected => report.rejected += 1,
                Outcome::Vanished => {}
            }
        }

        info!(
            mailbox = %self.name,
            delivered = report.delivered,
            deferred = report.deferred,
            rejected = report.rejected,
            "salvo_complete"
        );

        report
    }

    async fn deliver(&self, entry: &QueuedMessage) -> Outcome {
        let raw = match self.queue.read(entry).await {
            Ok(raw) => raw,
            Err(QueueError::NotFound(_)) => return Outcome::Vanished,
            Err(e) => {
                warn!(mailbox = %self.name, entry = %entry, error = %e, "salvo_read_failed");
                return Outcome::Deferred;
            }
        };

        let envelope = match envelope_of(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(mailbox = %self.name, entry = %entry, error = %e, "salvo_entry_corrupt");
                return self.reject(entry).await;
            }
        };

        match self.relay.deliver(&envelope, &raw).await {
            Ok(()) => {
                if let Err(e) = self.queue.acknowledge(entry).await {
                    // Stays queued and will be relayed again.
                    error!(mailbox = %self.name, entry = %entry, error = %e, "salvo_ack_failed");
                }
                debug!(mailbox = %self.name, entry = %entry, recipients = envelope.to().len(), "salvo_entry_delivered");
                Outcome::Delivered
            }
            Err(DeliveryError::Transient(reason)) => {
                warn!(mailbox = %self.name, entry = %entry, reason = %reason, "salvo_entry_deferred");
                Outcome::Deferred
            }
            Err(DeliveryError::Permanent(reason)) => {
                error!(mailbox = %self.name, entry = %entry, reason = %reason, "salvo_entry_rejected");
                self.reject(entry).await
            }
        }
    }

    async fn reject(&self, entry: &QueuedMessage) -> Outcome {
        match self.queue.quarantine(entry).await {
            Ok(()) => Outcome::Rejected,
            Err(QueueError::NotFound(_)) => Outcome::Vanished,
            Err(e) => {
                error!(mailbox = %self.name, entry = %entry, error = %e, "salvo_quarantine_failed");
                Outcome::Deferred
            }
        }
    }
}

/// Resolves once the background task has terminated; every clone resolves.
type Completion = Shared<BoxFuture<'static, ()>>;

/// Background flusher of one mailbox spool.
///
/// ```ignore
/// let worker = Worker::new("newsletter", maildir, relay, Duration::from_secs(5));
/// worker.start()?;
/// // ...
/// worker.stop();
/// worker.join().await;
/// ```
pub struct Worker {
    flusher: Arc<Flusher>,
    interval: Duration,
    state: AtomicU8,
    cancel: CancellationToken,
    completion: Mutex<Option<Completion>>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queue: Maildir,
        relay: Arc<dyn Relay>,
        interval: Duration,
    ) -> Self {
        Self {
            flusher: Arc::new(Flusher {
                name: name.into(),
                queue: Arc::new(queue),
                relay,
                salvo: tokio::sync::Mutex::new(()),
            }),
            interval,
            state: AtomicU8::new(WorkerState::Idle as u8),
            cancel: CancellationToken::new(),
            completion: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.flusher.name
    }

    pub fn queue(&self) -> &Maildir {
        &self.flusher.queue
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Start the flush cadence on a background tokio task.
    ///
    /// The first salvo runs immediately, so a backlog left by a previous
    /// process is resumed at once. A worker can only be started once.
    pub fn start(&self) -> Result<(), WorkerError> {
        self.state
            .compare_exchange(
                WorkerState::Idle as u8,
                WorkerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| WorkerError::AlreadyStarted(self.name().to_string()))?;

        let flusher = Arc::clone(&self.flusher);
        let cancel = self.cancel.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // A salvo in progress is never interrupted: cancellation is
                // only observed while waiting for the next tick.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        flusher.salvo().await;
                    }
                }
            }

            info!(mailbox = %flusher.name, "worker_loop_exited");
        });

        let name = self.name().to_string();
        let completion = handle
            .map(move |result| {
                if let Err(e) = result {
                    error!(mailbox = %name, error = %e, "worker_task_failed");
                }
            })
            .boxed()
            .shared();

        *self.completion.lock().unwrap_or_else(PoisonError::into_inner) = Some(completion);

        info!(
            mailbox = %self.name(),
            spool = %self.queue().path().display(),
            interval_ms = self.interval.as_millis() as u64,
            "worker_started"
        );
        Ok(())
    }

    /// Ask the cadence to exit after the current salvo. Idempotent.
    ///
    /// Entries still queued stay on disk and are resumed by the next start.
    pub fn stop(&self) {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match WorkerState::from_u8(state) {
                    WorkerState::Idle => Some(WorkerState::Stopped as u8),
                    WorkerState::Running => Some(WorkerState::Stopping as u8),
                    WorkerState::Stopping | WorkerState::Stopped => None,
                }
            });

        if previous.is_ok() {
            info!(mailbox = %self.name(), "worker_stopping");
        }
        self.cancel.cancel();
    }

    /// Wait until the background task has terminated.
    ///
    /// Call after [`Worker::stop`]; joining a running worker waits until
    /// somebody stops it. Any number of callers may join concurrently and
    /// none of them returns while a salvo is still in flight.
    pub async fn join(&self) {
        let completion = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Never started: stop() already moved it to Stopped.
        let Some(completion) = completion else {
            return;
        };
        completion.await;

        if self.cancel.is_cancelled()
            && self
                .state
                .compare_exchange(
                    WorkerState::Stopping as u8,
                    WorkerState::Stopped as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            info!(mailbox = %self.name(), "worker_stopped");
        }
    }

    /// Run one salvo now.
    pub async fn flush(&self) -> SalvoReport {
        self.flusher.salvo().await
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() && self.state() == WorkerState::Running {
            warn!(mailbox = %self.name(), "worker_dropped_while_running");
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use lettre::address::Envelope;

    use super::*;
    use crate::message::{render, OutboundMessage, SenderIdentity};

    /// Relay double that records what it accepts and fails on demand.
    #[derive(Default)]
    struct ScriptedRelay {
        delivered: StdMutex<Vec<Vec<u8>>>,
        transient_for: StdMutex<Option<String>>,
        permanent_for: StdMutex<Option<String>>,
        latency: StdMutex<Option<Duration>>,
    }

    impl ScriptedRelay {
        fn delivered(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Relay for ScriptedRelay {
        async fn deliver(&self, _envelope: &Envelope, message: &[u8]) -> Result<(), DeliveryError> {
            let latency = *self.latency.lock().unwrap();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let body = String::from_utf8_lossy(message);
            if let Some(marker) = self.transient_for.lock().unwrap().as_deref() {
                if body.contains(marker) {
                    return Err(DeliveryError::Transient("connection refused".into()));
                }
            }
            if let Some(marker) = self.permanent_for.lock().unwrap().as_deref() {
                if body.contains(marker) {
                    return Err(DeliveryError::Permanent("550 no such user".into()));
                }
            }
            self.delivered.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }

    fn rendered(subject: &str) -> Vec<u8> {
        let sender = SenderIdentity::new("noreply@example.com".parse().unwrap(), None);
        render(
            &sender,
            &OutboundMessage {
                recipients: vec!["a@x.com".into()],
                subject: subject.into(),
                text: "body".into(),
                html: None,
            },
        )
        .unwrap()
    }

    async fn worker(dir: &std::path::Path, relay: Arc<ScriptedRelay>, interval: Duration) -> Worker {
        let maildir = Maildir::open(dir).await.unwrap();
        Worker::new("test", maildir, relay, interval)
    }

    #[tokio::test]
    async fn flush_delivers_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        let worker = worker(dir.path(), relay.clone(), DEFAULT_FLUSH_INTERVAL).await;

        worker.queue().append(&rendered("one")).await.unwrap();
        worker.queue().append(&rendered("two")).await.unwrap();

        let report = worker.flush().await;

        assert_eq!(report, SalvoReport { delivered: 2, deferred: 0, rejected: 0 });
        assert_eq!(relay.delivered(), 2);
        assert!(worker.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_entry_does_not_block_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        let worker = worker(dir.path(), relay.clone(), DEFAULT_FLUSH_INTERVAL).await;

        worker.queue().append(b"this is not a message").await.unwrap();
        worker.queue().append(&rendered("fine")).await.unwrap();

        let report = worker.flush().await;

        assert_eq!(report, SalvoReport { delivered: 1, deferred: 0, rejected: 1 });
        assert!(worker.queue().is_empty().await.unwrap());
        assert_eq!(worker.queue().quarantined().await.unwrap(), 1);

        // Quarantined entries are not retried.
        assert_eq!(worker.flush().await.total(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_next_salvo() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        *relay.transient_for.lock().unwrap() = Some("flaky".into());
        let worker = worker(dir.path(), relay.clone(), DEFAULT_FLUSH_INTERVAL).await;

        worker.queue().append(&rendered("flaky")).await.unwrap();
        worker.queue().append(&rendered("steady")).await.unwrap();

        let report = worker.flush().await;
        assert_eq!(report, SalvoReport { delivered: 1, deferred: 1, rejected: 0 });
        assert_eq!(worker.queue().len().await.unwrap(), 1);

        *relay.transient_for.lock().unwrap() = None;
        let report = worker.flush().await;
        assert_eq!(report.delivered, 1);
        assert!(worker.queue().is_empty().await.unwrap());
        assert_eq!(relay.delivered(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        *relay.permanent_for.lock().unwrap() = Some("bounce".into());
        let worker = worker(dir.path(), relay.clone(), DEFAULT_FLUSH_INTERVAL).await;

        worker.queue().append(&rendered("bounce")).await.unwrap();

        let report = worker.flush().await;
        assert_eq!(report.rejected, 1);
        assert!(worker.queue().is_empty().await.unwrap());
        assert_eq!(worker.queue().quarantined().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        let worker = worker(dir.path(), relay, Duration::from_millis(20)).await;

        assert_eq!(worker.state(), WorkerState::Idle);
        worker.start().unwrap();
        assert!(worker.is_running());
        assert!(matches!(worker.start(), Err(WorkerError::AlreadyStarted(_))));

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopping);
        worker.stop();
        worker.join().await;
        assert_eq!(worker.state(), WorkerState::Stopped);

        // Terminal: cannot be restarted.
        assert!(worker.start().is_err());
    }

    #[tokio::test]
    async fn background_cadence_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        let worker = worker(dir.path(), relay.clone(), Duration::from_millis(20)).await;

        worker.start().unwrap();
        worker.queue().append(&rendered("later")).await.unwrap();

        let mut waited = Duration::ZERO;
        while relay.delivered() == 0 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }

        worker.stop();
        worker.join().await;
        assert_eq!(relay.delivered(), 1);
    }

    #[tokio::test]
    async fn stopped_worker_leaves_backlog_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        let worker = worker(dir.path(), relay.clone(), Duration::from_secs(3600)).await;

        worker.start().unwrap();
        // Let the immediate first tick pass on an empty spool.
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.queue().append(&rendered("pending")).await.unwrap();

        worker.stop();
        worker.join().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(relay.delivered(), 0);
        assert_eq!(worker.queue().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_without_start_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        let worker = worker(dir.path(), relay, DEFAULT_FLUSH_INTERVAL).await;

        worker.stop();
        worker.join().await;

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.start().is_err());
    }

    #[tokio::test]
    async fn concurrent_joins_wait_for_salvo_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(ScriptedRelay::default());
        *relay.latency.lock().unwrap() = Some(Duration::from_millis(300));
        let worker = Arc::new(worker(dir.path(), relay.clone(), Duration::from_secs(3600)).await);

        worker.queue().append(&rendered("slow")).await.unwrap();
        worker.start().unwrap();
        // The immediate first salvo is now blocked inside the relay.
        tokio::time::sleep(Duration::from_millis(50)).await;

        worker.stop();
        let first = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.join().await }
        });
        tokio::task::yield_now().await;

        worker.join().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(relay.delivered(), 1);
        assert!(worker.queue().is_empty().await.unwrap());

        first.await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}
