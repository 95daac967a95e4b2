// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded submission queue that ships documents in bulk, either when a full
//! batch is waiting or when the flush timer fires.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::clock::{deadline_after, Clock};
use crate::config::Config;
use crate::document::{
    group_by_index, BulkItemOutcome, BulkOperation, DocumentPatch, SampledDocument,
};
use crate::error::{ShutdownError, SubmitError};
use crate::throttle::LogThrottle;
use crate::transport::Transport;

const DROP_LOG_WINDOW: Duration = Duration::from_secs(10);
const MIN_FLUSH_DELAY: Duration = Duration::from_millis(1);

/// Flush parameters that can be swapped while the reporter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReporterSettings {
    pub flush_delay: Duration,
    pub max_batch_size: usize,
}

impl ReporterSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        ReporterSettings {
            flush_delay: config.flush_delay,
            max_batch_size: config.max_batch_size,
        }
    }

    fn flush_delay(&self) -> Duration {
        self.flush_delay.max(MIN_FLUSH_DELAY)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

impl Default for ReporterSettings {
    fn default() -> Self {
        ReporterSettings::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
pub struct ReporterStats {
    queued: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of the reporter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReporterStatsSnapshot {
    /// Accepted into the queue.
    pub queued: u64,
    /// Acknowledged as stored by the backend.
    pub flushed: u64,
    /// Rejected by the backend or lost with a failed request.
    pub failed: u64,
    /// Shed because the queue was full or closed.
    pub dropped: u64,
    /// Refused as invalid at submission.
    pub rejected: u64,
    /// Bulk requests issued.
    pub flushes: u64,
}

impl ReporterStats {
    #[must_use]
    pub fn snapshot(&self) -> ReporterStatsSnapshot {
        ReporterStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(u64::try_from(by).unwrap_or(u64::MAX), Ordering::Relaxed);
}

#[derive(Debug)]
pub enum ReporterCommand {
    /// Sends everything queued at the time of the request; replies with the
    /// number of operations handed to the transport.
    Flush(oneshot::Sender<usize>),
    /// Drains the queue and stops the service.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
struct Shared {
    settings: ArcSwap<ReporterSettings>,
    /// Operations accepted but not yet taken by the service. Raised before
    /// the enqueue attempt so it never lags the channel.
    pending: AtomicUsize,
    batch_ready: Notify,
    settings_changed: Notify,
    stats: ReporterStats,
    drop_log: LogThrottle,
    clock: Arc<dyn Clock>,
}

/// Cheap, cloneable producer side of the reporter. Every method returns
/// without waiting on the backend.
#[derive(Debug, Clone)]
pub struct BatchReporter {
    queue_tx: mpsc::Sender<BulkOperation>,
    command_tx: mpsc::UnboundedSender<ReporterCommand>,
    shared: Arc<Shared>,
}

impl BatchReporter {
    /// Queues a new document. Fails immediately if the document is invalid or
    /// the queue is full.
    pub fn submit(&self, document: SampledDocument) -> Result<(), SubmitError> {
        if document.index().trim().is_empty() {
            return self.reject("target index is empty");
        }
        if !document.payload().is_object() {
            return self.reject("payload is not a JSON object");
        }
        self.enqueue(BulkOperation::Index(document))
    }

    /// Queues a partial update of an already stored document.
    pub fn submit_patch(&self, patch: DocumentPatch) -> Result<(), SubmitError> {
        if patch.index.trim().is_empty() {
            return self.reject("target index is empty");
        }
        if patch.id.trim().is_empty() {
            return self.reject("document id is empty");
        }
        if patch.fields.is_empty() {
            return self.reject("patch has no fields");
        }
        self.enqueue(BulkOperation::Update(patch))
    }

    fn reject(&self, reason: &'static str) -> Result<(), SubmitError> {
        self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
        debug!("REPORTER | Rejected document: {reason}");
        Err(SubmitError::InvalidDocument(reason))
    }

    fn enqueue(&self, operation: BulkOperation) -> Result<(), SubmitError> {
        let pending = self.shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
        match self.queue_tx.try_send(operation) {
            Ok(()) => {
                self.shared.stats.queued.fetch_add(1, Ordering::Relaxed);
                if pending >= self.shared.settings.load().max_batch_size() {
                    self.shared.batch_ready.notify_one();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(dropped) = self.shared.drop_log.record(self.shared.clock.now()) {
                    warn!("REPORTER | Queue full, dropped {dropped} document(s)");
                }
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::Closed)
            }
        }
    }

    /// Sends everything queued so far, returning how many operations were
    /// handed to the transport.
    pub async fn flush(&self) -> Result<usize, SubmitError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ReporterCommand::Flush(response_tx))
            .map_err(|_| SubmitError::Closed)?;
        response_rx.await.map_err(|_| SubmitError::Closed)
    }

    /// Stops accepting documents, flushes what is queued and waits for the
    /// service to stop, giving up after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ReporterCommand::Shutdown(done_tx))
            .is_err()
        {
            debug!("REPORTER | Service already stopped");
            return Ok(());
        }
        match tokio::time::timeout(timeout, done_rx).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("REPORTER | Shutdown timed out after {timeout:?}, queued documents lost");
                Err(ShutdownError::Timeout(timeout))
            }
        }
    }

    /// Applies new flush settings. A smaller batch size takes effect at once;
    /// a new delay re-arms the running timer period from its start.
    pub fn update_settings(&self, settings: ReporterSettings) {
        self.shared.settings.store(Arc::new(settings));
        self.shared.settings_changed.notify_one();
        if self.shared.pending.load(Ordering::Acquire) >= settings.max_batch_size() {
            self.shared.batch_ready.notify_one();
        }
    }

    #[must_use]
    pub fn settings(&self) -> ReporterSettings {
        **self.shared.settings.load()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> ReporterStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

/// Single consumer of the queue. At most one bulk request is in flight.
pub struct ReporterService {
    queue_rx: mpsc::Receiver<BulkOperation>,
    command_rx: mpsc::UnboundedReceiver<ReporterCommand>,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
}

impl ReporterService {
    #[must_use]
    pub fn new(
        settings: ReporterSettings,
        max_queue_size: usize,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> (Self, BatchReporter) {
        let (queue_tx, queue_rx) = mpsc::channel(max_queue_size.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            settings: ArcSwap::from_pointee(settings),
            pending: AtomicUsize::new(0),
            batch_ready: Notify::new(),
            settings_changed: Notify::new(),
            stats: ReporterStats::default(),
            drop_log: LogThrottle::new(DROP_LOG_WINDOW),
            clock,
        });

        let service = Self {
            queue_rx,
            command_rx,
            shared: Arc::clone(&shared),
            transport,
        };
        let handle = BatchReporter {
            queue_tx,
            command_tx,
            shared,
        };
        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("REPORTER | Service started");
        let mut period_start = Instant::now();
        let mut next_flush = deadline_after(period_start, self.flush_delay());

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(ReporterCommand::Flush(response_tx)) => {
                        let sent = self.flush_pending().await;
                        if response_tx.send(sent).is_err() {
                            debug!("REPORTER | Flush requester went away");
                        }
                    }
                    Some(ReporterCommand::Shutdown(done_tx)) => {
                        debug!("REPORTER | Service shutting down");
                        self.drain().await;
                        if done_tx.send(()).is_err() {
                            debug!("REPORTER | Shutdown requester went away");
                        }
                        break;
                    }
                    None => {
                        debug!("REPORTER | All handles dropped");
                        self.drain().await;
                        break;
                    }
                },
                () = self.shared.batch_ready.notified() => {
                    self.flush_full_batches().await;
                }
                () = self.shared.settings_changed.notified() => {
                    next_flush = deadline_after(period_start, self.flush_delay());
                }
                () = sleep_until(next_flush) => {
                    self.flush_batch().await;
                    self.flush_full_batches().await;
                    period_start = Instant::now();
                    next_flush = deadline_after(period_start, self.flush_delay());
                }
            }
        }

        debug!("REPORTER | Service stopped");
    }

    fn max_batch_size(&self) -> usize {
        self.shared.settings.load().max_batch_size()
    }

    fn flush_delay(&self) -> Duration {
        self.shared.settings.load().flush_delay()
    }

    /// Keeps flushing while at least one full batch is waiting.
    async fn flush_full_batches(&mut self) {
        while self.shared.pending.load(Ordering::Acquire) >= self.max_batch_size() {
            if self.flush_batch().await == 0 {
                break;
            }
        }
    }

    /// Flushes what was pending when called. Later arrivals wait for the
    /// next trigger.
    async fn flush_pending(&mut self) -> usize {
        let mut remaining = self.shared.pending.load(Ordering::Acquire);
        let mut sent = 0;
        while remaining > 0 {
            let count = self.flush_batch().await;
            if count == 0 {
                break;
            }
            sent += count;
            remaining = remaining.saturating_sub(count);
        }
        sent
    }

    async fn drain(&mut self) {
        self.queue_rx.close();
        let mut sent = 0;
        loop {
            let count = self.flush_batch().await;
            if count == 0 {
                break;
            }
            sent += count;
        }
        debug!("REPORTER | Drained {sent} operation(s)");
    }

    /// Takes up to one batch off the queue and writes it in a single bulk
    /// request. A failed batch is logged and discarded.
    async fn flush_batch(&mut self) -> usize {
        let max_batch_size = self.max_batch_size();
        let mut batch = Vec::with_capacity(max_batch_size);
        while batch.len() < max_batch_size {
            match self.queue_rx.try_recv() {
                Ok(operation) => {
                    self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                    batch.push(operation);
                }
                Err(_) => break,
            }
        }

        let count = batch.len();
        if count == 0 {
            return 0;
        }

        let groups = group_by_index(batch);
        let stats = &self.shared.stats;
        stats.flushes.fetch_add(1, Ordering::Relaxed);
        match self.transport.bulk_write(&groups).await {
            Ok(outcomes) => {
                let failed = outcomes
                    .iter()
                    .filter(|outcome| matches!(outcome, BulkItemOutcome::Failed { .. }))
                    .count();
                bump(&stats.flushed, count.saturating_sub(failed));
                if failed > 0 {
                    bump(&stats.failed, failed);
                    warn!("REPORTER | Backend rejected {failed} of {count} operation(s)");
                } else {
                    debug!(
                        "REPORTER | Flushed {count} operation(s) to {} index(es)",
                        groups.len()
                    );
                }
            }
            Err(e) => {
                bump(&stats.failed, count);
                error!("REPORTER | Failed to write {count} operation(s), dropping batch: {e}");
            }
        }
        count
    }
}
