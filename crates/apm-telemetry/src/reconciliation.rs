// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deferred patches for documents whose backend id is unknown at write time.
//! The worker finds them by correlation keys with batched searches and hands
//! the patch to the reporter once found, or gives up at the deadline.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::document::{CorrelationKeys, CorrelationQuery, DocumentPatch, SearchOutcome};
use crate::error::UpdateRequestError;
use crate::reporter::BatchReporter;
use crate::throttle::LogThrottle;
use crate::transport::Transport;

const DROP_LOG_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationSettings {
    /// Period of the background loop.
    pub interval: Duration,
    /// Default wait before the first search.
    pub not_before_delay: Duration,
    /// Default time after which an unresolved update is dropped.
    pub deadline: Duration,
    /// Bound on requests waiting for the worker, queued and in progress.
    pub queue_size: usize,
    /// Index pattern searched for correlation keys; `None` searches all.
    pub search_index: Option<String>,
}

impl ReconciliationSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        ReconciliationSettings {
            interval: config.reconciliation_interval,
            not_before_delay: config.not_before_delay,
            deadline: config.reconciliation_deadline,
            queue_size: config.reconciliation_queue_size,
            search_index: Some(config.request_index.clone()),
        }
    }
}

/// A requested patch waiting for its target document to become searchable.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDescription {
    pub keys: CorrelationKeys,
    pub patch: Map<String, Value>,
    /// Earliest monotonic time at which searching makes sense.
    pub not_before: Duration,
    /// Monotonic time at which the update is abandoned.
    pub not_after: Duration,
    pub resolved_id: Option<String>,
}

impl UpdateDescription {
    #[must_use]
    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.not_before
    }

    #[must_use]
    pub fn is_expired(&self, now: Duration) -> bool {
        now >= self.not_after
    }
}

#[derive(Debug, Default)]
pub struct ReconciliationStats {
    requested: AtomicU64,
    reconciled: AtomicU64,
    expired: AtomicU64,
    dropped: AtomicU64,
    search_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationStatsSnapshot {
    pub requested: u64,
    /// Patches handed to the reporter.
    pub reconciled: u64,
    /// Given up after the deadline.
    pub expired: u64,
    /// Shed at request time or refused by the reporter.
    pub dropped: u64,
    pub search_failures: u64,
}

impl ReconciliationStats {
    #[must_use]
    pub fn snapshot(&self) -> ReconciliationStatsSnapshot {
        ReconciliationStatsSnapshot {
            requested: self.requested.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            search_failures: self.search_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Shared {
    settings: ReconciliationSettings,
    stats: ReconciliationStats,
    drop_log: LogThrottle,
    clock: Arc<dyn Clock>,
}

/// Producer side of the reconciliation worker.
#[derive(Debug, Clone)]
pub struct ReconciliationWorker {
    tx: mpsc::Sender<UpdateDescription>,
    shared: Arc<Shared>,
}

impl ReconciliationWorker {
    /// Asks for `patch` to be applied to the document carrying `keys`.
    /// Searching starts after `not_before_delay`; the request is dropped
    /// once `deadline` has passed. Never waits.
    pub fn request_update(
        &self,
        keys: CorrelationKeys,
        patch: Map<String, Value>,
        not_before_delay: Duration,
        deadline: Duration,
    ) -> Result<(), UpdateRequestError> {
        if !keys.is_valid() {
            return Err(UpdateRequestError::MissingCorrelationKeys);
        }
        if patch.is_empty() {
            return Err(UpdateRequestError::EmptyPatch);
        }

        let now = self.shared.clock.now();
        let description = UpdateDescription {
            keys,
            patch,
            not_before: now.saturating_add(not_before_delay),
            not_after: now.saturating_add(deadline),
            resolved_id: None,
        };
        match self.tx.try_send(description) {
            Ok(()) => {
                self.shared.stats.requested.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(dropped) = self.shared.drop_log.record(now) {
                    warn!("RECONCILIATION | Queue full, dropped {dropped} update request(s)");
                }
                Err(UpdateRequestError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(UpdateRequestError::Closed),
        }
    }

    /// Same as [`Self::request_update`] with the configured delay and deadline.
    pub fn request_update_with_defaults(
        &self,
        keys: CorrelationKeys,
        patch: Map<String, Value>,
    ) -> Result<(), UpdateRequestError> {
        let settings = &self.shared.settings;
        self.request_update(keys, patch, settings.not_before_delay, settings.deadline)
    }

    #[must_use]
    pub fn stats(&self) -> ReconciliationStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

pub struct ReconciliationService {
    rx: mpsc::Receiver<UpdateDescription>,
    /// Descriptions taken off the queue and still unresolved.
    pending: Vec<UpdateDescription>,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    reporter: BatchReporter,
}

impl ReconciliationService {
    #[must_use]
    pub fn new(
        settings: ReconciliationSettings,
        transport: Arc<dyn Transport>,
        reporter: BatchReporter,
        clock: Arc<dyn Clock>,
    ) -> (Self, ReconciliationWorker) {
        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let shared = Arc::new(Shared {
            settings,
            stats: ReconciliationStats::default(),
            drop_log: LogThrottle::new(DROP_LOG_WINDOW),
            clock,
        });
        let service = Self {
            rx,
            pending: Vec::new(),
            shared: Arc::clone(&shared),
            transport,
            reporter,
        };
        (service, ReconciliationWorker { tx, shared })
    }

    pub async fn run(mut self, cancel_token: CancellationToken) {
        debug!("RECONCILIATION | Worker started");
        let period = self.shared.settings.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.rx.close();
        let mut abandoned = self.pending.len();
        while self.rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            debug!("RECONCILIATION | Worker stopped with {abandoned} unresolved update(s)");
        } else {
            debug!("RECONCILIATION | Worker stopped");
        }
    }

    #[must_use]
    pub fn pending(&self) -> &[UpdateDescription] {
        &self.pending
    }

    /// One pass: take new requests, drop expired ones, search for the due
    /// ones and patch every hit. Misses and failed searches wait for the next
    /// pass.
    pub async fn tick(&mut self) {
        let capacity = self.shared.settings.queue_size.max(1);
        while self.pending.len() < capacity {
            match self.rx.try_recv() {
                Ok(description) => self.pending.push(description),
                Err(_) => break,
            }
        }
        if self.pending.is_empty() {
            return;
        }

        let now = self.shared.clock.now();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for description in std::mem::take(&mut self.pending) {
            if description.is_expired(now) {
                self.expire(&description);
            } else if description.is_due(now) {
                ready.push(description);
            } else {
                waiting.push(description);
            }
        }
        self.pending = waiting;
        if ready.is_empty() {
            return;
        }

        let queries: Vec<CorrelationQuery> = ready
            .iter()
            .map(|description| CorrelationQuery {
                index: self.shared.settings.search_index.clone(),
                keys: description.keys.clone(),
            })
            .collect();
        let outcomes = match self.transport.multi_search(&queries).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                bump(&self.shared.stats.search_failures, queries.len());
                error!(
                    "RECONCILIATION | Search for {} update(s) failed: {e}",
                    queries.len()
                );
                Vec::new()
            }
        };

        let now = self.shared.clock.now();
        for (position, mut description) in ready.into_iter().enumerate() {
            match outcomes.get(position) {
                Some(SearchOutcome::Hit { index, id }) => {
                    description.resolved_id = Some(id.clone());
                    self.apply(index, id, description);
                    continue;
                }
                Some(SearchOutcome::Failed { reason }) => {
                    self.shared
                        .stats
                        .search_failures
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "RECONCILIATION | Search for trace {} failed: {reason}",
                        description.keys.trace_id
                    );
                }
                Some(SearchOutcome::Miss) | None => {}
            }

            if description.is_expired(now) {
                self.expire(&description);
            } else {
                self.pending.push(description);
            }
        }
    }

    fn apply(&self, index: &str, id: &str, description: UpdateDescription) {
        let patch = DocumentPatch {
            index: index.to_string(),
            id: id.to_string(),
            fields: description.patch,
        };
        match self.reporter.submit_patch(patch) {
            Ok(()) => {
                self.shared.stats.reconciled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "RECONCILIATION | Resolved trace {} span {} to {index}/{id}",
                    description.keys.trace_id, description.keys.span_id
                );
            }
            Err(e) => {
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("RECONCILIATION | Could not schedule patch for {index}/{id}: {e}");
            }
        }
    }

    fn expire(&self, description: &UpdateDescription) {
        self.shared.stats.expired.fetch_add(1, Ordering::Relaxed);
        debug!(
            "RECONCILIATION | Dropping update for trace {} span {}: not found before deadline",
            description.keys.trace_id, description.keys.span_id
        );
    }
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(u64::try_from(by).unwrap_or(u64::MAX), Ordering::Relaxed);
}
