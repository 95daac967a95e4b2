// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-in for the search backend

use apm_telemetry::http_transport::{SPAN_ID_FIELD, TRACE_ID_FIELD};
use apm_telemetry::{
    BulkGroup, BulkItemOutcome, BulkOperation, Clock, CorrelationKeys, CorrelationQuery,
    SearchOutcome, Transport, TransportError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// One bulk request as received, stamped with tokio time.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub at: Instant,
    pub groups: Vec<BulkGroup>,
}

struct Stored {
    index: String,
    id: String,
    visible_at: Duration,
}

/// Records bulk writes and answers searches for documents whose stored
/// body carries the searched keys, once their refresh latency has elapsed.
/// Can be blocked or made to fail.
pub struct RecordingTransport {
    clock: Arc<dyn Clock>,
    refresh_latency: Duration,
    writes: Mutex<Vec<RecordedWrite>>,
    searches: Mutex<Vec<Vec<CorrelationQuery>>>,
    stored: Mutex<HashMap<CorrelationKeys, Stored>>,
    next_id: AtomicUsize,
    blocked: watch::Sender<bool>,
    fail_writes: AtomicBool,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn new(clock: Arc<dyn Clock>, refresh_latency: Duration) -> Self {
        let (blocked, _) = watch::channel(false);
        RecordingTransport {
            clock,
            refresh_latency,
            writes: Mutex::new(Vec::new()),
            searches: Mutex::new(Vec::new()),
            stored: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            blocked,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes a document findable by `keys` from `visible_at` on.
    pub fn store(&self, keys: CorrelationKeys, index: &str, id: &str, visible_at: Duration) {
        self.stored.lock().unwrap().insert(
            keys,
            Stored {
                index: index.to_string(),
                id: id.to_string(),
                visible_at,
            },
        );
    }

    /// Holds every bulk write until [`Self::unblock`].
    pub fn block(&self) {
        self.blocked.send_replace(true);
    }

    pub fn unblock(&self) {
        self.blocked.send_replace(false);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn search_count(&self) -> usize {
        self.searches.lock().unwrap().len()
    }
}

/// Keys a search can match on, read from the body as the backend stores it.
fn stored_keys(source: &Value) -> Option<CorrelationKeys> {
    let trace_id = source.get(TRACE_ID_FIELD)?.as_str()?;
    let span_id = source.get(SPAN_ID_FIELD)?.as_str()?;
    Some(CorrelationKeys::new(trace_id, span_id))
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn bulk_write(
        &self,
        groups: &[BulkGroup],
    ) -> Result<Vec<BulkItemOutcome>, TransportError> {
        let mut blocked = self.blocked.subscribe();
        let _ = blocked.wait_for(|blocked| !*blocked).await;

        self.writes.lock().unwrap().push(RecordedWrite {
            at: Instant::now(),
            groups: groups.to_vec(),
        });
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        let visible_at = self.clock.now() + self.refresh_latency;
        let mut outcomes = Vec::new();
        for group in groups {
            for operation in &group.operations {
                match operation {
                    BulkOperation::Index(document) => {
                        let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                        if let Some(keys) = stored_keys(&document.source()) {
                            self.store(keys, &group.index, &id, visible_at);
                        }
                        outcomes.push(BulkItemOutcome::Stored { id });
                    }
                    BulkOperation::Update(patch) => outcomes.push(BulkItemOutcome::Stored {
                        id: patch.id.clone(),
                    }),
                }
            }
        }
        Ok(outcomes)
    }

    async fn multi_search(
        &self,
        queries: &[CorrelationQuery],
    ) -> Result<Vec<SearchOutcome>, TransportError> {
        self.searches.lock().unwrap().push(queries.to_vec());
        let now = self.clock.now();
        let stored = self.stored.lock().unwrap();
        Ok(queries
            .iter()
            .map(|query| match stored.get(&query.keys) {
                Some(document) if now >= document.visible_at => SearchOutcome::Hit {
                    index: document.index.clone(),
                    id: document.id.clone(),
                },
                _ => SearchOutcome::Miss,
            })
            .collect())
    }
}
