// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reporting boundary for monitored requests: decides whether a request is
//! profiled, whether its document is kept, and builds that document.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::call_tree::CallTree;
use crate::clock::Clock;
use crate::document::{CorrelationKeys, SampledDocument};
use crate::error::SubmitError;
use crate::profiler::Profiler;
use crate::rate_limiter::{RateLimiterRegistry, ReloadableLimiter};
use crate::reporter::BatchReporter;

/// State of one monitored request. Owned by the context executing it.
#[derive(Debug)]
pub struct RequestContext {
    name: String,
    correlation: Option<CorrelationKeys>,
    started_at: Duration,
    profiler: Profiler,
}

impl RequestContext {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_profiled(&self) -> bool {
        self.profiler.is_active()
    }

    pub fn start(&mut self, signature: &str) {
        self.profiler.start(signature);
    }

    pub fn stop(&mut self) {
        self.profiler.stop();
    }

    pub fn profiler(&mut self) -> &mut Profiler {
        &mut self.profiler
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Submitted,
    /// The reporting limiter for the request name refused it.
    RateLimited,
    /// The reporter refused it; the document is lost.
    Dropped(SubmitError),
}

#[derive(Debug, Clone)]
pub struct RequestMonitor {
    clock: Arc<dyn Clock>,
    profiling: Arc<ReloadableLimiter>,
    reporting: Arc<RateLimiterRegistry>,
    reporter: BatchReporter,
    request_index: String,
    min_execution_time: Duration,
}

impl RequestMonitor {
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        profiling: Arc<ReloadableLimiter>,
        reporting: Arc<RateLimiterRegistry>,
        reporter: BatchReporter,
        request_index: impl Into<String>,
        min_execution_time: Duration,
    ) -> Self {
        RequestMonitor {
            clock,
            profiling,
            reporting,
            reporter,
            request_index: request_index.into(),
            min_execution_time,
        }
    }

    /// Opens a request. Call-tree collection is switched on only when the
    /// profiling limiter admits it.
    #[must_use]
    pub fn begin(&self, name: &str, correlation: Option<CorrelationKeys>) -> RequestContext {
        let mut profiler = Profiler::new(Arc::clone(&self.clock), self.min_execution_time);
        if self.profiling.try_acquire(1.0) {
            profiler.activate(name);
        }
        RequestContext {
            name: name.to_string(),
            correlation,
            started_at: self.clock.now(),
            profiler,
        }
    }

    /// Closes a request and, if reporting admits its name, queues its
    /// document. Never waits on the backend.
    pub fn finish(&self, context: RequestContext) -> ReportOutcome {
        let RequestContext {
            name,
            correlation,
            started_at,
            mut profiler,
        } = context;
        let tree = profiler.deactivate();
        let now = self.clock.now();

        if !self.reporting.try_acquire(&name, 1.0) {
            debug!("MONITOR | Request '{name}' not reported: rate limited");
            return ReportOutcome::RateLimited;
        }

        let payload = request_payload(
            &name,
            started_at,
            now.saturating_sub(started_at),
            tree.as_ref(),
        );
        let document = SampledDocument::new(self.request_index.clone(), payload, correlation, now);
        match self.reporter.submit(document) {
            Ok(()) => ReportOutcome::Submitted,
            Err(e) => {
                debug!("MONITOR | Request '{name}' not reported: {e}");
                ReportOutcome::Dropped(e)
            }
        }
    }
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn request_payload(
    name: &str,
    started_at: Duration,
    execution_time: Duration,
    tree: Option<&CallTree>,
) -> Value {
    let mut payload = Map::new();
    payload.insert("name".to_string(), json!(name));
    payload.insert("@timestamp_ns".to_string(), json!(nanos(started_at)));
    payload.insert("execution_time_ns".to_string(), json!(nanos(execution_time)));
    if let Some(tree) = tree {
        match serde_json::to_value(tree.flat_frames()) {
            Ok(frames) => {
                payload.insert("call_tree".to_string(), frames);
            }
            Err(e) => debug!("MONITOR | Could not serialize call tree of '{name}': {e}"),
        }
        payload.insert("call_tree_ascii".to_string(), json!(tree.render()));
    }
    Value::Object(payload)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::document::{
        BulkGroup, BulkItemOutcome, BulkOperation, CorrelationQuery, SearchOutcome,
    };
    use crate::rate_limiter::RateLimit;
    use crate::reporter::{ReporterService, ReporterSettings};
    use crate::transport::{Transport, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        groups: Mutex<Vec<BulkGroup>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn bulk_write(
            &self,
            groups: &[BulkGroup],
        ) -> Result<Vec<BulkItemOutcome>, TransportError> {
            self.groups.lock().unwrap().extend_from_slice(groups);
            Ok(Vec::new())
        }

        async fn multi_search(
            &self,
            queries: &[CorrelationQuery],
        ) -> Result<Vec<SearchOutcome>, TransportError> {
            Ok(vec![SearchOutcome::Miss; queries.len()])
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        recorder: Arc<Recorder>,
        reporter: BatchReporter,
        monitor: RequestMonitor,
    }

    fn fixture(profiling: RateLimit, reporting: RateLimit) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let recorder = Arc::new(Recorder::default());
        let (service, reporter) = ReporterService::new(
            ReporterSettings::default(),
            100,
            recorder.clone(),
            clock.clone(),
        );
        tokio::spawn(service.run());
        let monitor = RequestMonitor::new(
            clock.clone(),
            Arc::new(ReloadableLimiter::new(profiling, clock.clone())),
            Arc::new(RateLimiterRegistry::new(reporting, clock.clone())),
            reporter.clone(),
            "requests",
            Duration::from_millis(2),
        );
        Fixture {
            clock,
            recorder,
            reporter,
            monitor,
        }
    }

    /// Document bodies as the backend receives them.
    fn submitted_payloads(recorder: &Recorder) -> Vec<Value> {
        recorder
            .groups
            .lock()
            .unwrap()
            .iter()
            .flat_map(|group| group.operations.iter())
            .filter_map(|operation| match operation {
                BulkOperation::Index(document) => Some(document.source().into_owned()),
                BulkOperation::Update(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_profiled_request_document() {
        let f = fixture(RateLimit::Unbounded, RateLimit::Unbounded);
        let mut context = f
            .monitor
            .begin("GET /checkout", Some(CorrelationKeys::new("t1", "s1")));
        assert!(context.is_profiled());

        f.clock.advance(Duration::from_millis(5));
        context.start("db.query");
        f.clock.advance(Duration::from_millis(3));
        context.stop();
        f.clock.advance(Duration::from_millis(1));
        assert_eq!(f.monitor.finish(context), ReportOutcome::Submitted);

        f.reporter.flush().await.unwrap();
        let payloads = submitted_payloads(&f.recorder);
        assert_eq!(payloads.len(), 1);
        let payload = &payloads[0];
        assert_eq!(payload["name"], "GET /checkout");
        assert_eq!(payload["execution_time_ns"], 9_000_000);
        assert_eq!(payload["trace_id"], "t1");
        assert_eq!(payload["span_id"], "s1");
        assert_eq!(payload["call_tree"][0]["signature"], "GET /checkout");
        assert_eq!(payload["call_tree"][1]["signature"], "db.query");
        assert_eq!(payload["call_tree"][1]["depth"], 1);
        assert!(payload["call_tree_ascii"]
            .as_str()
            .unwrap()
            .contains("db.query"));
        assert_eq!(
            f.recorder.groups.lock().unwrap()[0].index,
            "requests".to_string()
        );
    }

    #[tokio::test]
    async fn test_unprofiled_request_still_reported() {
        let f = fixture(RateLimit::Disabled, RateLimit::Unbounded);
        let mut context = f.monitor.begin("GET /health", None);
        assert!(!context.is_profiled());
        context.start("ignored");
        context.stop();
        assert_eq!(f.monitor.finish(context), ReportOutcome::Submitted);

        f.reporter.flush().await.unwrap();
        let payloads = submitted_payloads(&f.recorder);
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].get("call_tree").is_none());
        assert!(payloads[0].get("trace_id").is_none());
    }

    #[tokio::test]
    async fn test_reporting_limited_per_name() {
        let f = fixture(RateLimit::Unbounded, RateLimit::with_capacity(1.0, 1.0));
        let first = f.monitor.begin("GET /a", None);
        assert_eq!(f.monitor.finish(first), ReportOutcome::Submitted);
        let second = f.monitor.begin("GET /a", None);
        assert_eq!(f.monitor.finish(second), ReportOutcome::RateLimited);
        let other = f.monitor.begin("GET /b", None);
        assert_eq!(f.monitor.finish(other), ReportOutcome::Submitted);

        f.clock.advance(Duration::from_secs(1));
        let later = f.monitor.begin("GET /a", None);
        assert_eq!(f.monitor.finish(later), ReportOutcome::Submitted);
    }
}
