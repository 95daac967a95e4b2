// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{deadline_after, Clock, MonotonicClock};
use crate::config::Config;
use crate::error::ShutdownError;
use crate::http_transport::HttpTransport;
use crate::monitor::RequestMonitor;
use crate::rate_limiter::{RateLimiterRegistry, ReloadableLimiter};
use crate::reconciliation::{ReconciliationService, ReconciliationSettings, ReconciliationWorker};
use crate::reporter::{BatchReporter, ReporterService, ReporterSettings};
use crate::transport::{Transport, TransportError};

/// Every background service of the telemetry core, started from one
/// [`Config`]. Must be started inside a tokio runtime.
pub struct TelemetryPipeline {
    monitor: RequestMonitor,
    reporter: BatchReporter,
    reconciliation: ReconciliationWorker,
    profiling_limiter: Arc<ReloadableLimiter>,
    reporting_limiters: Arc<RateLimiterRegistry>,
    cancel_token: CancellationToken,
    reporter_task: JoinHandle<()>,
    reconciliation_task: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl TelemetryPipeline {
    /// Starts the pipeline against the HTTP search backend named in `config`.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let transport = Arc::new(HttpTransport::from_config(config)?);
        Ok(Self::start(config, transport, Arc::new(MonotonicClock::new())))
    }

    #[must_use]
    pub fn start(config: &Config, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        let profiling_limiter = Arc::new(ReloadableLimiter::new(
            config.profiler_rate,
            Arc::clone(&clock),
        ));
        let reporting_limiters = Arc::new(
            RateLimiterRegistry::new(config.default_reporting_rate, Arc::clone(&clock))
                .with_overrides(
                    config
                        .reporting_rate_limits
                        .limits()
                        .iter()
                        .map(|(name, limit)| (name.clone(), *limit)),
                )
                .with_max_tracked(config.max_tracked_categories),
        );

        let (reporter_service, reporter) = ReporterService::new(
            ReporterSettings::from_config(config),
            config.max_queue_size,
            Arc::clone(&transport),
            Arc::clone(&clock),
        );
        let (reconciliation_service, reconciliation) = ReconciliationService::new(
            ReconciliationSettings::from_config(config),
            transport,
            reporter.clone(),
            Arc::clone(&clock),
        );
        let monitor = RequestMonitor::new(
            clock,
            Arc::clone(&profiling_limiter),
            Arc::clone(&reporting_limiters),
            reporter.clone(),
            config.request_index.clone(),
            config.min_execution_time,
        );

        let cancel_token = CancellationToken::new();
        let reporter_task = tokio::spawn(reporter_service.run());
        let reconciliation_task = tokio::spawn(reconciliation_service.run(cancel_token.clone()));
        debug!("PIPELINE | Telemetry pipeline started");

        TelemetryPipeline {
            monitor,
            reporter,
            reconciliation,
            profiling_limiter,
            reporting_limiters,
            cancel_token,
            reporter_task,
            reconciliation_task,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    #[must_use]
    pub fn monitor(&self) -> &RequestMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn reporter(&self) -> &BatchReporter {
        &self.reporter
    }

    #[must_use]
    pub fn reconciliation(&self) -> &ReconciliationWorker {
        &self.reconciliation
    }

    #[must_use]
    pub fn profiling_limiter(&self) -> &ReloadableLimiter {
        &self.profiling_limiter
    }

    #[must_use]
    pub fn reporting_limiters(&self) -> &RateLimiterRegistry {
        &self.reporting_limiters
    }

    /// Stops reconciliation, then drains the reporter. Both steps share the
    /// configured shutdown timeout; tasks still running when it runs out are
    /// aborted.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        let timeout = self.shutdown_timeout;
        let deadline = deadline_after(Instant::now(), timeout);
        let mut timed_out = false;

        self.cancel_token.cancel();
        if tokio::time::timeout_at(deadline, &mut self.reconciliation_task)
            .await
            .is_err()
        {
            warn!("PIPELINE | Reconciliation worker did not stop in time, aborting it");
            self.reconciliation_task.abort();
            timed_out = true;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.reporter.shutdown(remaining).await.is_err() {
            self.reporter_task.abort();
            timed_out = true;
        }

        if timed_out {
            return Err(ShutdownError::Timeout(timeout));
        }
        debug!("PIPELINE | Telemetry pipeline stopped");
        Ok(())
    }
}
