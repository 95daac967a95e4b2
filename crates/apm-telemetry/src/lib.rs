// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry core of an APM agent: per-request call trees, token-bucket
//! sampling, batched bulk reporting to a search backend and deferred
//! reconciliation of already written documents.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod call_tree;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod http_transport;
pub mod logger;
pub mod monitor;
pub mod pipeline;
pub mod profiler;
pub mod rate_limiter;
pub mod reconciliation;
pub mod reporter;
mod throttle;
pub mod transport;

pub use call_tree::{CallTree, FlatFrame, Frame, FrameId};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Config, RateLimits};
pub use document::{
    BulkGroup, BulkItemOutcome, BulkOperation, CorrelationKeys, CorrelationQuery, DocumentPatch,
    SampledDocument, SearchOutcome,
};
pub use error::{ConfigError, LoggerError, ShutdownError, SubmitError, UpdateRequestError};
pub use http_transport::HttpTransport;
pub use monitor::{ReportOutcome, RequestContext, RequestMonitor};
pub use pipeline::TelemetryPipeline;
pub use profiler::Profiler;
pub use rate_limiter::{Limiter, RateLimit, RateLimiterRegistry, ReloadableLimiter, TokenBucket};
pub use reconciliation::{
    ReconciliationService, ReconciliationSettings, ReconciliationStatsSnapshot,
    ReconciliationWorker, UpdateDescription,
};
pub use reporter::{BatchReporter, ReporterService, ReporterSettings, ReporterStatsSnapshot};
pub use transport::{Transport, TransportError};
