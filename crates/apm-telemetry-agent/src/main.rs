// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads one JSON object per line from stdin and feeds it to the telemetry
//! pipeline until stdin closes or Ctrl+C:
//!
//! ```text
//! {"op":"index","index":"spans","document":{...},"trace_id":"t1","span_id":"s1"}
//! {"op":"update","trace_id":"t1","span_id":"s1","fields":{...}}
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use std::time::Duration;

use apm_telemetry::{
    logger, Clock, Config, CorrelationKeys, HttpTransport, MonotonicClock, SampledDocument,
    TelemetryPipeline,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Input {
    Index {
        index: String,
        document: Value,
        trace_id: Option<String>,
        span_id: Option<String>,
    },
    Update {
        trace_id: String,
        span_id: String,
        fields: Map<String, Value>,
    },
}

#[tokio::main]
pub async fn main() {
    let config = Config::new();
    let log_level = config.as_ref().map_or("info", |c| c.log_level.as_str());
    if let Err(e) = logger::init(log_level) {
        eprintln!("APM | ERROR | Could not install logger: {e}");
    }
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("AGENT | Could not read configuration: {e}");
            return;
        }
    };

    let transport = match HttpTransport::from_config(&config) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("AGENT | Could not build backend client: {e}");
            return;
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let pipeline = TelemetryPipeline::start(&config, transport, Arc::clone(&clock));
    info!("AGENT | Forwarding stdin to {}", config.backend_url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stats_interval = interval(STATS_INTERVAL);
    stats_interval.tick().await; // discard first tick, which is instantaneous
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&pipeline, clock.as_ref(), &line),
                Ok(None) => {
                    debug!("AGENT | Input closed");
                    break;
                }
                Err(e) => {
                    error!("AGENT | Could not read input: {e}");
                    break;
                }
            },
            result = &mut interrupted => {
                match result {
                    Ok(()) => info!("AGENT | Received Ctrl+C, shutting down"),
                    Err(e) => error!("AGENT | Failed to listen for Ctrl+C: {e}"),
                }
                break;
            }
            _ = stats_interval.tick() => log_stats(&pipeline),
        }
    }

    log_stats(&pipeline);
    if let Err(e) = pipeline.shutdown().await {
        warn!("AGENT | {e}");
    }
}

fn handle_line(pipeline: &TelemetryPipeline, clock: &dyn Clock, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let input = match serde_json::from_str::<Input>(line) {
        Ok(input) => input,
        Err(e) => {
            warn!("AGENT | Skipping malformed line: {e}");
            return;
        }
    };
    match input {
        Input::Index {
            index,
            document,
            trace_id,
            span_id,
        } => {
            let keys = correlation(trace_id, span_id);
            let document = SampledDocument::new(index, document, keys, clock.now());
            if let Err(e) = pipeline.reporter().submit(document) {
                debug!("AGENT | Document not queued: {e}");
            }
        }
        Input::Update {
            trace_id,
            span_id,
            fields,
        } => {
            let keys = CorrelationKeys::new(trace_id, span_id);
            if let Err(e) = pipeline
                .reconciliation()
                .request_update_with_defaults(keys, fields)
            {
                debug!("AGENT | Update not scheduled: {e}");
            }
        }
    }
}

/// Both keys or neither.
fn correlation(trace_id: Option<String>, span_id: Option<String>) -> Option<CorrelationKeys> {
    match (trace_id, span_id) {
        (Some(trace_id), Some(span_id)) => Some(CorrelationKeys::new(trace_id, span_id)),
        _ => None,
    }
}

fn log_stats(pipeline: &TelemetryPipeline) {
    let stats = serde_json::json!({
        "reporter": pipeline.reporter().stats(),
        "reconciliation": pipeline.reconciliation().stats(),
    });
    info!("AGENT | Stats {stats}");
}
