// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Collapses a stream of identical events into at most one log line per
/// window.
#[derive(Debug)]
pub(crate) struct LogThrottle {
    window_nanos: u64,
    /// Time of the last emitted line plus one; zero means never.
    last_emit: AtomicU64,
    suppressed: AtomicU64,
}

impl LogThrottle {
    pub(crate) fn new(window: Duration) -> Self {
        LogThrottle {
            window_nanos: u64::try_from(window.as_nanos()).unwrap_or(u64::MAX),
            last_emit: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Records one event at `now`. Returns the number of events to report
    /// when a line should be emitted.
    pub(crate) fn record(&self, now: Duration) -> Option<u64> {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        let now = u64::try_from(now.as_nanos()).unwrap_or(u64::MAX - 1) + 1;
        let last = self.last_emit.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.window_nanos {
            return None;
        }
        self.last_emit
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.suppressed.swap(0, Ordering::Relaxed))
    }
}
