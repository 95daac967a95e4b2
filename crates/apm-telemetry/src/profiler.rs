// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-execution-context call-tree profiler.
//!
//! A [`Profiler`] is owned by exactly one execution context (one logical
//! request) and is never shared, so it needs no synchronization. When no root
//! frame has been activated every `start`/`stop` is a cheap no-op.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::call_tree::{CallTree, FrameId};
use crate::clock::Clock;

#[derive(Debug)]
pub struct Profiler {
    clock: Arc<dyn Clock>,
    /// Non-root frames that finish faster than this are pruned.
    min_execution_nanos: i64,
    tree: Option<CallTree>,
    cursor: Option<FrameId>,
}

impl Profiler {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, min_execution_time: Duration) -> Self {
        Profiler {
            clock,
            min_execution_nanos: i64::try_from(min_execution_time.as_nanos()).unwrap_or(i64::MAX),
            tree: None,
            cursor: None,
        }
    }

    /// True once a root frame exists.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tree.is_some()
    }

    #[must_use]
    pub fn tree(&self) -> Option<&CallTree> {
        self.tree.as_ref()
    }

    /// Starts a new call tree rooted at `root_signature`.
    ///
    /// A tree that was still being recorded is discarded.
    pub fn activate(&mut self, root_signature: &str) {
        if self.tree.is_some() {
            debug!("PROFILER | Discarding unfinished call tree before activating {root_signature}");
        }
        let tree = CallTree::new(root_signature, self.clock.now_nanos());
        self.cursor = Some(tree.root());
        self.tree = Some(tree);
    }

    /// Opens a child frame under the cursor and moves the cursor onto it.
    pub fn start(&mut self, signature: &str) {
        let (Some(tree), Some(cursor)) = (self.tree.as_mut(), self.cursor) else {
            return;
        };
        if let Some(child) = tree.push_child(cursor, signature, self.clock.now_nanos()) {
            self.cursor = Some(child);
        }
    }

    /// Closes the cursor frame and moves the cursor back to its parent.
    pub fn stop(&mut self) {
        let (Some(tree), Some(cursor)) = (self.tree.as_mut(), self.cursor) else {
            return;
        };
        let parent = tree.frame(cursor).and_then(|frame| frame.parent());
        let execution = tree.finalize(cursor, self.clock.now_nanos()).unwrap_or(0);
        if parent.is_some() && execution < self.min_execution_nanos {
            tree.prune(cursor);
        }
        self.cursor = parent;
    }

    /// Closes every frame still open and hands the tree back.
    pub fn deactivate(&mut self) -> Option<CallTree> {
        while self.cursor.is_some() {
            self.stop();
        }
        self.tree.take()
    }
}
