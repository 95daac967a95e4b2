// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Arena-backed call tree.
//!
//! Frames live in a single `Vec` owned by the tree and refer to each other by
//! [`FrameId`]. Frames are appended in creation order, so the subtree of the
//! frame currently being stopped always occupies the tail of the arena. That
//! property is what makes pruning a truncate instead of a search.
//!
//! All read-side functions (net/total time, flat export, rendering) are pure
//! and walk the tree with an explicit stack, so arbitrarily deep trees never
//! recurse.

use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

/// Width of the bar gauge in the rendered tree.
const BAR_WIDTH: usize = 10;

/// Deeper frames are rendered at this indentation with their depth spelled out.
const MAX_INDENT_DEPTH: usize = 64;

const RULER: &str =
    "------------------------------------------------------------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

impl FrameId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    signature: String,
    start_nanos: i64,
    /// `None` until the frame is stopped.
    execution_nanos: Option<i64>,
    children: Vec<FrameId>,
    parent: Option<FrameId>,
}

impl Frame {
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    #[must_use]
    pub fn children(&self) -> &[FrameId] {
        &self.children
    }

    #[must_use]
    pub fn parent(&self) -> Option<FrameId> {
        self.parent
    }

    #[must_use]
    pub fn start_nanos(&self) -> i64 {
        self.start_nanos
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.execution_nanos.is_some()
    }

    /// Execution time in nanoseconds, zero while the frame is still open.
    #[must_use]
    pub fn total_nanos(&self) -> i64 {
        self.execution_nanos.unwrap_or(0)
    }
}

/// One row of the depth-annotated pre-order export of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatFrame {
    pub signature: String,
    pub depth: usize,
    pub total_ns: i64,
    pub net_ns: i64,
}

#[derive(Debug, Clone)]
pub struct CallTree {
    frames: Vec<Frame>,
}

impl CallTree {
    /// Creates a tree holding a single open root frame.
    #[must_use]
    pub fn new(root_signature: impl Into<String>, start_nanos: i64) -> Self {
        CallTree {
            frames: vec![Frame {
                signature: root_signature.into(),
                start_nanos,
                execution_nanos: None,
                children: Vec::new(),
                parent: None,
            }],
        }
    }

    #[must_use]
    pub fn root(&self) -> FrameId {
        FrameId(0)
    }

    #[must_use]
    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0)
    }

    /// Number of live frames, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn push_child(
        &mut self,
        parent: FrameId,
        signature: impl Into<String>,
        start_nanos: i64,
    ) -> Option<FrameId> {
        let id = FrameId(self.frames.len());
        self.frames.get_mut(parent.0)?.children.push(id);
        self.frames.push(Frame {
            signature: signature.into(),
            start_nanos,
            execution_nanos: None,
            children: Vec::new(),
            parent: Some(parent),
        });
        Some(id)
    }

    /// Closes a frame. Returns its execution time.
    pub(crate) fn finalize(&mut self, id: FrameId, end_nanos: i64) -> Option<i64> {
        let frame = self.frames.get_mut(id.0)?;
        let execution = end_nanos.saturating_sub(frame.start_nanos).max(0);
        frame.execution_nanos = Some(execution);
        Some(execution)
    }

    /// Removes a non-root frame and its whole subtree.
    pub(crate) fn prune(&mut self, id: FrameId) {
        let Some(parent) = self.frames.get(id.0).and_then(Frame::parent) else {
            return;
        };
        if let Some(parent_frame) = self.frames.get_mut(parent.0) {
            parent_frame.children.retain(|child| *child != id);
        }
        // A stopped frame is the newest child of its parent and everything
        // allocated after it belongs to its subtree.
        if parent.0 < id.0 && self.frames.len() > id.0 {
            let tail_is_subtree = self.frames[id.0 + 1..]
                .iter()
                .all(|frame| frame.parent.is_some_and(|p| p.0 >= id.0));
            if tail_is_subtree {
                self.frames.truncate(id.0);
            }
        }
    }

    #[must_use]
    pub fn total_time(&self, id: FrameId) -> Duration {
        nanos_to_duration(self.frame(id).map_or(0, Frame::total_nanos))
    }

    #[must_use]
    pub fn net_time(&self, id: FrameId) -> Duration {
        nanos_to_duration(self.net_nanos(id))
    }

    /// Total time minus the total time of the direct children, never negative.
    #[must_use]
    pub fn net_nanos(&self, id: FrameId) -> i64 {
        let Some(frame) = self.frame(id) else {
            return 0;
        };
        let children: i64 = frame
            .children
            .iter()
            .filter_map(|child| self.frame(*child))
            .map(Frame::total_nanos)
            .sum();
        frame.total_nanos().saturating_sub(children).max(0)
    }

    /// Pre-order traversal yielding `(frame, depth)`.
    #[must_use]
    pub fn walk(&self) -> Vec<(FrameId, usize)> {
        let mut order = Vec::with_capacity(self.frames.len());
        let mut stack = vec![(self.root(), 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(frame) = self.frame(id) else {
                continue;
            };
            order.push((id, depth));
            for child in frame.children.iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
        order
    }

    #[must_use]
    pub fn flat_frames(&self) -> Vec<FlatFrame> {
        self.walk()
            .into_iter()
            .filter_map(|(id, depth)| {
                self.frame(id).map(|frame| FlatFrame {
                    signature: frame.signature.clone(),
                    depth,
                    total_ns: frame.total_nanos(),
                    net_ns: self.net_nanos(id),
                })
            })
            .collect()
    }

    /// Human readable, indented rendering of the tree.
    ///
    /// Each line shows net and total time in milliseconds, both as a share of
    /// the root's total time with a bar gauge, followed by the indented
    /// signature.
    #[must_use]
    pub fn render(&self) -> String {
        let root_total = self.frame(self.root()).map_or(0, Frame::total_nanos);
        let mut out = String::new();
        out.push_str(RULER);
        out.push('\n');
        let _ = writeln!(
            out,
            "{:<29}{:<29}{}",
            "Net (ms)", "Total (ms)", "Signature"
        );
        out.push_str(RULER);
        out.push('\n');

        for (id, depth) in self.walk() {
            let Some(frame) = self.frame(id) else {
                continue;
            };
            let net = self.net_nanos(id);
            let total = frame.total_nanos();
            let net_pct = percent_of(net, root_total);
            let total_pct = percent_of(total, root_total);
            let _ = writeln!(
                out,
                "{:>9.2} {:>3}% {:<width$}  {:>9.2} {:>3}% {:<width$}  {}{}",
                nanos_to_millis(net),
                net_pct,
                bar(net_pct),
                nanos_to_millis(total),
                total_pct,
                bar(total_pct),
                indent(depth),
                frame.signature,
                width = BAR_WIDTH,
            );
        }
        out
    }
}

fn nanos_to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(0))
}

#[allow(clippy::cast_precision_loss)]
fn nanos_to_millis(nanos: i64) -> f64 {
    nanos as f64 / 1_000_000.0
}

fn percent_of(part: i64, whole: i64) -> u32 {
    if whole <= 0 {
        return 0;
    }
    let pct = (i128::from(part) * 100 + i128::from(whole) / 2) / i128::from(whole);
    u32::try_from(pct.clamp(0, 100)).unwrap_or(0)
}

fn indent(depth: usize) -> String {
    if depth <= MAX_INDENT_DEPTH {
        "  ".repeat(depth)
    } else {
        format!("{}[{depth}] ", "  ".repeat(MAX_INDENT_DEPTH))
    }
}

fn bar(pct: u32) -> String {
    let filled = usize::try_from(pct).unwrap_or(0) * BAR_WIDTH / 100;
    "|".repeat(filled.min(BAR_WIDTH))
}
