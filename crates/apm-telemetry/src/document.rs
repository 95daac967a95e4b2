// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Units of work exchanged with the search backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::time::Duration;

/// Source fields the correlation keys are stored and searched under.
pub const TRACE_ID_FIELD: &str = "trace_id";
pub const SPAN_ID_FIELD: &str = "span_id";

/// Keys that let a stored document be found again without its backend id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKeys {
    pub trace_id: String,
    pub span_id: String,
}

impl CorrelationKeys {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        CorrelationKeys {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
        }
    }

    /// Both keys present and non-blank.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.trace_id.trim().is_empty() && !self.span_id.trim().is_empty()
    }
}

/// A completed, sampled document on its way to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledDocument {
    index: String,
    payload: Value,
    correlation: Option<CorrelationKeys>,
    enqueued_at: Duration,
}

impl SampledDocument {
    #[must_use]
    pub fn new(
        index: impl Into<String>,
        payload: Value,
        correlation: Option<CorrelationKeys>,
        enqueued_at: Duration,
    ) -> Self {
        SampledDocument {
            index: index.into(),
            payload,
            correlation,
            enqueued_at,
        }
    }

    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn correlation(&self) -> Option<&CorrelationKeys> {
        self.correlation.as_ref()
    }

    /// Body written to the backend: the payload with the correlation keys
    /// merged in, so a search on [`TRACE_ID_FIELD`] and [`SPAN_ID_FIELD`]
    /// finds it. Keys already present in the payload are overwritten.
    #[must_use]
    pub fn source(&self) -> Cow<'_, Value> {
        match (&self.correlation, &self.payload) {
            (Some(keys), Value::Object(fields)) => {
                let mut fields = fields.clone();
                fields.insert(
                    TRACE_ID_FIELD.to_string(),
                    Value::String(keys.trace_id.clone()),
                );
                fields.insert(
                    SPAN_ID_FIELD.to_string(),
                    Value::String(keys.span_id.clone()),
                );
                Cow::Owned(Value::Object(fields))
            }
            _ => Cow::Borrowed(&self.payload),
        }
    }

    /// Monotonic time at which the document was created for submission.
    #[must_use]
    pub fn enqueued_at(&self) -> Duration {
        self.enqueued_at
    }
}

/// Partial update addressed to an already stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPatch {
    pub index: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    Index(SampledDocument),
    Update(DocumentPatch),
}

impl BulkOperation {
    #[must_use]
    pub fn target_index(&self) -> &str {
        match self {
            BulkOperation::Index(document) => document.index(),
            BulkOperation::Update(patch) => &patch.index,
        }
    }
}

/// Operations for one target index, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkGroup {
    pub index: String,
    pub operations: Vec<BulkOperation>,
}

/// Groups operations by target index, keeping first-seen order between
/// groups and submission order inside each group.
#[must_use]
pub fn group_by_index(operations: Vec<BulkOperation>) -> Vec<BulkGroup> {
    let mut groups: Vec<BulkGroup> = Vec::new();
    for operation in operations {
        match groups
            .iter_mut()
            .find(|group| group.index == operation.target_index())
        {
            Some(group) => group.operations.push(operation),
            None => groups.push(BulkGroup {
                index: operation.target_index().to_string(),
                operations: vec![operation],
            }),
        }
    }
    groups
}

/// Backend verdict for one bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkItemOutcome {
    Stored { id: String },
    Failed { reason: String },
}

/// One search in a multi-search request: find the document carrying `keys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationQuery {
    /// Index or index pattern to search; `None` searches everything.
    pub index: Option<String>,
    pub keys: CorrelationKeys,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Hit { index: String, id: String },
    Miss,
    /// This sub-search failed; the others in the request are unaffected.
    Failed { reason: String },
}
