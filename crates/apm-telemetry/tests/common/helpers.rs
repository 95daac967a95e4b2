// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use apm_telemetry::{BulkOperation, CorrelationKeys, DocumentPatch, SampledDocument};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::mocks::RecordedWrite;

/// A small request document numbered `n`.
pub fn document(index: &str, n: u64) -> SampledDocument {
    SampledDocument::new(index, json!({ "n": n }), None, Duration::ZERO)
}

/// A request document that can later be found by `keys`. The keys live
/// only on the document, not in its payload.
#[allow(dead_code)]
pub fn correlated_document(index: &str, keys: CorrelationKeys) -> SampledDocument {
    SampledDocument::new(index, json!({ "kind": "span" }), Some(keys), Duration::ZERO)
}

#[allow(dead_code)]
pub fn fields(name: &str, value: Value) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(name.to_string(), value);
    fields
}

/// Number of operations in each recorded bulk write.
pub fn batch_sizes(writes: &[RecordedWrite]) -> Vec<usize> {
    writes
        .iter()
        .map(|write| write.groups.iter().map(|g| g.operations.len()).sum())
        .collect()
}

/// Every partial update sent, in order.
#[allow(dead_code)]
pub fn updates(writes: &[RecordedWrite]) -> Vec<DocumentPatch> {
    writes
        .iter()
        .flat_map(|write| write.groups.iter())
        .flat_map(|group| group.operations.iter())
        .filter_map(|operation| match operation {
            BulkOperation::Update(patch) => Some(patch.clone()),
            BulkOperation::Index(_) => None,
        })
        .collect()
}

/// Stored bodies of every indexed document, in order.
#[allow(dead_code)]
pub fn indexed_payloads(writes: &[RecordedWrite]) -> Vec<Value> {
    writes
        .iter()
        .flat_map(|write| write.groups.iter())
        .flat_map(|group| group.operations.iter())
        .filter_map(|operation| match operation {
            BulkOperation::Index(document) => Some(document.source().into_owned()),
            BulkOperation::Update(_) => None,
        })
        .collect()
}
