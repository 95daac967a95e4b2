// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capability the core needs from the storage/search backend.

use async_trait::async_trait;

use crate::document::{BulkGroup, BulkItemOutcome, CorrelationQuery, SearchOutcome};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend answered with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Possibly slow, possibly failing network operations. No ordering is
/// guaranteed across separate calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes every group in one request. Returns one outcome per operation,
    /// in group order then operation order.
    async fn bulk_write(
        &self,
        groups: &[BulkGroup],
    ) -> Result<Vec<BulkItemOutcome>, TransportError>;

    /// Runs all queries in one request. Returns one outcome per query, in
    /// query order.
    async fn multi_search(
        &self,
        queries: &[CorrelationQuery],
    ) -> Result<Vec<SearchOutcome>, TransportError>;
}
