// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`Transport`] for a search backend speaking the NDJSON `_bulk` and
//! `_msearch` APIs.
//!
//! Correlation lookups are exact `term` filters on [`TRACE_ID_FIELD`] and
//! [`SPAN_ID_FIELD`], so the target indices must map both as `keyword`.
//! Under dynamic mapping they become analyzed `text` and never match.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::Config;
use crate::document::{
    BulkGroup, BulkItemOutcome, BulkOperation, CorrelationQuery, SearchOutcome,
};
pub use crate::document::{SPAN_ID_FIELD, TRACE_ID_FIELD};
use crate::transport::{Transport, TransportError};

const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        credentials: Option<Credentials>,
    ) -> Result<Self, TransportError> {
        let client = build_client(timeout)?;
        Ok(HttpTransport {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let credentials = config.backend_username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: config.backend_password.clone(),
        });
        Self::new(&config.backend_url, config.backend_timeout, credentials)
    }

    async fn post_ndjson(&self, path: &str, body: String) -> Result<String, TransportError> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, NDJSON)
            .body(body);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, credentials.password.as_ref());
        }

        let time = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(
            "TRANSPORT | {url} answered {status} in {} ms",
            time.elapsed().as_millis()
        );
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn bulk_write(
        &self,
        groups: &[BulkGroup],
    ) -> Result<Vec<BulkItemOutcome>, TransportError> {
        let expected: usize = groups.iter().map(|group| group.operations.len()).sum();
        if expected == 0 {
            return Ok(Vec::new());
        }
        let body = bulk_body(groups)?;
        let text = self.post_ndjson("_bulk", body).await?;
        parse_bulk_response(&text, expected)
    }

    async fn multi_search(
        &self,
        queries: &[CorrelationQuery],
    ) -> Result<Vec<SearchOutcome>, TransportError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let body = multi_search_body(queries)?;
        let text = self.post_ndjson("_msearch", body).await?;
        parse_multi_search_response(&text, queries.len())
    }
}

fn push_line(body: &mut String, value: &Value) -> Result<(), serde_json::Error> {
    body.push_str(&serde_json::to_string(value)?);
    body.push('\n');
    Ok(())
}

pub(crate) fn bulk_body(groups: &[BulkGroup]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for group in groups {
        for operation in &group.operations {
            match operation {
                BulkOperation::Index(document) => {
                    push_line(&mut body, &json!({ "index": { "_index": group.index } }))?;
                    push_line(&mut body, document.source().as_ref())?;
                }
                BulkOperation::Update(patch) => {
                    push_line(
                        &mut body,
                        &json!({ "update": { "_index": group.index, "_id": patch.id } }),
                    )?;
                    push_line(&mut body, &json!({ "doc": patch.fields }))?;
                }
            }
        }
    }
    Ok(body)
}

pub(crate) fn multi_search_body(queries: &[CorrelationQuery]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for query in queries {
        let header = match &query.index {
            Some(index) => json!({ "index": index }),
            None => json!({}),
        };
        push_line(&mut body, &header)?;
        push_line(
            &mut body,
            &json!({
                "size": 1,
                "_source": false,
                "query": { "bool": { "filter": [
                    term(TRACE_ID_FIELD, &query.keys.trace_id),
                    term(SPAN_ID_FIELD, &query.keys.span_id),
                ] } }
            }),
        )?;
    }
    Ok(body)
}

fn term(field: &str, value: &str) -> Value {
    let mut clause = Map::new();
    clause.insert(field.to_string(), Value::String(value.to_string()));
    json!({ "term": clause })
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItemResponse>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResponse {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<Value>,
}

fn parse_bulk_response(
    text: &str,
    expected: usize,
) -> Result<Vec<BulkItemOutcome>, TransportError> {
    let response: BulkResponse =
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))?;
    let mut outcomes: Vec<BulkItemOutcome> = response
        .items
        .into_iter()
        .map(|item| match item.into_values().next() {
            Some(BulkItemResponse {
                id: Some(id),
                status,
                error: None,
            }) if (200..300).contains(&status) => BulkItemOutcome::Stored { id },
            Some(item) => BulkItemOutcome::Failed {
                reason: item
                    .error
                    .map_or_else(|| format!("status {}", item.status), |e| e.to_string()),
            },
            None => BulkItemOutcome::Failed {
                reason: "empty item".to_string(),
            },
        })
        .collect();
    outcomes.resize(
        expected,
        BulkItemOutcome::Failed {
            reason: "missing from response".to_string(),
        },
    );
    Ok(outcomes)
}

#[derive(Debug, Deserialize)]
struct MultiSearchResponse {
    responses: Vec<SearchResponse>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Option<Hits>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: String,
}

fn parse_multi_search_response(
    text: &str,
    expected: usize,
) -> Result<Vec<SearchOutcome>, TransportError> {
    let response: MultiSearchResponse =
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))?;
    let mut outcomes: Vec<SearchOutcome> = response
        .responses
        .into_iter()
        .map(|search| match (search.error, search.hits) {
            (Some(error), _) => SearchOutcome::Failed {
                reason: error.to_string(),
            },
            (None, Some(hits)) => hits
                .hits
                .into_iter()
                .next()
                .map_or(SearchOutcome::Miss, |hit| SearchOutcome::Hit {
                    index: hit.index,
                    id: hit.id,
                }),
            (None, None) => SearchOutcome::Miss,
        })
        .collect();
    outcomes.resize(
        expected,
        SearchOutcome::Failed {
            reason: "missing from response".to_string(),
        },
    );
    Ok(outcomes)
}
