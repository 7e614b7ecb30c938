//! JSON envelope spoken by the query API.
//!
//! Every response to `/db/query` has the shape
//! `{"results": [{...}], "time": <ms>}`; publish failures use
//! `{"error": "...", "time": <ms>}` instead. Optional fields are omitted
//! rather than sent as `null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use types::Value;

/// A result row keyed by column name.
pub type RowObject = Map<String, Json>;

/// Acknowledgement returned by the log service for a published batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    /// Stream the entry was appended to.
    pub stream: String,
    /// Sequence number assigned to the entry.
    pub seq: u64,
    /// Set when the log recognised the payload as a redelivery.
    #[serde(default)]
    pub duplicate: bool,
}

/// Outcome of a single batch within a response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<RowObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<PublishAck>,
}

impl StatementResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn rows(columns: &[String], rows: &[Vec<Value>]) -> Self {
        let rows = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(Value::to_json))
                    .collect::<RowObject>()
            })
            .collect();
        Self {
            rows: Some(rows),
            ..Default::default()
        }
    }

    pub fn write(rows_affected: u64, last_insert_id: i64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            last_insert_id: Some(last_insert_id),
            ..Default::default()
        }
    }

    pub fn published(ack: PublishAck) -> Self {
        Self {
            ack: Some(ack),
            ..Default::default()
        }
    }
}

/// Top-level response envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<StatementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds between receiving the request and producing the response.
    pub time: f64,
}

impl QueryResponse {
    pub fn single(result: StatementResult, time: f64) -> Self {
        Self {
            results: vec![result],
            error: None,
            time,
        }
    }

    /// Envelope for errors attributed to the batch itself.
    pub fn statement_error(message: impl Into<String>, time: f64) -> Self {
        Self::single(StatementResult::error(message), time)
    }

    /// Envelope for failures to hand the batch to the log.
    pub fn publish_error(message: impl Into<String>, time: f64) -> Self {
        Self {
            results: Vec::new(),
            error: Some(message.into()),
            time,
        }
    }

    pub fn first(&self) -> Option<&StatementResult> {
        self.results.first()
    }
}

/// Body of `GET /health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
