use common::DbError;
use serde_json::Value as Json;
use std::time::Instant;
use thiserror::Error;
use types::Value;

/// Reasons a request payload is rejected before it reaches the log or the database.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("not an array")]
    NotAnArray,
    #[error("empty array")]
    EmptyArray,
    #[error("statement is not a string")]
    StatementNotString,
    #[error("bulk request contains a non-string element")]
    BulkNotStrings,
    #[error("bulk parameterized request contains a non-array element")]
    BulkParamsNotArrays,
    #[error("read statement in bulk request")]
    ReadInBulk,
    #[error("nested more than two levels")]
    TooDeep,
    #[error("not enough items in parameterized statement")]
    NotEnoughItems,
}

impl From<ValidationError> for DbError {
    fn from(err: ValidationError) -> Self {
        DbError::Validation(err.to_string())
    }
}

/// One statement with positional parameters, e.g. `["INSERT INTO t VALUES(?)", "a"]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Shape of a classified request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchKind {
    /// `["SELECT 1"]`
    SimpleQuery { sql: String },
    /// `["UPDATE ...", "DELETE ..."]`, never containing reads.
    BulkStatements { statements: Vec<String> },
    /// `[["INSERT ... (?)", 1]]`
    Parameterized(ParamStatement),
    /// `[["INSERT ... (?)", 1], ["INSERT ... (?)", 2]]`, never containing reads.
    BulkParameterized { statements: Vec<ParamStatement> },
    /// The payload failed classification.
    ValidationError(ValidationError),
}

/// A classified request payload ready for routing or application.
#[derive(Clone, Debug)]
pub struct StatementBatch {
    pub kind: BatchKind,
    /// Whether the batch may run locally instead of through the log.
    pub is_read: bool,
    /// When the payload was received; responses report time elapsed since.
    pub received_at: Instant,
    source: Json,
}

impl StatementBatch {
    pub(crate) fn new(kind: BatchKind, is_read: bool, received_at: Instant, source: Json) -> Self {
        Self {
            kind,
            is_read,
            received_at,
            source,
        }
    }

    /// The validation error carried by a rejected batch.
    pub fn validation_error(&self) -> Option<&ValidationError> {
        match &self.kind {
            BatchKind::ValidationError(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validation_error().is_none()
    }

    /// The payload exactly as received; this is what gets published to the log.
    pub fn source(&self) -> &Json {
        &self.source
    }

    /// Serialized payload for publishing.
    pub fn to_payload(&self) -> Vec<u8> {
        self.source.to_string().into_bytes()
    }

    /// Number of statements the batch will execute.
    pub fn statement_count(&self) -> usize {
        match &self.kind {
            BatchKind::SimpleQuery { .. } | BatchKind::Parameterized(_) => 1,
            BatchKind::BulkStatements { statements } => statements.len(),
            BatchKind::BulkParameterized { statements } => statements.len(),
            BatchKind::ValidationError(_) => 0,
        }
    }
}
