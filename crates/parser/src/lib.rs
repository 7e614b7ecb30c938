//! Statement classifier.
//!
//! Turns a JSON request payload into a [`StatementBatch`]. The accepted grammar:
//!
//! ```text
//! ["SELECT * FROM t"]                              simple query
//! ["INSERT ...", "UPDATE ..."]                     bulk statements (no reads)
//! [["INSERT INTO t VALUES(?, ?)", 1, "a"]]         parameterized statement
//! [["INSERT ... (?)", 1], ["INSERT ... (?)", 2]]   bulk parameterized (no reads)
//! ```
//!
//! Classification never fails: malformed payloads become
//! [`BatchKind::ValidationError`] so callers can still report elapsed time.

mod ast;
#[cfg(test)]
mod tests;

pub use ast::*;

use serde_json::Value as Json;
use std::time::Instant;
use types::Value;

/// Classify a parsed request payload received at `received_at`.
pub fn classify(data: Json, received_at: Instant) -> StatementBatch {
    match classify_kind(&data) {
        Ok((kind, is_read)) => StatementBatch::new(kind, is_read, received_at, data),
        Err(err) => StatementBatch::new(BatchKind::ValidationError(err), false, received_at, data),
    }
}

/// Decode and classify a raw payload, as read back from the log.
pub fn classify_bytes(payload: &[u8], received_at: Instant) -> Result<StatementBatch, serde_json::Error> {
    let data: Json = serde_json::from_slice(payload)?;
    Ok(classify(data, received_at))
}

/// Case-insensitive `select` prefix check on the trimmed statement.
pub fn is_read_statement(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    trimmed
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("select"))
}

fn classify_kind(data: &Json) -> Result<(BatchKind, bool), ValidationError> {
    let Json::Array(items) = data else {
        return Err(ValidationError::NotAnArray);
    };
    let Some(first) = items.first() else {
        return Err(ValidationError::EmptyArray);
    };

    let Json::Array(first_stmt) = first else {
        return classify_flat(items);
    };

    if matches!(first_stmt.first(), Some(Json::Array(_))) {
        return Err(ValidationError::TooDeep);
    }

    if matches!(items.get(1), Some(Json::Array(_))) {
        let mut statements = Vec::with_capacity(items.len());
        for item in items {
            let Json::Array(parts) = item else {
                return Err(ValidationError::BulkParamsNotArrays);
            };
            let stmt = param_statement(parts)?;
            if is_read_statement(&stmt.sql) {
                return Err(ValidationError::ReadInBulk);
            }
            statements.push(stmt);
        }
        return Ok((BatchKind::BulkParameterized { statements }, false));
    }

    let stmt = param_statement(first_stmt)?;
    let is_read = is_read_statement(&stmt.sql);
    Ok((BatchKind::Parameterized(stmt), is_read))
}

fn classify_flat(items: &[Json]) -> Result<(BatchKind, bool), ValidationError> {
    if let [only] = items {
        let Json::String(sql) = only else {
            return Err(ValidationError::StatementNotString);
        };
        let is_read = is_read_statement(sql);
        return Ok((BatchKind::SimpleQuery { sql: sql.clone() }, is_read));
    }

    let statements = items
        .iter()
        .map(|item| match item {
            Json::String(sql) => Ok(sql.clone()),
            _ => Err(ValidationError::BulkNotStrings),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if statements.iter().any(|sql| is_read_statement(sql)) {
        return Err(ValidationError::ReadInBulk);
    }
    Ok((BatchKind::BulkStatements { statements }, false))
}

fn param_statement(parts: &[Json]) -> Result<ParamStatement, ValidationError> {
    if parts.len() < 2 {
        return Err(ValidationError::NotEnoughItems);
    }
    let Json::String(sql) = &parts[0] else {
        return Err(ValidationError::StatementNotString);
    };
    Ok(ParamStatement {
        sql: sql.clone(),
        params: parts[1..].iter().map(Value::from_json).collect(),
    })
}
