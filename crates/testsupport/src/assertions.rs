//! Assertion helpers for query results.

use database::ApplyResult;
use types::Value;

/// Extract the rows of a read result, panicking on anything else.
pub fn rows_of(result: ApplyResult) -> Vec<Vec<Value>> {
    match result {
        ApplyResult::Rows { rows, .. } => rows,
        other => panic!("expected rows, got {other:?}"),
    }
}

/// Assert that a read returned exactly `expected`, in order.
pub fn assert_rows(result: ApplyResult, expected: &[Vec<Value>]) {
    let rows = rows_of(result);
    pretty_assertions::assert_eq!(rows.as_slice(), expected);
}

/// Build a row from anything convertible into values.
///
/// ```
/// use testsupport::assertions::row;
/// use types::Value;
///
/// assert_eq!(row([Value::from(1), Value::from("ada")]).len(), 2);
/// ```
pub fn row<const N: usize>(values: [Value; N]) -> Vec<Value> {
    values.to_vec()
}
