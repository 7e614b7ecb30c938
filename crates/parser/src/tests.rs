use super::*;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

fn kind(data: Json) -> BatchKind {
    classify(data, Instant::now()).kind
}

fn error(data: Json) -> ValidationError {
    match kind(data) {
        BatchKind::ValidationError(err) => err,
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn rejects_non_arrays() {
    assert_eq!(error(json!({"q": "SELECT 1"})), ValidationError::NotAnArray);
    assert_eq!(error(json!("SELECT 1")), ValidationError::NotAnArray);
    assert_eq!(error(json!(null)), ValidationError::NotAnArray);
}

#[test]
fn rejects_empty_array() {
    let err = error(json!([]));
    assert_eq!(err, ValidationError::EmptyArray);
    assert_eq!(err.to_string(), "empty array");
}

#[test]
fn single_select_is_a_read() {
    let batch = classify(json!(["SELECT * FROM t"]), Instant::now());
    assert!(batch.is_read);
    assert_eq!(
        batch.kind,
        BatchKind::SimpleQuery {
            sql: "SELECT * FROM t".into()
        }
    );
    assert_eq!(batch.statement_count(), 1);
}

#[test]
fn read_detection_ignores_case_and_leading_whitespace() {
    assert!(is_read_statement("select 1"));
    assert!(is_read_statement("  SeLeCt 1"));
    assert!(!is_read_statement("INSERT INTO t SELECT * FROM u"));
    assert!(!is_read_statement("sel"));
    assert!(!is_read_statement(""));
}

#[test]
fn single_write_is_not_a_read() {
    let batch = classify(json!(["CREATE TABLE t (x INTEGER)"]), Instant::now());
    assert!(!batch.is_read);
    assert!(batch.is_valid());
}

#[test]
fn simple_query_must_be_a_string() {
    assert_eq!(error(json!([42])), ValidationError::StatementNotString);
}

#[test]
fn flat_writes_become_bulk_statements() {
    let batch = classify(json!(["UPDATE t SET x=1", "UPDATE t SET y=2"]), Instant::now());
    assert!(!batch.is_read);
    assert_eq!(
        batch.kind,
        BatchKind::BulkStatements {
            statements: vec!["UPDATE t SET x=1".into(), "UPDATE t SET y=2".into()]
        }
    );
    assert_eq!(batch.statement_count(), 2);
}

#[test]
fn bulk_rejects_reads() {
    let err = error(json!(["INSERT INTO t VALUES(1)", "select * from t"]));
    assert_eq!(err, ValidationError::ReadInBulk);
    assert_eq!(err.to_string(), "read statement in bulk request");
}

#[test]
fn bulk_rejects_non_strings() {
    assert_eq!(error(json!(["INSERT INTO t VALUES(1)", 7])), ValidationError::BulkNotStrings);
}

#[test]
fn single_parameterized_statement() {
    let batch = classify(json!([["INSERT INTO t VALUES(?)", "a"]]), Instant::now());
    assert!(!batch.is_read);
    assert_eq!(
        batch.kind,
        BatchKind::Parameterized(ParamStatement {
            sql: "INSERT INTO t VALUES(?)".into(),
            params: vec![Value::Text("a".into())],
        })
    );
}

#[test]
fn parameterized_select_is_a_read() {
    let batch = classify(json!([["SELECT * FROM t WHERE id = ?", 3]]), Instant::now());
    assert!(batch.is_read);
}

#[test]
fn parameterized_trailing_scalars_are_ignored() {
    let batch = classify(json!([["INSERT INTO t VALUES(?)", 1], "ignored"]), Instant::now());
    assert!(matches!(batch.kind, BatchKind::Parameterized(_)));
}

#[test]
fn parameterized_needs_at_least_one_param() {
    let err = error(json!([["INSERT INTO t VALUES(1)"]]));
    assert_eq!(err, ValidationError::NotEnoughItems);
}

#[test]
fn rejects_three_levels_of_nesting() {
    assert_eq!(error(json!([[["INSERT"], 1]])), ValidationError::TooDeep);
}

#[test]
fn bulk_parameterized_statements() {
    let batch = classify(
        json!([
            ["INSERT INTO t VALUES(?, ?)", 1, "a"],
            ["INSERT INTO t VALUES(?, ?)", 2, null]
        ]),
        Instant::now(),
    );
    assert!(!batch.is_read);
    let BatchKind::BulkParameterized { statements } = batch.kind else {
        panic!("expected bulk parameterized");
    };
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[1].params, vec![Value::Integer(2), Value::Null]);
}

#[test]
fn bulk_parameterized_rejects_reads_and_short_items() {
    assert_eq!(
        error(json!([["INSERT INTO t VALUES(?)", 1], ["SELECT ?", 1]])),
        ValidationError::ReadInBulk
    );
    assert_eq!(
        error(json!([["INSERT INTO t VALUES(?)", 1], ["DELETE FROM t"]])),
        ValidationError::NotEnoughItems
    );
    assert_eq!(
        error(json!([["INSERT INTO t VALUES(?)", 1], ["DELETE FROM t", 1], "x"])),
        ValidationError::BulkParamsNotArrays
    );
}

#[test]
fn payload_round_trips_through_bytes() {
    let batch = classify(json!([["INSERT INTO t VALUES(?)", "a"]]), Instant::now());
    let again = classify_bytes(&batch.to_payload(), Instant::now()).unwrap();
    assert_eq!(again.kind, batch.kind);
    assert!(classify_bytes(b"not json", Instant::now()).is_err());
}

#[test]
fn validation_error_converts_to_db_error() {
    let err: common::DbError = ValidationError::TooDeep.into();
    assert_eq!(err.to_string(), "validation: nested more than two levels");
}

fn select_text() -> impl Strategy<Value = String> {
    ("[sS][eE][lL][eE][cC][tT]", "[ a-z0-9*,]{0,20}").prop_map(|(kw, rest)| format!("{kw}{rest}"))
}

fn write_text() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("INSERT INTO t VALUES(1)".to_string()),
        Just("UPDATE t SET x = 2".to_string()),
        Just("DELETE FROM t".to_string()),
        "(insert|update|delete) [a-z ]{0,12}",
    ]
}

proptest! {
    #[test]
    fn any_single_select_is_simple_read(sql in select_text()) {
        let batch = classify(json!([sql]), Instant::now());
        prop_assert!(batch.is_read);
        let is_simple = matches!(batch.kind, BatchKind::SimpleQuery { .. });
        prop_assert!(is_simple);
    }

    #[test]
    fn any_bulk_with_a_select_is_rejected(
        writes in prop::collection::vec(write_text(), 1..6),
        read in select_text(),
        pos in any::<prop::sample::Index>(),
    ) {
        let mut statements = writes;
        let at = pos.index(statements.len() + 1);
        statements.insert(at, read);
        let batch = classify(json!(statements), Instant::now());
        prop_assert_eq!(batch.validation_error(), Some(&ValidationError::ReadInBulk));
    }

    #[test]
    fn bulk_parameterized_keeps_one_statement_per_sub_array(
        rows in prop::collection::vec((write_text(), any::<i64>()), 2..10),
    ) {
        let data: Vec<Json> = rows.iter().map(|(sql, p)| json!([sql, p])).collect();
        let batch = classify(Json::Array(data), Instant::now());
        match batch.kind {
            BatchKind::BulkParameterized { statements } => prop_assert_eq!(statements.len(), rows.len()),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}
