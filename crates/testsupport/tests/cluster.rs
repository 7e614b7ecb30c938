use pretty_assertions::assert_eq;
use replication::{CycleOutcome, RestoreOutcome};
use std::sync::Arc;
use stream::{FileStream, LogService};
use testsupport::prelude::*;
use types::Value;

#[tokio::test]
async fn two_replicas_converge_on_the_same_rows() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.publish(users_schema()).await.unwrap();
    cluster.publish(insert_user("ada", 36)).await.unwrap();
    cluster
        .publish(insert_users(&[("grace", 45), ("linus", 28)]))
        .await
        .unwrap();
    let last = cluster
        .publish(select("UPDATE users SET age = age + 1 WHERE name = 'ada'"))
        .await
        .unwrap();
    assert_eq!(last, 4);

    cluster.wait_all(last).await.unwrap();
    cluster
        .assert_converged("SELECT id, name, age FROM users ORDER BY id")
        .await
        .unwrap();

    let rows = cluster.node(1).unwrap().rows("SELECT name, age FROM users ORDER BY id").await.unwrap();
    assert_eq!(
        rows,
        vec![
            row([Value::from("ada"), Value::from(37)]),
            row([Value::from("grace"), Value::from(45)]),
            row([Value::from("linus"), Value::from(28)]),
        ]
    );
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_entry_is_skipped_identically_everywhere() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.publish(users_schema()).await.unwrap();
    cluster.publish(insert_user("ada", 36)).await.unwrap();
    // Violates NOT NULL on every replica.
    cluster
        .publish(serde_json::json!([["INSERT INTO users (name) VALUES (?)", null]]))
        .await
        .unwrap();
    let last = cluster.publish(insert_user("grace", 45)).await.unwrap();

    cluster.wait_all(last).await.unwrap();
    cluster
        .assert_converged("SELECT id, name FROM users ORDER BY id")
        .await
        .unwrap();
    assert_eq!(cluster.node(0).unwrap().sequence().await.unwrap(), 4);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn late_joiner_bootstraps_from_snapshot_and_purged_log() {
    let mut cluster = TestCluster::start(1).await.unwrap();
    cluster.publish(users_schema()).await.unwrap();
    let mut last = 0;
    for i in 0..20 {
        last = cluster.publish(insert_user(&format!("user{i}"), i)).await.unwrap();
    }
    cluster.wait_all(last).await.unwrap();

    let outcome = cluster.node(0).unwrap().snapshot_now().await.unwrap();
    assert!(
        matches!(outcome, CycleOutcome::Completed { sequence: 21, purged: 12, .. }),
        "{outcome:?}"
    );
    assert_eq!(cluster.log.info().await.unwrap().first_seq, 13);

    let last = cluster.publish(insert_user("after-snapshot", 99)).await.unwrap();
    cluster.add_node().await.unwrap();
    cluster.wait_all(last).await.unwrap();
    cluster
        .assert_converged("SELECT id, name, age FROM users ORDER BY id")
        .await
        .unwrap();
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn restarted_node_keeps_identity_and_position() {
    let mut node = TestNode::start().await.unwrap();
    let uid = node.node().unwrap().node_id().to_string();
    node.publish(users_schema()).await.unwrap();
    let seq = node.publish(insert_user("ada", 36)).await.unwrap().seq;
    node.wait_for_sequence(seq).await.unwrap();

    node.restart().await.unwrap();
    assert_eq!(node.node().unwrap().node_id(), uid);
    assert_eq!(node.sequence().await.unwrap(), 2);

    let seq = node.publish(insert_user("grace", 45)).await.unwrap().seq;
    node.wait_for_sequence(seq).await.unwrap();
    assert_eq!(
        node.rows("SELECT count(*) FROM users").await.unwrap(),
        vec![row([Value::from(2)])]
    );
    node.stop().await.unwrap();
}

#[tokio::test]
async fn durable_log_replays_into_a_fresh_replica() {
    let stream_dir = tempfile::TempDir::new().unwrap();
    {
        let log: Arc<dyn LogService> = Arc::new(FileStream::open(stream_dir.path(), "logsql").unwrap());
        let mut node = TestNode::start_with(log, Arc::new(blobstore::MemoryObjectStore::new()))
            .await
            .unwrap();
        node.publish(users_schema()).await.unwrap();
        let seq = node.publish(insert_user("ada", 36)).await.unwrap().seq;
        node.wait_for_sequence(seq).await.unwrap();
        node.stop().await.unwrap();
    }

    let log: Arc<dyn LogService> = Arc::new(FileStream::open(stream_dir.path(), "logsql").unwrap());
    let mut fresh = TestNode::start_with(log, Arc::new(blobstore::MemoryObjectStore::new()))
        .await
        .unwrap();
    fresh.wait_for_sequence(2).await.unwrap();
    assert_eq!(
        fresh.rows("SELECT name FROM users").await.unwrap(),
        vec![row([Value::from("ada")])]
    );
    fresh.stop().await.unwrap();
}

#[tokio::test]
async fn snapshot_round_trip_preserves_sequence() {
    let cluster = TestCluster::start(1).await.unwrap();
    cluster.publish(users_schema()).await.unwrap();
    let mut last = 0;
    for i in 0..8 {
        last = cluster.publish(insert_user("n", i)).await.unwrap();
    }
    cluster.wait_all(last).await.unwrap();
    assert!(matches!(
        cluster.node(0).unwrap().snapshot_now().await.unwrap(),
        CycleOutcome::Completed { sequence: 9, .. }
    ));

    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("restored.db");
    let outcome = replication::restore_database(&cluster.objects, &db_path).await.unwrap();
    assert!(matches!(outcome, RestoreOutcome::Restored(ref meta) if meta.sequence == 9));
    let restored = database::StateMachine::open(&db_path).await.unwrap();
    assert_eq!(restored.sequence().await.unwrap(), 9);
    cluster.shutdown().await.unwrap();
}
