use bytes::Bytes;
use std::fs::OpenOptions;
use std::io::Write;
use stream::{FileStream, LogService, StreamInfo};
use tempfile::TempDir;

async fn publish_n(stream: &FileStream, n: usize) {
    for i in 0..n {
        stream
            .publish("app.push", Bytes::from(format!("payload-{i}")))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let stream = FileStream::open(dir.path(), "app").unwrap();
        publish_n(&stream, 3).await;
    }

    let stream = FileStream::open(dir.path(), "app").unwrap();
    let info = stream.info().await.unwrap();
    assert_eq!(info, StreamInfo { first_seq: 1, last_seq: 3, messages: 3 });

    let mut sub = stream.subscribe("node-a", 1).await.unwrap();
    for expected in 1..=3u64 {
        let entry = sub.next().await.unwrap();
        assert_eq!(entry.seq, expected);
        assert_eq!(entry.payload, Bytes::from(format!("payload-{}", expected - 1)));
    }

    let ack = stream.publish("app.push", Bytes::from_static(b"next")).await.unwrap();
    assert_eq!(ack.seq, 4);
    assert_eq!(ack.stream, "app");
}

#[tokio::test]
async fn purge_is_durable_and_sequences_keep_counting() {
    let dir = TempDir::new().unwrap();
    {
        let stream = FileStream::open(dir.path(), "app").unwrap();
        publish_n(&stream, 10).await;
        assert_eq!(stream.purge(8).await.unwrap(), 7);
    }

    let stream = FileStream::open(dir.path(), "app").unwrap();
    let info = stream.info().await.unwrap();
    assert_eq!(info, StreamInfo { first_seq: 8, last_seq: 10, messages: 3 });

    let mut sub = stream.subscribe("node-a", 1).await.unwrap();
    assert_eq!(sub.next().await.unwrap().seq, 8);
}

#[tokio::test]
async fn purging_everything_keeps_last_seq() {
    let dir = TempDir::new().unwrap();
    {
        let stream = FileStream::open(dir.path(), "app").unwrap();
        publish_n(&stream, 4).await;
        stream.purge(5).await.unwrap();
    }

    let stream = FileStream::open(dir.path(), "app").unwrap();
    let info = stream.info().await.unwrap();
    assert_eq!(info, StreamInfo { first_seq: 5, last_seq: 4, messages: 0 });
    assert_eq!(
        stream.publish("app.push", Bytes::from_static(b"x")).await.unwrap().seq,
        5
    );
}

#[tokio::test]
async fn torn_tail_is_truncated_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let stream = FileStream::open(dir.path(), "app").unwrap();
        publish_n(&stream, 2).await;
    }

    let log_path = dir.path().join("stream.log");
    let intact_len = std::fs::metadata(&log_path).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[0x4C, 0x51, 0x53, 0x4C, 1, 2, 3]).unwrap();
    }

    let stream = FileStream::open(dir.path(), "app").unwrap();
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), intact_len);
    assert_eq!(stream.info().await.unwrap().last_seq, 2);

    let ack = stream.publish("app.push", Bytes::from_static(b"after")).await.unwrap();
    assert_eq!(ack.seq, 3);
    drop(stream);

    let reopened = FileStream::open(dir.path(), "app").unwrap();
    assert_eq!(reopened.info().await.unwrap().messages, 3);
}

#[tokio::test]
async fn drained_consumer_position_is_persisted() {
    let dir = TempDir::new().unwrap();
    let stream = FileStream::open(dir.path(), "app").unwrap();
    publish_n(&stream, 2).await;

    let mut sub = stream.subscribe("node-a", 1).await.unwrap();
    let entry = sub.next().await.unwrap();
    sub.ack(entry.seq).await.unwrap();
    sub.drain().await.unwrap();

    let state = std::fs::read_to_string(dir.path().join("stream_state.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(state["consumers"]["node-a"], 1);
    assert_eq!(state["last_seq"], 2);
}
