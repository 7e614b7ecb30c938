use axum::body::Bytes as BodyBytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use blobstore::{HttpObjectStore, ObjectMeta, ObjectStore};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
struct Backup {
    objects: Arc<Mutex<HashMap<String, (HeaderMap, Vec<u8>)>>>,
    token: Option<String>,
}

fn authorized(backup: &Backup, headers: &HeaderMap) -> bool {
    match &backup.token {
        None => true,
        Some(token) => headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {token}")),
    }
}

fn metadata_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = HeaderMap::new();
    for (name, value) in headers {
        if name.as_str().starts_with("x-logsql-") {
            kept.insert(name.clone(), value.clone());
        }
    }
    kept
}

async fn put_object(
    State(backup): State<Backup>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: BodyBytes,
) -> StatusCode {
    if !authorized(&backup, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    backup
        .objects
        .lock()
        .await
        .insert(key, (metadata_headers(&headers), body.to_vec()));
    StatusCode::NO_CONTENT
}

async fn get_object(
    State(backup): State<Backup>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !authorized(&backup, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match backup.objects.lock().await.get(&key) {
        Some((meta, body)) => (StatusCode::OK, meta.clone(), body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve(backup: Backup) -> SocketAddr {
    let router = Router::new()
        .route("/objects/:key", get(get_object).put(put_object))
        .with_state(backup);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn meta() -> ObjectMeta {
    ObjectMeta {
        sequence: 2048,
        modified_ms: 1_700_000_000_000,
        node_id: "7b0c2f0e".into(),
    }
}

#[tokio::test]
async fn upload_then_download_with_metadata() {
    let addr = serve(Backup::default()).await;
    let store = HttpObjectStore::new(format!("http://{addr}/objects"), None).unwrap();

    assert!(store.get("snapshot").await.unwrap().is_none());
    assert!(store.info("snapshot").await.unwrap().is_none());

    let size = store
        .put("snapshot", Bytes::from_static(b"database image"), meta())
        .await
        .unwrap();
    assert_eq!(size, 14);

    let info = store.info("snapshot").await.unwrap().unwrap();
    assert_eq!(info.meta, meta());
    assert_eq!(info.size, 14);

    let object = store.get("snapshot").await.unwrap().unwrap();
    assert_eq!(object.data, Bytes::from_static(b"database image"));
    assert_eq!(object.meta, meta());
}

#[tokio::test]
async fn bearer_token_is_sent() {
    let backup = Backup {
        token: Some("s3cret".into()),
        ..Default::default()
    };
    let addr = serve(backup).await;

    let anonymous = HttpObjectStore::new(format!("http://{addr}/objects"), None).unwrap();
    let err = anonymous
        .put("snapshot", Bytes::from_static(b"x"), meta())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("401"));

    let store = HttpObjectStore::new(format!("http://{addr}/objects"), Some("s3cret".into())).unwrap();
    store.put("snapshot", Bytes::from_static(b"x"), meta()).await.unwrap();
    assert!(store.get("snapshot").await.unwrap().is_some());
}

#[tokio::test]
async fn unreachable_endpoint_is_a_snapshot_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = HttpObjectStore::new(format!("http://{addr}"), None).unwrap();
    let err = store.get("snapshot").await.unwrap_err();
    assert!(matches!(err, common::DbError::Snapshot(_)));
}
