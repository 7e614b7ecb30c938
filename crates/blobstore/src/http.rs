//! Object store reached over plain HTTP.
//!
//! Objects live at `{base_url}/{key}`:
//!
//! - `PUT` uploads the body with metadata in `x-logsql-*` headers
//! - `GET` returns the body and the same headers
//! - `HEAD` returns only the headers
//!
//! A `404` means the object does not exist.

use crate::{store_error, ObjectInfo, ObjectMeta, ObjectStore, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use common::{DbError, DbResult};
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

pub const SEQUENCE_HEADER: &str = "x-logsql-sequence";
pub const MODIFIED_HEADER: &str = "x-logsql-modified-ms";
pub const NODE_HEADER: &str = "x-logsql-node";
pub const SIZE_HEADER: &str = "x-logsql-size";

#[derive(Clone)]
pub struct HttpObjectStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> DbResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| DbError::Snapshot(format!("create http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, key: &str, action: &str, request: RequestBuilder) -> DbResult<Option<Response>> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| store_error(action, key, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(store_error(action, key, format!("HTTP {status}: {body}")))
            }
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn meta_from_headers(headers: &HeaderMap) -> ObjectMeta {
    ObjectMeta {
        sequence: header_u64(headers, SEQUENCE_HEADER).unwrap_or(0),
        modified_ms: header_u64(headers, MODIFIED_HEADER).unwrap_or(0),
        node_id: headers
            .get(NODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, data: Bytes, meta: ObjectMeta) -> DbResult<u64> {
        let size = data.len() as u64;
        let request = self
            .client
            .put(self.url(key))
            .header(SEQUENCE_HEADER, meta.sequence.to_string())
            .header(MODIFIED_HEADER, meta.modified_ms.to_string())
            .header(NODE_HEADER, meta.node_id.as_str())
            .header(SIZE_HEADER, size.to_string())
            .body(data);
        match self.send(key, "upload", request).await? {
            Some(_) => {
                tracing::debug!(key, size, url = %self.base_url, "uploaded object");
                Ok(size)
            }
            None => Err(store_error("upload", key, "endpoint not found")),
        }
    }

    async fn get(&self, key: &str) -> DbResult<Option<StoredObject>> {
        let Some(response) = self.send(key, "download", self.client.get(self.url(key))).await?
        else {
            return Ok(None);
        };
        let meta = meta_from_headers(response.headers());
        let data = response
            .bytes()
            .await
            .map_err(|e| store_error("download", key, e))?;
        Ok(Some(StoredObject {
            meta,
            size: data.len() as u64,
            data,
        }))
    }

    async fn info(&self, key: &str) -> DbResult<Option<ObjectInfo>> {
        let Some(response) = self.send(key, "stat", self.client.head(self.url(key))).await? else {
            return Ok(None);
        };
        let headers = response.headers();
        let size = header_u64(headers, SIZE_HEADER)
            .or_else(|| header_u64(headers, CONTENT_LENGTH.as_str()))
            .unwrap_or(0);
        Ok(Some(ObjectInfo {
            meta: meta_from_headers(headers),
            size,
        }))
    }
}
