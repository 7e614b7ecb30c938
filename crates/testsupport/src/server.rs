//! A replica behind a real HTTP server.
//!
//! [`TestServer`] runs the full stack in-process so integration tests can
//! exercise the public HTTP API with a real client.

use crate::context::TestNode;
use anyhow::Result;
use protocol::QueryResponse;
use serde_json::Value as Json;
use server::ServerHandle;
use std::net::SocketAddr;

pub struct TestServer {
    pub node: TestNode,
    handle: ServerHandle,
    client: reqwest::Client,
}

impl TestServer {
    /// Start a node and serve it on `127.0.0.1` with a random port.
    pub async fn start() -> Result<Self> {
        Self::with_node(TestNode::start().await?).await
    }

    pub async fn with_node(node: TestNode) -> Result<Self> {
        let addr: SocketAddr = "127.0.0.1:0".parse()?;
        let handle = server::start_server(addr, node.context()?).await?;
        Ok(Self {
            node,
            handle,
            client: reqwest::Client::new(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.handle.local_addr())
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// `POST /db/query` with a JSON payload.
    pub async fn post_query(&self, payload: &Json) -> Result<(u16, QueryResponse)> {
        let response = self
            .client
            .post(self.url("/db/query"))
            .json(payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        Ok((status, response.json().await?))
    }

    /// `GET /db/query?q=<statement>`.
    pub async fn get_query(&self, statement: &str) -> Result<(u16, QueryResponse)> {
        let response = self
            .client
            .get(self.url("/db/query"))
            .query(&[("q", statement)])
            .send()
            .await?;
        let status = response.status().as_u16();
        Ok((status, response.json().await?))
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.handle.shutdown();
        self.handle.wait().await?;
        self.node.stop().await
    }
}
