//! Query routing.
//!
//! Reads run against the local database and answer synchronously. Writes
//! are published to the log and answered with the publish acknowledgement;
//! they reach this replica's database only through its consumer.
//!
//! | route | behavior |
//! |---|---|
//! | `GET /health` | `{"status":"ok"}` |
//! | `GET /db/query?q=<sql>` | single statement, routed like a one-element batch |
//! | `POST /db/query` | JSON batch body |

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use common::elapsed_ms;
use database::ApplyResult;
use parser::StatementBatch;
use protocol::{HealthResponse, QueryResponse, StatementResult};
use replication::NodeContext;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct QueryParams {
    q: Option<String>,
}

/// Build the router for a node.
pub fn create_router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/db/query", get(handle_query_get).post(handle_query_post))
        .with_state(ctx)
}

/// Bind `addr` and serve the node's router until shut down.
pub async fn start_server(addr: SocketAddr, ctx: Arc<NodeContext>) -> std::io::Result<ServerHandle> {
    let router = create_router(ctx);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        server_handle,
    })
}

/// A running HTTP server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections; in-flight requests complete.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the server task to finish.
    pub async fn wait(self) -> Result<(), std::io::Error> {
        match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(format!("server task panicked: {e}"))),
        }
    }
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

async fn handle_query_get(
    State(ctx): State<Arc<NodeContext>>,
    Query(params): Query<QueryParams>,
) -> Response {
    let received_at = Instant::now();
    let Some(q) = params.q else {
        return respond(
            StatusCode::BAD_REQUEST,
            QueryResponse::statement_error("missing query", elapsed_ms(received_at.elapsed())),
        );
    };
    let batch = parser::classify(JsonValue::Array(vec![JsonValue::String(q)]), received_at);
    execute(&ctx, batch).await
}

async fn handle_query_post(State(ctx): State<Arc<NodeContext>>, body: Bytes) -> Response {
    let received_at = Instant::now();
    let data: JsonValue = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            return respond(
                StatusCode::BAD_REQUEST,
                QueryResponse::statement_error(
                    format!("invalid JSON: {e}"),
                    elapsed_ms(received_at.elapsed()),
                ),
            );
        }
    };
    execute(&ctx, parser::classify(data, received_at)).await
}

async fn execute(ctx: &NodeContext, batch: StatementBatch) -> Response {
    if let Some(err) = batch.validation_error() {
        debug!(error = %err, "rejected batch");
        return respond(
            StatusCode::BAD_REQUEST,
            QueryResponse::statement_error(err.to_string(), elapsed(&batch)),
        );
    }

    if batch.is_read {
        let response = match ctx.query(&batch).await {
            Ok(result) => QueryResponse::single(to_statement_result(result), elapsed(&batch)),
            Err(e) => QueryResponse::statement_error(e.to_string(), elapsed(&batch)),
        };
        return respond(StatusCode::OK, response);
    }

    let response = match ctx.publish(&batch).await {
        Ok(ack) => QueryResponse::single(StatementResult::published(ack), elapsed(&batch)),
        Err(e) => {
            warn!(error = %e, "publish failed");
            QueryResponse::publish_error(e.to_string(), elapsed(&batch))
        }
    };
    respond(StatusCode::OK, response)
}

fn elapsed(batch: &StatementBatch) -> f64 {
    elapsed_ms(batch.received_at.elapsed())
}

fn to_statement_result(result: ApplyResult) -> StatementResult {
    match result {
        ApplyResult::Rows { columns, rows } => StatementResult::rows(&columns, &rows),
        ApplyResult::Write {
            rows_affected,
            last_insert_id,
        }
        | ApplyResult::Bulk {
            rows_affected,
            last_insert_id,
            ..
        } => StatementResult::write(rows_affected, last_insert_id),
    }
}

fn respond(status: StatusCode, body: QueryResponse) -> Response {
    (status, Json(body)).into_response()
}
