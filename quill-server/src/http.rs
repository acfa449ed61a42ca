//! Plain HTTP endpoints next to the collaboration socket.
//!
//! - `GET /` — liveness plus hub counters
//! - `POST /rollback/{document_id}/{version}` — restore a saved version

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use quill_collab::{DocumentId, FanoutHub, HubError, StoreError};
use serde::Serialize;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

/// Body of `GET /`.
#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
    system: &'static str,
    documents: usize,
    connections: usize,
    published: u64,
    publish_failures: u64,
    lag_events: u64,
}

/// Body of a successful rollback.
#[derive(Debug, Serialize)]
struct RollbackBody {
    status: &'static str,
    document_id: String,
    version_restored: u64,
}

/// All routes, for serving or for `warp::test`.
pub fn routes(hub: Arc<FanoutHub>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let status = warp::path::end()
        .and(warp::get())
        .and(with_hub(hub.clone()))
        .and_then(handle_status);

    let rollback = warp::path!("rollback" / String / u64)
        .and(warp::post())
        .and(with_hub(hub))
        .and_then(handle_rollback);

    status.or(rollback)
}

/// Serve [`routes`] on `addr` until the future is dropped.
pub async fn serve(addr: SocketAddr, hub: Arc<FanoutHub>) {
    log::info!("HTTP endpoints listening on {addr}");
    warp::serve(routes(hub)).run(addr).await;
}

fn with_hub(hub: Arc<FanoutHub>) -> impl Filter<Extract = (Arc<FanoutHub>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&hub))
}

async fn handle_status(hub: Arc<FanoutHub>) -> Result<impl Reply, Rejection> {
    let stats = hub.stats().await;
    Ok(warp::reply::json(&StatusBody {
        status: "running",
        system: "quill",
        documents: hub.registry().len().await,
        connections: stats.connections,
        published: stats.published,
        publish_failures: stats.publish_failures,
        lag_events: stats.lag_events,
    }))
}

async fn handle_rollback(
    document_id: String,
    version: u64,
    hub: Arc<FanoutHub>,
) -> Result<WithStatus<Json>, Rejection> {
    let id = DocumentId::from(document_id.as_str());
    let reply = match hub.rollback(&id, version).await {
        Ok(_) => {
            let body = RollbackBody { status: "success", document_id, version_restored: version };
            warp::reply::with_status(warp::reply::json(&body), StatusCode::OK)
        }
        Err(HubError::Store(StoreError::VersionNotFound { .. })) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "detail": "Version not found" })),
            StatusCode::NOT_FOUND,
        ),
        Err(e) => {
            log::error!("Rollback of {id} to version {version} failed: {e}");
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "detail": e.to_string() })),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    };
    Ok(reply)
}
