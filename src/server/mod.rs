//! Inbound HTTP servers.
//!
//! The callback server answers the cluster manager (liveness, status,
//! blacklist and purge). The action server is the endpoint advertised in
//! every resource report; the resource manager pushes task actions and
//! coordinator start requests to it. Both share one [`Dispatcher`] and the
//! same hardening: a concurrency limit and a per-request timeout.

mod listener;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, SessionAction};
use crate::session::SessionInfo;
use crate::tasks::WorkDescriptor;

pub use listener::BoundListener;

#[derive(Debug, Serialize, Deserialize)]
pub struct AliveResponse {
    pub alive: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: String,
    /// False when the session was already blacklisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklisted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs_purged: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitActionsResponse {
    pub received: usize,
    pub accepted: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartCoordinatorRequest {
    pub work: WorkDescriptor,
    pub session: SessionInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartCoordinatorResponse {
    pub context_id: Option<Uuid>,
}

/// Routes served to the cluster manager.
pub fn callback_router(dispatcher: Arc<Dispatcher>, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/alive", get(alive_handler))
        .route("/status", get(status_handler))
        .route("/sessions/:handle/blacklist", post(blacklist_handler))
        .route("/sessions/:handle/purge", post(purge_handler))
        .with_state(dispatcher);
    harden(router, config)
}

/// Routes on the advertised action endpoint.
pub fn action_router(dispatcher: Arc<Dispatcher>, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/alive", get(alive_handler))
        .route("/actions", post(submit_actions_handler))
        .route("/coordinators", post(start_coordinator_handler))
        .with_state(dispatcher);
    harden(router, config)
}

fn harden(router: Router, config: &ServerConfig) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_millis(config.client_timeout_ms)))
            .layer(ConcurrencyLimitLayer::new(config.handler_pool_size.max(1))),
    )
}

/// Serve until the token is cancelled, then drain in-flight requests.
pub async fn serve(name: &'static str, listener: TcpListener, router: Router, token: CancellationToken) {
    let addr = listener.local_addr().ok();
    tracing::info!(server = name, addr = ?addr, "Starting server");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    match result {
        Ok(()) => tracing::info!(server = name, "Server stopped"),
        Err(e) => tracing::error!(server = name, error = %e, "Server failed"),
    }
}

async fn alive_handler(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(AliveResponse {
        alive: dispatcher.is_alive().await,
    })
}

async fn status_handler(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(dispatcher.status().await)
}

async fn blacklist_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(handle): Path<String>,
) -> impl IntoResponse {
    let blacklisted = dispatcher.blacklist_session(&handle).await;
    Json(SessionResponse {
        session: handle,
        blacklisted: Some(blacklisted),
        jobs_purged: None,
    })
}

async fn purge_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(handle): Path<String>,
) -> impl IntoResponse {
    let jobs_purged = dispatcher.purge_session(&handle).await;
    tracing::info!(session = %handle, jobs = jobs_purged, "Purged session on request");
    Json(SessionResponse {
        session: handle,
        blacklisted: None,
        jobs_purged: Some(jobs_purged),
    })
}

async fn submit_actions_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(actions): Json<Vec<SessionAction>>,
) -> impl IntoResponse {
    let received = actions.len();
    let accepted = dispatcher.submit_actions(actions).await;
    Json(SubmitActionsResponse { received, accepted })
}

async fn start_coordinator_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<StartCoordinatorRequest>,
) -> impl IntoResponse {
    let context_id = dispatcher
        .start_coordinator_for_job(request.work, request.session)
        .await;
    Json(StartCoordinatorResponse { context_id })
}
