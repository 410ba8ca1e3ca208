use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use fleet_common::{ErrorKind, FleetError, Topology};
use fleet_meta::{keys, MetaStore, MetaStoreExt};

use crate::metrics::{healthz_handler, metrics_handler, SharedMetrics};
use crate::reconcile::Orchestrator;
use crate::trigger::reconcile_and_record;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn MetaStore>,
    pub metrics: Arc<SharedMetrics>,
    /// Fires on shutdown; requested runs stop launching steps.
    pub cancel: CancellationToken,
}

impl FromRef<AppState> for Arc<SharedMetrics> {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    code: ErrorKind,
    message: String,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(err: &FleetError) -> Response {
    let status = match err.kind() {
        ErrorKind::InvalidTopology | ErrorKind::InvalidTaintSet => StatusCode::BAD_REQUEST,
        ErrorKind::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        error: ErrorDetail {
            code: err.kind(),
            message: err.to_string(),
            request_id: format!("req_{}", Uuid::new_v4()),
        },
    };
    (status, Json(body)).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/topology", get(get_topology).put(put_topology))
        .route("/v1/plan", post(plan))
        .route("/v1/reconcile", post(reconcile))
        .route("/v1/pools", get(list_pools))
        .route("/v1/placements", get(list_placements))
        .route("/v1/reports/last", get(last_report))
        .with_state(state)
}

/// GET /v1/topology: the stored target, or 404 when none was submitted.
pub async fn get_topology(State(st): State<AppState>) -> Response {
    match st.store.get_json::<Topology>(keys::TARGET_TOPOLOGY_KEY).await {
        Ok(Some((topology, _))) => Json(topology).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(&FleetError::from(e)),
    }
}

/// PUT /v1/topology: store a new target; the store watch reconciles it.
pub async fn put_topology(State(st): State<AppState>, Json(target): Json<Topology>) -> Response {
    if let Err(e) = target.validate() {
        return error_response(&e);
    }
    match st.store.put_json(keys::TARGET_TOPOLOGY_KEY, &target).await {
        Ok(revision) => {
            info!(revision, pools = target.pools.len(), workloads = target.workloads.len(), "target topology stored");
            (StatusCode::ACCEPTED, Json(serde_json::json!({ "revision": revision }))).into_response()
        }
        Err(e) => error_response(&FleetError::from(e)),
    }
}

/// POST /v1/plan: dry run against the current observation.
pub async fn plan(State(st): State<AppState>, Json(target): Json<Topology>) -> Response {
    match st.orchestrator.plan(&target).await {
        Ok(plan) => Json(plan).into_response(),
        Err(e) => {
            warn!(error=%e, "plan request failed");
            error_response(&e)
        }
    }
}

/// POST /v1/reconcile: converge toward the posted topology, store the report
/// and return it.
pub async fn reconcile(State(st): State<AppState>, Json(target): Json<Topology>) -> Response {
    let report = reconcile_and_record(&st.orchestrator, st.store.as_ref(), &target, &st.cancel).await;
    let status = match report.error.as_ref().map(|e| e.kind) {
        Some(ErrorKind::InvalidTopology) => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::SERVICE_UNAVAILABLE,
        None => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

pub async fn list_pools(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.orchestrator.pools().snapshot().await)
}

pub async fn list_placements(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.orchestrator.placements().snapshot().await)
}

pub async fn last_report(State(st): State<AppState>) -> Response {
    match st.orchestrator.last_report().await {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
