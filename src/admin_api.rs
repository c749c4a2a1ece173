// Health/readiness surface and the one operator-triggered job endpoint
// (`POST /admin/kick-report`, mirrored from `run_daily_kick_report`'s
// `force` bypass). Routing and layering follow the teacher's
// `storage_node` binary: a flat `Router` with `Extension` state,
// `TraceLayer` plus a permissive `CorsLayer`.

use crate::notifications::NotificationDispatcher;
use crate::store::Store;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub struct AdminApiState {
    pub store: Store,
    pub notifications: Arc<NotificationDispatcher>,
}

pub fn router(state: Arc<AdminApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admin/kick-report", post(kick_report))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthBody { status: "ok" }))
}

/// Readiness additionally confirms the database connection still answers a
/// trivial query; a stuck or poisoned connection should pull this pod out of
/// rotation even though the process itself is alive.
async fn readyz(Extension(state): Extension<Arc<AdminApiState>>) -> impl IntoResponse {
    match state.store.get_job_state("__readyz_probe__") {
        Ok(_) => (StatusCode::OK, Json(HealthBody { status: "ready" })),
        Err(e) => {
            tracing::error!(error = %e, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(HealthBody { status: "not_ready" }))
        }
    }
}

#[derive(Serialize)]
struct KickReportResponse {
    rows: Vec<KickReportRow>,
}

#[derive(Serialize)]
struct KickReportRow {
    tg_id: i64,
    end_at: String,
}

async fn kick_report(Extension(state): Extension<Arc<AdminApiState>>) -> impl IntoResponse {
    match state.notifications.run_daily_kick_report(crate::clock::utcnow(), true).await {
        Ok(rows) => {
            let rows = rows
                .unwrap_or_default()
                .into_iter()
                .map(|(tg_id, end_at)| KickReportRow { tg_id, end_at: end_at.to_rfc3339() })
                .collect();
            (StatusCode::OK, Json(KickReportResponse { rows })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "operator-triggered kick report failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(HealthBody { status: "error" })).into_response()
        }
    }
}
