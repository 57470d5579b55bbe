//! Axum admin surface: the update trigger and sync status endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cps_storage::{MetaStore, PgStore};
use cps_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cps-web";

#[derive(Debug, Serialize)]
struct UpdateOkBody {
    status: &'static str,
    summary: SyncRunSummary,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    #[serde(rename = "lastUpdateTime")]
    last_update_time: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/admin/update", get(admin_update_handler))
        .route("/api/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CPS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let config = SyncConfig::from_env();
    let store = PgStore::connect(&config.database_url).await?;
    let pipeline = Arc::new(SyncPipeline::new(config, Arc::new(store))?);

    let scheduler = SyncPipeline::maybe_build_scheduler(&pipeline).await?;
    if let Some(mut sched) = scheduler {
        sched.start().await?;
        info!("sync scheduler started");
    }

    let state = AppState::new(pipeline);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Admin-only trigger for a full sync cycle. Returns a JSON success envelope
/// with the run summary, or a 500 with an error message when the run aborts.
async fn admin_update_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => {
            info!(run_id = %summary.run_id, "update triggered via admin endpoint");
            Json(UpdateOkBody {
                status: "success",
                summary,
            })
            .into_response()
        }
        Err(err) => {
            error!(%err, "admin-triggered update failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    status: "error",
                    message: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().last_update().await {
        Ok(last_update) => Json(StatusBody {
            last_update_time: last_update.map(|dt| dt.to_rfc3339()),
        })
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                status: "error",
                message: err.to_string(),
            }),
        )
            .into_response(),
    }
}
