use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::models::{EnrolReq, EnrolResp, InstanceInfo};
use crate::store::{StorageError, Store};
use crate::task::{RunReport, SyncError, SyncTask};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub task: Arc<SyncTask<Store>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/instances/:instance_id", get(instance_info))
        .route("/api/enrolments", post(enrol))
        .route("/api/sync/run", post(run_sync))
        .with_state(state)
}

async fn instance_info(
    State(state): State<AppState>,
    Path(instance_id): Path<i64>,
) -> Result<Json<InstanceInfo>, (StatusCode, String)> {
    let info = state
        .store
        .instance_info(instance_id)
        .await
        .map_err(storage_err)?;
    Ok(Json(info))
}

async fn enrol(
    State(state): State<AppState>,
    Json(req): Json<EnrolReq>,
) -> Result<Json<EnrolResp>, (StatusCode, String)> {
    let newly = state
        .store
        .enrol_learner(req.instance_id, req.learner_id)
        .await
        .map_err(storage_err)?;
    Ok(Json(EnrolResp {
        status: true,
        already_enrolled: !newly,
    }))
}

async fn run_sync(
    State(state): State<AppState>,
) -> Result<Json<RunReport>, (StatusCode, String)> {
    match state.task.run().await {
        Ok(report) => Ok(Json(report)),
        // The run itself finished; the remote refused some of it.
        Err(SyncError::RunFailed(report)) => Err((
            StatusCode::BAD_GATEWAY,
            serde_json::to_string(&report).unwrap_or_default(),
        )),
        Err(SyncError::Storage(e)) => Err(e500(e)),
    }
}

// --- helpers ---

fn storage_err(e: StorageError) -> (StatusCode, String) {
    match e {
        StorageError::SessionNotFound(_)
        | StorageError::LearnerNotFound(_)
        | StorageError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        StorageError::Db(_) => e500(e),
    }
}

fn e500<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    tracing::error!(error = %e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
