use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::job::{GenerationJob, JobStatus};
use crate::models::CourseGenerationRequest;
use crate::outline::StoredOutline;
use crate::pipeline::CourseGenerator;

#[derive(Clone)]
pub struct AppState {
    pub generator: CourseGenerator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // generation jobs
        .route("/api/course-generation", post(start_generation))
        .route("/api/course-generation/:job_id", get(get_job))
        .route("/api/course-generation/:job_id/cancel", post(cancel_job))
        // generated outlines
        .route("/api/outlines/:outline_id", get(get_outline))
        .with_state(state)
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StartGenerationResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancellation_requested: bool,
}

async fn start_generation(
    State(state): State<AppState>,
    Json(req): Json<CourseGenerationRequest>,
) -> ApiResult<(StatusCode, Json<StartGenerationResponse>)> {
    let handle = state.generator.generate_course(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartGenerationResponse {
            job_id: handle.job_id(),
            status: handle.job.status,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<GenerationJob>> {
    let job = state
        .generator
        .storage()
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("generation job {job_id}")))?;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let job = state
        .generator
        .storage()
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("generation job {job_id}")))?;
    if job.status.is_terminal() {
        return Err(ApiError::Conflict(format!("generation job already {}", job.status)));
    }
    if !state.generator.cancel(job_id) {
        return Err(ApiError::Conflict(
            "generation job is not running in this process".into(),
        ));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id,
            cancellation_requested: true,
        }),
    ))
}

async fn get_outline(
    State(state): State<AppState>,
    Path(outline_id): Path<Uuid>,
) -> ApiResult<Json<StoredOutline>> {
    let outline = state
        .generator
        .storage()
        .get_outline(outline_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("outline {outline_id}")))?;
    Ok(Json(outline))
}
