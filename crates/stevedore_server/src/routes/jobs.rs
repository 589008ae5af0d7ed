//! Job submission, listing, cancellation, deletion, logs and
//! artifacts.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use stevedore_protocol::capabilities::capabilities_for;
use stevedore_protocol::ids::{JobId, ProfileId};
use stevedore_protocol::types::{Job, JobStatus, JobType};
use stevedore_store::JobFilter;

use crate::error::ApiError;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    profile_id: ProfileId,
    #[serde(rename = "type")]
    job_type: JobType,
    payload: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(rename = "type", default)]
    job_type: Option<JobType>,
    #[serde(default)]
    profile_id: Option<ProfileId>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsResponse {
    jobs: Vec<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<JobId>,
}

pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let profile = state.store.get_profile(&request.profile_id).await?;
    let capability = capabilities_for(profile.provider).job_transfer;
    if !capability.supported {
        return Err(ApiError::validation(format!(
            "provider {} does not support transfer jobs: {}",
            profile.provider,
            capability.reason.unwrap_or("unsupported")
        )));
    }

    let job = state
        .jobs
        .submit(&request.profile_id, request.job_type, request.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let cursor = query
        .cursor
        .as_deref()
        .map(JobId::parse)
        .transpose()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    let filter = JobFilter {
        status: query.status,
        job_type: query.job_type,
        profile_id: query.profile_id,
    };
    let (jobs, next_cursor) = state
        .store
        .list_jobs(&filter, cursor.as_ref(), query.limit.unwrap_or(50))
        .await?;
    Ok(Json(ListJobsResponse { jobs, next_cursor }))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.get_job(&id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.jobs.cancel(&id).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.jobs.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Raw per-job log file.
pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    // 404 for unknown jobs, empty body for jobs that logged nothing.
    let _ = state.store.get_job(&id).await?;
    let path = state
        .settings
        .jobs_log_dir()
        .join(format!("{}.log", id.as_str()));
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                e.to_string(),
                stevedore_protocol::error::NormalizedErrorCode::Unknown,
            ))
        }
    };
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(content))
        .unwrap())
}

/// Zip artifact download; only advertised (and only present) for
/// succeeded zip jobs.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let job = state.store.get_job(&id).await?;
    if !job.job_type.produces_artifact() || job.status != JobStatus::Succeeded {
        return Err(ApiError::not_found(format!("job {id} has no artifact")));
    }
    let path = state
        .settings
        .artifacts_dir()
        .join(format!("{}.zip", id.as_str()));
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("artifact for job {id}")))?;
    let stream = ReaderStream::new(file);
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.zip\"", id.as_str()),
        )
        .body(Body::from_stream(stream))
        .unwrap())
}

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw).map_err(|e| ApiError::validation(e.to_string()))
}
