//! Upload session endpoints.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use stevedore_protocol::ids::{ProfileId, UploadId};
use stevedore_protocol::types::{Job, UploadMode, UploadSession};
use stevedore_uploads::{CommitOutcome, NewSessionRequest, PresignedPart};

use crate::error::ApiError;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    profile_id: ProfileId,
    bucket: String,
    #[serde(default)]
    prefix: Option<String>,
    mode: UploadMode,
    #[serde(default)]
    bytes_budget: u64,
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateUploadRequest>,
) -> Result<(StatusCode, Json<UploadSession>), ApiError> {
    if request.bucket.is_empty() {
        return Err(ApiError::validation("bucket must not be empty"));
    }
    let session = state
        .uploads
        .create_session(NewSessionRequest {
            profile_id: request.profile_id,
            bucket: request.bucket,
            prefix: request.prefix,
            mode: request.mode,
            bytes_budget: request.bytes_budget,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UploadSession>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.uploads.get_session(&id).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFilesResponse {
    files: Vec<UploadedFile>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    path: String,
    bytes: u64,
}

/// Receive files as multipart form fields. The field's file name is
/// the session-relative path. Staging sessions write to disk; direct
/// sessions stream straight through the engine.
pub async fn upload_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadFilesResponse>, ApiError> {
    let id = parse_id(&id)?;
    let session = state.uploads.get_session(&id).await?;

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        match session.mode {
            UploadMode::Staging => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("failed reading {file_name}: {e}")))?;
                state
                    .uploads
                    .store_staged_file(&id, &file_name, &data)
                    .await?;
                files.push(UploadedFile {
                    path: file_name,
                    bytes: data.len() as u64,
                });
            }
            UploadMode::Direct => {
                let mut reader =
                    StreamReader::new(field.map_err(std::io::Error::other));
                let written = state
                    .uploads
                    .direct_upload(&id, &file_name, &mut reader, &CancellationToken::new())
                    .await?;
                files.push(UploadedFile {
                    path: file_name,
                    bytes: written,
                });
            }
            UploadMode::Presigned => {
                return Err(ApiError::validation(
                    "presigned sessions take uploads directly at the provider",
                ));
            }
        }
    }

    if files.is_empty() {
        return Err(ApiError::validation("no files in the request"));
    }
    Ok(Json(UploadFilesResponse { files }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    path: String,
    #[serde(default)]
    multipart: Option<MultipartSpec>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartSpec {
    part_number: i32,
    part_size: u64,
    file_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum PresignResponse {
    Single { url: String },
    Part(PresignedPart),
}

pub async fn presign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PresignRequest>,
) -> Result<Json<PresignResponse>, ApiError> {
    let id = parse_id(&id)?;
    let response = match request.multipart {
        None => PresignResponse::Single {
            url: state.uploads.presign_put(&id, &request.path).await?,
        },
        Some(spec) => PresignResponse::Part(
            state
                .uploads
                .presign_multipart_part(
                    &id,
                    &request.path,
                    spec.part_number,
                    spec.part_size,
                    spec.file_size,
                )
                .await?,
        ),
    };
    Ok(Json(response))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum CommitResponse {
    Job { job: Job },
    Multipart { completed: usize },
}

pub async fn commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CommitResponse>), ApiError> {
    let id = parse_id(&id)?;
    match state.uploads.commit(&id).await? {
        CommitOutcome::TransferJob {
            job_type,
            payload,
            profile_id,
        } => {
            let job = state.jobs.submit(&profile_id, job_type, payload).await?;
            Ok((StatusCode::CREATED, Json(CommitResponse::Job { job })))
        }
        CommitOutcome::MultipartFinalized { completed } => {
            Ok((StatusCode::OK, Json(CommitResponse::Multipart { completed })))
        }
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.uploads.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str) -> Result<UploadId, ApiError> {
    UploadId::parse(raw).map_err(|e| ApiError::validation(e.to_string()))
}
