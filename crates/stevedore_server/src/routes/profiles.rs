//! Profile CRUD. Secrets are write-only here: responses never carry
//! credential material.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use stevedore_protocol::ids::ProfileId;
use stevedore_protocol::types::{Profile, ProfileFlags, ProfileSecrets, Provider};
use stevedore_store::{NewProfile, ProfileUpdate};

use crate::error::ApiError;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProfileRequest {
    name: String,
    provider: Provider,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    flags: ProfileFlags,
    #[serde(default)]
    secrets: ProfileSecrets,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    flags: Option<ProfileFlags>,
    #[serde(default)]
    secrets: Option<ProfileSecrets>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateProfileRequest>,
) -> Result<(StatusCode, Json<Profile>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::validation("profile name must not be empty"));
    }
    let profile = state
        .store
        .create_profile(NewProfile {
            name: request.name,
            provider: request.provider,
            endpoint: request.endpoint,
            region: request.region,
            flags: request.flags,
            secrets: request.secrets,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Profile>>, ApiError> {
    Ok(Json(state.store.list_profiles().await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.get_profile(&id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<Json<Profile>, ApiError> {
    let id = parse_id(&id)?;
    let profile = state
        .store
        .update_profile(
            &id,
            ProfileUpdate {
                name: request.name,
                endpoint: request.endpoint.map(Some),
                region: request.region.map(Some),
                flags: request.flags,
                secrets: request.secrets,
            },
        )
        .await?;
    Ok(Json(profile))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    if !state.store.delete_profile(&id).await? {
        return Err(ApiError::not_found(format!("profile {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str) -> Result<ProfileId, ApiError> {
    ProfileId::parse(raw).map_err(|e| ApiError::validation(e.to_string()))
}
