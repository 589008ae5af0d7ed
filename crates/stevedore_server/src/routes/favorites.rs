//! Favorite bucket/prefix bookmarks.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use stevedore_protocol::ids::ProfileId;
use stevedore_store::{Favorite, NewFavorite};

use crate::error::ApiError;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFavoriteRequest {
    profile_id: ProfileId,
    bucket: String,
    #[serde(default)]
    prefix: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFavoritesQuery {
    #[serde(default)]
    profile_id: Option<ProfileId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteView {
    id: String,
    profile_id: String,
    bucket: String,
    prefix: String,
    name: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Favorite> for FavoriteView {
    fn from(f: Favorite) -> Self {
        Self {
            id: f.id,
            profile_id: f.profile_id,
            bucket: f.bucket,
            prefix: f.prefix,
            name: f.name,
            created_at: f.created_at,
        }
    }
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateFavoriteRequest>,
) -> Result<(StatusCode, Json<FavoriteView>), ApiError> {
    if request.bucket.is_empty() || request.name.trim().is_empty() {
        return Err(ApiError::validation("bucket and name are required"));
    }
    let favorite = state
        .store
        .create_favorite(NewFavorite {
            profile_id: request.profile_id,
            bucket: request.bucket,
            prefix: request.prefix,
            name: request.name,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(favorite.into())))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListFavoritesQuery>,
) -> Result<Json<Vec<FavoriteView>>, ApiError> {
    let favorites = state
        .store
        .list_favorites(query.profile_id.as_ref())
        .await?;
    Ok(Json(favorites.into_iter().map(Into::into).collect()))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_favorite(&id).await? {
        return Err(ApiError::not_found(format!("favorite {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}
