//! Activity endpoint routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use nestlog_engine::wire::{ActivityPage, CreateActivityRequest, RemoteActivity, UpdateActivityRequest};

use crate::error::Result;
use crate::handlers::{handle_create, handle_delete, handle_get, handle_list, handle_update, ListQuery};
use crate::AppState;

/// Create activity routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/activities", get(list_handler).post(create_handler))
        .route(
            "/activities/{id}",
            get(get_handler).patch(update_handler).delete(delete_handler),
        )
}

/// POST /activities - 201 for a new row, 200 when the client id is known.
async fn create_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateActivityRequest>,
) -> Result<(StatusCode, Json<RemoteActivity>)> {
    let (activity, created) = handle_create(&state.store, request)?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(activity)))
}

/// PATCH /activities/{id}
async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateActivityRequest>,
) -> Result<Json<RemoteActivity>> {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let activity = handle_update(&state.store, &id, request, now)?;
    Ok(Json(activity))
}

/// GET /activities?owner=&page=&limit=
async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ActivityPage>> {
    let page = handle_list(&state.store, query, state.config.max_page_size)?;
    Ok(Json(page))
}

/// GET /activities/{id}
async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RemoteActivity>> {
    Ok(Json(handle_get(&state.store, &id)?))
}

/// DELETE /activities/{id}
async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    handle_delete(&state.store, &id)?;
    Ok(StatusCode::NO_CONTENT)
}
