use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    application::{
        content::{ContentStore, ListQuery},
        error::HttpError,
    },
    cache::{
        CacheService, ClearTarget, TtlPreset, clear_cache, clear_cache_layer, collection_patterns,
        resource_cache, response_cache_layer, route_cache,
    },
};

use super::middleware::{log_responses, resolve_caller, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub content: Arc<ContentStore>,
    pub cache: Arc<CacheService>,
}

pub fn build_router(state: HttpState) -> Router {
    let cache = Arc::clone(&state.cache);

    let listings = Router::new()
        .route("/api/{collection}", get(list_items))
        .layer(middleware::from_fn_with_state(
            resource_cache(Arc::clone(&cache), "collection", TtlPreset::Medium),
            response_cache_layer,
        ));

    let details = Router::new()
        .route("/api/{collection}/{id}", get(get_item))
        .layer(middleware::from_fn_with_state(
            route_cache(Arc::clone(&cache), TtlPreset::Long),
            response_cache_layer,
        ));

    let mutations = Router::new()
        .route("/api/{collection}", post(create_item))
        .route(
            "/api/{collection}/{id}",
            put(replace_item)
                .patch(patch_item)
                .delete(delete_item),
        )
        .layer(middleware::from_fn_with_state(
            clear_cache(Arc::clone(&cache), ClearTarget::Derived(collection_patterns)),
            clear_cache_layer,
        ));

    let health = Router::new().route("/health/cache", get(cache_health));

    listings
        .merge(details)
        .merge(mutations)
        .merge(health)
        .with_state(state)
        .layer(middleware::from_fn(resolve_caller))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn list_items(
    State(state): State<HttpState>,
    Path(collection): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, HttpError> {
    let page = state.content.list(&collection, &query).await?;
    Ok(Json(page).into_response())
}

async fn get_item(
    State(state): State<HttpState>,
    Path((collection, id)): Path<(String, Uuid)>,
) -> Result<Response, HttpError> {
    let item = state.content.get(&collection, id).await?;
    Ok(Json(item).into_response())
}

async fn create_item(
    State(state): State<HttpState>,
    Path(collection): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Response, HttpError> {
    let item = state.content.create(&collection, payload).await?;
    Ok((StatusCode::CREATED, Json(item)).into_response())
}

async fn replace_item(
    State(state): State<HttpState>,
    Path((collection, id)): Path<(String, Uuid)>,
    Json(payload): Json<Value>,
) -> Result<Response, HttpError> {
    let item = state.content.replace(&collection, id, payload).await?;
    Ok(Json(item).into_response())
}

async fn patch_item(
    State(state): State<HttpState>,
    Path((collection, id)): Path<(String, Uuid)>,
    Json(payload): Json<Value>,
) -> Result<Response, HttpError> {
    let item = state.content.patch(&collection, id, payload).await?;
    Ok(Json(item).into_response())
}

async fn delete_item(
    State(state): State<HttpState>,
    Path((collection, id)): Path<(String, Uuid)>,
) -> Result<Response, HttpError> {
    state.content.delete(&collection, id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Always 200: a degraded cache still serves from memory.
async fn cache_health(State(state): State<HttpState>) -> Response {
    Json(state.cache.status()).into_response()
}
