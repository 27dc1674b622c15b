use axum::{extract::rejection::JsonRejection, extract::State, Extension, Json};
use chrono::Local;

use crate::auth::middleware::AuthUser;
use crate::dto::{StorageDeltaRequest, UsageResponse};
use crate::error::AppResult;
use crate::services::entitlements;
use crate::AppState;

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AppResult<Json<UsageResponse>> {
    let sub = entitlements::load_subscription(state.store.as_ref(), &auth_user.id, Local::now()).await?;
    Ok(Json(sub.into()))
}

pub async fn link_institution(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AppResult<Json<UsageResponse>> {
    let sub = entitlements::link_institution(state.store.as_ref(), &auth_user.id, Local::now()).await?;
    tracing::info!(
        user_id = %auth_user.id,
        connections = sub.usage.institution_connections,
        "Institution linked"
    );
    Ok(Json(sub.into()))
}

pub async fn unlink_institution(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AppResult<Json<UsageResponse>> {
    let sub = entitlements::unlink_institution(state.store.as_ref(), &auth_user.id, Local::now()).await?;
    tracing::info!(
        user_id = %auth_user.id,
        connections = sub.usage.institution_connections,
        "Institution unlinked"
    );
    Ok(Json(sub.into()))
}

pub async fn adjust_storage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Result<Json<StorageDeltaRequest>, JsonRejection>,
) -> AppResult<Json<UsageResponse>> {
    let Json(body) = body?;
    let sub = entitlements::adjust_storage(
        state.store.as_ref(),
        &auth_user.id,
        Local::now(),
        body.delta_gb,
    )
    .await?;
    Ok(Json(sub.into()))
}
