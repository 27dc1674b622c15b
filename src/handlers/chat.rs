use axum::{extract::rejection::JsonRejection, extract::State, Extension, Json};
use chrono::Local;

use crate::auth::middleware::AuthUser;
use crate::dto::{validate_request, ChatRequest, ChatResponse, ChatUsage};
use crate::error::{AppError, AppResult};
use crate::models::subscription::is_approaching_limit;
use crate::services::{assistant, entitlements};
use crate::AppState;

/// Count the message first, then call the model; a failed call refunds it.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Json<ChatResponse>> {
    let Json(body) = body?;
    validate_request(&body)?;

    if !state.config.assistant_enabled() {
        return Err(AppError::Internal(anyhow::anyhow!("AI assistant not configured")));
    }

    if let Err(retry_after) = state.chat_limiter.check(&auth_user.id).await {
        tracing::warn!(
            user_id = %auth_user.id,
            retry_after_secs = retry_after.as_secs(),
            "Chat rate limit exceeded"
        );
        return Err(AppError::RateLimited);
    }

    let store = state.store.as_ref();
    let sub = entitlements::reserve_ai_message(store, &auth_user.id, Local::now()).await?;

    let reply = match assistant::ask(&state.http, &state.config, &body.history, &body.message).await {
        Ok(reply) => reply,
        Err(e) => {
            if let Err(refund_err) =
                entitlements::release_ai_message(store, &auth_user.id, Local::now()).await
            {
                tracing::error!(user_id = %auth_user.id, error = %refund_err, "Failed to refund AI message");
            }
            return Err(AppError::Upstream(e.to_string()));
        }
    };

    let used = sub.usage.ai_chat_messages_this_month;
    let allowed = sub.limits.ai_chat_messages_per_month;
    Ok(Json(ChatResponse {
        reply,
        usage: ChatUsage {
            ai_chat_messages_this_month: used,
            ai_chat_messages_per_month: allowed,
            approaching_limit: is_approaching_limit(used, allowed),
        },
    }))
}
