use axum::{body::Bytes, extract::State, http::HeaderMap, Extension, Json};
use chrono::Local;

use crate::auth::middleware::AuthUser;
use crate::dto::{CheckoutResponse, WebhookAck};
use crate::error::{AppError, AppResult};
use crate::models::subscription::{SubscriptionData, SubscriptionStatus};
use crate::services::entitlements::{self, BillingChange};
use crate::services::stripe::{self, BillingTarget, StripeClient, StripeEvent};
use crate::AppState;

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AppResult<Json<SubscriptionData>> {
    let sub = entitlements::load_subscription(state.store.as_ref(), &auth_user.id, Local::now()).await?;
    Ok(Json(sub))
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AppResult<Json<CheckoutResponse>> {
    let client = StripeClient::new(state.http.clone(), &state.config)?;
    let store = state.store.as_ref();

    let sub = entitlements::load_subscription(store, &auth_user.id, Local::now()).await?;
    if sub.stripe_subscription_id.is_some() && sub.status == SubscriptionStatus::Active {
        return Err(AppError::Conflict("Subscription already active".into()));
    }

    let customer_id = match sub.stripe_customer_id {
        Some(cid) => cid,
        None => {
            let cid = client
                .create_customer(&auth_user.id, auth_user.email.as_deref())
                .await?;
            entitlements::apply_billing_change(
                store,
                &auth_user.id,
                Local::now(),
                &BillingChange {
                    stripe_customer_id: Some(cid.clone()),
                    ..Default::default()
                },
            )
            .await?;
            cid
        }
    };

    let checkout_url = client
        .create_checkout_session(&auth_user.id, &customer_id)
        .await?;

    tracing::info!(user_id = %auth_user.id, customer_id = %customer_id, "Checkout session created");
    Ok(Json(CheckoutResponse { checkout_url }))
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    if !state.config.stripe_webhook_secret.is_empty() {
        let sig_header = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Validation("Missing Stripe-Signature header".into()))?;

        stripe::verify_signature(
            &body,
            sig_header,
            &state.config.stripe_webhook_secret,
            chrono::Utc::now().timestamp(),
        )?;
    } else {
        tracing::warn!("Stripe webhook secret not configured, signature verification skipped");
    }

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid webhook payload: {}", e)))?;

    tracing::info!(event_type = %event.event_type, event_id = %event.id, "Stripe webhook received");

    // Recorded only after a successful apply, so a failed one is retried.
    let store = state.store.as_ref();
    if store.is_stripe_event_recorded(&event.id).await? {
        tracing::debug!(event_id = %event.id, "Stripe event already processed, skipping");
        return Ok(Json(WebhookAck {
            received: true,
            duplicate: true,
        }));
    }

    match stripe::billing_update_for(&event)? {
        Some(update) => {
            let user_id = match update.target {
                BillingTarget::User(user_id) => Some(user_id),
                BillingTarget::Customer(customer_id) => {
                    store.find_user_by_stripe_customer(&customer_id).await?
                }
            };

            match user_id {
                Some(user_id) => {
                    entitlements::apply_billing_change(store, &user_id, Local::now(), &update.change)
                        .await?;
                }
                None => {
                    tracing::warn!(event_id = %event.id, "No user matches Stripe event, ignoring");
                }
            }
        }
        None => {
            tracing::debug!(event_type = %event.event_type, "Unhandled Stripe event");
        }
    }

    // A concurrent delivery of the same event may have recorded it first.
    let first_delivery = store.record_stripe_event(&event.id, &event.event_type).await?;

    Ok(Json(WebhookAck {
        received: true,
        duplicate: !first_delivery,
    }))
}
