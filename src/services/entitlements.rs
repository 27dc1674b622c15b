//! Read-modify-write of a user's subscription record.
//!
//! Writes go through [`update_subscription`], which retries on revision
//! conflicts so two requests for the same user never lose an increment.

use chrono::{DateTime, Local, Utc};
use serde_json::Value;

use crate::db::{PreferenceDocument, PreferenceStore};
use crate::error::{AppError, AppResult};
use crate::models::subscription::{
    default_subscription, has_exceeded_limit, reconcile_monthly_usage, resolve_subscription,
    SubscriptionData, SubscriptionStatus, UsageResource, SUBSCRIPTION_PREF_KEY,
};

const MAX_UPDATE_ATTEMPTS: usize = 5;

/// A billing state change coming from the payment provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillingChange {
    pub status: Option<SubscriptionStatus>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    /// Drop the stored subscription id (subscription deleted).
    pub clear_subscription_id: bool,
}

/// Current subscription with the monthly reset applied.
///
/// Unreadable stored data falls back to the free default on this path only;
/// writers refuse to overwrite it.
pub async fn load_subscription(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
) -> AppResult<SubscriptionData> {
    let doc = store.load(user_id).await?;
    let sub = match resolve_subscription(Some(&doc.prefs), &now) {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Falling back to default subscription");
            default_subscription(&now)
        }
    };
    Ok(reconcile_monthly_usage(sub, &now))
}

/// Apply `f` to the reconciled subscription and persist it, retrying on
/// concurrent writes. `f` may run more than once.
pub async fn update_subscription<F, T>(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
    mut f: F,
) -> AppResult<(SubscriptionData, T)>
where
    F: FnMut(&mut SubscriptionData) -> AppResult<T>,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut doc: PreferenceDocument = store.load(user_id).await?;
        let sub = resolve_subscription(Some(&doc.prefs), &now)?;
        let mut sub = reconcile_monthly_usage(sub, &now);

        let out = f(&mut sub)?;

        let value: Value = serde_json::to_value(&sub)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode subscription: {}", e)))?;
        doc.set(SUBSCRIPTION_PREF_KEY, value);

        if store.save(user_id, &doc).await? {
            return Ok((sub, out));
        }

        tracing::debug!(user_id = %user_id, attempt = attempt, "Subscription write conflict, retrying");
    }

    tracing::warn!(user_id = %user_id, "Subscription update gave up after repeated conflicts");
    Err(AppError::Conflict(
        "Subscription was modified concurrently, please retry".into(),
    ))
}

fn ensure_within_limit(sub: &SubscriptionData, resource: UsageResource) -> AppResult<()> {
    let (current, limit) = sub.current_and_limit(resource);
    if has_exceeded_limit(current, limit) {
        return Err(AppError::LimitExceeded {
            resource,
            current,
            limit,
        });
    }
    Ok(())
}

/// Count one AI chat message against the monthly allowance.
pub async fn reserve_ai_message(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
) -> AppResult<SubscriptionData> {
    let (sub, _) = update_subscription(store, user_id, now, |sub| {
        ensure_within_limit(sub, UsageResource::AiChatMessages)?;
        sub.usage.ai_chat_messages_this_month += 1;
        Ok(())
    })
    .await?;
    Ok(sub)
}

/// Give back a message reserved for a request that never completed.
pub async fn release_ai_message(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
) -> AppResult<SubscriptionData> {
    let (sub, _) = update_subscription(store, user_id, now, |sub| {
        sub.usage.ai_chat_messages_this_month = sub.usage.ai_chat_messages_this_month.saturating_sub(1);
        Ok(())
    })
    .await?;
    Ok(sub)
}

pub async fn link_institution(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
) -> AppResult<SubscriptionData> {
    let (sub, _) = update_subscription(store, user_id, now, |sub| {
        ensure_within_limit(sub, UsageResource::InstitutionConnections)?;
        sub.usage.institution_connections += 1;
        Ok(())
    })
    .await?;
    Ok(sub)
}

pub async fn unlink_institution(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
) -> AppResult<SubscriptionData> {
    let (sub, _) = update_subscription(store, user_id, now, |sub| {
        sub.usage.institution_connections = sub.usage.institution_connections.saturating_sub(1);
        Ok(())
    })
    .await?;
    Ok(sub)
}

/// Record a storage change. Growth is blocked when the quota is already
/// reached or the new total would pass it; deletions always go through.
pub async fn adjust_storage(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
    delta_gb: f64,
) -> AppResult<SubscriptionData> {
    if !delta_gb.is_finite() {
        return Err(AppError::Validation("deltaGB must be a finite number".into()));
    }

    let (sub, _) = update_subscription(store, user_id, now, |sub| {
        if delta_gb > 0.0 {
            ensure_within_limit(sub, UsageResource::Storage)?;
            let (current, limit) = sub.current_and_limit(UsageResource::Storage);
            if current + delta_gb > limit {
                return Err(AppError::LimitExceeded {
                    resource: UsageResource::Storage,
                    current,
                    limit,
                });
            }
        }
        sub.usage.storage_gb = (sub.usage.storage_gb + delta_gb).max(0.0);
        Ok(())
    })
    .await?;
    Ok(sub)
}

/// Write billing fields and the matching plan limits. Usage is untouched.
pub async fn apply_billing_change(
    store: &dyn PreferenceStore,
    user_id: &str,
    now: DateTime<Local>,
    change: &BillingChange,
) -> AppResult<SubscriptionData> {
    let (sub, _) = update_subscription(store, user_id, now, |sub| {
        if let Some(status) = change.status {
            sub.status = status;
            sub.limits = status.plan_limits();
        }
        if let Some(customer_id) = &change.stripe_customer_id {
            sub.stripe_customer_id = Some(customer_id.clone());
        }
        if change.clear_subscription_id {
            sub.stripe_subscription_id = None;
        } else if let Some(subscription_id) = &change.stripe_subscription_id {
            sub.stripe_subscription_id = Some(subscription_id.clone());
        }
        if change.current_period_end.is_some() {
            sub.current_period_end = change.current_period_end;
        }
        Ok(())
    })
    .await?;

    tracing::info!(
        user_id = %user_id,
        status = ?sub.status,
        "Subscription billing state updated"
    );
    Ok(sub)
}
