//! Stripe REST calls and webhook decoding.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::subscription::SubscriptionStatus;
use crate::services::entitlements::BillingChange;

type HmacSha256 = Hmac<Sha256>;

/// Max age of a signed webhook, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header: `t=timestamp,v1=signature[,v1=...]`.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now_secs: i64,
) -> AppResult<()> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(ts)) => timestamp = Some(ts),
            (Some("v1"), Some(sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let ts = timestamp
        .ok_or_else(|| AppError::Validation("Missing timestamp in Stripe-Signature".into()))?;
    let ts_secs: i64 = ts
        .parse()
        .map_err(|_| AppError::Validation("Malformed timestamp in Stripe-Signature".into()))?;

    if signatures.is_empty() {
        return Err(AppError::Validation(
            "Missing v1 signature in Stripe-Signature".into(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Invalid webhook secret")))?;
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    // Constant-time comparison
    let valid = signatures.iter().any(|sig| {
        sig.len() == expected.len()
            && sig
                .as_bytes()
                .iter()
                .zip(expected.as_bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    });

    if !valid {
        return Err(AppError::Validation("Invalid Stripe webhook signature".into()));
    }

    if (now_secs - ts_secs).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(AppError::Validation(
            "Stripe webhook timestamp outside tolerance".into(),
        ));
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    customer: Option<String>,
    subscription: Option<String>,
    client_reference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: String,
    status: String,
    current_period_end: Option<i64>,
}

/// Who an event is about and what should change.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingTarget {
    User(String),
    Customer(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillingUpdate {
    pub target: BillingTarget,
    pub change: BillingChange,
}

/// Map Stripe's subscription status onto ours.
pub fn map_status(stripe_status: &str) -> SubscriptionStatus {
    match stripe_status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::None,
    }
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

fn decode_object<T: for<'de> Deserialize<'de>>(event: &StripeEvent) -> AppResult<T> {
    T::deserialize(&event.data.object).map_err(|e| {
        AppError::Validation(format!("Malformed {} payload: {}", event.event_type, e))
    })
}

/// Translate a webhook event into a billing update. `Ok(None)` for event
/// types we don't act on.
pub fn billing_update_for(event: &StripeEvent) -> AppResult<Option<BillingUpdate>> {
    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let session: CheckoutSessionObject = decode_object(event)?;
            let target = match (&session.client_reference_id, &session.customer) {
                (Some(user_id), _) => BillingTarget::User(user_id.clone()),
                (None, Some(customer_id)) => BillingTarget::Customer(customer_id.clone()),
                (None, None) => {
                    return Err(AppError::Validation(
                        "Checkout session has neither client_reference_id nor customer".into(),
                    ))
                }
            };
            Ok(Some(BillingUpdate {
                target,
                change: BillingChange {
                    status: Some(SubscriptionStatus::Active),
                    stripe_customer_id: session.customer,
                    stripe_subscription_id: session.subscription,
                    ..Default::default()
                },
            }))
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            let sub: SubscriptionObject = decode_object(event)?;
            Ok(Some(BillingUpdate {
                target: BillingTarget::Customer(sub.customer.clone()),
                change: BillingChange {
                    status: Some(map_status(&sub.status)),
                    stripe_customer_id: Some(sub.customer),
                    stripe_subscription_id: Some(sub.id),
                    current_period_end: timestamp(sub.current_period_end),
                    clear_subscription_id: false,
                },
            }))
        }
        "customer.subscription.deleted" => {
            let sub: SubscriptionObject = decode_object(event)?;
            Ok(Some(BillingUpdate {
                target: BillingTarget::Customer(sub.customer.clone()),
                change: BillingChange {
                    status: Some(SubscriptionStatus::Canceled),
                    stripe_customer_id: Some(sub.customer),
                    stripe_subscription_id: None,
                    current_period_end: timestamp(sub.current_period_end),
                    clear_subscription_id: true,
                },
            }))
        }
        _ => Ok(None),
    }
}

/// Thin client over the two Stripe endpoints checkout needs.
pub struct StripeClient<'a> {
    http: reqwest::Client,
    config: &'a Config,
}

impl<'a> StripeClient<'a> {
    pub fn new(http: reqwest::Client, config: &'a Config) -> AppResult<Self> {
        if !config.stripe_enabled() {
            return Err(AppError::Internal(anyhow::anyhow!("Stripe not configured")));
        }
        Ok(Self { http, config })
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> AppResult<serde_json::Value> {
        let resp = self
            .http
            .post(format!("{}{}", self.config.stripe_api_url, path))
            .bearer_auth(&self.config.stripe_secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Stripe error: {}", e)))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Stripe parse error: {}", e)))?;

        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "Stripe {} returned {}: {}",
                path, status, body["error"]["message"]
            )));
        }
        Ok(body)
    }

    pub async fn create_customer(&self, user_id: &str, email: Option<&str>) -> AppResult<String> {
        let customer = self
            .post_form(
                "/v1/customers",
                &[
                    ("email", email.unwrap_or("")),
                    ("metadata[user_id]", user_id),
                ],
            )
            .await?;

        customer["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Upstream("No customer ID from Stripe".into()))
    }

    pub async fn create_checkout_session(&self, user_id: &str, customer_id: &str) -> AppResult<String> {
        let success_url = format!("{}/billing?success=true", self.config.frontend_url);
        let cancel_url = format!("{}/billing?canceled=true", self.config.frontend_url);

        let session = self
            .post_form(
                "/v1/checkout/sessions",
                &[
                    ("customer", customer_id),
                    ("client_reference_id", user_id),
                    ("mode", "subscription"),
                    ("line_items[0][price]", &self.config.stripe_base_price_id),
                    ("line_items[0][quantity]", "1"),
                    ("success_url", &success_url),
                    ("cancel_url", &cancel_url),
                ],
            )
            .await?;

        session["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Upstream("No checkout URL from Stripe".into()))
    }
}

#[cfg(test)]
pub(crate) fn sign_test_payload(payload: &[u8], secret: &str, ts: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.", ts).as_bytes());
    mac.update(payload);
    format!("t={},v1={}", ts, hex::encode(mac.finalize().into_bytes()))
}
