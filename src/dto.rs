//! # Koffers: Request/Response DTOs
//!
//! Conventions:
//! - `*Request`  → deserialized from client JSON body
//! - `*Response` → serialized to client JSON
//! - Field names are camelCase to match the web client
//! - Validation is expressed via `validator` derive macros

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::AppError;
use crate::models::subscription::{
    SubscriptionData, SubscriptionLimits, SubscriptionStatus, SubscriptionUsage, UsageReport,
};
use crate::services::assistant::ChatTurn;

/// Run `validator` rules and turn failures into a 422.
pub fn validate_request<T: Validate>(req: &T) -> Result<(), AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))
}

// ============================================================================
// Usage
// ============================================================================

/// GET /api/subscription/usage and every usage mutation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub status: SubscriptionStatus,
    pub limits: SubscriptionLimits,
    pub usage: SubscriptionUsage,
    pub report: UsageReport,
}

impl From<SubscriptionData> for UsageResponse {
    fn from(sub: SubscriptionData) -> Self {
        let report = sub.usage_report();
        Self {
            status: sub.status,
            limits: sub.limits,
            usage: sub.usage,
            report,
        }
    }
}

/// POST /api/usage/storage
#[derive(Debug, Deserialize)]
pub struct StorageDeltaRequest {
    /// GB added (positive) or freed (negative)
    #[serde(rename = "deltaGB")]
    pub delta_gb: f64,
}

// ============================================================================
// AI chat
// ============================================================================

/// POST /api/ai/chat
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 4000, message = "Message must be 1-4000 characters"))]
    pub message: String,

    /// Prior turns, oldest first
    #[serde(default)]
    #[validate(length(max = 20, message = "At most 20 history turns"))]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub reply: String,
    pub usage: ChatUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUsage {
    pub ai_chat_messages_this_month: u32,
    pub ai_chat_messages_per_month: u32,
    pub approaching_limit: bool,
}

// ============================================================================
// Billing
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub checkout_url: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}
