//! Subscription limits and usage accounting.
//!
//! Everything in here is pure: callers load the stored preference blob,
//! run it through these functions and persist the result themselves.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Preference key the subscription blob is stored under.
pub const SUBSCRIPTION_PREF_KEY: &str = "subscription";

/// Highest blob version this build understands.
pub const SUBSCRIPTION_SCHEMA_VERSION: u32 = 1;

/// Usage percentage at which a resource counts as "approaching" its limit.
pub const APPROACHING_LIMIT_PERCENT: u8 = 80;

/// Free tier: no bank connections, no storage, a small AI allowance.
pub const FREE_PLAN_LIMITS: SubscriptionLimits = SubscriptionLimits {
    institution_connections: 0,
    storage_gb: 0.0,
    ai_chat_messages_per_month: 30,
};

/// The single paid plan.
pub const BASE_PLAN_LIMITS: SubscriptionLimits = SubscriptionLimits {
    institution_connections: 3,
    storage_gb: 10.0,
    ai_chat_messages_per_month: 5000,
};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EntitlementError {
    #[error("Corrupt preference data: {0}")]
    CorruptPreferenceData(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    #[default]
    None,
}

impl SubscriptionStatus {
    /// Limits a user in this billing state is entitled to. Past-due keeps the
    /// paid plan while the billing provider retries the charge.
    pub fn plan_limits(&self) -> SubscriptionLimits {
        match self {
            SubscriptionStatus::Active | SubscriptionStatus::PastDue => BASE_PLAN_LIMITS,
            SubscriptionStatus::Canceled | SubscriptionStatus::None => FREE_PLAN_LIMITS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionLimits {
    pub institution_connections: u32,
    #[serde(rename = "storageGB")]
    pub storage_gb: f64,
    pub ai_chat_messages_per_month: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUsage {
    /// Live count, never reset monthly.
    pub institution_connections: u32,
    /// Live consumption, never reset monthly.
    #[serde(rename = "storageGB")]
    pub storage_gb: f64,
    pub ai_chat_messages_this_month: u32,
    /// Instant after which `ai_chat_messages_this_month` goes back to zero.
    pub ai_chat_messages_reset_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    #[serde(default = "default_version")]
    pub version: u32,
    pub status: SubscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    pub limits: SubscriptionLimits,
    pub usage: SubscriptionUsage,
}

fn default_version() -> u32 {
    SUBSCRIPTION_SCHEMA_VERSION
}

/// A metered resource.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UsageResource {
    InstitutionConnections,
    Storage,
    AiChatMessages,
}

impl UsageResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageResource::InstitutionConnections => "institution connections",
            UsageResource::Storage => "storage",
            UsageResource::AiChatMessages => "AI chat messages",
        }
    }
}

impl std::fmt::Display for UsageResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub current: f64,
    pub limit: f64,
    pub percentage: u8,
    pub approaching: bool,
    pub exceeded: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub institution_connections: ResourceReport,
    pub storage: ResourceReport,
    pub ai_chat_messages: ResourceReport,
}

impl SubscriptionData {
    pub fn current_and_limit(&self, resource: UsageResource) -> (f64, f64) {
        match resource {
            UsageResource::InstitutionConnections => (
                f64::from(self.usage.institution_connections),
                f64::from(self.limits.institution_connections),
            ),
            UsageResource::Storage => (self.usage.storage_gb, self.limits.storage_gb),
            UsageResource::AiChatMessages => (
                f64::from(self.usage.ai_chat_messages_this_month),
                f64::from(self.limits.ai_chat_messages_per_month),
            ),
        }
    }

    pub fn resource_report(&self, resource: UsageResource) -> ResourceReport {
        let (current, limit) = self.current_and_limit(resource);
        ResourceReport {
            current,
            limit,
            percentage: usage_percentage(current, limit),
            approaching: is_approaching_limit(current, limit),
            exceeded: has_exceeded_limit(current, limit),
        }
    }

    pub fn usage_report(&self) -> UsageReport {
        UsageReport {
            institution_connections: self.resource_report(UsageResource::InstitutionConnections),
            storage: self.resource_report(UsageResource::Storage),
            ai_chat_messages: self.resource_report(UsageResource::AiChatMessages),
        }
    }

    fn validate(&self) -> Result<(), EntitlementError> {
        if self.version > SUBSCRIPTION_SCHEMA_VERSION {
            return Err(EntitlementError::CorruptPreferenceData(format!(
                "unsupported subscription version {}",
                self.version
            )));
        }
        for (field, value) in [
            ("limits.storageGB", self.limits.storage_gb),
            ("usage.storageGB", self.usage.storage_gb),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EntitlementError::CorruptPreferenceData(format!(
                    "{} must be a non-negative number, got {}",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

/// First instant of the month after `now`, at midnight in `now`'s timezone.
pub fn next_reset_date<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let local = now.naive_local();
    let (year, month) = if local.month() == 12 {
        (local.year() + 1, 1)
    } else {
        (local.year(), local.month() + 1)
    };

    let Some(midnight) = NaiveDate::from_ymd_opt(year, month, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return DateTime::<Utc>::MAX_UTC;
    };

    let tz = now.timezone();
    // Midnight can fall in a DST gap; the first valid instant that day is 01:00.
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Free-tier record for a user without a stored subscription.
pub fn default_subscription<Tz: TimeZone>(now: &DateTime<Tz>) -> SubscriptionData {
    SubscriptionData {
        version: SUBSCRIPTION_SCHEMA_VERSION,
        status: SubscriptionStatus::None,
        stripe_customer_id: None,
        stripe_subscription_id: None,
        current_period_end: None,
        limits: FREE_PLAN_LIMITS,
        usage: SubscriptionUsage {
            institution_connections: 0,
            storage_gb: 0.0,
            ai_chat_messages_this_month: 0,
            ai_chat_messages_reset_date: next_reset_date(now),
        },
    }
}

/// Interpret a user's preference document.
///
/// A missing document or a document without a `subscription` key yields the
/// free default. A present value that does not decode is reported as
/// [`EntitlementError::CorruptPreferenceData`].
pub fn resolve_subscription<Tz: TimeZone>(
    prefs: Option<&Map<String, Value>>,
    now: &DateTime<Tz>,
) -> Result<SubscriptionData, EntitlementError> {
    let stored = match prefs.and_then(|p| p.get(SUBSCRIPTION_PREF_KEY)) {
        None | Some(Value::Null) => return Ok(default_subscription(now)),
        Some(v) => v,
    };

    let data: SubscriptionData = match stored {
        // Older writers stored the blob as an encoded string.
        Value::String(raw) => serde_json::from_str(raw),
        other => SubscriptionData::deserialize(other),
    }
    .map_err(|e| EntitlementError::CorruptPreferenceData(e.to_string()))?;

    data.validate()?;
    Ok(data)
}

/// Lazily apply the monthly AI message reset.
///
/// Any number of missed month boundaries collapse into one reset; the next
/// boundary is computed from `now`, not replayed from the stale date.
pub fn reconcile_monthly_usage<Tz: TimeZone>(
    sub: SubscriptionData,
    now: &DateTime<Tz>,
) -> SubscriptionData {
    if now.with_timezone(&Utc) <= sub.usage.ai_chat_messages_reset_date {
        return sub;
    }

    SubscriptionData {
        usage: SubscriptionUsage {
            ai_chat_messages_this_month: 0,
            ai_chat_messages_reset_date: next_reset_date(now),
            ..sub.usage
        },
        ..sub
    }
}

/// Inclusive: being exactly at the limit already blocks one more unit.
pub fn has_exceeded_limit<T: Into<f64>>(current: T, limit: T) -> bool {
    current.into() >= limit.into()
}

/// Usage as a whole percentage in `[0, 100]`, rounded half away from zero.
///
/// A zero limit always reads as full.
pub fn usage_percentage<T: Into<f64>>(current: T, limit: T) -> u8 {
    let (current, limit) = (current.into(), limit.into());
    if limit <= 0.0 {
        return 100;
    }
    let pct = (current * 100.0 / limit).round();
    if pct.is_nan() || pct <= 0.0 {
        0
    } else if pct >= 100.0 {
        100
    } else {
        pct as u8
    }
}

pub fn is_approaching_limit<T: Into<f64>>(current: T, limit: T) -> bool {
    usage_percentage(current, limit) >= APPROACHING_LIMIT_PERCENT
}
