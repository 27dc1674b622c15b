//! Per-user preference documents with optimistic concurrency.
//!
//! Every document carries a revision. Writers load, modify and call
//! [`PreferenceStore::save`], which only succeeds if nobody else wrote in
//! between, so concurrent usage increments can't clobber each other.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AppResult;
use crate::models::subscription::SUBSCRIPTION_PREF_KEY;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceDocument {
    pub prefs: Map<String, Value>,
    /// 0 means the document has never been written.
    pub revision: i64,
}

impl PreferenceDocument {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.prefs.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.prefs.insert(key.to_string(), value);
    }
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Load a user's document; unknown users get an empty one at revision 0.
    async fn load(&self, user_id: &str) -> AppResult<PreferenceDocument>;

    /// Compare-and-swap write. Returns `false` if the stored revision no
    /// longer matches `doc.revision`.
    async fn save(&self, user_id: &str, doc: &PreferenceDocument) -> AppResult<bool>;

    async fn find_user_by_stripe_customer(&self, customer_id: &str) -> AppResult<Option<String>>;

    /// Whether an event id has already been handled.
    async fn is_stripe_event_recorded(&self, event_id: &str) -> AppResult<bool>;

    /// Returns `true` the first time an event id is seen.
    async fn record_stripe_event(&self, event_id: &str, event_type: &str) -> AppResult<bool>;

    async fn ping(&self) -> bool;
}

pub struct PgPreferenceStore {
    pool: PgPool,
}

impl PgPreferenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for PgPreferenceStore {
    async fn load(&self, user_id: &str) -> AppResult<PreferenceDocument> {
        let row = sqlx::query_as::<_, (Json<Map<String, Value>>, i64)>(
            "SELECT prefs, revision FROM user_preferences WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|(Json(prefs), revision)| PreferenceDocument { prefs, revision })
            .unwrap_or_default())
    }

    async fn save(&self, user_id: &str, doc: &PreferenceDocument) -> AppResult<bool> {
        let result = if doc.revision == 0 {
            sqlx::query(
                r#"
                INSERT INTO user_preferences (user_id, prefs, revision)
                VALUES ($1, $2, 1)
                ON CONFLICT (user_id) DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(Json(&doc.prefs))
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE user_preferences SET
                    prefs = $2,
                    revision = revision + 1,
                    updated_at = NOW()
                WHERE user_id = $1 AND revision = $3
                "#,
            )
            .bind(user_id)
            .bind(Json(&doc.prefs))
            .bind(doc.revision)
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn find_user_by_stripe_customer(&self, customer_id: &str) -> AppResult<Option<String>> {
        let user_id = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id FROM user_preferences
            WHERE prefs -> 'subscription' ->> 'stripeCustomerId' = $1
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id)
    }

    async fn is_stripe_event_recorded(&self, event_id: &str) -> AppResult<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM stripe_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn record_stripe_event(&self, event_id: &str, event_type: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT INTO stripe_events (event_id, event_type) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

/// Process-local store for development and tests.
#[derive(Clone, Default)]
pub struct InMemoryPreferenceStore {
    documents: Arc<Mutex<HashMap<String, PreferenceDocument>>>,
    events: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn load(&self, user_id: &str) -> AppResult<PreferenceDocument> {
        let documents = self.documents.lock().await;
        Ok(documents.get(user_id).cloned().unwrap_or_default())
    }

    async fn save(&self, user_id: &str, doc: &PreferenceDocument) -> AppResult<bool> {
        let mut documents = self.documents.lock().await;
        let stored_revision = documents.get(user_id).map(|d| d.revision).unwrap_or(0);
        if stored_revision != doc.revision {
            return Ok(false);
        }

        documents.insert(
            user_id.to_string(),
            PreferenceDocument {
                prefs: doc.prefs.clone(),
                revision: doc.revision + 1,
            },
        );
        Ok(true)
    }

    async fn find_user_by_stripe_customer(&self, customer_id: &str) -> AppResult<Option<String>> {
        let documents = self.documents.lock().await;
        Ok(documents
            .iter()
            .find(|(_, doc)| {
                doc.get(SUBSCRIPTION_PREF_KEY)
                    .and_then(|s| s.get("stripeCustomerId"))
                    .and_then(Value::as_str)
                    == Some(customer_id)
            })
            .map(|(user_id, _)| user_id.clone()))
    }

    async fn is_stripe_event_recorded(&self, event_id: &str) -> AppResult<bool> {
        Ok(self.events.lock().await.contains(event_id))
    }

    async fn record_stripe_event(&self, event_id: &str, _event_type: &str) -> AppResult<bool> {
        let mut events = self.events.lock().await;
        Ok(events.insert(event_id.to_string()))
    }

    async fn ping(&self) -> bool {
        true
    }
}
