use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{auth, handlers, AppState};

pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/readyz", get(handlers::health::readyz))
        .route(
            "/api/billing/webhook",
            post(handlers::billing::stripe_webhook),
        );

    let protected_routes = Router::new()
        // Usage
        .route("/api/subscription/usage", get(handlers::usage::get_usage))
        .route(
            "/api/usage/institutions",
            post(handlers::usage::link_institution).delete(handlers::usage::unlink_institution),
        )
        .route("/api/usage/storage", post(handlers::usage::adjust_storage))
        // AI assistant
        .route("/api/ai/chat", post(handlers::chat::send_message))
        // Billing
        .route(
            "/api/billing/subscription",
            get(handlers::billing::get_subscription),
        )
        .route(
            "/api/billing/checkout",
            post(handlers::billing::create_checkout),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::middleware::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors_layer(&state.config.frontend_url))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let mut origins: Vec<HeaderValue> = Vec::new();
    match frontend_url.parse::<HeaderValue>() {
        Ok(hv) => origins.push(hv),
        Err(_) => tracing::warn!(frontend_url = %frontend_url, "FRONTEND_URL is not a valid origin"),
    }
    if let Ok(extra) = std::env::var("CORS_EXTRA_ORIGINS") {
        for o in extra.split(',') {
            if let Ok(hv) = o.trim().parse::<HeaderValue>() {
                origins.push(hv);
            }
        }
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::sign_test_token;
    use crate::config::Config;
    use crate::db::{InMemoryPreferenceStore, PreferenceDocument, PreferenceStore};
    use crate::models::subscription::SUBSCRIPTION_PREF_KEY;
    use crate::services::stripe::sign_test_payload;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: InMemoryPreferenceStore,
        config: Config,
    }

    fn test_app_with(config: Config) -> TestApp {
        let store = InMemoryPreferenceStore::new();
        let state = AppState::new(Arc::new(store.clone()), config.clone()).unwrap();
        TestApp {
            router: create_router(state),
            store,
            config,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(Config::for_tests())
    }

    impl TestApp {
        fn token(&self, user_id: &str) -> String {
            sign_test_token(user_id, &self.config, 600)
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
            let response = self.router.clone().oneshot(req).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, body)
        }

        async fn call(&self, method: Method, uri: &str, user_id: &str, body: Option<Value>) -> (StatusCode, Value) {
            let builder = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)));
            let req = match body {
                Some(b) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(b.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            self.send(req).await
        }

        async fn put_subscription(&self, user_id: &str, subscription: Value) {
            let mut doc = self.store.load(user_id).await.unwrap();
            doc.set(SUBSCRIPTION_PREF_KEY, subscription);
            assert!(self.store.save(user_id, &doc).await.unwrap());
        }
    }

    fn paid_subscription(messages: u32, reset: &str) -> Value {
        json!({
            "status": "active",
            "stripeCustomerId": "cus_paid",
            "stripeSubscriptionId": "sub_paid",
            "limits": { "institutionConnections": 3, "storageGB": 10, "aiChatMessagesPerMonth": 5000 },
            "usage": {
                "institutionConnections": 0,
                "storageGB": 0,
                "aiChatMessagesThisMonth": messages,
                "aiChatMessagesResetDate": reset
            }
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_app();
        let (status, body) = app
            .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_readyz_with_memory_store() {
        let app = test_app();
        let (status, body) = app
            .send(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["store"], "ok");
    }

    #[tokio::test]
    async fn test_protected_route_requires_token() {
        let app = test_app();
        let (status, body) = app
            .send(
                Request::builder()
                    .uri("/api/subscription/usage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], 401);

        let (status, _) = app
            .send(
                Request::builder()
                    .uri("/api/subscription/usage")
                    .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_usage_for_user_without_record() {
        let app = test_app();
        let (status, body) = app.call(Method::GET, "/api/subscription/usage", "new_user", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "none");
        assert_eq!(
            body["limits"],
            json!({ "institutionConnections": 0, "storageGB": 0.0, "aiChatMessagesPerMonth": 30 })
        );
        assert_eq!(body["usage"]["institutionConnections"], 0);
        assert_eq!(body["usage"]["storageGB"], 0.0);
        assert_eq!(body["usage"]["aiChatMessagesThisMonth"], 0);
        assert!(body["usage"]["aiChatMessagesResetDate"].is_string());
    }

    #[tokio::test]
    async fn test_usage_applies_lazy_monthly_reset() {
        let app = test_app();
        app.put_subscription("u1", paid_subscription(4200, "2020-01-01T00:00:00Z")).await;

        let (status, body) = app.call(Method::GET, "/api/subscription/usage", "u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["usage"]["aiChatMessagesThisMonth"], 0);
        assert_ne!(body["usage"]["aiChatMessagesResetDate"], "2020-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_usage_with_corrupt_record_reports_default() {
        let app = test_app();
        app.put_subscription("u1", json!({ "status": "active", "limits": "lots" })).await;

        let (status, body) = app.call(Method::GET, "/api/subscription/usage", "u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "none");

        let (status, body) = app.call(Method::POST, "/api/usage/institutions", "u1", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Subscription data is unreadable");
    }

    #[tokio::test]
    async fn test_free_user_blocked_from_linking_bank() {
        let app = test_app();
        let (status, body) = app.call(Method::POST, "/api/usage/institutions", "free_user", None).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["reason"], "limit_exceeded");
        assert_eq!(body["error"]["resource"], "institutionConnections");
        assert_eq!(body["error"]["limit"], 0.0);
    }

    #[tokio::test]
    async fn test_paid_user_links_and_unlinks() {
        let app = test_app();
        app.put_subscription("u1", paid_subscription(0, "2999-01-01T00:00:00Z")).await;

        for expected in 1..=3 {
            let (status, body) = app.call(Method::POST, "/api/usage/institutions", "u1", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["usage"]["institutionConnections"], expected);
        }
        let (status, _) = app.call(Method::POST, "/api/usage/institutions", "u1", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app.call(Method::DELETE, "/api/usage/institutions", "u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usage"]["institutionConnections"], 2);
        assert_eq!(body["report"]["institutionConnections"]["percentage"], 67);
    }

    #[tokio::test]
    async fn test_storage_adjustment() {
        let app = test_app();
        app.put_subscription("u1", paid_subscription(0, "2999-01-01T00:00:00Z")).await;

        let (status, body) = app
            .call(Method::POST, "/api/usage/storage", "u1", Some(json!({ "deltaGB": 8.5 })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usage"]["storageGB"], 8.5);
        assert_eq!(body["report"]["storage"]["approaching"], true);

        let (status, body) = app
            .call(Method::POST, "/api/usage/storage", "u1", Some(json!({ "deltaGB": 2.0 })))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["resource"], "storage");
        assert_eq!(body["error"]["current"], 8.5);

        let (_, body) = app.call(Method::GET, "/api/subscription/usage", "u1", None).await;
        assert_eq!(body["usage"]["storageGB"], 8.5);

        let (status, body) = app
            .call(Method::POST, "/api/usage/storage", "u1", Some(json!({ "deltaGB": "lots" })))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], 422);
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_malformed_body_renders_json_error() {
        let app = test_app();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/ai/chat")
            .header(header::AUTHORIZATION, format!("Bearer {}", app.token("u1")))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = app.send(req).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], 422);
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_chat_validation_runs_first() {
        let app = test_app();
        let (status, _) = app
            .call(Method::POST, "/api/ai/chat", "u1", Some(json!({ "message": "" })))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_chat_without_assistant_configured() {
        let app = test_app();
        let (status, _) = app
            .call(Method::POST, "/api/ai/chat", "u1", Some(json!({ "message": "hi" })))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_chat_blocked_at_monthly_limit() {
        let mut config = Config::for_tests();
        config.claude_api_key = "test-key".into();
        let app = test_app_with(config);
        app.put_subscription("u1", paid_subscription(5000, "2999-01-01T00:00:00Z")).await;

        let (status, body) = app
            .call(Method::POST, "/api/ai/chat", "u1", Some(json!({ "message": "budget?" })))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["resource"], "aiChatMessages");
    }

    #[tokio::test]
    async fn test_chat_upstream_failure_refunds_message() {
        let mut config = Config::for_tests();
        config.claude_api_key = "test-key".into();
        let app = test_app_with(config);
        app.put_subscription("u1", paid_subscription(4999, "2999-01-01T00:00:00Z")).await;

        // The test config points the assistant at a closed port.
        let (status, _) = app
            .call(Method::POST, "/api/ai/chat", "u1", Some(json!({ "message": "budget?" })))
            .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (_, body) = app.call(Method::GET, "/api/subscription/usage", "u1", None).await;
        assert_eq!(body["usage"]["aiChatMessagesThisMonth"], 4999);
    }

    #[tokio::test]
    async fn test_chat_rate_limited() {
        let mut config = Config::for_tests();
        config.claude_api_key = "test-key".into();
        config.chat_rate_limit_per_minute = 1;
        let app = test_app_with(config);
        app.put_subscription("u1", paid_subscription(5000, "2999-01-01T00:00:00Z")).await;

        let (status, _) = app
            .call(Method::POST, "/api/ai/chat", "u1", Some(json!({ "message": "one" })))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .call(Method::POST, "/api/ai/chat", "u1", Some(json!({ "message": "two" })))
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_checkout_without_stripe_configured() {
        let app = test_app();
        let (status, _) = app.call(Method::POST, "/api/billing/checkout", "u1", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    async fn post_webhook(app: &TestApp, payload: &Value, signature: Option<String>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/billing/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(sig) = signature {
            builder = builder.header("stripe-signature", sig);
        }
        app.send(builder.body(Body::from(payload.to_string())).unwrap()).await
    }

    #[tokio::test]
    async fn test_webhook_lifecycle() {
        let app = test_app();

        let completed = json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "data": { "object": {
                "customer": "cus_9",
                "subscription": "sub_9",
                "client_reference_id": "u9"
            }}
        });
        let (status, body) = post_webhook(&app, &completed, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "received": true }));

        let (_, sub) = app.call(Method::GET, "/api/billing/subscription", "u9", None).await;
        assert_eq!(sub["status"], "active");
        assert_eq!(sub["stripeCustomerId"], "cus_9");
        assert_eq!(sub["limits"]["institutionConnections"], 3);

        let (_, body) = post_webhook(&app, &completed, None).await;
        assert_eq!(body["duplicate"], true);

        let deleted = json!({
            "id": "evt_deleted",
            "type": "customer.subscription.deleted",
            "data": { "object": { "id": "sub_9", "customer": "cus_9", "status": "canceled" } }
        });
        let (status, _) = post_webhook(&app, &deleted, None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, sub) = app.call(Method::GET, "/api/billing/subscription", "u9", None).await;
        assert_eq!(sub["status"], "canceled");
        assert_eq!(sub["limits"]["aiChatMessagesPerMonth"], 30);
        assert!(sub.get("stripeSubscriptionId").is_none());
    }

    #[tokio::test]
    async fn test_redelivered_event_does_not_override_newer_state() {
        let app = test_app();

        let completed = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "customer": "cus_5",
                "subscription": "sub_5",
                "client_reference_id": "u5"
            }}
        });
        let deleted = json!({
            "id": "evt_2",
            "type": "customer.subscription.deleted",
            "data": { "object": { "id": "sub_5", "customer": "cus_5", "status": "canceled" } }
        });

        post_webhook(&app, &completed, None).await;
        post_webhook(&app, &deleted, None).await;

        let (status, body) = post_webhook(&app, &completed, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["duplicate"], true);

        let (_, sub) = app.call(Method::GET, "/api/billing/subscription", "u5", None).await;
        assert_eq!(sub["status"], "canceled");
        assert_eq!(sub["limits"]["institutionConnections"], 0);
        assert!(sub.get("stripeSubscriptionId").is_none());
    }

    #[tokio::test]
    async fn test_webhook_signature_enforced_when_configured() {
        let mut config = Config::for_tests();
        config.stripe_webhook_secret = "whsec_test".into();
        let app = test_app_with(config);

        let payload = json!({
            "id": "evt_sig",
            "type": "invoice.paid",
            "data": { "object": {} }
        });

        let (status, _) = post_webhook(&app, &payload, None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = post_webhook(&app, &payload, Some("t=1,v1=00".into())).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let signature = sign_test_payload(
            payload.to_string().as_bytes(),
            "whsec_test",
            chrono::Utc::now().timestamp(),
        );
        let (status, body) = post_webhook(&app, &payload, Some(signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_customer_is_acknowledged() {
        let app = test_app();
        let payload = json!({
            "id": "evt_orphan",
            "type": "customer.subscription.updated",
            "data": { "object": { "id": "sub_x", "customer": "cus_unknown", "status": "active" } }
        });
        let (status, _) = post_webhook(&app, &payload, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.store.load("cus_unknown").await.unwrap(), PreferenceDocument::default());
    }
}
