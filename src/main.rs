use std::sync::Arc;

use anyhow::Context;

mod auth;
mod config;
mod db;
mod dto;
mod error;
mod handlers;
mod models;
mod routes;
mod services;

use auth::rate_limit::RateLimitState;
use config::Config;
use db::{InMemoryPreferenceStore, PgPreferenceStore, PreferenceStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PreferenceStore>,
    pub config: Arc<Config>,
    pub chat_limiter: RateLimitState,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(store: Arc<dyn PreferenceStore>, config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            chat_limiter: RateLimitState::per_minute(config.chat_rate_limit_per_minute),
            store,
            config: Arc::new(config),
            http,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "koffers_api=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn PreferenceStore> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url)
                .await
                .context("Failed to create database pool")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");
            Arc::new(PgPreferenceStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, preferences are kept in memory only");
            Arc::new(InMemoryPreferenceStore::new())
        }
    };

    let addr = config.listen_addr();
    let state = AppState::new(store, config)?;
    state.chat_limiter.spawn_cleanup_worker();

    let app = routes::create_router(state);

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
