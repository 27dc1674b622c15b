use anyhow::Context;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres preference store; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub frontend_url: String,

    pub jwt_secret: String,

    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_base_price_id: String,
    pub stripe_api_url: String,

    pub claude_api_key: String,
    pub claude_model: String,
    pub claude_api_url: String,

    pub chat_rate_limit_per_minute: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()
                .context("PORT must be a number")?,
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),

            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,

            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            stripe_base_price_id: env::var("STRIPE_BASE_PRICE_ID").unwrap_or_default(),
            stripe_api_url: env::var("STRIPE_API_URL")
                .unwrap_or_else(|_| "https://api.stripe.com".into()),

            claude_api_key: env::var("CLAUDE_API_KEY").unwrap_or_default(),
            claude_model: env::var("CLAUDE_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            claude_api_url: env::var("CLAUDE_API_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".into()),

            chat_rate_limit_per_minute: env::var("CHAT_RATE_LIMIT_PER_MINUTE")
                .unwrap_or_else(|_| "20".into())
                .parse()
                .context("CHAT_RATE_LIMIT_PER_MINUTE must be a number")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn stripe_enabled(&self) -> bool {
        !self.stripe_secret_key.is_empty()
    }

    pub fn assistant_enabled(&self) -> bool {
        !self.claude_api_key.is_empty()
    }
}

#[cfg(test)]
impl Config {
    /// Deterministic config for router tests; no external services.
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            host: "127.0.0.1".into(),
            port: 0,
            frontend_url: "http://localhost:3000".into(),
            jwt_secret: "test-secret".into(),
            stripe_secret_key: String::new(),
            stripe_webhook_secret: String::new(),
            stripe_base_price_id: "price_base".into(),
            stripe_api_url: "http://127.0.0.1:9".into(),
            claude_api_key: String::new(),
            claude_model: "claude-test".into(),
            claude_api_url: "http://127.0.0.1:9".into(),
            chat_rate_limit_per_minute: 20,
        }
    }
}
