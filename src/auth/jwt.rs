//! Session tokens are minted by the identity provider; this service only
//! verifies them.

use jsonwebtoken::{decode, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Identity-provider user id.
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

pub fn verify_token(token: &str, config: &Config) -> AppResult<TokenData<Claims>> {
    let mut validation = Validation::default();
    validation.validate_exp = true;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AppError::Unauthorized)?;

    if data.claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized);
    }
    Ok(data)
}

#[cfg(test)]
pub(crate) fn sign_test_token(sub: &str, config: &Config, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: sub.to_string(),
        email: Some(format!("{}@example.com", sub)),
        exp: now + ttl_secs,
        iat: Some(now),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token_roundtrip() {
        let config = Config::for_tests();
        let token = sign_test_token("user_abc", &config, 600);
        let data = verify_token(&token, &config).unwrap();
        assert_eq!(data.claims.sub, "user_abc");
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = Config::for_tests();
        let token = sign_test_token("user_abc", &config, -3600);
        assert!(matches!(verify_token(&token, &config), Err(AppError::Unauthorized)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let config = Config::for_tests();
        let token = sign_test_token("user_abc", &config, 600);
        let mut other = Config::for_tests();
        other.jwt_secret = "another-secret".into();
        assert!(verify_token(&token, &other).is_err());
    }

    #[test]
    fn test_blank_subject_rejected() {
        let config = Config::for_tests();
        let token = sign_test_token("  ", &config, 600);
        assert!(verify_token(&token, &config).is_err());
    }
}
