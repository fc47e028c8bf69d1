//! Password hashing, JWT issuance and the bearer-auth request extractor.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::EncodingKey;
use jsonwebtoken::Header;
use jsonwebtoken::Validation;
use serde::Deserialize;
use serde::Serialize;

use atelier_core::flags::JWT_EXPIRE_DAYS;
use atelier_core::flags::JWT_SECRET;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| ApiError::internal(format!("failed to hash password: {e}")))
}

pub fn verify_password(password: &str, hashed: &str) -> bool {
    bcrypt::verify(password, hashed).unwrap_or(false)
}

pub fn create_token(user_id: &str) -> Result<String, ApiError> {
    let expire = Utc::now() + Duration::days(*JWT_EXPIRE_DAYS);
    let claims = Claims {
        sub: user_id.to_string(),
        exp: expire.timestamp(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .map_err(|e| ApiError::internal(format!("failed to sign token: {e}")))
}

pub fn decode_token(token: &str) -> Result<String, ApiError> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(JWT_SECRET.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::unauthorized("Invalid token"))?;
    if data.claims.sub.is_empty() {
        return Err(ApiError::unauthorized("Invalid token"));
    }
    Ok(data.claims.sub)
}

/// The authenticated caller, resolved from the bearer token on every
/// request that extracts it.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        let user_id = decode_token(token)?;
        let user = state
            .store
            .user_by_id(&user_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::unauthorized("User not found"))?;

        Ok(AuthUser {
            id: user.id,
            email: user.email,
            created_at: user.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn token_round_trips_to_user_id() {
        let token = create_token("user-123").unwrap();
        assert_eq!(decode_token(&token).unwrap(), "user-123");
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(decode_token("not-a-jwt").is_err());
    }

    #[test]
    fn password_hashing_verifies_and_rejects() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("hunter2", "not-a-hash"));
    }
}
