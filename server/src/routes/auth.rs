//! Registration and login.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use axum::routing::post;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::auth::AuthUser;
use crate::auth::create_token;
use crate::auth::hash_password;
use crate::auth::verify_password;
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub user: UserResponse,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<Json<TokenResponse>, ApiError> {
    if !body.email.contains('@') || body.email.trim().is_empty() {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    if body.password.is_empty() {
        return Err(ApiError::bad_request("Password must not be empty"));
    }

    let user = state
        .store
        .create_user(&body.email, &hash_password(&body.password)?)
        .await?;

    Ok(Json(TokenResponse {
        access_token: create_token(&user.id)?,
        token_type: "bearer",
        user: UserResponse {
            id: user.id,
            email: user.email,
            created_at: user.created_at,
        },
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state
        .store
        .user_by_email(&body.email)
        .await?
        .filter(|user| verify_password(&body.password, &user.password_hash))
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    Ok(Json(TokenResponse {
        access_token: create_token(&user.id)?,
        token_type: "bearer",
        user: UserResponse {
            id: user.id,
            email: user.email,
            created_at: user.created_at,
        },
    }))
}

async fn me(user: AuthUser) -> Json<UserResponse> {
    Json(UserResponse {
        id: user.id,
        email: user.email,
        created_at: user.created_at,
    })
}
