use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::UserRow;
use parley_gateway::auth::issue_token;
use parley_gateway::relay::Relay;
use parley_types::api::{AuthResponse, LoginRequest, RegisterRequest};

use crate::blocking;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub relay: Relay,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.trim().to_string();
    let email = req.email.trim().to_lowercase();

    // Validate input
    if name.is_empty() || name.chars().count() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !email.contains('@') {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let user_id = Uuid::new_v4();
    let password = req.password;
    let row_name = name.clone();

    // Hash and insert on the blocking pool; the insert settles email races
    let created = blocking(&state, move |db| {
        let password_hash = hash_password(&password)?;
        db.create_user(&user_id.to_string(), &row_name, &email, &password_hash)
    })
    .await?;
    if !created {
        return Err(StatusCode::CONFLICT);
    }

    let token = issue_token(&state.jwt_secret, user_id, &name, state.token_ttl)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Registered {} ({})", name, user_id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user_id,
            name,
            token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let email = req.email.trim().to_lowercase();
    let password = req.password;

    let user = blocking(&state, move |db| {
        let Some(user) = db.get_user_by_email(&email)? else {
            return Ok(None);
        };
        Ok(verify_password(&password, &user)?.then_some(user))
    })
    .await?
    .ok_or(StatusCode::UNAUTHORIZED)?;

    let user_id: Uuid = user.id.parse().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let token = issue_token(&state.jwt_secret, user_id, &user.name, state.token_ttl)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(AuthResponse {
        user_id,
        name: user.name,
        token,
    }))
}

/// Argon2id with a fresh salt.
fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))
}

/// A stored hash that does not parse is an error; a wrong password is not.
fn verify_password(password: &str, user: &UserRow) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(&user.password)
        .map_err(|e| anyhow::anyhow!("stored hash for {} unreadable: {}", user.id, e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
