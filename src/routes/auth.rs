use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::Redirect,
    Json,
};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    auth::{password, AuthenticatedUser, LOGIN_PATH, SESSION_COOKIE_NAME},
    error::{AppError, AppResult},
    models::{NewUser, Role, User},
    schema::users::dsl,
    state::AppState,
};

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: i32,
    pub username: String,
    pub role: Role,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub role: Role,
    pub redirect_to: &'static str,
}

/// Describes how to sign in; the browser UI itself is served elsewhere.
pub async fn login_page() -> Json<serde_json::Value> {
    Json(json!({
        "login": "/api/auth/login",
        "register": "/api/auth/register",
    }))
}

/// Creates an ordinary user account.
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<CredentialsRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    let username = payload.username.trim();
    let password = payload.password.trim();
    if username.is_empty() || password.is_empty() {
        return Err(AppError::validation("username and password are required"));
    }

    let mut conn = state.db()?;
    let user: User = diesel::insert_into(dsl::users)
        .values(&NewUser {
            username,
            password,
            role: Role::User,
        })
        .returning(User::as_returning())
        .get_result(&mut conn)
        .map_err(|err| match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                warn!(username = %username, "registration rejected: username taken");
                AppError::duplicate_name()
            }
            other => AppError::from(other),
        })?;

    info!(user_id = user.id, username = %user.username, "registered user");
    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            id: user.id,
            username: user.username,
            role: user.role,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<CredentialsRequest>,
) -> AppResult<(HeaderMap, Json<LoginResponse>)> {
    let username = payload.username.trim();
    let supplied = payload.password.trim();

    let user: Option<User> = {
        let mut conn = state.db()?;
        dsl::users
            .filter(dsl::username.eq(username))
            .first(&mut conn)
            .optional()?
    };

    let user = match user {
        Some(user) if password::credentials_match(supplied, &user.password) => user,
        _ => {
            warn!(username = %username, "login failed");
            return Err(AppError::invalid_credentials());
        }
    };

    let access_token = state
        .jwt
        .generate_token(user.id, &user.username, user.role)
        .map_err(AppError::from)?;

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_session_cookie(&state, &access_token)?);

    let redirect_to = match user.role {
        Role::Admin => "/api/admin/requests",
        Role::User => "/api/requests",
    };

    info!(user_id = user.id, username = %user.username, role = %user.role, "login succeeded");
    Ok((
        headers,
        Json(LoginResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: state.jwt.expiry_seconds(),
            role: user.role,
            redirect_to,
        }),
    ))
}

/// Ends the session whether or not one exists.
pub async fn logout(State(state): State<AppState>) -> AppResult<(HeaderMap, Redirect)> {
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_clear_session_cookie(&state)?);
    Ok((headers, Redirect::to(LOGIN_PATH)))
}

pub async fn me(user: AuthenticatedUser) -> Json<AuthenticatedUser> {
    Json(user)
}

fn build_session_cookie(state: &AppState, token: &str) -> AppResult<HeaderValue> {
    let mut parts = vec![format!("{}={}", SESSION_COOKIE_NAME, token)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Lax".into());
    parts.push(format!("Max-Age={}", state.jwt.expiry_seconds()));
    if state.config.session_cookie_secure {
        parts.push("Secure".into());
    }

    HeaderValue::from_str(&parts.join("; "))
        .map_err(|err| AppError::internal(format!("invalid session cookie: {err}")))
}

fn build_clear_session_cookie(state: &AppState) -> AppResult<HeaderValue> {
    let mut parts = vec![format!("{}=", SESSION_COOKIE_NAME)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Lax".into());
    parts.push("Max-Age=0".into());
    parts.push("Expires=Thu, 01 Jan 1970 00:00:00 GMT".into());
    if state.config.session_cookie_secure {
        parts.push("Secure".into());
    }

    HeaderValue::from_str(&parts.join("; "))
        .map_err(|err| AppError::internal(format!("invalid session cookie: {err}")))
}
