pub mod jwt;
pub mod password;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::headers::{authorization::Bearer, Authorization, Cookie};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};

use crate::{models::Role, state::AppState};

pub const SESSION_COOKIE_NAME: &str = "session";
pub const LOGIN_PATH: &str = "/login";

/// The caller bound to the current session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: i32,
    pub username: String,
    pub role: Role,
}

/// Rejection for every gated route: send the caller to the login page.
#[derive(Debug)]
pub struct AuthRedirect;

impl IntoResponse for AuthRedirect {
    fn into_response(self) -> Response {
        Redirect::to(LOGIN_PATH).into_response()
    }
}

async fn session_token(parts: &mut Parts, state: &AppState) -> Option<String> {
    if let Ok(TypedHeader(Authorization(bearer))) =
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state).await
    {
        return Some(bearer.token().to_string());
    }

    let TypedHeader(cookies) = TypedHeader::<Cookie>::from_request_parts(parts, state)
        .await
        .ok()?;
    cookies
        .get(SESSION_COOKIE_NAME)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AuthRedirect;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(parts, state).await.ok_or(AuthRedirect)?;

        let claims = state.jwt.verify_token(&token).map_err(|_| AuthRedirect)?;

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
        })
    }
}

/// A session holding the ordinary user role.
#[derive(Debug, Clone)]
pub struct OrdinaryUser(pub AuthenticatedUser);

/// A session holding the administrator role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

async fn require_role(
    parts: &mut Parts,
    state: &AppState,
    role: Role,
) -> Result<AuthenticatedUser, AuthRedirect> {
    let user = AuthenticatedUser::from_request_parts(parts, state).await?;
    if user.role != role {
        tracing::debug!(
            username = %user.username,
            role = %user.role,
            required = %role,
            "session role mismatch, redirecting to login"
        );
        return Err(AuthRedirect);
    }
    Ok(user)
}

#[async_trait]
impl FromRequestParts<AppState> for OrdinaryUser {
    type Rejection = AuthRedirect;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        require_role(parts, state, Role::User).await.map(OrdinaryUser)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AuthRedirect;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        require_role(parts, state, Role::Admin).await.map(AdminUser)
    }
}
