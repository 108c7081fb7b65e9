use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    response::Redirect,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{
    auth::{AdminUser, OrdinaryUser, LOGIN_PATH},
    state::AppState,
};

pub mod admin;
pub mod auth;
mod files;
pub mod health;
pub mod requests;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .filter_map(|value| match value.parse::<HeaderValue>() {
                Ok(header) => Some(header),
                Err(_) => {
                    tracing::warn!(origin = %value, "ignoring invalid CORS allowed origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout).get(auth::logout))
        .route("/me", get(auth::me));

    let user_routes = Router::new()
        .route(
            "/",
            get(requests::list_requests).post(requests::submit_request),
        )
        .layer(middleware::from_extractor_with_state::<OrdinaryUser, _>(
            state.clone(),
        ))
        .route("/:id/download", get(requests::download_request));

    let admin_routes = Router::new()
        .route("/requests", get(admin::list_requests).post(admin::upload_document))
        .route("/requests/:id/approve", post(admin::approve_request))
        .route("/requests/:id/reject", post(admin::reject_request))
        .route("/requests/:id/view", get(admin::view_request))
        .route("/settings", post(admin::update_settings))
        .layer(middleware::from_extractor_with_state::<AdminUser, _>(
            state.clone(),
        ));

    let max_upload_bytes = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(|| async { Redirect::to(LOGIN_PATH) }))
        .route(LOGIN_PATH, get(auth::login_page))
        .nest("/api/auth", auth_routes)
        .nest("/api/requests", user_routes)
        .nest("/api/admin", admin_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
