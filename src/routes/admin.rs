use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::{
    auth::AdminUser,
    error::{AppError, AppResult},
    state::AppState,
    workflow,
};

use super::files::{file_response, Disposition, FormParts};
use super::requests::{read_pdf_upload, RequestResponse};

#[derive(Serialize)]
pub struct AdminRequestResponse {
    #[serde(flatten)]
    pub request: RequestResponse,
    pub username: String,
    pub view_url: String,
}

#[derive(Serialize)]
pub struct SettingsResponse {
    pub signature_updated: bool,
    pub password_updated: bool,
}

/// Every request in the system, for the review dashboard.
pub async fn list_requests(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Vec<AdminRequestResponse>>> {
    let rows = workflow::list_all(&state)?;
    let body = rows
        .into_iter()
        .map(|(request, username)| {
            let view_url = format!("/api/admin/requests/{}/view", request.id);
            AdminRequestResponse {
                request: request.into(),
                username,
                view_url,
            }
        })
        .collect();
    Ok(Json(body))
}

/// An administrator's own document, stamped on upload.
pub async fn upload_document(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<RequestResponse>)> {
    let upload = read_pdf_upload(multipart).await?;
    let request = workflow::admin_submit(&state, &admin, upload).await?;
    Ok((StatusCode::CREATED, Json(request.into())))
}

pub async fn approve_request(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(request_id): Path<i32>,
) -> AppResult<Json<RequestResponse>> {
    let request = workflow::approve(&state, &admin, request_id).await?;
    Ok(Json(request.into()))
}

pub async fn reject_request(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(request_id): Path<i32>,
) -> AppResult<Json<RequestResponse>> {
    let request = workflow::reject(&state, &admin, request_id)?;
    Ok(Json(request.into()))
}

pub async fn view_request(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(request_id): Path<i32>,
) -> AppResult<Response> {
    let file = workflow::admin_view(&state, request_id).await?;
    Ok(file_response(file, Disposition::Inline))
}

/// Replaces the signature image and/or the administrator password.
///
/// Fields: `signature` (image file) and `password` (text). Either may be omitted;
/// a blank password leaves the current one in place.
pub async fn update_settings(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    multipart: Multipart,
) -> AppResult<Json<SettingsResponse>> {
    let mut form = FormParts::read(multipart).await?;
    let signature = form.take_file("signature");
    let password = form
        .take_text("password")
        .filter(|value| !value.trim().is_empty());

    if signature.is_none() && password.is_none() {
        return Err(AppError::validation(
            "provide a signature image or a new password",
        ));
    }

    let mut response = SettingsResponse {
        signature_updated: false,
        password_updated: false,
    };

    if let Some(file) = signature {
        workflow::update_signature(&state, &admin, file.bytes).await?;
        response.signature_updated = true;
    }

    if let Some(password) = password {
        workflow::update_admin_password(&state, &admin, &password)?;
        response.password_updated = true;
    }

    info!(
        admin = %admin.username,
        signature_updated = response.signature_updated,
        password_updated = response.password_updated,
        "settings updated"
    );
    Ok(Json(response))
}
