use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use serde::Serialize;

use crate::{
    auth::{AuthenticatedUser, OrdinaryUser},
    error::AppResult,
    models::{DocumentRequest, RequestStatus},
    state::AppState,
    workflow::{self, key_basename, PdfUpload},
};

use super::files::{file_response, Disposition, FormParts};

/// Multipart field carrying the uploaded document.
pub const PDF_FIELD: &str = "pdf";

#[derive(Serialize)]
pub struct RequestResponse {
    pub id: i32,
    pub filename: String,
    pub source_path: String,
    pub output_path: Option<String>,
    pub status: RequestStatus,
    pub owner_id: i32,
    pub download_url: Option<String>,
}

impl From<DocumentRequest> for RequestResponse {
    fn from(request: DocumentRequest) -> Self {
        let download_url = request
            .is_available()
            .then(|| format!("/api/requests/{}/download", request.id));
        Self {
            id: request.id,
            filename: key_basename(&request.source_path).to_string(),
            output_path: (!request.output_path.is_empty()).then_some(request.output_path),
            source_path: request.source_path,
            status: request.status,
            owner_id: request.owner_id,
            download_url,
        }
    }
}

pub(crate) async fn read_pdf_upload(multipart: Multipart) -> AppResult<PdfUpload> {
    let mut form = FormParts::read(multipart).await?;
    let file = form.take_file(PDF_FIELD);
    let (file_name, bytes) = match file {
        Some(file) => (file.file_name, Some(file.bytes)),
        None => (None, None),
    };
    PdfUpload::new(file_name.as_deref(), bytes)
}

/// The caller's dashboard.
pub async fn list_requests(
    State(state): State<AppState>,
    OrdinaryUser(user): OrdinaryUser,
) -> AppResult<Json<Vec<RequestResponse>>> {
    let rows = workflow::list_for_owner(&state, &user)?;
    Ok(Json(rows.into_iter().map(RequestResponse::from).collect()))
}

pub async fn submit_request(
    State(state): State<AppState>,
    OrdinaryUser(user): OrdinaryUser,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<RequestResponse>)> {
    let upload = read_pdf_upload(multipart).await?;
    let request = workflow::submit(&state, &user, upload).await?;
    Ok((StatusCode::CREATED, Json(request.into())))
}

/// Open to any signed-in caller; ownership is checked by the workflow.
pub async fn download_request(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(request_id): Path<i32>,
) -> AppResult<Response> {
    let file = workflow::download(&state, &user, request_id).await?;
    Ok(file_response(file, Disposition::Attachment))
}
