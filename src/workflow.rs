//! Request lifecycle: submission, review and delivery of stamped documents.
//!
//! A request moves `pending -> approved` or `pending -> rejected` and never leaves a
//! terminal state. Approving an approved request re-stamps it in place. Every
//! operation takes its own pooled connection and gives it back before touching
//! storage or the stamping engine.

use axum::http::StatusCode;
use bytes::Bytes;
use diesel::prelude::*;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tokio::task;
use tracing::{error, info, warn};

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{DocumentRequest, NewDocumentRequest, RequestStatus, Role};
use crate::schema::{requests, users};
use crate::stamp::{self, StampError};
use crate::state::AppState;

pub const SIGNED_PREFIX: &str = "signed_";
pub const ADMIN_SIGNED_PREFIX: &str = "signed_admin_";

/// A validated PDF upload.
#[derive(Debug, Clone)]
pub struct PdfUpload {
    file_name: String,
    bytes: Bytes,
}

impl PdfUpload {
    /// Checks that a file was supplied, that its name ends in `.pdf` and that it has
    /// content. Only the base name of the supplied file name is kept.
    pub fn new(file_name: Option<&str>, bytes: Option<Bytes>) -> AppResult<Self> {
        let file_name = file_name
            .and_then(upload_basename)
            .filter(|name| name.to_ascii_lowercase().ends_with(".pdf"))
            .ok_or_else(|| AppError::validation("please upload a PDF file"))?;

        let bytes = bytes.ok_or_else(|| AppError::validation("please upload a PDF file"))?;
        if bytes.is_empty() {
            return Err(AppError::validation("uploaded file must not be empty"));
        }

        Ok(Self { file_name, bytes })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// A file read back from storage for delivery.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Strips any client-side directory part from an uploaded file name.
fn upload_basename(raw: &str) -> Option<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Last path segment of a storage key.
pub fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Storage key of the stamped output for `source_key`.
///
/// `uploads/<token>/<name>` maps to `<signed_dir>/<token>/<prefix><name>`; keys
/// without a token directory map to `<signed_dir>/<prefix><name>`.
pub fn output_key(signed_dir: &str, source_key: &str, prefix: &str) -> String {
    let segments: Vec<&str> = source_key.split('/').collect();
    let name = key_basename(source_key);
    if segments.len() >= 3 {
        let token = segments[segments.len() - 2];
        format!("{signed_dir}/{token}/{prefix}{name}")
    } else {
        format!("{signed_dir}/{prefix}{name}")
    }
}

fn new_storage_token() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn store_upload(state: &AppState, upload: &PdfUpload) -> AppResult<String> {
    let key = format!(
        "{}/{}/{}",
        state.config.upload_prefix,
        new_storage_token(),
        upload.file_name
    );
    state
        .storage
        .put_object(&key, upload.bytes.to_vec())
        .await
        .map_err(|err| {
            error!(error = %err, key = %key, "failed to store upload");
            AppError::internal(format!("failed to store upload: {err}"))
        })?;
    Ok(key)
}

async fn discard(state: &AppState, key: &str) {
    if let Err(err) = state.storage.delete_object(key).await {
        warn!(error = %err, key = %key, "failed to remove orphaned object");
    }
}

fn insert_request(state: &AppState, new_request: NewDocumentRequest<'_>) -> AppResult<DocumentRequest> {
    let mut conn = state.db()?;
    let request = diesel::insert_into(requests::table)
        .values(&new_request)
        .returning(DocumentRequest::as_returning())
        .get_result(&mut conn)?;
    Ok(request)
}

/// Reads the signature and source, stamps them and stores the result under
/// `output_key`. Nothing is written when stamping fails.
async fn stamp_into(state: &AppState, source_key: &str, output_key: &str) -> AppResult<()> {
    let signature_key = state.config.signature_key.as_str();
    if !state.storage.object_exists(signature_key).await? {
        error!(signature = %signature_key, "signature image missing");
        return Err(StampError::SignatureMissing {
            path: signature_key.to_string(),
        }
        .into());
    }

    let signature = state.storage.get_object(signature_key).await?;
    let source = state.storage.get_object(source_key).await?;
    let options = state.config.stamp;

    let stamped = task::spawn_blocking(move || stamp::stamp_pdf(&source, &signature, &options))
        .await
        .map_err(|err| AppError::internal(format!("stamping task panicked: {err}")))?
        .map_err(|err| {
            error!(error = %err, source = %source_key, "stamping failed");
            AppError::from(err)
        })?;

    let checksum = hex::encode(Sha256::digest(&stamped));
    let size_bytes = stamped.len();
    state.storage.put_object(output_key, stamped).await?;

    info!(
        source = %source_key,
        output = %output_key,
        checksum = %checksum,
        size_bytes,
        "stamped document"
    );
    Ok(())
}

/// Files a new pending request for an ordinary user.
pub async fn submit(
    state: &AppState,
    owner: &AuthenticatedUser,
    upload: PdfUpload,
) -> AppResult<DocumentRequest> {
    let source_key = store_upload(state, &upload).await?;

    let inserted = insert_request(
        state,
        NewDocumentRequest {
            source_path: &source_key,
            output_path: "",
            status: RequestStatus::Pending,
            owner_id: owner.user_id,
        },
    );

    match inserted {
        Ok(request) => {
            info!(
                request_id = request.id,
                owner = %owner.username,
                source = %source_key,
                "request submitted"
            );
            Ok(request)
        }
        Err(err) => {
            discard(state, &source_key).await;
            Err(err)
        }
    }
}

/// Stores and stamps an administrator's own document in one step. The request row
/// is created already approved; a stamping failure creates no row.
pub async fn admin_submit(
    state: &AppState,
    admin: &AuthenticatedUser,
    upload: PdfUpload,
) -> AppResult<DocumentRequest> {
    let source_key = store_upload(state, &upload).await?;
    let output = output_key(&state.config.signed_prefix, &source_key, ADMIN_SIGNED_PREFIX);

    if let Err(err) = stamp_into(state, &source_key, &output).await {
        warn!(error = %err, source = %source_key, "admin upload not stamped");
        discard(state, &source_key).await;
        return Err(err);
    }

    let inserted = insert_request(
        state,
        NewDocumentRequest {
            source_path: &source_key,
            output_path: &output,
            status: RequestStatus::Approved,
            owner_id: admin.user_id,
        },
    );

    match inserted {
        Ok(request) => {
            info!(
                request_id = request.id,
                admin = %admin.username,
                output = %output,
                "admin upload stamped"
            );
            Ok(request)
        }
        Err(err) => {
            discard(state, &output).await;
            discard(state, &source_key).await;
            Err(err)
        }
    }
}

/// Stamps the request's source and marks it approved.
pub async fn approve(
    state: &AppState,
    admin: &AuthenticatedUser,
    request_id: i32,
) -> AppResult<DocumentRequest> {
    let request: DocumentRequest = {
        let mut conn = state.db()?;
        requests::table.find(request_id).first(&mut conn)?
    };

    if request.status == RequestStatus::Rejected {
        return Err(AppError::invalid_transition(
            "request has already been rejected",
        ));
    }

    let reapproved = request.status == RequestStatus::Approved;
    // re-approval overwrites the existing output, admin uploads included
    let output = if request.output_path.is_empty() {
        output_key(&state.config.signed_prefix, &request.source_path, SIGNED_PREFIX)
    } else {
        request.output_path.clone()
    };
    stamp_into(state, &request.source_path, &output).await?;

    let mut conn = state.db()?;
    let updated = diesel::update(
        requests::table
            .find(request_id)
            .filter(requests::status.ne(RequestStatus::Rejected)),
    )
    .set((
        requests::status.eq(RequestStatus::Approved),
        requests::output_path.eq(&output),
    ))
    .execute(&mut conn)?;

    if updated == 0 {
        drop(conn);
        warn!(request_id, "request rejected while being approved");
        discard(state, &output).await;
        return Err(AppError::invalid_transition(
            "request has already been rejected",
        ));
    }

    let request: DocumentRequest = requests::table.find(request_id).first(&mut conn)?;
    info!(
        request_id,
        admin = %admin.username,
        output = %output,
        reapproved,
        "request approved"
    );
    Ok(request)
}

/// Marks a pending request rejected. Rejecting twice is a no-op.
pub fn reject(
    state: &AppState,
    admin: &AuthenticatedUser,
    request_id: i32,
) -> AppResult<DocumentRequest> {
    let mut conn = state.db()?;
    let request: DocumentRequest = requests::table.find(request_id).first(&mut conn)?;

    match request.status {
        RequestStatus::Rejected => return Ok(request),
        RequestStatus::Approved => {
            return Err(AppError::invalid_transition(
                "request has already been approved",
            ))
        }
        RequestStatus::Pending => {}
    }

    let updated = diesel::update(
        requests::table
            .find(request_id)
            .filter(requests::status.eq(RequestStatus::Pending)),
    )
    .set(requests::status.eq(RequestStatus::Rejected))
    .execute(&mut conn)?;

    if updated == 0 {
        return Err(AppError::invalid_transition("request is no longer pending"));
    }

    info!(request_id, admin = %admin.username, "request rejected");
    let request = requests::table.find(request_id).first(&mut conn)?;
    Ok(request)
}

/// Returns the stamped output to its owner. Every other case answers the same
/// "not available" error, so callers learn nothing about other owners' requests.
pub async fn download(
    state: &AppState,
    caller: &AuthenticatedUser,
    request_id: i32,
) -> AppResult<StoredFile> {
    let request: Option<DocumentRequest> = {
        let mut conn = state.db()?;
        requests::table
            .find(request_id)
            .first(&mut conn)
            .optional()?
    };

    let request = match request {
        Some(request) if request.owner_id == caller.user_id && request.is_available() => request,
        _ => return Err(AppError::not_available()),
    };

    let bytes = state
        .storage
        .get_object(&request.output_path)
        .await
        .map_err(|err| {
            warn!(error = %err, request_id, "stamped output missing from storage");
            AppError::not_available()
        })?;

    Ok(StoredFile {
        filename: key_basename(&request.output_path).to_string(),
        bytes,
    })
}

/// Returns the original upload for review, whatever the request's status.
pub async fn admin_view(state: &AppState, request_id: i32) -> AppResult<StoredFile> {
    let request: DocumentRequest = {
        let mut conn = state.db()?;
        requests::table.find(request_id).first(&mut conn)?
    };

    let missing =
        || AppError::new(StatusCode::NOT_FOUND, "not_found", "PDF file not available on server");
    if request.source_path.is_empty() || !state.storage.object_exists(&request.source_path).await? {
        return Err(missing());
    }

    let bytes = state.storage.get_object(&request.source_path).await?;
    Ok(StoredFile {
        filename: key_basename(&request.source_path).to_string(),
        bytes,
    })
}

/// Replaces the global signature image. Past outputs are not touched.
pub async fn update_signature(
    state: &AppState,
    admin: &AuthenticatedUser,
    image_bytes: Bytes,
) -> AppResult<()> {
    if image_bytes.is_empty() {
        return Err(AppError::validation("signature image must not be empty"));
    }
    let decoded = image::load_from_memory(&image_bytes)
        .map_err(|_| AppError::validation("signature must be a PNG or JPEG image"))?;

    state
        .storage
        .put_object(&state.config.signature_key, image_bytes.to_vec())
        .await?;

    info!(
        admin = %admin.username,
        width = decoded.width(),
        height = decoded.height(),
        "signature image updated"
    );
    Ok(())
}

/// Overwrites the stored credential of the configured administrator account.
pub fn update_admin_password(
    state: &AppState,
    admin: &AuthenticatedUser,
    new_password: &str,
) -> AppResult<()> {
    let new_password = new_password.trim();
    if new_password.is_empty() {
        return Err(AppError::validation("password must not be empty"));
    }

    let mut conn = state.db()?;
    let updated = diesel::update(
        users::table
            .filter(users::username.eq(&state.config.admin_username))
            .filter(users::role.eq(Role::Admin)),
    )
    .set(users::password.eq(new_password))
    .execute(&mut conn)?;

    if updated == 0 {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "administrator account not found",
        ));
    }

    info!(admin = %admin.username, account = %state.config.admin_username, "administrator password updated");
    Ok(())
}

/// The caller's own requests, newest first.
pub fn list_for_owner(state: &AppState, owner: &AuthenticatedUser) -> AppResult<Vec<DocumentRequest>> {
    let mut conn = state.db()?;
    let rows = requests::table
        .filter(requests::owner_id.eq(owner.user_id))
        .order(requests::id.desc())
        .load(&mut conn)?;
    Ok(rows)
}

/// Every request with its owner's username, newest first.
pub fn list_all(state: &AppState) -> AppResult<Vec<(DocumentRequest, String)>> {
    let mut conn = state.db()?;
    let rows = requests::table
        .inner_join(users::table)
        .select((DocumentRequest::as_select(), users::username))
        .order(requests::id.desc())
        .load(&mut conn)?;
    Ok(rows)
}
