use std::collections::HashMap;

use axum::{
    extract::Multipart,
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderValue,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::error;

use crate::{
    error::{AppError, AppResult},
    workflow::StoredFile,
};

/// A file part of a multipart form.
pub struct FormFile {
    pub file_name: Option<String>,
    pub bytes: Bytes,
}

/// The parts of a multipart form, keyed by field name. Later fields win.
#[derive(Default)]
pub struct FormParts {
    files: HashMap<String, FormFile>,
    fields: HashMap<String, String>,
}

impl FormParts {
    pub async fn read(mut multipart: Multipart) -> AppResult<Self> {
        let mut parts = FormParts::default();

        while let Some(field) = multipart.next_field().await.map_err(|err| {
            error!(error = %err, "invalid multipart data");
            AppError::validation(format!("invalid multipart data: {err}"))
        })? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };

            if let Some(file_name) = field.file_name().map(str::to_string) {
                let bytes = field.bytes().await.map_err(|err| {
                    error!(error = %err, field = %name, "failed to read file bytes");
                    AppError::validation(format!("failed to read file bytes: {err}"))
                })?;
                parts.files.insert(
                    name,
                    FormFile {
                        file_name: Some(file_name),
                        bytes,
                    },
                );
            } else {
                let value = field.text().await.map_err(|err| {
                    error!(error = %err, field = %name, "failed to read form field");
                    AppError::validation(format!("invalid form field {name}: {err}"))
                })?;
                parts.fields.insert(name, value);
            }
        }

        Ok(parts)
    }

    /// Takes a file field. Browsers send an empty, unnamed part when no file was picked;
    /// that counts as absent.
    pub fn take_file(&mut self, name: &str) -> Option<FormFile> {
        self.files.remove(name).filter(|file| {
            file.file_name.as_deref().is_some_and(|n| !n.is_empty()) || !file.bytes.is_empty()
        })
    }

    pub fn take_text(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }
}

pub enum Disposition {
    Attachment,
    Inline,
}

fn content_disposition(kind: &Disposition, filename: &str) -> String {
    let kind = match kind {
        Disposition::Attachment => "attachment",
        Disposition::Inline => "inline",
    };

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_control() => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    format!("{kind}; filename=\"{sanitized}\"; filename*=UTF-8''{encoded}")
}

/// Serves stored bytes with a content type guessed from the file name.
pub fn file_response(file: StoredFile, disposition: Disposition) -> Response {
    let content_type = mime_guess::from_path(&file.filename)
        .first_or_octet_stream()
        .to_string();

    let mut response = file.bytes.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    let disposition = content_disposition(&disposition, &file.filename);
    if let Ok(value) = HeaderValue::from_bytes(disposition.as_bytes()) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    response
}
