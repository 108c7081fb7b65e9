mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{body_json, sample_pdf, sample_signature, TestApp, ADMIN_PASSWORD, ADMIN_USERNAME};
use serde::Deserialize;
use sigdesk::models::RequestStatus;
use sigdesk::storage::ObjectStorage;

#[derive(Deserialize)]
struct RequestBody {
    id: i32,
    output_path: Option<String>,
    status: String,
    owner_id: i32,
}

#[derive(Deserialize)]
struct SettingsBody {
    signature_updated: bool,
    password_updated: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
}

#[derive(Deserialize)]
struct Me {
    user_id: i32,
}

#[tokio::test]
async fn admin_upload_is_approved_immediately() -> Result<()> {
    let app = TestApp::new().await?;
    app.install_signature().await?;
    let admin = app.admin_token().await?;
    let me: Me = body_json(app.get("/api/auth/me", Some(&admin)).await?).await?;

    let response = app
        .upload_pdf(
            "/api/admin/requests",
            "board-minutes.pdf",
            &sample_pdf(&[(612, 792)]),
            &admin,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: RequestBody = body_json(response).await?;
    assert_eq!(created.status, "approved");
    assert_eq!(created.owner_id, me.user_id);
    let output = created.output_path.expect("output recorded");
    assert!(output.ends_with("/signed_admin_board-minutes.pdf"));
    assert!(app.state.storage.object_exists(&output).await?);

    let row = app.request_row(created.id).await?.expect("row exists");
    assert_eq!(row.status, RequestStatus::Approved);

    let download = app
        .get(&format!("/api/requests/{}/download", created.id), Some(&admin))
        .await?;
    assert_eq!(download.status(), StatusCode::OK);

    let anonymous = app
        .get(&format!("/api/requests/{}/download", created.id), None)
        .await?;
    assert_eq!(anonymous.status(), StatusCode::SEE_OTHER);
    Ok(())
}

#[tokio::test]
async fn admin_upload_without_signature_creates_nothing() -> Result<()> {
    let app = TestApp::new().await?;
    let admin = app.admin_token().await?;

    let response = app
        .upload_pdf(
            "/api/admin/requests",
            "unsigned.pdf",
            &sample_pdf(&[(612, 792)]),
            &admin,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = body_json(response).await?;
    assert_eq!(body.code, "signature_missing");
    assert_eq!(app.request_count().await?, 0);

    let leftover: usize = std::fs::read_dir(app.root().join("uploads"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| std::fs::read_dir(entry.path()).map(|dir| dir.count()).unwrap_or(0))
        .sum();
    assert_eq!(leftover, 0);
    Ok(())
}

#[tokio::test]
async fn admin_upload_rejects_non_pdf() -> Result<()> {
    let app = TestApp::new().await?;
    app.install_signature().await?;
    let admin = app.admin_token().await?;

    let response = app
        .upload_pdf("/api/admin/requests", "slides.pptx", b"binary", &admin)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.request_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn settings_replace_signature_and_password() -> Result<()> {
    let app = TestApp::new().await?;
    let admin = app.admin_token().await?;
    let signature = sample_signature(64, 32);

    let response = app
        .post_multipart(
            "/api/admin/settings",
            &[
                ("signature", Some("sig.png"), signature.as_slice()),
                ("password", None, b"n3w-secret".as_slice()),
            ],
            &admin,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: SettingsBody = body_json(response).await?;
    assert!(body.signature_updated);
    assert!(body.password_updated);

    let stored = app
        .state
        .storage
        .get_object(&app.state.config.signature_key)
        .await?;
    assert_eq!(stored, signature);

    assert!(app.login_token(ADMIN_USERNAME, ADMIN_PASSWORD).await.is_err());
    app.login_token(ADMIN_USERNAME, "n3w-secret").await?;
    Ok(())
}

#[tokio::test]
async fn settings_with_blank_password_keep_current_one() -> Result<()> {
    let app = TestApp::new().await?;
    let admin = app.admin_token().await?;

    let response = app
        .post_multipart(
            "/api/admin/settings",
            &[
                ("signature", Some("sig.png"), sample_signature(8, 8).as_slice()),
                ("password", None, b"".as_slice()),
            ],
            &admin,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: SettingsBody = body_json(response).await?;
    assert!(body.signature_updated);
    assert!(!body.password_updated);

    app.login_token(ADMIN_USERNAME, ADMIN_PASSWORD).await?;
    Ok(())
}

#[tokio::test]
async fn settings_reject_files_that_are_not_images() -> Result<()> {
    let app = TestApp::new().await?;
    let admin = app.admin_token().await?;

    let response = app
        .post_multipart(
            "/api/admin/settings",
            &[("signature", Some("sig.png"), b"not an image".as_slice())],
            &admin,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = body_json(response).await?;
    assert_eq!(body.code, "validation_error");
    assert!(!app
        .state
        .storage
        .object_exists(&app.state.config.signature_key)
        .await?);

    let empty = app
        .post_multipart("/api/admin/settings", &[], &admin)
        .await?;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn new_signature_applies_to_later_approvals_only() -> Result<()> {
    let app = TestApp::new().await?;
    app.install_signature().await?;
    let user = app.user_token("alice").await?;
    let admin = app.admin_token().await?;

    let upload = app
        .upload_pdf("/api/requests", "first.pdf", &sample_pdf(&[(612, 792)]), &user)
        .await?;
    let first: RequestBody = body_json(upload).await?;
    let approved: RequestBody = body_json(
        app.post(&format!("/api/admin/requests/{}/approve", first.id), Some(&admin))
            .await?,
    )
    .await?;
    let first_output = approved.output_path.expect("output recorded");
    let before = app.state.storage.get_object(&first_output).await?;

    let response = app
        .post_multipart(
            "/api/admin/settings",
            &[("signature", Some("new.png"), sample_signature(10, 90).as_slice())],
            &admin,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let after = app.state.storage.get_object(&first_output).await?;
    assert_eq!(before, after);
    Ok(())
}

#[tokio::test]
async fn reapproving_admin_upload_keeps_its_output() -> Result<()> {
    let app = TestApp::new().await?;
    app.install_signature().await?;
    let admin = app.admin_token().await?;

    let created: RequestBody = body_json(
        app.upload_pdf(
            "/api/admin/requests",
            "charter.pdf",
            &sample_pdf(&[(612, 792)]),
            &admin,
        )
        .await?,
    )
    .await?;
    let output = created.output_path.expect("output recorded");

    let response = app
        .post(&format!("/api/admin/requests/{}/approve", created.id), Some(&admin))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let reapproved: RequestBody = body_json(response).await?;
    assert_eq!(reapproved.output_path.as_deref(), Some(output.as_str()));

    let output_file = app.root().join(&output);
    let siblings: Vec<_> = std::fs::read_dir(output_file.parent().expect("output has a directory"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(siblings, vec!["signed_admin_charter.pdf".to_string()]);
    Ok(())
}

#[tokio::test]
async fn settings_password_is_trimmed_like_login() -> Result<()> {
    let app = TestApp::new().await?;
    let admin = app.admin_token().await?;

    let response = app
        .post_multipart(
            "/api/admin/settings",
            &[("password", None, b"  n3w-secret \n".as_slice())],
            &admin,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    app.login_token(ADMIN_USERNAME, "n3w-secret").await?;

    let blank = app
        .post_multipart(
            "/api/admin/settings",
            &[
                ("signature", Some("sig.png"), sample_signature(8, 8).as_slice()),
                ("password", None, b"   ".as_slice()),
            ],
            &admin,
        )
        .await?;
    assert_eq!(blank.status(), StatusCode::OK);
    let body: SettingsBody = body_json(blank).await?;
    assert!(!body.password_updated);
    app.login_token(ADMIN_USERNAME, "n3w-secret").await?;
    Ok(())
}
