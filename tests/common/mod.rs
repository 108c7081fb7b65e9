use std::io::Cursor;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::prelude::*;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use rand::{rngs::OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sigdesk::auth::jwt::JwtService;
use sigdesk::config::AppConfig;
use sigdesk::db;
use sigdesk::models::DocumentRequest;
use sigdesk::routes;
use sigdesk::state::AppState;
use sigdesk::storage::{LocalStorage, ObjectStorage};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin123";

/// A multipart part: `(field name, optional file name, bytes)`.
pub type Part<'a> = (&'a str, Option<&'a str>, &'a [u8]);

pub struct TestApp {
    pub state: AppState,
    router: Router,
    root: TempDir,
}

impl TestApp {
    /// A fresh application over its own temporary database and storage root.
    pub async fn new() -> Result<Self> {
        let root = tempfile::tempdir().context("failed to create test root")?;
        let config = AppConfig::for_root(root.path());

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        let setup_pool = pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = setup_pool
                .get()
                .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
            db::run_migrations(&mut conn)?;
            db::seed_default_admin(&mut conn, ADMIN_USERNAME, ADMIN_PASSWORD)?;
            Ok(())
        })
        .await
        .context("migration task panicked")??;

        let storage = LocalStorage::new(root.path());
        storage.ensure_dirs(&["uploads", "signed", "static"]).await?;

        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool, config, Arc::new(storage), jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            root,
        })
    }

    #[allow(dead_code)]
    pub fn root(&self) -> &std::path::Path {
        self.root.path()
    }

    /// Installs a solid-colour PNG as the signature image.
    pub async fn install_signature(&self) -> Result<()> {
        self.state
            .storage
            .put_object(&self.state.config.signature_key, sample_signature(40, 20))
            .await
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<hyper::Response<Body>> {
        #[derive(Serialize)]
        struct Payload<'a> {
            username: &'a str,
            password: &'a str,
        }

        self.post_json("/api/auth/register", &Payload { username, password }, None)
            .await
    }

    /// Registers an ordinary user and returns a session token for them.
    #[allow(dead_code)]
    pub async fn user_token(&self, username: &str) -> Result<String> {
        let response = self.register(username, "pw").await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "registration failed with status {}",
            response.status()
        );
        self.login_token(username, "pw").await
    }

    #[allow(dead_code)]
    pub async fn admin_token(&self) -> Result<String> {
        self.login_token(ADMIN_USERNAME, ADMIN_PASSWORD).await
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = body_json(response).await?;
        Ok(parsed.access_token)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body))?).await
    }

    #[allow(dead_code)]
    pub async fn post(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::POST).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }

    #[allow(dead_code)]
    pub async fn get_with_cookie(&self, path: &str, cookie: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header("cookie", cookie)
            .body(Body::empty())?;
        self.send(request).await
    }

    /// Posts a PDF under the `pdf` field.
    #[allow(dead_code)]
    pub async fn upload_pdf(
        &self,
        path: &str,
        filename: &str,
        data: &[u8],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        self.post_multipart(path, &[("pdf", Some(filename), data)], token)
            .await
    }

    pub async fn post_multipart(
        &self,
        path: &str,
        parts: &[Part<'_>],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let mut nonce = [0u8; 8];
        OsRng.fill_bytes(&mut nonce);
        let boundary = format!("boundary-{}", hex::encode(nonce));

        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            match filename {
                Some(filename) => {
                    body.extend(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend(b"Content-Type: application/octet-stream\r\n\r\n");
                }
                None => {
                    body.extend(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                }
            }
            body.extend(*data);
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        self.send(request).await
    }

    /// Reads a request row straight from the database.
    #[allow(dead_code)]
    pub async fn request_row(&self, id: i32) -> Result<Option<DocumentRequest>> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<DocumentRequest>> {
            use sigdesk::schema::requests;

            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            let row = requests::table
                .find(id)
                .first(&mut conn)
                .optional()
                .context("failed to load request")?;
            Ok(row)
        })
        .await
        .context("connection task panicked")?
    }

    #[allow(dead_code)]
    pub async fn request_count(&self) -> Result<i64> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<i64> {
            use sigdesk::schema::requests;

            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            let count = requests::table
                .count()
                .get_result(&mut conn)
                .context("failed to count requests")?;
            Ok(count)
        })
        .await
        .context("connection task panicked")?
    }

    async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .map_err(|err| anyhow!("router failed: {err}"))?;
        Ok(response)
    }
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_json<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).context("response body is not the expected JSON")
}

/// A minimal PDF with one page per `(width, height)` entry.
#[allow(dead_code)]
pub fn sample_pdf(pages: &[(i64, i64)]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();

    for (width, height) in pages {
        let content = Stream::new(Dictionary::new(), b"0 0 1 rg\n10 10 50 50 re\nf\n".to_vec());
        let content_id = doc.add_object(content);
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(*width),
                Object::Integer(*height),
            ],
            "Contents" => Object::Reference(content_id),
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("sample pdf serializes");
    bytes
}

pub fn sample_signature(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba([10, 20, 200, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encodes");
    bytes
}
