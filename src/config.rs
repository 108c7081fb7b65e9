use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};

use crate::db::DEFAULT_MAX_POOL_SIZE;
use crate::stamp::StampOptions;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub session_secret: String,
    pub session_issuer: String,
    pub session_audience: String,
    pub session_expiry_minutes: i64,
    pub session_cookie_secure: bool,
    pub cors_allowed_origin: Option<String>,
    pub storage_root: PathBuf,
    pub upload_prefix: String,
    pub signed_prefix: String,
    pub signature_key: String,
    pub stamp: StampOptions,
    pub admin_username: String,
    pub admin_password: String,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "requests.db".to_string());
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let session_secret = match env::var("SESSION_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!(
                    "SESSION_SECRET not set; generated a random secret, sessions will not survive a restart"
                );
                generate_secret()
            }
        };
        let session_issuer = env::var("SESSION_ISSUER").unwrap_or_else(|_| "sigdesk".to_string());
        let session_audience =
            env::var("SESSION_AUDIENCE").unwrap_or_else(|_| "sigdesk-clients".to_string());
        let session_expiry_minutes = env::var("SESSION_EXPIRY_MINUTES")
            .unwrap_or_else(|_| "480".to_string())
            .parse()
            .context("SESSION_EXPIRY_MINUTES must be an integer")?;
        let session_cookie_secure = env::var("SESSION_COOKIE_SECURE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let storage_root = env::var("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let signature_key =
            env::var("SIGNATURE_PATH").unwrap_or_else(|_| "static/signature.png".to_string());
        let stamp = StampOptions::coerce(
            &env::var("STAMP_WIDTH").unwrap_or_else(|_| "120".to_string()),
            &env::var("STAMP_HEIGHT").unwrap_or_else(|_| "60".to_string()),
            &env::var("STAMP_MARGIN").unwrap_or_else(|_| "20".to_string()),
        );
        let admin_username = env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string());
        let admin_password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin123".to_string());
        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            session_secret,
            session_issuer,
            session_audience,
            session_expiry_minutes,
            session_cookie_secure,
            cors_allowed_origin,
            storage_root,
            upload_prefix: "uploads".to_string(),
            signed_prefix: "signed".to_string(),
            signature_key,
            stamp,
            admin_username,
            admin_password,
            max_upload_bytes,
        })
    }

    /// Settings suitable for tests and local tooling: everything lives under `root`.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let storage_root = root.into();
        Self {
            database_url: storage_root.join("requests.db").to_string_lossy().into_owned(),
            database_max_pool_size: DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            session_secret: generate_secret(),
            session_issuer: "sigdesk".to_string(),
            session_audience: "sigdesk-clients".to_string(),
            session_expiry_minutes: 60,
            session_cookie_secure: false,
            cors_allowed_origin: None,
            storage_root,
            upload_prefix: "uploads".to_string(),
            signed_prefix: "signed".to_string(),
            signature_key: "static/signature.png".to_string(),
            stamp: StampOptions::default(),
            admin_username: "admin".to_string(),
            admin_password: "admin123".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
