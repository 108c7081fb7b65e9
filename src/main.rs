use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower::make::Shared;
use tracing_subscriber::EnvFilter;

use sigdesk::auth::jwt::JwtService;
use sigdesk::config::AppConfig;
use sigdesk::db;
use sigdesk::routes::create_router;
use sigdesk::state::AppState;
use sigdesk::storage::LocalStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        database_url = %config.database_url,
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        storage_root = %config.storage_root.display(),
        signature = %config.signature_key,
        stamp_width = config.stamp.width,
        stamp_height = config.stamp.height,
        stamp_margin = config.stamp.margin,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let mut conn = pool.get()?;
        db::run_migrations(&mut conn)?;
        db::seed_default_admin(&mut conn, &config.admin_username, &config.admin_password)?;
    }

    let storage = LocalStorage::new(config.storage_root.clone());
    let signature_dir = Path::new(&config.signature_key)
        .parent()
        .and_then(Path::to_str)
        .filter(|dir| !dir.is_empty());
    let mut dirs = vec![config.upload_prefix.as_str(), config.signed_prefix.as_str()];
    dirs.extend(signature_dir);
    storage.ensure_dirs(&dirs).await?;
    tracing::info!(root = %storage.root().display(), "storage ready");

    let jwt = JwtService::from_config(&config)?;
    let state = AppState::new(pool, config, Arc::new(storage), jwt);
    let listen_addr: SocketAddr = {
        let config = state.config.clone();
        format!("{}:{}", config.server_host, config.server_port).parse()?
    };
    let router = create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, Shared::new(router)).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
