use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tus_store::{
    auth::{AllowAll, AuthPolicy, BearerToken},
    config::{self, Backend},
    routes,
    services::{
        coordinator::{ReaperConfig, TransferCoordinator, spawn_reaper},
        hooks::filename_header_hook,
        metadata_store::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore},
        notify::LogCompletionSink,
        storage::{FileStorage, MemoryStorage, StorageBackend},
        upload_service::UploadService,
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        backend = ?cfg.backend,
        base_path = %cfg.base_path,
        "Starting tus-store"
    );

    // --- Initialize storage + metadata ---
    let (storage, store): (Arc<dyn StorageBackend>, Arc<dyn MetadataStore>) = match cfg.backend {
        Backend::File => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }

            let db_url = &cfg.database_url;
            let db_path = db_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("file:");
            tracing::debug!("Interpreted SQLite path => {}", db_path);

            // Create parent directory and file if needed
            let db_path_obj = Path::new(db_path);
            if let Some(parent) = db_path_obj.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                    tracing::info!("Created missing directory {:?}", parent);
                }
            }
            if let Err(e) = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(db_path)
            {
                tracing::warn!("Failed to open database file manually: {}", e);
            }

            let db = Arc::new(
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect(db_url)
                    .await?,
            );
            let sqlite = SqliteMetadataStore::new(db);

            // --- Handle migration mode ---
            if migrate {
                sqlite.migrate().await?;
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            if cfg.auto_migrate {
                sqlite.migrate().await?;
            }

            (Arc::new(FileStorage::new(&cfg.storage_dir)), Arc::new(sqlite))
        }
        Backend::Memory => {
            if migrate {
                tracing::info!("Memory backend has no schema; nothing to migrate.");
                return Ok(());
            }
            tracing::warn!("Memory backend selected: uploads do not survive a restart");
            (Arc::new(MemoryStorage::new()), Arc::new(MemoryMetadataStore::new()))
        }
    };

    // --- Initialize core service ---
    let coordinator = Arc::new(TransferCoordinator::new(Arc::new(LogCompletionSink)));
    let service = UploadService::new(storage, store, coordinator)
        .with_creation_hook(filename_header_hook())
        .with_max_size(cfg.max_size)
        .with_retention(cfg.retention);

    let report = service.recover().await?;
    tracing::info!(
        checked = report.checked,
        truncated = report.truncated,
        inconsistent = report.inconsistent,
        "Storage consistency pass finished"
    );
    service.redeliver_pending().await;

    if let Some(retention) = cfg.retention {
        spawn_reaper(
            service.clone(),
            ReaperConfig {
                interval: cfg.reap_interval,
                retention,
                reap_completed: cfg.reap_completed,
            },
        );
    }

    let auth: Arc<dyn AuthPolicy> = match &cfg.auth_token {
        Some(token) => Arc::new(BearerToken::new(token.clone())),
        None => {
            tracing::warn!("No auth token configured; upload endpoints are open");
            Arc::new(AllowAll)
        }
    };

    // --- Build router ---
    let app = routes::routes::routes(AppState::new(service, auth, &cfg.base_path));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
