use std::sync::Arc;

use taskhub::config::{DatabaseLocation, ServerConfig};
use taskhub::quota::{HttpQuotaPolicy, QuotaPolicy, Unlimited};
use taskhub::store::{FileObjectStore, LibSqlBackend};
use taskhub::{HubDeps, TaskHub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    eprintln!("📋 Taskhub v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker API: http://0.0.0.0:{}/internal/api/v1/tasks", config.port);
    eprintln!("   Admin API:  http://0.0.0.0:{}/api/v1/tasks", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = match &config.database {
        DatabaseLocation::Remote { url, auth_token } => {
            let backend = LibSqlBackend::new_remote(url, auth_token)
                .await
                .unwrap_or_else(|e| {
                    eprintln!("Error: Failed to connect to database at {}: {}", url, e);
                    std::process::exit(1);
                });
            eprintln!("   Database: {} (remote)", url);
            backend
        }
        DatabaseLocation::Local(path) => {
            let backend = LibSqlBackend::new_local(path).await.unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    path.display(),
                    e
                );
                std::process::exit(1);
            });
            eprintln!("   Database: {}", path.display());
            backend
        }
    };
    let backend = Arc::new(backend);

    // ── Chunk staging ────────────────────────────────────────────────────
    let objects = Arc::new(FileObjectStore::open(config.object_dir.clone()).await?);
    eprintln!("   Chunk staging: {}", config.object_dir.display());

    // ── Quota ────────────────────────────────────────────────────────────
    let quota: Arc<dyn QuotaPolicy> = match &config.quota {
        Some(q) => {
            eprintln!("   Quota: {}", q.base_url);
            Arc::new(HttpQuotaPolicy::new(q.base_url.clone(), q.token.clone()))
        }
        None => {
            eprintln!("   Quota: disabled");
            Arc::new(Unlimited)
        }
    };

    let hub = TaskHub::new(HubDeps::from_backend(backend, objects, quota), &config);
    eprintln!("   Processors: {}\n", hub.processors.list().await.join(", "));

    let _sweeper = hub.spawn_background(config.cleanup_sweep_interval);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Task server started");

    axum::serve(listener, hub.router())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
