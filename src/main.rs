use anyhow::{Context, Result};
use axum::Router;
use cloud_offload::{
    config::AppConfig,
    db, routes,
    services::{
        history_service::HistoryReconciler,
        notifier::{LogSink, NotificationSink, TelegramSink},
        path_mapper::RuleStore,
        pipeline::{Pipeline, PipelineParts, PipelineSettings},
        remote_client::HttpRemoteStorage,
        share_aggregator::SystemClock,
    },
    state::AppState,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    // --- Initialize SQLite connection ---
    let db = Arc::new(
        db::connect(&cfg.database_url, 5)
            .await
            .with_context(|| format!("opening history database {}", cfg.database_url))?,
    );

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    cfg.validate()?;
    tracing::info!(
        addr = %cfg.addr(),
        workers = cfg.workers,
        local = %cfg.local_kind,
        remote = %cfg.remote_kind,
        share = cfg.share_enabled,
        "Starting cloud-offload"
    );

    // --- Build pipeline collaborators ---
    let rules = RuleStore::load(cfg.mappings.clone(), cfg.mappings_file.clone())
        .context("loading path mappings")?;
    if rules.snapshot().is_empty() {
        tracing::warn!("No path mappings configured; every upload will fail as unmapped");
    }

    let remote = Arc::new(
        HttpRemoteStorage::new(cfg.remote_base_url.clone(), cfg.remote_credential.clone())
            .context("building remote storage client")?,
    );
    let history = HistoryReconciler::new(
        db.clone(),
        cfg.local_kind.clone(),
        cfg.remote_kind.clone(),
    );
    let sink: Arc<dyn NotificationSink> = match (&cfg.telegram_token, &cfg.telegram_chat_id) {
        (Some(token), Some(chat)) => Arc::new(
            TelegramSink::new(token.clone(), chat.clone()).context("building telegram client")?,
        ),
        _ => Arc::new(LogSink),
    };

    let pipeline = Pipeline::start(
        PipelineSettings {
            local_kind: cfg.local_kind.clone(),
            pool: cfg.pool_settings(),
            share: cfg.share_settings(),
        },
        PipelineParts {
            rules,
            remote,
            history: Arc::new(history.clone()),
            sink,
            clock: Arc::new(SystemClock),
        },
    );

    // --- Build router ---
    let state = AppState {
        db: db.clone(),
        history,
        pipeline: pipeline.handle(),
    };
    let app: Router = routes::routes::routes().with_state(state);

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
