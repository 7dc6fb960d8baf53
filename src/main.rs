use anyhow::Result;
use axum::Router;
use bucket_encryptor::{
    config::{AppConfig, ControllerConfig},
    db, routes,
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, time::Duration};
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

    tracing::info!("Starting bucket-encryptor with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Controller parameters ---
    let controller_cfg = ControllerConfig::from_env()?;
    tracing::info!(
        target_tag = %controller_cfg.target_tag.key,
        encryption = ?controller_cfg.encryption,
        region = %controller_cfg.region,
        "Controller parameters loaded"
    );

    let state = AppState::build(db, cfg.storage_dir.clone(), controller_cfg);

    // --- Background timers ---
    if cfg.scan_interval_secs > 0 {
        tokio::spawn(scan_loop(state.clone(), Duration::from_secs(cfg.scan_interval_secs)));
    }
    if cfg.runner_interval_secs > 0 {
        tokio::spawn(runner_loop(state.clone(), Duration::from_secs(cfg.runner_interval_secs)));
    }

    // --- Build router ---
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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic selector + scheduler pass.
async fn scan_loop(state: AppState, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        match state.controller.run_inventory_pass().await {
            Ok(report) => tracing::info!(
                created = report.created.len(),
                unchanged = report.unchanged.len(),
                skipped = report.skipped.len(),
                failures = report.failures.len(),
                "inventory pass complete"
            ),
            Err(err) => tracing::error!(error = %err, "inventory pass aborted"),
        }
    }
}

/// Drive the local inventory generator and batch runner.
async fn runner_loop(state: AppState, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(err) = state.run_inventory_cycle().await {
            tracing::error!(error = %err, "inventory delivery failed");
        }
        if let Err(err) = state.run_job_cycle().await {
            tracing::error!(error = %err, "batch runner failed");
        }
    }
}
