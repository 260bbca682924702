pub mod background_job;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod validation;

use std::sync::Arc;

use config::AppConfig;
use db::DbPool;
use engine::crypto::StateCodec;
use engine::effects::{LogEffects, RotationEffects, WebhookEffects};
use engine::provider::{FunctionExecutor, SqlxClient};
use engine::store::{SqliteSecretStore, SqliteWorkspaceKeys};
use engine::template::TemplateRegistry;
use engine::{RotationEngine, RotationService, TokioScheduler};
use error::AppError;

/// Everything a running service holds on to.
pub struct AppState {
    pub db: DbPool,
    pub engine: Arc<RotationEngine>,
    pub scheduler: Arc<TokioScheduler>,
    pub service: Arc<RotationService>,
}

/// Wire the collaborators together. Must be called inside a tokio runtime.
pub fn build_state(config: &AppConfig) -> Result<AppState, AppError> {
    let pool = db::init_db(&config.data_dir)?;
    let codec = Arc::new(StateCodec::new(
        config.root_encryption_key.as_deref(),
        config.legacy_encryption_key.as_deref(),
    )?);
    tracing::info!(scheme = codec.preferred().as_str(), "Rotation state codec ready");

    let templates = TemplateRegistry::builtin();
    tracing::info!(templates = ?templates.names(), "Rotation templates loaded");

    let secrets = Arc::new(SqliteSecretStore::new(pool.clone()));
    let keys = Arc::new(SqliteWorkspaceKeys::new(pool.clone(), codec.clone()));
    let effects: Arc<dyn RotationEffects> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookEffects::new(
            url.clone(),
            config.webhook_secret.clone(),
            config.http_timeout,
        )?),
        None => Arc::new(LogEffects),
    };
    let executor = FunctionExecutor::new(
        config.http_timeout,
        Arc::new(SqlxClient::new(config.db_connect_timeout)),
    )?;

    let engine = Arc::new(RotationEngine::new(
        pool.clone(),
        codec.clone(),
        templates.clone(),
        secrets.clone(),
        keys,
        effects,
        executor,
    ));
    let scheduler = Arc::new(TokioScheduler::new(engine.clone())?);
    let service = Arc::new(RotationService::new(
        pool.clone(),
        codec,
        templates,
        secrets,
        scheduler.clone(),
        config.interval_unit,
    ));

    Ok(AppState {
        db: pool,
        engine,
        scheduler,
        service,
    })
}

/// Run the rotation daemon until ctrl-c.
pub fn run() -> Result<(), AppError> {
    logging::init();

    tracing::info!("Starting secret-rotator v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rotation-worker")
        .build()?;

    runtime.block_on(async move {
        let state = build_state(&config)?;
        let restored = state.service.restore_schedules()?;
        tracing::info!(
            policies = restored,
            interval_unit = ?config.interval_unit,
            "Rotation scheduler running"
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown requested");
        state.scheduler.shutdown();
        Ok::<(), AppError>(())
    })
}
