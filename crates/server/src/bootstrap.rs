use std::sync::Arc;
use std::time::Duration;

use concierge_agent::providers::build_client;
use concierge_agent::{AgentRuntime, LlmError, RuntimeDependencies, RuntimeSettings, SystemClock};
use concierge_core::config::AppConfig;
use concierge_db::repositories::{
    SqlContextRepository, SqlRateWindowRepository, SqlSessionRepository,
};
use concierge_db::{connect_with_settings, migrations, DbPool, ReportingError, SqliteRelationalStore};
use thiserror::Error;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("reporting store is misconfigured: {0}")]
    Reporting(#[source] ReportingError),
    #[error("completion provider setup failed: {0}")]
    Llm(#[source] LlmError),
}

/// Connects the application store, applies migrations and wires the agent runtime.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let reporting =
        SqliteRelationalStore::new(&config.reporting.url).map_err(BootstrapError::Reporting)?;
    if let Err(error) = reporting.ping().await {
        // Queries open their own connections, so a store that appears later is still picked up.
        warn!(
            event_name = "system.bootstrap.reporting_unreachable",
            correlation_id = "bootstrap",
            error = %error,
            "reporting store is not reachable yet"
        );
    }

    let completions = build_client(&config.llm).map_err(BootstrapError::Llm)?;
    info!(
        event_name = "system.bootstrap.completion_provider",
        correlation_id = "bootstrap",
        provider = ?config.llm.provider,
        model = %config.llm.model,
        "completion provider configured"
    );

    let runtime = AgentRuntime::new(
        RuntimeDependencies {
            sessions: Arc::new(SqlSessionRepository::new(db_pool.clone())),
            rate_windows: Arc::new(SqlRateWindowRepository::new(db_pool.clone())),
            context: Arc::new(SqlContextRepository::new(db_pool.clone())),
            reporting: Arc::new(reporting),
            completions,
            clock: Arc::new(SystemClock),
        },
        RuntimeSettings {
            history_window: config.chat.history_window,
            query_timeout: Duration::from_secs(config.reporting.timeout_secs),
        },
        tracing::info_span!("runtime"),
    );

    Ok(Application { config, db_pool, runtime: Arc::new(runtime) })
}
