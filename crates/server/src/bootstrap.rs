//! Process composition: configuration, database, and the service graph the
//! HTTP surface and the worker pool share. Everything here fails fast; a
//! partially wired process never reaches serving.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use winback_agent::{
    AbandonmentIntake, DeliveryService, HttpInterpreter, InboundPipeline, Interpreter,
    OptOutDetector, PaymentReconciliation, ResilientInterpreter,
};
use winback_channel::template::{TemplateEngine, TemplateError};
use winback_channel::transport::HttpChannelTransport;
use winback_core::compliance::ComplianceGate;
use winback_core::config::{AppConfig, ConfigError, LoadOptions};
use winback_core::queue::{QueueEngine, QueueEngineConfig};
use winback_db::repositories::{
    AbandonmentRepository, ConversationRepository, MessageRepository, QueueRepository,
    SqlAbandonmentRepository, SqlConversationRepository, SqlMessageRepository, SqlQueueRepository,
    SqlUserRepository, UserRepository,
};
use winback_db::{connect_with_settings, migrations, DbPool};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub queue_engine: QueueEngine,
    pub intake: Arc<AbandonmentIntake>,
    pub reconciliation: Arc<PaymentReconciliation>,
    pub pipeline: Arc<InboundPipeline>,
    pub delivery: Arc<DeliveryService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("template engine initialization failed: {0}")]
    Template(#[from] TemplateError),
    #[error("http client initialization failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Variant of [`bootstrap`] for a configuration the caller already loaded,
/// typically to initialize logging first.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let users: Arc<dyn UserRepository> = Arc::new(SqlUserRepository::new(db_pool.clone()));
    let abandonments: Arc<dyn AbandonmentRepository> =
        Arc::new(SqlAbandonmentRepository::new(db_pool.clone()));
    let conversations: Arc<dyn ConversationRepository> =
        Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let messages: Arc<dyn MessageRepository> =
        Arc::new(SqlMessageRepository::new(db_pool.clone()));
    let queue: Arc<dyn QueueRepository> = Arc::new(SqlQueueRepository::new(db_pool.clone()));

    let templates = Arc::new(TemplateEngine::new()?);
    let transport = Arc::new(
        HttpChannelTransport::from_config(&config.channel).map_err(BootstrapError::HttpClient)?,
    );
    let queue_engine = QueueEngine::with_config(QueueEngineConfig::from(&config.queue));

    let delivery = Arc::new(DeliveryService::new(
        transport,
        templates.clone(),
        messages.clone(),
        conversations.clone(),
        queue.clone(),
        queue_engine.clone(),
        config.channel.clone(),
    ));

    let interpreter: Arc<dyn Interpreter> = Arc::new(ResilientInterpreter::from_config(
        HttpInterpreter::from_config(&config.llm).map_err(BootstrapError::HttpClient)?,
        &config.llm,
    ));

    let pipeline = Arc::new(InboundPipeline::new(
        users.clone(),
        abandonments.clone(),
        conversations.clone(),
        messages.clone(),
        interpreter.clone(),
        OptOutDetector::new(interpreter),
        delivery.clone(),
        config.llm.history_limit,
    ));

    let gate = ComplianceGate::new(config.engagement.window_hours, config.engagement.max_cycles);
    let intake = Arc::new(AbandonmentIntake::new(
        users,
        abandonments.clone(),
        conversations.clone(),
        messages.clone(),
        delivery.clone(),
        templates,
        gate,
    ));
    let reconciliation = Arc::new(PaymentReconciliation::new(abandonments, conversations.clone()));

    info!(event_name = "system.bootstrap.services_wired", "service graph assembled");
    Ok(Application {
        config,
        db_pool,
        conversations,
        messages,
        queue,
        queue_engine,
        intake,
        reconciliation,
        pipeline,
        delivery,
    })
}
