use std::sync::Arc;
use std::time::Duration;

use concierge_agent::portal::InMemoryPortal;
use concierge_agent::AgentRuntime;
use concierge_core::config::{AppConfig, ConfigError, LoadOptions};
use concierge_core::ApplicationError;
use thiserror::Error;
use tracing::info;

use crate::audit_log::TracingAuditSink;
use crate::identity::InMemoryUserDirectory;
use crate::ingress::{IngressRunner, NoopChatTransport};

pub struct Application {
    pub config: AppConfig,
    pub runtime: Arc<AgentRuntime>,
    pub ingress: IngressRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("agent runtime assembly failed: {0}")]
    Runtime(#[from] ApplicationError),
}

pub fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config)
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        provider = ?config.llm.provider,
        model = %config.llm.model,
        "starting application bootstrap"
    );

    let portal = Arc::new(InMemoryPortal::seeded());
    let runtime = Arc::new(AgentRuntime::from_config(&config, portal, Arc::new(TracingAuditSink))?);
    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        handlers = runtime.router().handler_count(),
        tools = runtime.tools().len(),
        "agent runtime assembled"
    );

    let purged = runtime.purge_on_startup(config.assistant.dev_reset_on_startup);
    if config.assistant.dev_reset_on_startup {
        info!(
            event_name = "system.bootstrap.dev_reset",
            correlation_id = "bootstrap",
            purged,
            "development reset applied"
        );
    }

    let ingress = IngressRunner::new(
        Arc::new(NoopChatTransport),
        runtime.clone(),
        Arc::new(InMemoryUserDirectory::default()),
        config.server.max_concurrent_events,
    )
    .with_shutdown_grace(Duration::from_secs(config.server.graceful_shutdown_secs));

    Ok(Application { config, runtime, ingress })
}
