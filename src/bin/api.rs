use fiscal_compliance_orchestrator::{
    agent::create_default_orchestrator, api::start_server, calendar::SystemClock,
    config::OrchestratorConfig,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;

    info!("Fiscal Compliance Orchestrator - API Server");
    info!("Port: {}", config.api_port);
    if config.webhook_url.is_none() {
        info!("MAKE_WEBHOOK_URL not set, approved publications are logged only");
    }

    let orchestrator = Arc::new(create_default_orchestrator(&config, Arc::new(SystemClock)).await?);

    info!("Starting API server...");

    start_server(orchestrator, config.api_port).await?;

    Ok(())
}
