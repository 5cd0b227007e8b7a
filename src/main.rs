use std::sync::Arc;

use huddle::classifier::{HttpClassifier, IntentClassifier};
use huddle::config::AppConfig;
use huddle::engine::Engine;
use huddle::processor::MessageProcessor;
use huddle::scheduler::Scheduler;
use huddle::server;
use huddle::store::{Database, LibSqlBackend};
use huddle::transport::{NoopTransport, SmsTransport, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.db_path)).await?,
    );
    tracing::info!(path = %config.db_path, "Database ready");

    let classifier: Arc<dyn IntentClassifier> =
        Arc::new(HttpClassifier::new(config.classifier.clone()));

    let transport: Arc<dyn Transport> = match config.transport.clone() {
        Some(t) => Arc::new(SmsTransport::new(t)),
        None => {
            tracing::warn!("No SMS provider configured, sends are log-only");
            Arc::new(NoopTransport)
        }
    };

    let scheduler = Scheduler::new(db.clone(), transport.clone(), config.scheduler.clone());
    tokio::spawn(async move {
        if let Err(e) = scheduler.run_forever().await {
            tracing::error!(error = %e, "Scheduler stopped");
        }
    });

    let engine = Engine::new(db.clone(), config.scheduler.clone());
    let processor = Arc::new(MessageProcessor::new(db, classifier, engine, transport));
    let app = server::routes(processor);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.bind_port)).await?;
    tracing::info!(port = config.bind_port, "Inbound webhook server started");
    axum::serve(listener, app).await?;
    Ok(())
}
