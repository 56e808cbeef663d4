// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use deadswitch_server::api::router;
use deadswitch_server::config::{init_logging, AppConfig};
use deadswitch_server::crypto::{generate_key, CryptoService, KeyResolver};
use deadswitch_server::delivery::{DeliveryPipeline, SmtpMailer, WebhookSender};
use deadswitch_server::scheduler::TriggerScheduler;
use deadswitch_server::service::SwitchService;
use deadswitch_server::state::AppState;
use deadswitch_server::storage::{AttachmentStore, RedbStore, SwitchStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] deadswitch_server::config::ConfigError),

    #[error(transparent)]
    Key(#[from] deadswitch_server::crypto::KeyError),

    #[error(transparent)]
    Store(#[from] deadswitch_server::storage::StoreError),

    #[error(transparent)]
    Attachments(#[from] deadswitch_server::storage::AttachmentError),

    #[error(transparent)]
    Service(#[from] deadswitch_server::service::ServiceError),

    #[error(transparent)]
    Webhook(#[from] deadswitch_server::delivery::WebhookError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    if std::env::args().skip(1).any(|arg| arg == "--generate-key") {
        println!("{}", generate_key());
        return;
    }

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_logging(config.log_format);

    if let Err(e) = run(config).await {
        error!(error = %e, "Fatal startup error");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), StartupError> {
    info!("Starting Deadswitch server v{}", env!("CARGO_PKG_VERSION"));

    // Key resolution failure is fatal
    let resolver = KeyResolver::new(config.key_sources.clone());
    let key = resolver.resolve()?;
    info!(source = %key.source(), "Encryption key loaded");
    let crypto = Arc::new(CryptoService::new(key));

    let store: Arc<dyn SwitchStore> = Arc::new(RedbStore::open(&config.paths.database_file())?);
    info!(path = %config.paths.database_file().display(), "Switch store opened");

    let attachments = Arc::new(AttachmentStore::new(
        config.paths.clone(),
        crypto.clone(),
        store.clone(),
    ));
    attachments.initialize()?;

    let service = Arc::new(SwitchService::new(
        store.clone(),
        crypto.clone(),
        attachments.clone(),
        config.webhook_allow_list.clone(),
    ));
    service.ensure_heartbeat_token()?;
    if service.smtp_config()?.is_none() {
        info!("SMTP not configured, emails will be simulated");
    }

    let pipeline = Arc::new(DeliveryPipeline::new(
        store.clone(),
        crypto.clone(),
        attachments,
        Arc::new(SmtpMailer::new()),
        WebhookSender::new()?,
    ));

    let shutdown = CancellationToken::new();
    let scheduler = TriggerScheduler::new(store, crypto, pipeline, config.public_base_url.clone())
        .with_interval(config.scheduler_interval);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let app = router(AppState::new(service));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Deadswitch server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received Ctrl+C, shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task ended abnormally");
    }
    info!("Shutdown complete");
    Ok(())
}
