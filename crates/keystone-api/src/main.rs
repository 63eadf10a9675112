use keystone_api::setup;
use keystone_core::models::NotificationChannel;
use keystone_core::Config;
use keystone_infra::{shutdown_telemetry, SmtpTransport};
use keystone_services::{LogTransport, NotificationTransport};
use std::sync::Arc;

// Use mimalloc as the global allocator for better performance and lower fragmentation,
// especially when running on musl-based systems inside containers.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let (_state, router, worker_context) = setup::initialize_app(&config).await?;

    let workers = worker_context.spawn(&config, transports(&config));

    let served = setup::server::start_server(&config, router).await;

    workers.shutdown().await;
    shutdown_telemetry().await;

    served
}

/// SMTP for email when configured; the other channels log their payloads.
fn transports(config: &Config) -> Vec<Arc<dyn NotificationTransport>> {
    let email: Arc<dyn NotificationTransport> = match SmtpTransport::from_config(config) {
        Some(smtp) => Arc::new(smtp),
        None => {
            tracing::warn!("SMTP not configured; email notifications are logged only");
            Arc::new(LogTransport::new(NotificationChannel::Email))
        }
    };
    vec![
        email,
        Arc::new(LogTransport::new(NotificationChannel::Sms)),
        Arc::new(LogTransport::new(NotificationChannel::Push)),
    ]
}
