//! Tracing initialization
//!
//! One global subscriber per process. `RUST_LOG` overrides the default filter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "keystone=debug,tower_http=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// JSON in production, human-readable text elsewhere.
    pub fn for_environment(environment: &str) -> Self {
        match environment.to_lowercase().as_str() {
            "production" | "prod" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

pub fn init_telemetry(
    service_name: &str,
    format: LogFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?,
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }

    tracing::info!(service = %service_name, format = ?format, "Tracing initialized");
    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::debug!("Telemetry shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_follows_environment() {
        assert_eq!(LogFormat::for_environment("production"), LogFormat::Json);
        assert_eq!(LogFormat::for_environment("PROD"), LogFormat::Json);
        assert_eq!(LogFormat::for_environment("development"), LogFormat::Text);
    }
}
