//! Configuration module
//!
//! Environment-driven configuration for the API, worker loops and the gateway adapter.
//! Per-tenant overrides (lockout limits, currency) live on the tenant row.

use std::env;

// Common constants
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const ACCESS_TOKEN_TTL_SECONDS: i64 = 900;
const REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 3600;
const RESET_TOKEN_TTL_SECONDS: i64 = 1800;
const OTP_EXPIRY_IN_SECONDS: i64 = 300;
const OTP_RESEND_INTERVAL_SECONDS: i64 = 60;
const DEFAULT_LOCKOUT_LIMIT: i32 = 5;
const DEFAULT_LOCKOUT_WINDOW_SECONDS: i64 = 1800;
const GATEWAY_TIMEOUT_SECONDS: u64 = 30;
const RECONCILE_INTERVAL_SECONDS: u64 = 300;
const RECONCILE_CUTOFF_HOURS: i64 = 48;
const NOTIFICATION_MAX_RETRIES: i32 = 3;
const NOTIFICATION_POLL_INTERVAL_MS: u64 = 1000;
const RECURRENCE_HORIZON_DAYS: i64 = 90;
const HTTP_RATE_LIMIT_PER_MINUTE: u32 = 100;

/// Base configuration shared by the API and the worker
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
    pub http_rate_limit_per_minute: u32,
}

/// Token lifetimes and signing material
#[derive(Clone, Debug)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
    pub otp_expiry_seconds: i64,
    pub otp_resend_interval_seconds: i64,
    pub default_lockout_limit: i32,
    pub default_lockout_window_seconds: i64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_ttl_seconds: ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: REFRESH_TOKEN_TTL_SECONDS,
            reset_token_ttl_seconds: RESET_TOKEN_TTL_SECONDS,
            otp_expiry_seconds: OTP_EXPIRY_IN_SECONDS,
            otp_resend_interval_seconds: OTP_RESEND_INTERVAL_SECONDS,
            default_lockout_limit: DEFAULT_LOCKOUT_LIMIT,
            default_lockout_window_seconds: DEFAULT_LOCKOUT_WINDOW_SECONDS,
        }
    }
}

/// Payment gateway connection settings
#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub merchant_id: Option<String>,
    pub timeout_seconds: u64,
    pub reconcile_interval_seconds: u64,
    pub reconcile_cutoff_hours: i64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            api_key: None,
            merchant_id: None,
            timeout_seconds: GATEWAY_TIMEOUT_SECONDS,
            reconcile_interval_seconds: RECONCILE_INTERVAL_SECONDS,
            reconcile_cutoff_hours: RECONCILE_CUTOFF_HOURS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub base: BaseConfig,
    pub database_url: String,
    pub auth: AuthSettings,
    pub gateway: GatewaySettings,
    pub notification_max_retries: i32,
    pub notification_poll_interval_ms: u64,
    pub recurrence_horizon_days: i64,
    // Email transport
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    pub smtp_tls: bool,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<AppConfig>);

impl Config {
    fn inner(&self) -> &AppConfig {
        &self.0
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.inner().base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = AppConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.inner().validate()
    }

    pub fn server_port(&self) -> u16 {
        self.inner().base.server_port
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.inner().base.cors_origins
    }

    pub fn environment(&self) -> &str {
        &self.inner().base.environment
    }

    pub fn db_max_connections(&self) -> u32 {
        self.inner().base.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.inner().base.db_timeout_seconds
    }

    pub fn http_rate_limit_per_minute(&self) -> u32 {
        self.inner().base.http_rate_limit_per_minute
    }

    pub fn database_url(&self) -> &str {
        &self.inner().database_url
    }

    pub fn auth(&self) -> &AuthSettings {
        &self.inner().auth
    }

    pub fn jwt_secret(&self) -> &str {
        &self.inner().auth.jwt_secret
    }

    pub fn gateway(&self) -> &GatewaySettings {
        &self.inner().gateway
    }

    pub fn notification_max_retries(&self) -> i32 {
        self.inner().notification_max_retries
    }

    pub fn notification_poll_interval_ms(&self) -> u64 {
        self.inner().notification_poll_interval_ms
    }

    pub fn recurrence_horizon_days(&self) -> i64 {
        self.inner().recurrence_horizon_days
    }

    pub fn smtp_host(&self) -> Option<&str> {
        self.inner().smtp_host.as_deref()
    }

    pub fn smtp_port(&self) -> Option<u16> {
        self.inner().smtp_port
    }

    pub fn smtp_user(&self) -> Option<&str> {
        self.inner().smtp_user.as_deref()
    }

    pub fn smtp_password(&self) -> Option<&str> {
        self.inner().smtp_password.as_deref()
    }

    pub fn smtp_from(&self) -> Option<&str> {
        self.inner().smtp_from.as_deref()
    }

    pub fn smtp_tls(&self) -> bool {
        self.inner().smtp_tls
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let cors_origins_str = env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
        let is_production =
            environment.to_lowercase() == "production" || environment.to_lowercase() == "prod";
        if is_production && cors_origins_str.trim() == "*" {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS cannot be '*' in production. Please specify explicit origins."
            ));
        }

        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let base = BaseConfig {
            server_port: env::var("PORT")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?,
            cors_origins,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            environment,
            http_rate_limit_per_minute: env_or(
                "HTTP_RATE_LIMIT_PER_MINUTE",
                HTTP_RATE_LIMIT_PER_MINUTE,
            ),
        };

        let auth = AuthSettings {
            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set for authentication"))?,
            access_token_ttl_seconds: env_or("ACCESS_TOKEN_TTL_SECONDS", ACCESS_TOKEN_TTL_SECONDS),
            refresh_token_ttl_seconds: env_or(
                "REFRESH_TOKEN_TTL_SECONDS",
                REFRESH_TOKEN_TTL_SECONDS,
            ),
            reset_token_ttl_seconds: env_or("RESET_TOKEN_TTL_SECONDS", RESET_TOKEN_TTL_SECONDS),
            otp_expiry_seconds: env_or("OTP_EXPIRY_IN_SECONDS", OTP_EXPIRY_IN_SECONDS),
            otp_resend_interval_seconds: env_or(
                "OTP_RESEND_INTERVAL_SECONDS",
                OTP_RESEND_INTERVAL_SECONDS,
            ),
            default_lockout_limit: env_or("DEFAULT_LOCKOUT_LIMIT", DEFAULT_LOCKOUT_LIMIT),
            default_lockout_window_seconds: env_or(
                "DEFAULT_LOCKOUT_WINDOW_SECONDS",
                DEFAULT_LOCKOUT_WINDOW_SECONDS,
            ),
        };

        let gateway = GatewaySettings {
            base_url: env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| GatewaySettings::default().base_url),
            api_key: env::var("GATEWAY_API_KEY").ok(),
            merchant_id: env::var("GATEWAY_MERCHANT_ID").ok(),
            timeout_seconds: env_or("GATEWAY_TIMEOUT_SECONDS", GATEWAY_TIMEOUT_SECONDS),
            reconcile_interval_seconds: env_or(
                "RECONCILE_INTERVAL_SECONDS",
                RECONCILE_INTERVAL_SECONDS,
            ),
            reconcile_cutoff_hours: env_or("RECONCILE_CUTOFF_HOURS", RECONCILE_CUTOFF_HOURS),
        };

        let config = AppConfig {
            base,
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            auth,
            gateway,
            notification_max_retries: env_or("NOTIFICATION_MAX_RETRIES", NOTIFICATION_MAX_RETRIES),
            notification_poll_interval_ms: env_or(
                "NOTIFICATION_POLL_INTERVAL_MS",
                NOTIFICATION_POLL_INTERVAL_MS,
            ),
            recurrence_horizon_days: env_or("RECURRENCE_HORIZON_DAYS", RECURRENCE_HORIZON_DAYS),
            smtp_host: env::var("SMTP_HOST").ok(),
            smtp_port: env::var("SMTP_PORT").ok().and_then(|s| s.parse().ok()),
            smtp_user: env::var("SMTP_USER").ok(),
            smtp_password: env::var("SMTP_PASSWORD").ok(),
            smtp_from: env::var("SMTP_FROM").ok(),
            smtp_tls: env_or("SMTP_TLS", true),
        };

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.auth.jwt_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "JWT_SECRET must be at least 32 characters long"
            ));
        }
        if self.auth.default_lockout_limit < 1 {
            return Err(anyhow::anyhow!("DEFAULT_LOCKOUT_LIMIT must be at least 1"));
        }
        if self.auth.otp_expiry_seconds <= 0 {
            return Err(anyhow::anyhow!("OTP_EXPIRY_IN_SECONDS must be positive"));
        }
        if self.recurrence_horizon_days <= 0 {
            return Err(anyhow::anyhow!("RECURRENCE_HORIZON_DAYS must be positive"));
        }
        if self.gateway.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("GATEWAY_TIMEOUT_SECONDS must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            base: BaseConfig {
                server_port: 4000,
                cors_origins: vec!["*".to_string()],
                db_max_connections: 5,
                db_timeout_seconds: 5,
                environment: "development".to_string(),
                http_rate_limit_per_minute: 100,
            },
            database_url: "postgresql://localhost/keystone".to_string(),
            auth: AuthSettings {
                jwt_secret: "test-secret-key-min-32-characters-long".to_string(),
                ..AuthSettings::default()
            },
            gateway: GatewaySettings::default(),
            notification_max_retries: 3,
            notification_poll_interval_ms: 1000,
            recurrence_horizon_days: 90,
            smtp_host: None,
            smtp_port: None,
            smtp_user: None,
            smtp_password: None,
            smtp_from: None,
            smtp_tls: true,
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_secret() {
        let mut config = sample();
        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_lockout_limit() {
        let mut config = sample();
        config.auth.default_lockout_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_detection_is_case_insensitive() {
        let mut config = sample();
        config.base.environment = "PROD".to_string();
        assert!(Config(Box::new(config)).is_production());
    }
}
