use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "tenant_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

/// Tenant (landlord or property-management organization).
/// Lockout and currency settings here override the process-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub status: TenantStatus,
    pub lockout_limit: i32,
    pub lockout_window_seconds: i64,
    pub default_currency: String,
    /// Home state, used when a bill carries no tax state of its own.
    pub state: Option<String>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl Tenant {
    pub fn lockout_window(&self) -> Duration {
        Duration::seconds(self.lockout_window_seconds)
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}
