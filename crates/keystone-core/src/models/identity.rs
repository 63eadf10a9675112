use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditEnvelope;

/// Ordered scope a staff profile is bound at. `Admin` sees everything; `Unit` is the narrowest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "access_level", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Admin,
    Customer,
    Property,
    Location,
    Building,
    Floor,
    Unit,
}

impl AccessLevel {
    /// Levels that are not narrowed by scope nodes.
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, AccessLevel::Admin | AccessLevel::Customer)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "user_status", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Pending,
    Approved,
    Inactive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "user_type", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Staff,
    Resident,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct User {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub email: Option<String>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub access_level: AccessLevel,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub country_code: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub status: UserStatus,
    pub locked: bool,
    pub failed_attempt_count: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub languages: Vec<String>,
}

impl User {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }

    pub fn user_type(&self) -> UserType {
        if self.is_staff {
            UserType::Staff
        } else {
            UserType::Resident
        }
    }
}

/// Fields accepted when creating a user; username is derived when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_staff: bool,
    pub access_level: Option<AccessLevel>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub country_code: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Staff {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub user_id: Uuid,
    pub role_ids: Vec<Uuid>,
    /// Scope nodes at the user's access level.
    pub scope_ids: Vec<Uuid>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "profile_type", rename_all = "SCREAMING_SNAKE_CASE")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileType {
    Tenant,
    CoRenter,
    Guarantor,
    Occupant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Resident {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub user_id: Uuid,
    /// Human-readable resident number shown on statements.
    pub resident_code: String,
    pub profile_type: ProfileType,
    pub role_ids: Vec<Uuid>,
    pub scope_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RegisteredDevice {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub user_id: Uuid,
    pub make: Option<String>,
    pub model: Option<String>,
    pub mac_address: Option<String>,
    pub device_fingerprint: String,
    pub last_seen_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "login_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum LoginStatus {
    Success,
    Failure,
}

/// One row per authentication attempt. Successful rows carry the refresh token id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AccessLog {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub user_id: Uuid,
    pub login_status: LoginStatus,
    pub refresh_jti: Option<String>,
    pub refresh_exp: Option<DateTime<Utc>>,
    pub device_id: Option<Uuid>,
    pub ip: Option<String>,
    pub location: Option<String>,
    pub logged_out_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SecurityQuestion {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub question: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserSecurityQuestion {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub user_id: Uuid,
    pub question_id: Uuid,
    #[serde(skip_serializing)]
    pub answer_hash: String,
}

/// Client device description sent with login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDetail {
    pub make: Option<String>,
    pub model: Option<String>,
    pub mac_address: Option<String>,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationDetail {
    pub ip: Option<String>,
    pub location: Option<String>,
}
