use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditEnvelope;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "policy_status", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyStatus {
    Draft,
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Policy {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
    pub status: PolicyStatus,
    pub policy_type: String,
    pub publishing_date: Option<NaiveDate>,
    pub current_version_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PolicyVersion {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub policy_id: Uuid,
    pub version_number: i32,
    pub content_html: String,
    /// Reference to the rendered PDF, filled in by the renderer.
    pub pdf_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserPolicyAcceptance {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub user_id: Uuid,
    pub policy_version_id: Uuid,
    pub accepted_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyChanges {
    pub name: Option<String>,
    pub status: Option<PolicyStatus>,
    pub policy_type: Option<String>,
    pub publishing_date: Option<NaiveDate>,
    /// New content; creates and points at a new version.
    pub content_html: Option<String>,
}

/// Per-policy acceptance answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptanceStatus {
    pub policy_id: Uuid,
    pub accepted: bool,
    pub accepted_version: Option<i32>,
    pub latest_version: Option<i32>,
}
