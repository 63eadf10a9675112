//! Security audit log
//!
//! Structured entries on the `audit` target for sign-in outcomes, lockouts, password
//! changes, role permission changes and refund initiation.

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSuccess,
    LoginFailure,
    UserLocked,
    TokenRefreshed,
    Logout,
    PasswordChanged,
    RoleCreated,
    RolePermissionsChanged,
    RoleDeactivated,
    RefundInitiated,
}

#[derive(Debug, Serialize)]
pub struct AuditLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub tenant_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub success: bool,
}

impl AuditLogEntry {
    pub fn new(event_type: AuditEventType, tenant_id: Uuid) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            tenant_id,
            user_id: None,
            client_ip: None,
            details: None,
            success: true,
        }
    }

    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_client_ip(mut self, client_ip: Option<String>) -> Self {
        self.client_ip = client_ip;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());

        if self.success {
            tracing::event!(
                target: "audit",
                tracing::Level::INFO,
                audit_entry = %json,
                event_type = ?self.event_type,
                tenant_id = %self.tenant_id,
                user_id = ?self.user_id,
                "Security audit log"
            );
        } else {
            tracing::event!(
                target: "audit",
                tracing::Level::WARN,
                audit_entry = %json,
                event_type = ?self.event_type,
                tenant_id = %self.tenant_id,
                user_id = ?self.user_id,
                "Security audit log - failure"
            );
        }
    }
}
