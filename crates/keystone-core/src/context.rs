//! Request context
//!
//! Bound once per request by the auth middleware (or once per job by a worker) and passed
//! explicitly to every service call. Audit columns and query scoping read from it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::SYSTEM_ACTOR;
use crate::models::{AccessLevel, UserType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub user_type: UserType,
    pub access_level: AccessLevel,
    pub staff_id: Option<Uuid>,
    pub resident_id: Option<Uuid>,
    /// Scope nodes the caller is bound to at its access level.
    #[serde(default)]
    pub scope_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_superuser: bool,
    pub request_id: Option<String>,
}

impl RequestContext {
    /// Context for background jobs acting on behalf of the platform.
    pub fn system(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id: SYSTEM_ACTOR,
            user_type: UserType::System,
            access_level: AccessLevel::Admin,
            staff_id: None,
            resident_id: None,
            scope_ids: Vec::new(),
            is_superuser: true,
            request_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn is_resident(&self) -> bool {
        self.user_type == UserType::Resident
    }

    pub fn is_system(&self) -> bool {
        self.user_type == UserType::System
    }
}
