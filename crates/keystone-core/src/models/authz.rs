use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditEnvelope;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserGroup {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserRole {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
    pub active: bool,
    /// Set once default permissions have been written for the role.
    pub seeded: bool,
    pub group_id: Option<Uuid>,
}

impl UserRole {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }
}

/// A product module. Submodules are modules linked through [`SubModuleComposition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Module {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub product: String,
    pub code: String,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SubModuleComposition {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub module_id: Uuid,
    pub submodule_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Entity {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct EntityAttributeComposition {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub entity_id: Uuid,
    pub attribute: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for Action {
    type Err = crate::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Action::View),
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(crate::AppError::InvalidInput(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

/// CRUD grant flags shared by module and submodule permissions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PermissionFlags {
    pub can_create: bool,
    pub can_view: bool,
    pub can_update: bool,
    pub can_delete: bool,
}

impl PermissionFlags {
    pub const VIEW_ONLY: PermissionFlags = PermissionFlags {
        can_create: false,
        can_view: true,
        can_update: false,
        can_delete: false,
    };

    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::View => self.can_view,
            Action::Create => self.can_create,
            Action::Update => self.can_update,
            Action::Delete => self.can_delete,
        }
    }

    pub fn union(self, other: PermissionFlags) -> PermissionFlags {
        PermissionFlags {
            can_create: self.can_create || other.can_create,
            can_view: self.can_view || other.can_view,
            can_update: self.can_update || other.can_update,
            can_delete: self.can_delete || other.can_delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ModulePermission {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub module_id: Uuid,
    pub role_id: Uuid,
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub flags: PermissionFlags,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SubModulePermission {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub composition_id: Uuid,
    pub role_id: Uuid,
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub flags: PermissionFlags,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct EntityAttributePermission {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub composition_id: Uuid,
    pub role_id: Uuid,
    pub has_perm: bool,
}

/// Replacement payload for one module's grants on a role, with nested submodule grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePermissionUpdate {
    pub module_id: Uuid,
    #[serde(flatten)]
    pub flags: PermissionFlags,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub submodule_permissions: Vec<SubModulePermissionUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubModulePermissionUpdate {
    pub composition_id: Uuid,
    #[serde(flatten)]
    pub flags: PermissionFlags,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}
