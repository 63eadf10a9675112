//! Role-based authorization
//!
//! Resolution gathers the caller's bound roles from its staff (or resident) profile, keeps
//! the active ones and ORs their grants. Missing data resolves to a denial.

use std::collections::HashSet;
use std::sync::Arc;

use keystone_core::access::{
    active_role_ids, copy_role_permissions, resolve, resolve_attribute, seed_role_permissions,
    Decision, RolePermissionSet,
};
use keystone_core::models::{
    Action, AuditEnvelope, ModulePermission, ModulePermissionUpdate, PermissionFlags,
    SubModulePermission, UserRole, UserType,
};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::{AuthzStore, IdentityStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLogEntry};

const FULL_ACCESS: PermissionFlags = PermissionFlags {
    can_create: true,
    can_view: true,
    can_update: true,
    can_delete: true,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub group_id: Option<Uuid>,
    /// Copy every grant of this role instead of seeding view-only defaults.
    pub reference_role_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct AuthzService {
    authz: Arc<dyn AuthzStore>,
    identity: Arc<dyn IdentityStore>,
}

impl AuthzService {
    pub fn new(authz: Arc<dyn AuthzStore>, identity: Arc<dyn IdentityStore>) -> Self {
        Self { authz, identity }
    }

    fn bypasses(ctx: &RequestContext) -> bool {
        ctx.is_system() || ctx.is_superuser
    }

    async fn active_roles(&self, ctx: &RequestContext) -> AppResult<HashSet<Uuid>> {
        let bound = match ctx.user_type {
            UserType::Staff => self
                .identity
                .get_staff_by_user(ctx.tenant_id, ctx.user_id)
                .await?
                .filter(|s| s.active)
                .map(|s| s.role_ids),
            UserType::Resident => self
                .identity
                .get_resident_by_user(ctx.tenant_id, ctx.user_id)
                .await?
                .map(|r| r.role_ids),
            UserType::System => None,
        }
        .unwrap_or_default();
        if bound.is_empty() {
            return Ok(HashSet::new());
        }
        let roles = self.authz.list_roles(ctx.tenant_id).await?;
        Ok(active_role_ids(&bound, &roles))
    }

    /// Module-level decision for the caller.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, user_id = %ctx.user_id))]
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        module_code: &str,
        action: Action,
    ) -> AppResult<Decision> {
        if Self::bypasses(ctx) {
            return Ok(Decision {
                allowed: true,
                effective: FULL_ACCESS,
            });
        }
        let Some(module) = self.authz.find_module(ctx.tenant_id, module_code).await? else {
            return Ok(denied());
        };
        let roles = self.active_roles(ctx).await?;
        if roles.is_empty() {
            return Ok(denied());
        }
        let role_ids: Vec<Uuid> = roles.iter().copied().collect();
        let grants = self
            .authz
            .module_permissions(ctx.tenant_id, module.audit.id, &role_ids)
            .await?;
        Ok(resolve(&roles, &grants, action))
    }

    pub async fn resolve_submodule(
        &self,
        ctx: &RequestContext,
        module_code: &str,
        submodule_code: &str,
        action: Action,
    ) -> AppResult<Decision> {
        if Self::bypasses(ctx) {
            return Ok(Decision {
                allowed: true,
                effective: FULL_ACCESS,
            });
        }
        let (Some(module), Some(submodule)) = (
            self.authz.find_module(ctx.tenant_id, module_code).await?,
            self.authz.find_module(ctx.tenant_id, submodule_code).await?,
        ) else {
            return Ok(denied());
        };
        let Some(composition) = self
            .authz
            .find_submodule_composition(ctx.tenant_id, module.audit.id, submodule.audit.id)
            .await?
        else {
            return Ok(denied());
        };
        let roles = self.active_roles(ctx).await?;
        let role_ids: Vec<Uuid> = roles.iter().copied().collect();
        let grants = self
            .authz
            .submodule_permissions(ctx.tenant_id, composition.audit.id, &role_ids)
            .await?;
        Ok(resolve(&roles, &grants, action))
    }

    /// Field-level visibility of `entity.attribute` for the caller.
    pub async fn resolve_attribute(
        &self,
        ctx: &RequestContext,
        entity: &str,
        attribute: &str,
    ) -> AppResult<bool> {
        if Self::bypasses(ctx) {
            return Ok(true);
        }
        let Some(composition) = self
            .authz
            .find_attribute_composition(ctx.tenant_id, entity, attribute)
            .await?
        else {
            return Ok(false);
        };
        let roles = self.active_roles(ctx).await?;
        let role_ids: Vec<Uuid> = roles.iter().copied().collect();
        let grants = self
            .authz
            .attribute_permissions(ctx.tenant_id, composition.audit.id, &role_ids)
            .await?;
        Ok(resolve_attribute(&roles, &grants))
    }

    /// Strip from a serialized `entity` record every attribute that is under field-level
    /// control and not granted to the caller. Returns the removed attribute names.
    ///
    /// Attributes with no composition registered are not controlled and stay visible.
    pub async fn redact(
        &self,
        ctx: &RequestContext,
        entity: &str,
        record: &mut serde_json::Value,
    ) -> AppResult<Vec<String>> {
        if Self::bypasses(ctx) {
            return Ok(Vec::new());
        }
        let Some(fields) = record.as_object_mut() else {
            return Ok(Vec::new());
        };

        let mut roles: Option<(HashSet<Uuid>, Vec<Uuid>)> = None;
        let mut hidden = Vec::new();
        let attributes: Vec<String> = fields.keys().cloned().collect();
        for attribute in attributes {
            let Some(composition) = self
                .authz
                .find_attribute_composition(ctx.tenant_id, entity, &attribute)
                .await?
            else {
                continue;
            };
            if roles.is_none() {
                let active = self.active_roles(ctx).await?;
                let ids = active.iter().copied().collect();
                roles = Some((active, ids));
            }
            let Some((active, ids)) = roles.as_ref() else {
                continue;
            };
            let grants = self
                .authz
                .attribute_permissions(ctx.tenant_id, composition.audit.id, ids)
                .await?;
            if !resolve_attribute(active, &grants) {
                fields.remove(&attribute);
                hidden.push(attribute);
            }
        }

        if !hidden.is_empty() {
            tracing::debug!(entity, hidden = ?hidden, "Attributes redacted");
        }
        Ok(hidden)
    }

    /// Fail with `permission_denied` unless the caller may perform `action` on the module.
    pub async fn require(
        &self,
        ctx: &RequestContext,
        module_code: &str,
        action: Action,
    ) -> AppResult<()> {
        let decision = self.resolve(ctx, module_code, action).await?;
        if decision.allowed {
            Ok(())
        } else {
            tracing::debug!(module = module_code, action = ?action, "Permission denied");
            Err(AppError::PermissionDenied(format!(
                "{:?} on {} is not allowed",
                action, module_code
            )))
        }
    }

    pub async fn list_roles(&self, ctx: &RequestContext) -> AppResult<Vec<UserRole>> {
        self.authz.list_roles(ctx.tenant_id).await
    }

    pub async fn role_permissions(
        &self,
        ctx: &RequestContext,
        role_id: Uuid,
    ) -> AppResult<RolePermissionSet> {
        self.role(ctx, role_id).await?;
        self.authz.role_permissions(ctx.tenant_id, role_id).await
    }

    async fn role(&self, ctx: &RequestContext, role_id: Uuid) -> AppResult<UserRole> {
        self.authz
            .get_role(ctx.tenant_id, role_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("role {}", role_id)))
    }

    /// Create a role and write its first grant set: a copy of the reference role when one
    /// is named, view-only defaults otherwise.
    #[tracing::instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id))]
    pub async fn create_role(&self, ctx: &RequestContext, input: &NewRole) -> AppResult<UserRole> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(AppError::MissingRequiredParam("name".to_string()));
        }
        let role = UserRole {
            audit: AuditEnvelope::stamp_create(ctx),
            name: name.to_string(),
            active: true,
            seeded: true,
            group_id: input.group_id,
        };

        let grants = match input.reference_role_id {
            Some(reference_id) => {
                self.role(ctx, reference_id).await?;
                let reference = self.authz.role_permissions(ctx.tenant_id, reference_id).await?;
                copy_role_permissions(ctx, role.id(), &reference)
            }
            None => {
                let modules = self.authz.list_modules(ctx.tenant_id).await?;
                let submodules = self.authz.list_submodule_compositions(ctx.tenant_id).await?;
                let attributes = self.authz.list_attribute_compositions(ctx.tenant_id).await?;
                seed_role_permissions(ctx, role.id(), &modules, &submodules, &attributes)
            }
        };

        let created = self.authz.create_role(&role, &grants).await?;
        AuditLogEntry::new(AuditEventType::RoleCreated, ctx.tenant_id)
            .with_user_id(ctx.user_id)
            .with_details(serde_json::json!({
                "role_id": created.id(),
                "copied_from": input.reference_role_id,
                "module_grants": grants.modules.len(),
            }))
            .log();
        Ok(created)
    }

    /// Replace module grants (and their nested submodule grants) of a role.
    #[tracing::instrument(skip(self, ctx, updates), fields(tenant_id = %ctx.tenant_id, role_id = %role_id))]
    pub async fn update_role_permissions(
        &self,
        ctx: &RequestContext,
        role_id: Uuid,
        updates: &[ModulePermissionUpdate],
    ) -> AppResult<RolePermissionSet> {
        self.role(ctx, role_id).await?;

        let modules: Vec<ModulePermission> = updates
            .iter()
            .map(|u| ModulePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                module_id: u.module_id,
                role_id,
                flags: u.flags,
                active: u.active,
            })
            .collect();
        let submodules: Vec<SubModulePermission> = updates
            .iter()
            .flat_map(|u| u.submodule_permissions.iter())
            .map(|s| SubModulePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                composition_id: s.composition_id,
                role_id,
                flags: s.flags,
                active: s.active,
            })
            .collect();

        self.authz
            .replace_role_permissions(ctx.tenant_id, role_id, &modules, &submodules)
            .await?;
        AuditLogEntry::new(AuditEventType::RolePermissionsChanged, ctx.tenant_id)
            .with_user_id(ctx.user_id)
            .with_details(serde_json::json!({
                "role_id": role_id,
                "modules": modules.len(),
                "submodules": submodules.len(),
            }))
            .log();
        self.authz.role_permissions(ctx.tenant_id, role_id).await
    }

    /// Deactivate a role that no active staff member holds.
    pub async fn deactivate_role(&self, ctx: &RequestContext, role_id: Uuid) -> AppResult<UserRole> {
        self.role(ctx, role_id).await?;
        let holders = self
            .identity
            .count_active_staff_with_role(ctx.tenant_id, role_id)
            .await?;
        if holders > 0 {
            return Err(AppError::InvalidStatus(format!(
                "role is assigned to {} active staff",
                holders
            )));
        }
        let role = self
            .authz
            .set_role_active(ctx.tenant_id, role_id, false, ctx.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("role {}", role_id)))?;
        AuditLogEntry::new(AuditEventType::RoleDeactivated, ctx.tenant_id)
            .with_user_id(ctx.user_id)
            .with_details(serde_json::json!({ "role_id": role_id }))
            .log();
        Ok(role)
    }
}

fn denied() -> Decision {
    Decision {
        allowed: false,
        effective: PermissionFlags::default(),
    }
}
