use std::collections::HashSet;

use uuid::Uuid;

use crate::context::RequestContext;
use crate::models::{
    Action, AuditEnvelope, EntityAttributeComposition, EntityAttributePermission, Module,
    ModulePermission, PermissionFlags, SubModuleComposition, SubModulePermission, UserRole,
};

/// Outcome of a permission check. Missing data yields `allowed = false`, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub effective: PermissionFlags,
}

/// Rows that grant CRUD flags to one role.
pub trait RoleGrant {
    fn role_id(&self) -> Uuid;
    fn is_active(&self) -> bool;
    fn flags(&self) -> PermissionFlags;
}

impl RoleGrant for ModulePermission {
    fn role_id(&self) -> Uuid {
        self.role_id
    }
    fn is_active(&self) -> bool {
        self.active && !self.audit.is_deleted()
    }
    fn flags(&self) -> PermissionFlags {
        self.flags
    }
}

impl RoleGrant for SubModulePermission {
    fn role_id(&self) -> Uuid {
        self.role_id
    }
    fn is_active(&self) -> bool {
        self.active && !self.audit.is_deleted()
    }
    fn flags(&self) -> PermissionFlags {
        self.flags
    }
}

/// Roles bound to a profile that are currently active.
pub fn active_role_ids(bound_role_ids: &[Uuid], roles: &[UserRole]) -> HashSet<Uuid> {
    roles
        .iter()
        .filter(|r| r.active && !r.audit.is_deleted() && bound_role_ids.contains(&r.id()))
        .map(|r| r.id())
        .collect()
}

/// OR of the grants held by any active role. `grants` must already be narrowed to the
/// module (or submodule) under test.
pub fn resolve<G: RoleGrant>(active_roles: &HashSet<Uuid>, grants: &[G], action: Action) -> Decision {
    let effective = grants
        .iter()
        .filter(|g| g.is_active() && active_roles.contains(&g.role_id()))
        .fold(PermissionFlags::default(), |acc, g| acc.union(g.flags()));
    Decision {
        allowed: effective.allows(action),
        effective,
    }
}

/// Field-level visibility: true when any active role has the attribute.
pub fn resolve_attribute(active_roles: &HashSet<Uuid>, grants: &[EntityAttributePermission]) -> bool {
    grants
        .iter()
        .filter(|g| !g.audit.is_deleted())
        .any(|g| g.has_perm && active_roles.contains(&g.role_id))
}

/// Full grant set of one role.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RolePermissionSet {
    pub modules: Vec<ModulePermission>,
    pub submodules: Vec<SubModulePermission>,
    pub attributes: Vec<EntityAttributePermission>,
}

/// View-only defaults for every module, submodule and entity attribute.
pub fn seed_role_permissions(
    ctx: &RequestContext,
    role_id: Uuid,
    modules: &[Module],
    submodules: &[SubModuleComposition],
    attributes: &[EntityAttributeComposition],
) -> RolePermissionSet {
    RolePermissionSet {
        modules: modules
            .iter()
            .map(|m| ModulePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                module_id: m.audit.id,
                role_id,
                flags: PermissionFlags::VIEW_ONLY,
                active: true,
            })
            .collect(),
        submodules: submodules
            .iter()
            .map(|c| SubModulePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                composition_id: c.audit.id,
                role_id,
                flags: PermissionFlags::VIEW_ONLY,
                active: true,
            })
            .collect(),
        attributes: attributes
            .iter()
            .map(|a| EntityAttributePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                composition_id: a.audit.id,
                role_id,
                has_perm: true,
            })
            .collect(),
    }
}

/// Duplicate a reference role's grants under `role_id` with fresh identifiers.
pub fn copy_role_permissions(
    ctx: &RequestContext,
    role_id: Uuid,
    reference: &RolePermissionSet,
) -> RolePermissionSet {
    RolePermissionSet {
        modules: reference
            .modules
            .iter()
            .map(|p| ModulePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                role_id,
                ..p.clone()
            })
            .collect(),
        submodules: reference
            .submodules
            .iter()
            .map(|p| SubModulePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                role_id,
                ..p.clone()
            })
            .collect(),
        attributes: reference
            .attributes
            .iter()
            .map(|p| EntityAttributePermission {
                audit: AuditEnvelope::stamp_create(ctx),
                role_id,
                ..p.clone()
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::system(Uuid::new_v4())
    }

    fn grant(ctx: &RequestContext, role_id: Uuid, flags: PermissionFlags, active: bool) -> ModulePermission {
        ModulePermission {
            audit: AuditEnvelope::stamp_create(ctx),
            module_id: Uuid::new_v4(),
            role_id,
            flags,
            active,
        }
    }

    fn role(ctx: &RequestContext, active: bool) -> UserRole {
        UserRole {
            audit: AuditEnvelope::stamp_create(ctx),
            name: "role".to_string(),
            active,
            seeded: true,
            group_id: None,
        }
    }

    #[test]
    fn no_rows_denies() {
        let roles = HashSet::from([Uuid::new_v4()]);
        let grants: Vec<ModulePermission> = Vec::new();
        let decision = resolve(&roles, &grants, Action::View);
        assert!(!decision.allowed);
    }

    #[test]
    fn or_across_roles() {
        let ctx = ctx();
        let viewer = Uuid::new_v4();
        let editor = Uuid::new_v4();
        let grants = vec![
            grant(&ctx, viewer, PermissionFlags::VIEW_ONLY, true),
            grant(
                &ctx,
                editor,
                PermissionFlags {
                    can_update: true,
                    ..PermissionFlags::default()
                },
                true,
            ),
        ];
        let roles = HashSet::from([viewer, editor]);

        let decision = resolve(&roles, &grants, Action::Update);
        assert!(decision.allowed);
        assert!(decision.effective.can_view);
        assert!(!resolve(&roles, &grants, Action::Delete).allowed);
    }

    #[test]
    fn inactive_grant_is_ignored() {
        let ctx = ctx();
        let role_id = Uuid::new_v4();
        let grants = vec![grant(&ctx, role_id, PermissionFlags::VIEW_ONLY, false)];
        assert!(!resolve(&HashSet::from([role_id]), &grants, Action::View).allowed);
    }

    #[test]
    fn inactive_role_is_not_gathered() {
        let ctx = ctx();
        let live = role(&ctx, true);
        let dead = role(&ctx, false);
        let ids = active_role_ids(&[live.id(), dead.id()], &[live.clone(), dead]);
        assert_eq!(ids, HashSet::from([live.id()]));
    }

    #[test]
    fn adding_a_role_never_reduces_access() {
        let ctx = ctx();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let grants = vec![
            grant(
                &ctx,
                a,
                PermissionFlags {
                    can_create: true,
                    can_view: true,
                    ..PermissionFlags::default()
                },
                true,
            ),
            grant(&ctx, b, PermissionFlags::default(), true),
        ];
        for action in [Action::View, Action::Create, Action::Update, Action::Delete] {
            let before = resolve(&HashSet::from([a]), &grants, action).allowed;
            let after = resolve(&HashSet::from([a, b]), &grants, action).allowed;
            assert!(!before || after, "{:?} lost after adding a role", action);
        }
    }

    #[test]
    fn seed_grants_view_only() {
        let ctx = ctx();
        let module = Module {
            audit: AuditEnvelope::stamp_create(&ctx),
            product: "pm".to_string(),
            code: "billing".to_string(),
            name: "Billing".to_string(),
            active: true,
        };
        let role_id = Uuid::new_v4();
        let set = seed_role_permissions(&ctx, role_id, &[module], &[], &[]);
        assert_eq!(set.modules.len(), 1);
        assert_eq!(set.modules[0].flags, PermissionFlags::VIEW_ONLY);
        assert!(set.modules[0].active);
    }

    #[test]
    fn copy_resets_identifiers() {
        let ctx = ctx();
        let reference_role = Uuid::new_v4();
        let reference = RolePermissionSet {
            modules: vec![grant(&ctx, reference_role, PermissionFlags::VIEW_ONLY, true)],
            ..RolePermissionSet::default()
        };
        let new_role = Uuid::new_v4();
        let copy = copy_role_permissions(&ctx, new_role, &reference);
        assert_eq!(copy.modules[0].role_id, new_role);
        assert_ne!(copy.modules[0].audit.id, reference.modules[0].audit.id);
        assert_eq!(copy.modules[0].module_id, reference.modules[0].module_id);
    }
}
