use chrono::Utc;
use keystone_core::models::{
    Action, AuditEnvelope, Entity, EntityAttributeComposition, EntityAttributePermission, Module,
    ModulePermissionUpdate, PermissionFlags, SubModuleComposition, SubModulePermission, UserRole,
};
use keystone_core::{AppError, RequestContext};
use keystone_services::test_helpers::*;
use keystone_services::NewRole;
use serde_json::json;
use uuid::Uuid;

struct Seeded {
    services: TestServices,
    admin: RequestContext,
    member: RequestContext,
    member_user_id: Uuid,
    billing_module_id: Uuid,
}

fn module(tenant_id: Uuid, code: &str) -> Module {
    Module {
        audit: AuditEnvelope::stamp_create_at(&RequestContext::system(tenant_id), Utc::now()),
        product: "property".to_string(),
        code: code.to_string(),
        name: code.to_uppercase(),
        active: true,
    }
}

fn seed() -> Seeded {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let admin_user = create_test_user(tenant.id, "owner@harborview.test", true);
    let member_user = create_test_user(tenant.id, "frank@harborview.test", true);
    let billing = module(tenant.id, "billing");
    let amenities = module(tenant.id, "amenities");

    let admin = staff_context(tenant.id, admin_user.audit.id);
    let member = staff_context(tenant.id, member_user.audit.id);
    let member_user_id = member_user.audit.id;
    let billing_module_id = billing.audit.id;
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(admin_user.audit.id, admin_user);
        s.users.insert(member_user.audit.id, member_user);
        s.modules.push(billing);
        s.modules.push(amenities);
    });
    Seeded {
        services,
        admin,
        member,
        member_user_id,
        billing_module_id,
    }
}

fn assign(seeded: &Seeded, role_ids: Vec<Uuid>) {
    let staff = create_test_staff(seeded.member.tenant_id, seeded.member_user_id, role_ids);
    seeded.services.store.with_state(|s| {
        s.staff.retain(|_, existing| existing.user_id != seeded.member_user_id);
        s.staff.insert(staff.audit.id, staff);
    });
}

fn system_envelope(tenant_id: Uuid) -> AuditEnvelope {
    AuditEnvelope::stamp_create_at(&RequestContext::system(tenant_id), Utc::now())
}

/// Store a role directly, bypassing default grant seeding.
fn bare_role(seeded: &Seeded, name: &str, active: bool) -> Uuid {
    let role = UserRole {
        audit: system_envelope(seeded.member.tenant_id),
        name: name.to_string(),
        active,
        seeded: true,
        group_id: None,
    };
    let id = role.audit.id;
    seeded.services.store.with_state(|s| {
        s.roles.insert(id, role);
    });
    id
}

/// Register `submodule` under the billing module and return the composition id.
fn compose_submodule(seeded: &Seeded, code: &str) -> Uuid {
    let tenant_id = seeded.member.tenant_id;
    let submodule = module(tenant_id, code);
    let composition = SubModuleComposition {
        audit: system_envelope(tenant_id),
        module_id: seeded.billing_module_id,
        submodule_id: submodule.audit.id,
    };
    let id = composition.audit.id;
    seeded.services.store.with_state(|s| {
        s.modules.push(submodule);
        s.submodule_compositions.push(composition);
    });
    id
}

fn grant_submodule(seeded: &Seeded, composition_id: Uuid, role_id: Uuid, flags: PermissionFlags) {
    let grant = SubModulePermission {
        audit: system_envelope(seeded.member.tenant_id),
        composition_id,
        role_id,
        flags,
        active: true,
    };
    seeded.services.store.with_state(|s| s.submodule_permissions.push(grant));
}

/// Register `entity.attribute` for field-level control and return the composition id.
fn compose_attribute(seeded: &Seeded, entity: &str, attribute: &str) -> Uuid {
    let tenant_id = seeded.member.tenant_id;
    let existing = seeded.services.store.with_state(|s| {
        s.entities
            .iter()
            .find(|e| e.name == entity)
            .map(|e| e.audit.id)
    });
    let entity_id = existing.unwrap_or_else(|| {
        let row = Entity {
            audit: system_envelope(tenant_id),
            name: entity.to_string(),
        };
        let id = row.audit.id;
        seeded.services.store.with_state(|s| s.entities.push(row));
        id
    });
    let composition = EntityAttributeComposition {
        audit: system_envelope(tenant_id),
        entity_id,
        attribute: attribute.to_string(),
        display_name: None,
    };
    let id = composition.audit.id;
    seeded
        .services
        .store
        .with_state(|s| s.attribute_compositions.push(composition));
    id
}

fn grant_attribute(seeded: &Seeded, composition_id: Uuid, role_id: Uuid, has_perm: bool) {
    let grant = EntityAttributePermission {
        audit: system_envelope(seeded.member.tenant_id),
        composition_id,
        role_id,
        has_perm,
    };
    seeded.services.store.with_state(|s| s.attribute_permissions.push(grant));
}

async fn new_role(seeded: &Seeded, name: &str) -> Uuid {
    seeded
        .services
        .authz
        .create_role(
            &seeded.admin,
            &NewRole {
                name: name.to_string(),
                group_id: None,
                reference_role_id: None,
            },
        )
        .await
        .unwrap()
        .audit
        .id
}

#[tokio::test]
async fn test_new_role_is_seeded_view_only() {
    let seeded = seed();
    let role_id = new_role(&seeded, "Front desk").await;

    let grants = seeded
        .services
        .authz
        .role_permissions(&seeded.admin, role_id)
        .await
        .unwrap();
    assert_eq!(grants.modules.len(), 2);
    assert!(grants
        .modules
        .iter()
        .all(|g| g.flags == PermissionFlags::VIEW_ONLY));

    assign(&seeded, vec![role_id]);
    let authz = &seeded.services.authz;
    let view = authz
        .resolve(&seeded.member, "billing", Action::View)
        .await
        .unwrap();
    assert!(view.allowed);
    let create = authz
        .resolve(&seeded.member, "billing", Action::Create)
        .await
        .unwrap();
    assert!(!create.allowed);

    let denied = authz.require(&seeded.member, "billing", Action::Delete).await;
    assert!(matches!(denied, Err(AppError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_updated_grants_take_effect() {
    let seeded = seed();
    let role_id = new_role(&seeded, "Accounts").await;
    assign(&seeded, vec![role_id]);

    let flags = PermissionFlags {
        can_create: true,
        can_view: true,
        can_update: true,
        can_delete: false,
    };
    seeded
        .services
        .authz
        .update_role_permissions(
            &seeded.admin,
            role_id,
            &[ModulePermissionUpdate {
                module_id: seeded.billing_module_id,
                flags,
                active: true,
                submodule_permissions: Vec::new(),
            }],
        )
        .await
        .unwrap();

    let decision = seeded
        .services
        .authz
        .resolve(&seeded.member, "billing", Action::Create)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.effective, flags);
}

#[tokio::test]
async fn test_copied_role_inherits_reference_grants() {
    let seeded = seed();
    let reference = new_role(&seeded, "Template").await;
    let copy = seeded
        .services
        .authz
        .create_role(
            &seeded.admin,
            &NewRole {
                name: "Copy".to_string(),
                group_id: None,
                reference_role_id: Some(reference),
            },
        )
        .await
        .unwrap();

    let grants = seeded
        .services
        .authz
        .role_permissions(&seeded.admin, copy.audit.id)
        .await
        .unwrap();
    assert_eq!(grants.modules.len(), 2);
    assert!(grants.modules.iter().all(|g| g.role_id == copy.audit.id));
}

#[tokio::test]
async fn test_role_with_holders_cannot_be_deactivated() {
    let seeded = seed();
    let role_id = new_role(&seeded, "Maintenance").await;
    assign(&seeded, vec![role_id]);

    let result = seeded
        .services
        .authz
        .deactivate_role(&seeded.admin, role_id)
        .await;
    assert!(matches!(result, Err(AppError::InvalidStatus(_))));
}

#[tokio::test]
async fn test_deactivated_role_grants_nothing() {
    let seeded = seed();
    let role_id = new_role(&seeded, "Seasonal").await;
    let role = seeded
        .services
        .authz
        .deactivate_role(&seeded.admin, role_id)
        .await
        .unwrap();
    assert!(!role.active);

    // Bound after deactivation: the inactive role is ignored.
    assign(&seeded, vec![role_id]);
    let decision = seeded
        .services
        .authz
        .resolve(&seeded.member, "billing", Action::View)
        .await
        .unwrap();
    assert!(!decision.allowed);
}

#[tokio::test]
async fn test_superuser_and_system_bypass_checks() {
    let seeded = seed();
    let superuser = RequestContext {
        is_superuser: true,
        ..seeded.member.clone()
    };
    let authz = &seeded.services.authz;
    assert!(authz
        .resolve(&superuser, "billing", Action::Delete)
        .await
        .unwrap()
        .allowed);
    let system = RequestContext::system(seeded.member.tenant_id);
    assert!(authz
        .resolve(&system, "unknown-module", Action::Delete)
        .await
        .unwrap()
        .allowed);

    let nobody = authz
        .resolve(&seeded.member, "billing", Action::View)
        .await
        .unwrap();
    assert!(!nobody.allowed);
}

#[tokio::test]
async fn test_submodule_grants_are_ored_across_active_roles() {
    let seeded = seed();
    let invoices = compose_submodule(&seeded, "invoices");
    let viewer = bare_role(&seeded, "Viewer", true);
    let creator = bare_role(&seeded, "Creator", true);
    let retired = bare_role(&seeded, "Retired", false);
    grant_submodule(&seeded, invoices, viewer, PermissionFlags::VIEW_ONLY);
    grant_submodule(
        &seeded,
        invoices,
        creator,
        PermissionFlags {
            can_create: true,
            can_view: false,
            can_update: false,
            can_delete: false,
        },
    );
    grant_submodule(
        &seeded,
        invoices,
        retired,
        PermissionFlags {
            can_create: false,
            can_view: false,
            can_update: false,
            can_delete: true,
        },
    );
    assign(&seeded, vec![viewer, creator, retired]);

    let authz = &seeded.services.authz;
    let view = authz
        .resolve_submodule(&seeded.member, "billing", "invoices", Action::View)
        .await
        .unwrap();
    assert!(view.allowed);
    let create = authz
        .resolve_submodule(&seeded.member, "billing", "invoices", Action::Create)
        .await
        .unwrap();
    assert!(create.allowed);
    assert_eq!(
        create.effective,
        PermissionFlags {
            can_create: true,
            can_view: true,
            can_update: false,
            can_delete: false,
        }
    );
    let delete = authz
        .resolve_submodule(&seeded.member, "billing", "invoices", Action::Delete)
        .await
        .unwrap();
    assert!(!delete.allowed);
}

#[tokio::test]
async fn test_submodule_without_composition_is_denied() {
    let seeded = seed();
    let role = bare_role(&seeded, "Everything", true);
    assign(&seeded, vec![role]);

    // Both modules exist but "amenities" is not composed under "billing".
    let decision = seeded
        .services
        .authz
        .resolve_submodule(&seeded.member, "billing", "amenities", Action::View)
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.effective, PermissionFlags::default());
}

#[tokio::test]
async fn test_attribute_visible_when_any_active_role_grants_it() {
    let seeded = seed();
    let insurance = compose_attribute(&seeded, "bill", "insurance_paid");
    let clerk = bare_role(&seeded, "Clerk", true);
    let auditor = bare_role(&seeded, "Auditor", true);
    grant_attribute(&seeded, insurance, clerk, false);
    grant_attribute(&seeded, insurance, auditor, true);

    assign(&seeded, vec![clerk]);
    let authz = &seeded.services.authz;
    assert!(!authz
        .resolve_attribute(&seeded.member, "bill", "insurance_paid")
        .await
        .unwrap());

    assign(&seeded, vec![clerk, auditor]);
    assert!(authz
        .resolve_attribute(&seeded.member, "bill", "insurance_paid")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_attribute_granted_only_by_inactive_role_is_hidden() {
    let seeded = seed();
    let insurance = compose_attribute(&seeded, "bill", "insurance_paid");
    let retired = bare_role(&seeded, "Retired", false);
    grant_attribute(&seeded, insurance, retired, true);
    assign(&seeded, vec![retired]);

    let visible = seeded
        .services
        .authz
        .resolve_attribute(&seeded.member, "bill", "insurance_paid")
        .await
        .unwrap();
    assert!(!visible);
}

#[tokio::test]
async fn test_attribute_without_composition_is_denied() {
    let seeded = seed();
    let role = bare_role(&seeded, "Clerk", true);
    assign(&seeded, vec![role]);
    let authz = &seeded.services.authz;

    assert!(!authz
        .resolve_attribute(&seeded.member, "bill", "other_writeoff")
        .await
        .unwrap());

    let superuser = RequestContext {
        is_superuser: true,
        ..seeded.member.clone()
    };
    assert!(authz
        .resolve_attribute(&superuser, "bill", "other_writeoff")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_redact_removes_only_controlled_ungranted_attributes() {
    let seeded = seed();
    let insurance = compose_attribute(&seeded, "bill", "insurance_paid");
    let writeoff = compose_attribute(&seeded, "bill", "other_writeoff");
    let clerk = bare_role(&seeded, "Clerk", true);
    grant_attribute(&seeded, insurance, clerk, false);
    grant_attribute(&seeded, writeoff, clerk, true);
    assign(&seeded, vec![clerk]);

    let record = json!({
        "total_charges": "120.00",
        "insurance_paid": "30.00",
        "other_writeoff": "5.00"
    });
    let authz = &seeded.services.authz;

    let mut redacted = record.clone();
    let hidden = authz
        .redact(&seeded.member, "bill", &mut redacted)
        .await
        .unwrap();
    assert_eq!(hidden, vec!["insurance_paid".to_string()]);
    assert!(redacted.get("insurance_paid").is_none());
    assert_eq!(redacted["total_charges"], "120.00");
    assert_eq!(redacted["other_writeoff"], "5.00");

    let superuser = RequestContext {
        is_superuser: true,
        ..seeded.member.clone()
    };
    let mut untouched = record.clone();
    let hidden = authz
        .redact(&superuser, "bill", &mut untouched)
        .await
        .unwrap();
    assert!(hidden.is_empty());
    assert_eq!(untouched, record);
}
