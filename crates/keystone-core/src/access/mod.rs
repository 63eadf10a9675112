//! Authorization rules: permission resolution over role grants, role seeding, and
//! access-level scoping hints.

pub mod permissions;
pub mod scope;

pub use permissions::{
    active_role_ids, copy_role_permissions, resolve, resolve_attribute, seed_role_permissions,
    Decision, RolePermissionSet,
};
pub use scope::{scope_filter, ScopeFilter, ScopePath, ScopeSpec};
