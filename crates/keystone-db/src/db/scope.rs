//! Generic `for_current_user` query scoper
//!
//! Composes the tenant filter, the soft-delete filter and the caller's access-level or
//! resident restriction into a `SELECT` over one scoped table. Callers append their own
//! predicates with `AND ...` and finish the query.

use keystone_core::access::{scope_filter, ScopeFilter, ScopePath, ScopeSpec};
use keystone_core::RequestContext;
use sqlx::{Postgres, QueryBuilder};

/// `SELECT <table>.* FROM <table> [joins] WHERE <tenant> AND <not deleted> AND <scope>`.
pub fn scoped_select<'a, T: ScopeSpec>(ctx: &RequestContext) -> QueryBuilder<'a, Postgres> {
    let filter = scope_filter(ctx);
    let path = match &filter {
        ScopeFilter::Nodes(_) => T::location_path(),
        ScopeFilter::Resident(_) => T::resident_path(),
        ScopeFilter::Unrestricted | ScopeFilter::Deny => None,
    };

    let mut qb = QueryBuilder::new(format!("SELECT {table}.* FROM {table}", table = T::TABLE));
    if let Some(path) = path {
        for join in path.joins {
            qb.push(" ");
            qb.push(*join);
        }
    }
    qb.push(format!(" WHERE {}.tenant_id = ", T::TABLE));
    qb.push_bind(ctx.tenant_id);
    qb.push(format!(" AND {}.deleted_by IS NULL", T::TABLE));
    push_scope_predicate(&mut qb, &filter, path);
    qb
}

fn push_scope_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &ScopeFilter,
    path: Option<ScopePath>,
) {
    match (filter, path) {
        (ScopeFilter::Unrestricted, _) => {}
        (ScopeFilter::Nodes(ids), Some(path)) => {
            qb.push(format!(
                " AND EXISTS (SELECT 1 FROM scope_nodes sn WHERE sn.id = {} AND sn.path && ",
                path.column
            ));
            qb.push_bind(ids.clone());
            qb.push(")");
        }
        (ScopeFilter::Resident(resident_id), Some(path)) => {
            qb.push(format!(" AND {} = ", path.column));
            qb.push_bind(*resident_id);
        }
        // No way to reach the scoping column: nothing is visible.
        _ => {
            qb.push(" AND FALSE");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::models::{AccessLevel, Bill, Payment, UserType};
    use uuid::Uuid;

    fn staff(level: AccessLevel, scope_ids: Vec<Uuid>) -> RequestContext {
        RequestContext {
            user_type: UserType::Staff,
            access_level: level,
            staff_id: Some(Uuid::new_v4()),
            scope_ids,
            is_superuser: false,
            ..RequestContext::system(Uuid::new_v4())
        }
    }

    #[test]
    fn admin_gets_tenant_and_soft_delete_filters_only() {
        let qb = scoped_select::<Bill>(&staff(AccessLevel::Admin, vec![]));
        assert_eq!(
            qb.sql(),
            "SELECT bills.* FROM bills WHERE bills.tenant_id = $1 AND bills.deleted_by IS NULL"
        );
    }

    #[test]
    fn location_staff_filters_through_scope_nodes() {
        let qb = scoped_select::<Payment>(&staff(AccessLevel::Location, vec![Uuid::new_v4()]));
        let sql = qb.sql();
        assert!(sql.contains("JOIN bills ON bills.id = payments.bill_id"));
        assert!(sql.contains("sn.id = bills.location_id AND sn.path && $2"));
    }

    #[test]
    fn resident_is_pinned_to_own_rows() {
        let ctx = RequestContext {
            user_type: UserType::Resident,
            access_level: AccessLevel::Unit,
            resident_id: Some(Uuid::new_v4()),
            is_superuser: false,
            ..RequestContext::system(Uuid::new_v4())
        };
        let qb = scoped_select::<Bill>(&ctx);
        assert!(qb.sql().ends_with("AND bills.resident_id = $2"));
    }

    #[test]
    fn unscoped_staff_sees_nothing() {
        let qb = scoped_select::<Bill>(&staff(AccessLevel::Unit, vec![]));
        assert!(qb.sql().ends_with("AND FALSE"));
    }
}
