//! Access-level scoping hints
//!
//! Each scoped entity declares how to reach its scope node (`location_path`) and its owning
//! resident (`resident_path`). The database layer turns these into SQL predicates; the
//! in-memory stores evaluate [`ScopeFilter::admits`] directly.

use uuid::Uuid;

use crate::context::RequestContext;
use crate::models::{AmenityBooking, Bill, BillRefundRequest, Payment};

/// Join specification from an entity's table to a scoping column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopePath {
    /// Extra JOIN clauses, appended verbatim after the entity table.
    pub joins: &'static [&'static str],
    /// Column expression yielding the node (or resident) id.
    pub column: &'static str,
}

pub trait ScopeSpec {
    const TABLE: &'static str;

    fn location_path() -> Option<ScopePath>;

    fn resident_path() -> Option<ScopePath>;
}

/// Row restriction for the caller, composed with the tenant filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    Unrestricted,
    /// Rows whose scope node sits at or below any of these nodes.
    Nodes(Vec<Uuid>),
    /// Rows owned by this resident.
    Resident(Uuid),
    Deny,
}

impl ScopeFilter {
    /// `node_path` is the row's scope node followed by its ancestors.
    pub fn admits(&self, node_path: &[Uuid], resident_id: Option<Uuid>) -> bool {
        match self {
            ScopeFilter::Unrestricted => true,
            ScopeFilter::Nodes(ids) => node_path.iter().any(|n| ids.contains(n)),
            ScopeFilter::Resident(id) => resident_id == Some(*id),
            ScopeFilter::Deny => false,
        }
    }
}

pub fn scope_filter(ctx: &RequestContext) -> ScopeFilter {
    if ctx.is_resident() {
        return match ctx.resident_id {
            Some(id) => ScopeFilter::Resident(id),
            None => ScopeFilter::Deny,
        };
    }
    if ctx.is_system() || ctx.is_superuser || ctx.access_level.is_unrestricted() {
        return ScopeFilter::Unrestricted;
    }
    if ctx.scope_ids.is_empty() {
        ScopeFilter::Deny
    } else {
        ScopeFilter::Nodes(ctx.scope_ids.clone())
    }
}

impl ScopeSpec for Bill {
    const TABLE: &'static str = "bills";

    fn location_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &[],
            column: "bills.location_id",
        })
    }

    fn resident_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &[],
            column: "bills.resident_id",
        })
    }
}

impl ScopeSpec for AmenityBooking {
    const TABLE: &'static str = "amenity_bookings";

    fn location_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &["JOIN amenities ON amenities.id = amenity_bookings.amenity_id"],
            column: "amenities.location_id",
        })
    }

    fn resident_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &[],
            column: "amenity_bookings.resident_id",
        })
    }
}

impl ScopeSpec for Payment {
    const TABLE: &'static str = "payments";

    fn location_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &["JOIN bills ON bills.id = payments.bill_id"],
            column: "bills.location_id",
        })
    }

    fn resident_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &["JOIN bills ON bills.id = payments.bill_id"],
            column: "bills.resident_id",
        })
    }
}

impl ScopeSpec for BillRefundRequest {
    const TABLE: &'static str = "bill_refund_requests";

    fn location_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &["JOIN bills ON bills.id = bill_refund_requests.bill_id"],
            column: "bills.location_id",
        })
    }

    fn resident_path() -> Option<ScopePath> {
        Some(ScopePath {
            joins: &["JOIN bills ON bills.id = bill_refund_requests.bill_id"],
            column: "bills.resident_id",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessLevel, UserType};

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
    fn admin_is_unrestricted() {
        assert_eq!(
            scope_filter(&staff(AccessLevel::Admin, vec![])),
            ScopeFilter::Unrestricted
        );
    }

    #[test]
    fn location_staff_sees_descendants_only() {
        let building = Uuid::new_v4();
        let location = Uuid::new_v4();
        let other = Uuid::new_v4();
        let filter = scope_filter(&staff(AccessLevel::Location, vec![location]));

        assert!(filter.admits(&[building, location], None));
        assert!(!filter.admits(&[other], None));
    }

    #[test]
    fn scoped_staff_without_nodes_is_denied() {
        assert_eq!(
            scope_filter(&staff(AccessLevel::Unit, vec![])),
            ScopeFilter::Deny
        );
    }

    #[test]
    fn resident_restricted_to_own_rows() {
        let resident_id = Uuid::new_v4();
        let ctx = RequestContext {
            user_type: UserType::Resident,
            access_level: AccessLevel::Unit,
            resident_id: Some(resident_id),
            is_superuser: false,
            ..RequestContext::system(Uuid::new_v4())
        };
        let filter = scope_filter(&ctx);
        assert!(filter.admits(&[], Some(resident_id)));
        assert!(!filter.admits(&[], Some(Uuid::new_v4())));
    }

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::Admin < AccessLevel::Customer);
        assert!(AccessLevel::Floor < AccessLevel::Unit);
    }
}
