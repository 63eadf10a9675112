use keystone_core::models::Action;
use keystone_core::{AppResult, RequestContext};

use crate::state::AppState;

pub const MODULE_ROLES: &str = "roles";
pub const MODULE_AMENITIES: &str = "amenities";
pub const MODULE_BILLING: &str = "billing";
pub const MODULE_POLICIES: &str = "policies";

/// Entity name for field-level grants on bills.
pub const ENTITY_BILL: &str = "bill";

/// Who may reach a handler besides staff holding the module grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidentAccess {
    /// Residents act on their own records; row scoping narrows what they can touch.
    SelfService,
    Denied,
}

/// Check the caller's module grant. Residents either pass through to row scoping or are
/// denied outright.
pub async fn authorize(
    state: &AppState,
    ctx: &RequestContext,
    module_code: &str,
    action: Action,
    residents: ResidentAccess,
) -> AppResult<()> {
    if ctx.is_resident() && residents == ResidentAccess::SelfService {
        return Ok(());
    }
    state.authz.require(ctx, module_code, action).await
}
