use serde::{Deserialize, Serialize};

use super::AuditEnvelope;

/// One entry of a named enumeration (`booking_rejection_reason`, `bill_cancellation_reason`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Lookup {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
    pub code: String,
    pub display: String,
    pub active: bool,
    pub sort_order: i32,
}

/// Maps a free-form bill cancellation reason to a stable cancellation code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct BillCancellationCodeComposition {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub cancellation_reason: String,
    pub cancellation_code: String,
}

/// In-memory view over the lookup table for one tenant.
#[derive(Debug, Clone, Default)]
pub struct LookupRegistry {
    entries: Vec<Lookup>,
}

impl LookupRegistry {
    pub fn new(entries: Vec<Lookup>) -> Self {
        let mut entries: Vec<Lookup> = entries
            .into_iter()
            .filter(|e| !e.audit.is_deleted())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.sort_order.cmp(&b.sort_order)));
        Self { entries }
    }

    /// Active entries of `name` in display order.
    pub fn list(&self, name: &str) -> Vec<&Lookup> {
        self.entries
            .iter()
            .filter(|e| e.name == name && e.active)
            .collect()
    }

    /// Active entry by code; inactive codes do not resolve.
    pub fn resolve(&self, name: &str, code: &str) -> Option<&Lookup> {
        self.entries
            .iter()
            .find(|e| e.name == name && e.code == code && e.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use uuid::Uuid;

    fn entry(ctx: &RequestContext, name: &str, code: &str, active: bool, order: i32) -> Lookup {
        Lookup {
            audit: AuditEnvelope::stamp_create(ctx),
            name: name.to_string(),
            code: code.to_string(),
            display: code.to_uppercase(),
            active,
            sort_order: order,
        }
    }

    #[test]
    fn list_filters_inactive_and_orders() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let registry = LookupRegistry::new(vec![
            entry(&ctx, "reason", "b", true, 2),
            entry(&ctx, "reason", "a", true, 1),
            entry(&ctx, "reason", "c", false, 0),
            entry(&ctx, "other", "x", true, 0),
        ]);

        let codes: Vec<&str> = registry
            .list("reason")
            .iter()
            .map(|e| e.code.as_str())
            .collect();
        assert_eq!(codes, vec!["a", "b"]);
        assert!(registry.resolve("reason", "c").is_none());
        assert!(registry.resolve("other", "x").is_some());
    }
}
