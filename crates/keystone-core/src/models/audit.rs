use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::RequestContext;

/// Columns carried by every tenant-scoped row.
///
/// A non-null `deleted_by` marks the row as soft-deleted; default queries exclude it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AuditEnvelope {
    pub id: Uuid,
    pub version: i32,
    pub tenant_id: Uuid,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<Uuid>,
}

impl AuditEnvelope {
    /// Fresh envelope stamped with the caller as creator.
    pub fn stamp_create(ctx: &RequestContext) -> Self {
        Self::stamp_create_at(ctx, Utc::now())
    }

    pub fn stamp_create_at(ctx: &RequestContext, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            tenant_id: ctx.tenant_id,
            created_on: now,
            updated_on: now,
            created_by: Some(ctx.user_id),
            updated_by: Some(ctx.user_id),
            deleted_by: None,
        }
    }

    pub fn stamp_update(&mut self, ctx: &RequestContext) {
        self.version += 1;
        self.updated_on = Utc::now();
        self.updated_by = Some(ctx.user_id);
    }

    pub fn soft_delete(&mut self, ctx: &RequestContext) {
        self.stamp_update(ctx);
        self.deleted_by = Some(ctx.user_id);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_bumps_version_and_actor() {
        let creator = RequestContext::system(Uuid::new_v4());
        let mut envelope = AuditEnvelope::stamp_create(&creator);
        assert_eq!(envelope.version, 1);

        let editor = RequestContext::system(envelope.tenant_id).with_user(Uuid::new_v4());
        envelope.stamp_update(&editor);
        assert_eq!(envelope.version, 2);
        assert_eq!(envelope.updated_by, Some(editor.user_id));
        assert_eq!(envelope.created_by, Some(creator.user_id));
    }

    #[test]
    fn soft_delete_sets_deleted_by() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let mut envelope = AuditEnvelope::stamp_create(&ctx);
        assert!(!envelope.is_deleted());
        envelope.soft_delete(&ctx);
        assert!(envelope.is_deleted());
    }
}
