//! Policies, versions and user acceptance.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use keystone_core::models::{
    AcceptanceStatus, AuditEnvelope, Policy, PolicyChanges, PolicyStatus, PolicyVersion,
    UserPolicyAcceptance,
};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::PolicyStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;

/// Turns a policy version into a document and returns where it was stored.
#[async_trait]
pub trait PolicyRenderer: Send + Sync {
    async fn render(&self, policy: &Policy, version: &PolicyVersion) -> AppResult<String>;
}

/// Renderer that only derives the storage key.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRenderer;

#[async_trait]
impl PolicyRenderer for NoopRenderer {
    async fn render(&self, policy: &Policy, version: &PolicyVersion) -> AppResult<String> {
        Ok(format!(
            "policies/{}/{}/v{}.pdf",
            policy.audit.tenant_id, policy.audit.id, version.version_number
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPolicy {
    pub name: String,
    pub policy_type: String,
    #[serde(default = "default_status")]
    pub status: PolicyStatus,
    pub publishing_date: Option<NaiveDate>,
    pub content_html: String,
}

fn default_status() -> PolicyStatus {
    PolicyStatus::Draft
}

#[derive(Clone)]
pub struct PolicyService {
    store: Arc<dyn PolicyStore>,
    renderer: Arc<dyn PolicyRenderer>,
    clock: Arc<dyn Clock>,
}

impl PolicyService {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        renderer: Arc<dyn PolicyRenderer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            renderer,
            clock,
        }
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        status: Option<PolicyStatus>,
    ) -> AppResult<Vec<Policy>> {
        self.store.list_policies(ctx.tenant_id, status).await
    }

    pub async fn get(&self, ctx: &RequestContext, policy_id: Uuid) -> AppResult<Policy> {
        self.store
            .get_policy(ctx.tenant_id, policy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("policy {}", policy_id)))
    }

    /// Create a policy with version 1.
    #[tracing::instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id))]
    pub async fn create(&self, ctx: &RequestContext, input: &NewPolicy) -> AppResult<Policy> {
        if input.name.trim().is_empty() {
            return Err(AppError::MissingRequiredParam("name".to_string()));
        }
        let now = self.clock.now();
        let policy_audit = AuditEnvelope::stamp_create_at(ctx, now);
        let version = PolicyVersion {
            audit: AuditEnvelope::stamp_create_at(ctx, now),
            policy_id: policy_audit.id,
            version_number: 1,
            content_html: input.content_html.clone(),
            pdf_ref: None,
        };
        let policy = Policy {
            audit: policy_audit,
            name: input.name.trim().to_string(),
            status: input.status,
            policy_type: input.policy_type.clone(),
            publishing_date: input.publishing_date,
            current_version_id: Some(version.audit.id),
        };

        let created = self.store.create_policy(&policy, &version).await?;
        if created.status == PolicyStatus::Active {
            self.render(&created, &version).await;
        }
        tracing::info!(policy_id = %created.audit.id, "Policy created");
        Ok(created)
    }

    /// Apply changes. New content bumps the version; becoming (or staying) ACTIVE with a new
    /// version renders the document.
    #[tracing::instrument(skip(self, ctx, changes), fields(tenant_id = %ctx.tenant_id, policy_id = %policy_id))]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        policy_id: Uuid,
        changes: &PolicyChanges,
    ) -> AppResult<Policy> {
        let mut policy = self.get(ctx, policy_id).await?;
        let latest = self.store.latest_version(ctx.tenant_id, policy_id).await?;
        let was_active = policy.status == PolicyStatus::Active;

        let new_version = match (&changes.content_html, &latest) {
            (Some(content), Some(current)) if *content == current.content_html => None,
            (Some(content), current) => Some(PolicyVersion {
                audit: AuditEnvelope::stamp_create_at(ctx, self.clock.now()),
                policy_id,
                version_number: current.as_ref().map_or(1, |v| v.version_number + 1),
                content_html: content.clone(),
                pdf_ref: None,
            }),
            (None, _) => None,
        };

        if let Some(name) = changes.name.as_deref() {
            policy.name = name.trim().to_string();
        }
        if let Some(status) = changes.status {
            policy.status = status;
        }
        if let Some(policy_type) = changes.policy_type.as_deref() {
            policy.policy_type = policy_type.to_string();
        }
        if changes.publishing_date.is_some() {
            policy.publishing_date = changes.publishing_date;
        }
        if let Some(version) = &new_version {
            policy.current_version_id = Some(version.audit.id);
        }
        policy.audit.stamp_update(ctx);

        let saved = self.store.save_policy(&policy, new_version.as_ref()).await?;

        let activated = saved.status == PolicyStatus::Active && !was_active;
        if saved.status == PolicyStatus::Active && (activated || new_version.is_some()) {
            let current = match new_version {
                Some(v) => Some(v),
                None => latest,
            };
            if let Some(version) = current {
                self.render(&saved, &version).await;
            }
        }
        Ok(saved)
    }

    async fn render(&self, policy: &Policy, version: &PolicyVersion) {
        match self.renderer.render(policy, version).await {
            Ok(pdf_ref) => {
                if let Err(e) = self
                    .store
                    .set_version_pdf(policy.audit.tenant_id, version.audit.id, &pdf_ref)
                    .await
                {
                    tracing::error!(error = %e, version_id = %version.audit.id, "Failed to record policy document");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, policy_id = %policy.audit.id, "Policy render failed");
            }
        }
    }

    /// Record acceptance of the policy's latest version. Returns false when already accepted.
    pub async fn accept(&self, ctx: &RequestContext, policy_id: Uuid) -> AppResult<bool> {
        let version = self
            .store
            .latest_version(ctx.tenant_id, policy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("policy {}", policy_id)))?;
        let now = self.clock.now();
        let acceptance = UserPolicyAcceptance {
            audit: AuditEnvelope::stamp_create_at(ctx, now),
            user_id: ctx.user_id,
            policy_version_id: version.audit.id,
            accepted_on: now,
        };
        self.store.insert_acceptance(&acceptance).await
    }

    /// Per policy: whether the caller accepted its latest version.
    pub async fn latest_accepted(
        &self,
        ctx: &RequestContext,
        policy_ids: &[Uuid],
    ) -> AppResult<Vec<AcceptanceStatus>> {
        let accepted: HashMap<Uuid, i32> = self
            .store
            .accepted_versions(ctx.tenant_id, ctx.user_id, policy_ids)
            .await?
            .into_iter()
            .collect();
        let latest: HashMap<Uuid, i32> = self
            .store
            .latest_versions(ctx.tenant_id, policy_ids)
            .await?
            .into_iter()
            .collect();

        Ok(policy_ids
            .iter()
            .map(|id| {
                let accepted_version = accepted.get(id).copied();
                let latest_version = latest.get(id).copied();
                AcceptanceStatus {
                    policy_id: *id,
                    accepted: accepted_version.is_some() && accepted_version == latest_version,
                    accepted_version,
                    latest_version,
                }
            })
            .collect())
    }
}
