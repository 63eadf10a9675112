use async_trait::async_trait;
use keystone_core::access::RolePermissionSet;
use keystone_core::models::{
    EntityAttributeComposition, EntityAttributePermission, Module, ModulePermission,
    SubModuleComposition, SubModulePermission, UserRole,
};
use keystone_core::AppResult;
use sqlx::{PgExecutor, PgPool, Postgres};
use uuid::Uuid;

use crate::db::db_error;
use crate::db::transaction::{begin_serializable, commit, retry_on_contention};
use crate::store_traits::AuthzStore;

#[derive(Clone)]
pub struct PgAuthzRepository {
    pool: PgPool,
}

impl PgAuthzRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn create_role_once(
        &self,
        role: &UserRole,
        grants: &RolePermissionSet,
    ) -> AppResult<UserRole> {
        let mut tx = begin_serializable(&self.pool).await?;

        let created = sqlx::query_as::<Postgres, UserRole>(
            r#"
            INSERT INTO user_roles (
                id, version, tenant_id, created_on, updated_on, created_by, updated_by,
                name, active, seeded, group_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10)
            RETURNING *
            "#,
        )
        .bind(role.audit.id)
        .bind(role.audit.version)
        .bind(role.audit.tenant_id)
        .bind(role.audit.created_on)
        .bind(role.audit.updated_on)
        .bind(role.audit.created_by)
        .bind(role.audit.updated_by)
        .bind(&role.name)
        .bind(role.active)
        .bind(role.group_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to create role"))?;

        for grant in &grants.modules {
            upsert_module_permission(&mut *tx, grant).await?;
        }
        for grant in &grants.submodules {
            upsert_submodule_permission(&mut *tx, grant).await?;
        }
        for grant in &grants.attributes {
            insert_attribute_permission(&mut *tx, grant).await?;
        }

        commit(tx).await?;
        Ok(created)
    }

    async fn replace_role_permissions_once(
        &self,
        modules: &[ModulePermission],
        submodules: &[SubModulePermission],
    ) -> AppResult<()> {
        let mut tx = begin_serializable(&self.pool).await?;
        for grant in modules {
            upsert_module_permission(&mut *tx, grant).await?;
        }
        for grant in submodules {
            upsert_submodule_permission(&mut *tx, grant).await?;
        }
        commit(tx).await
    }
}

async fn upsert_module_permission<'e, E: PgExecutor<'e>>(
    executor: E,
    grant: &ModulePermission,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO module_permissions (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            module_id, role_id, can_create, can_view, can_update, can_delete, active
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (module_id, role_id) DO UPDATE
        SET can_create = EXCLUDED.can_create,
            can_view = EXCLUDED.can_view,
            can_update = EXCLUDED.can_update,
            can_delete = EXCLUDED.can_delete,
            active = EXCLUDED.active,
            deleted_by = NULL,
            updated_on = EXCLUDED.updated_on,
            updated_by = EXCLUDED.updated_by,
            version = module_permissions.version + 1
        "#,
    )
    .bind(grant.audit.id)
    .bind(grant.audit.version)
    .bind(grant.audit.tenant_id)
    .bind(grant.audit.created_on)
    .bind(grant.audit.updated_on)
    .bind(grant.audit.created_by)
    .bind(grant.audit.updated_by)
    .bind(grant.module_id)
    .bind(grant.role_id)
    .bind(grant.flags.can_create)
    .bind(grant.flags.can_view)
    .bind(grant.flags.can_update)
    .bind(grant.flags.can_delete)
    .bind(grant.active)
    .execute(executor)
    .await
    .map_err(db_error("Failed to write module permission"))?;

    Ok(())
}

async fn upsert_submodule_permission<'e, E: PgExecutor<'e>>(
    executor: E,
    grant: &SubModulePermission,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO submodule_permissions (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            composition_id, role_id, can_create, can_view, can_update, can_delete, active
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (composition_id, role_id) DO UPDATE
        SET can_create = EXCLUDED.can_create,
            can_view = EXCLUDED.can_view,
            can_update = EXCLUDED.can_update,
            can_delete = EXCLUDED.can_delete,
            active = EXCLUDED.active,
            deleted_by = NULL,
            updated_on = EXCLUDED.updated_on,
            updated_by = EXCLUDED.updated_by,
            version = submodule_permissions.version + 1
        "#,
    )
    .bind(grant.audit.id)
    .bind(grant.audit.version)
    .bind(grant.audit.tenant_id)
    .bind(grant.audit.created_on)
    .bind(grant.audit.updated_on)
    .bind(grant.audit.created_by)
    .bind(grant.audit.updated_by)
    .bind(grant.composition_id)
    .bind(grant.role_id)
    .bind(grant.flags.can_create)
    .bind(grant.flags.can_view)
    .bind(grant.flags.can_update)
    .bind(grant.flags.can_delete)
    .bind(grant.active)
    .execute(executor)
    .await
    .map_err(db_error("Failed to write submodule permission"))?;

    Ok(())
}

async fn insert_attribute_permission<'e, E: PgExecutor<'e>>(
    executor: E,
    grant: &EntityAttributePermission,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO entity_attribute_permissions (
            id, version, tenant_id, created_on, updated_on, created_by, updated_by,
            composition_id, role_id, has_perm
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (composition_id, role_id) DO NOTHING
        "#,
    )
    .bind(grant.audit.id)
    .bind(grant.audit.version)
    .bind(grant.audit.tenant_id)
    .bind(grant.audit.created_on)
    .bind(grant.audit.updated_on)
    .bind(grant.audit.created_by)
    .bind(grant.audit.updated_by)
    .bind(grant.composition_id)
    .bind(grant.role_id)
    .bind(grant.has_perm)
    .execute(executor)
    .await
    .map_err(db_error("Failed to write attribute permission"))?;

    Ok(())
}

#[async_trait]
impl AuthzStore for PgAuthzRepository {
    #[tracing::instrument(skip(self), fields(db.table = "user_roles", db.operation = "select"))]
    async fn list_roles(&self, tenant_id: Uuid) -> AppResult<Vec<UserRole>> {
        let roles = sqlx::query_as::<Postgres, UserRole>(
            r#"
            SELECT * FROM user_roles
            WHERE tenant_id = $1 AND deleted_by IS NULL
            ORDER BY name
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list roles"))?;

        Ok(roles)
    }

    #[tracing::instrument(skip(self), fields(db.table = "user_roles", db.operation = "select"))]
    async fn get_role(&self, tenant_id: Uuid, role_id: Uuid) -> AppResult<Option<UserRole>> {
        let role = sqlx::query_as::<Postgres, UserRole>(
            r#"
            SELECT * FROM user_roles
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get role"))?;

        Ok(role)
    }

    #[tracing::instrument(skip(self), fields(db.table = "modules", db.operation = "select"))]
    async fn list_modules(&self, tenant_id: Uuid) -> AppResult<Vec<Module>> {
        let modules = sqlx::query_as::<Postgres, Module>(
            r#"
            SELECT * FROM modules
            WHERE tenant_id = $1 AND deleted_by IS NULL
            ORDER BY product, code
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list modules"))?;

        Ok(modules)
    }

    #[tracing::instrument(skip(self), fields(db.table = "modules", db.operation = "select"))]
    async fn find_module(&self, tenant_id: Uuid, code: &str) -> AppResult<Option<Module>> {
        let module = sqlx::query_as::<Postgres, Module>(
            r#"
            SELECT * FROM modules
            WHERE tenant_id = $1 AND code = $2 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find module"))?;

        Ok(module)
    }

    #[tracing::instrument(skip(self), fields(db.table = "submodule_compositions", db.operation = "select"))]
    async fn list_submodule_compositions(
        &self,
        tenant_id: Uuid,
    ) -> AppResult<Vec<SubModuleComposition>> {
        let compositions = sqlx::query_as::<Postgres, SubModuleComposition>(
            r#"
            SELECT * FROM submodule_compositions
            WHERE tenant_id = $1 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list submodule compositions"))?;

        Ok(compositions)
    }

    #[tracing::instrument(skip(self), fields(db.table = "submodule_compositions", db.operation = "select"))]
    async fn find_submodule_composition(
        &self,
        tenant_id: Uuid,
        module_id: Uuid,
        submodule_id: Uuid,
    ) -> AppResult<Option<SubModuleComposition>> {
        let composition = sqlx::query_as::<Postgres, SubModuleComposition>(
            r#"
            SELECT * FROM submodule_compositions
            WHERE tenant_id = $1 AND module_id = $2 AND submodule_id = $3 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(module_id)
        .bind(submodule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find submodule composition"))?;

        Ok(composition)
    }

    #[tracing::instrument(skip(self), fields(db.table = "entity_attribute_compositions", db.operation = "select"))]
    async fn list_attribute_compositions(
        &self,
        tenant_id: Uuid,
    ) -> AppResult<Vec<EntityAttributeComposition>> {
        let compositions = sqlx::query_as::<Postgres, EntityAttributeComposition>(
            r#"
            SELECT * FROM entity_attribute_compositions
            WHERE tenant_id = $1 AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list attribute compositions"))?;

        Ok(compositions)
    }

    #[tracing::instrument(skip(self), fields(db.table = "entity_attribute_compositions", db.operation = "select"))]
    async fn find_attribute_composition(
        &self,
        tenant_id: Uuid,
        entity: &str,
        attribute: &str,
    ) -> AppResult<Option<EntityAttributeComposition>> {
        let composition = sqlx::query_as::<Postgres, EntityAttributeComposition>(
            r#"
            SELECT c.* FROM entity_attribute_compositions c
            JOIN entities e ON e.id = c.entity_id
            WHERE c.tenant_id = $1 AND e.name = $2 AND c.attribute = $3
              AND c.deleted_by IS NULL AND e.deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(entity)
        .bind(attribute)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find attribute composition"))?;

        Ok(composition)
    }

    #[tracing::instrument(skip(self, role_ids), fields(db.table = "module_permissions", db.operation = "select"))]
    async fn module_permissions(
        &self,
        tenant_id: Uuid,
        module_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<ModulePermission>> {
        let grants = sqlx::query_as::<Postgres, ModulePermission>(
            r#"
            SELECT * FROM module_permissions
            WHERE tenant_id = $1 AND module_id = $2 AND role_id = ANY($3) AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(module_id)
        .bind(role_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load module permissions"))?;

        Ok(grants)
    }

    #[tracing::instrument(skip(self, role_ids), fields(db.table = "submodule_permissions", db.operation = "select"))]
    async fn submodule_permissions(
        &self,
        tenant_id: Uuid,
        composition_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<SubModulePermission>> {
        let grants = sqlx::query_as::<Postgres, SubModulePermission>(
            r#"
            SELECT * FROM submodule_permissions
            WHERE tenant_id = $1 AND composition_id = $2 AND role_id = ANY($3)
              AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(composition_id)
        .bind(role_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load submodule permissions"))?;

        Ok(grants)
    }

    #[tracing::instrument(skip(self, role_ids), fields(db.table = "entity_attribute_permissions", db.operation = "select"))]
    async fn attribute_permissions(
        &self,
        tenant_id: Uuid,
        composition_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<EntityAttributePermission>> {
        let grants = sqlx::query_as::<Postgres, EntityAttributePermission>(
            r#"
            SELECT * FROM entity_attribute_permissions
            WHERE tenant_id = $1 AND composition_id = $2 AND role_id = ANY($3)
              AND deleted_by IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(composition_id)
        .bind(role_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load attribute permissions"))?;

        Ok(grants)
    }

    #[tracing::instrument(skip(self), fields(db.table = "module_permissions", db.operation = "select"))]
    async fn role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> AppResult<RolePermissionSet> {
        let modules = sqlx::query_as::<Postgres, ModulePermission>(
            "SELECT * FROM module_permissions WHERE tenant_id = $1 AND role_id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load role module permissions"))?;

        let submodules = sqlx::query_as::<Postgres, SubModulePermission>(
            "SELECT * FROM submodule_permissions WHERE tenant_id = $1 AND role_id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load role submodule permissions"))?;

        let attributes = sqlx::query_as::<Postgres, EntityAttributePermission>(
            "SELECT * FROM entity_attribute_permissions WHERE tenant_id = $1 AND role_id = $2 AND deleted_by IS NULL",
        )
        .bind(tenant_id)
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load role attribute permissions"))?;

        Ok(RolePermissionSet {
            modules,
            submodules,
            attributes,
        })
    }

    #[tracing::instrument(skip(self, role, grants), fields(db.table = "user_roles", db.operation = "insert"))]
    async fn create_role(
        &self,
        role: &UserRole,
        grants: &RolePermissionSet,
    ) -> AppResult<UserRole> {
        let created =
            retry_on_contention("create_role", move || self.create_role_once(role, grants)).await?;

        tracing::info!(
            event_type = "role_created",
            role_id = %created.id(),
            tenant_id = %created.audit.tenant_id,
            module_grants = grants.modules.len(),
            "Role created with seeded permissions"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self, modules, submodules), fields(db.table = "module_permissions", db.operation = "upsert"))]
    async fn replace_role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        modules: &[ModulePermission],
        submodules: &[SubModulePermission],
    ) -> AppResult<()> {
        retry_on_contention("replace_role_permissions", move || {
            self.replace_role_permissions_once(modules, submodules)
        })
        .await?;

        tracing::info!(
            event_type = "role_permissions_changed",
            tenant_id = %tenant_id,
            role_id = %role_id,
            modules = modules.len(),
            submodules = submodules.len(),
            "Role permissions replaced"
        );

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "user_roles", db.operation = "update"))]
    async fn set_role_active(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        active: bool,
        actor: Uuid,
    ) -> AppResult<Option<UserRole>> {
        let role = sqlx::query_as::<Postgres, UserRole>(
            r#"
            UPDATE user_roles
            SET active = $3, updated_by = $4, updated_on = NOW(), version = version + 1
            WHERE tenant_id = $1 AND id = $2 AND deleted_by IS NULL
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(role_id)
        .bind(active)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update role status"))?;

        Ok(role)
    }
}
