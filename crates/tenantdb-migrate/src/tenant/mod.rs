//! Tenant lifecycle and session context.
//!
//! Tenants move through a fixed status ladder: provisioning, active,
//! frozen, dropped (with free as a reuse state for abandoned ids). Every
//! mutating operation validates the current status first, so a crashed
//! provision run cannot be frozen and a live tenant cannot be dropped
//! without freezing it first.
//!
//! Keys are rotated by issuing a new key and revoking the old one; both
//! can coexist while clients switch over.

pub mod keys;

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::adapter::{SchemaExecutor, TenantRecord, TenantStatus};
use crate::error::{MigrateError, Result};
use crate::model::PhysicalDataModel;

/// Outcome of provisioning: the tenant row plus the one-time secret.
#[derive(Debug)]
pub struct ProvisionedTenant {
    pub record: TenantRecord,
    pub key_id: i64,
    /// Returned exactly once; only its salted hash is stored.
    pub secret: String,
}

/// Manages tenant rows, keys, partitions and the session tenant variable.
pub struct TenantManager {
    executor: Arc<dyn SchemaExecutor>,
    admin_schema: String,
}

impl TenantManager {
    pub fn new(executor: Arc<dyn SchemaExecutor>, admin_schema: impl Into<String>) -> Self {
        Self {
            executor,
            admin_schema: admin_schema.into(),
        }
    }

    async fn tenant(&self, tenant_id: i64) -> Result<TenantRecord> {
        self.executor
            .get_tenant(&self.admin_schema, tenant_id)
            .await?
            .ok_or_else(|| MigrateError::TenantNotFound(tenant_id.to_string()))
    }

    fn require_status(
        record: &TenantRecord,
        expected: TenantStatus,
        action: &str,
    ) -> Result<()> {
        if record.status == expected {
            Ok(())
        } else {
            Err(MigrateError::TenantState {
                tenant: record.tenant_name.clone(),
                status: record.status.to_string(),
                message: format!("cannot {action}; tenant must be {expected}"),
            })
        }
    }

    /// Provision a new tenant: allocate an id, create a partition on every
    /// tenant-partitioned table in the model, issue the first key, then
    /// mark the tenant active.
    ///
    /// The row stays in `provisioning` until the last partition exists, so
    /// an interrupted run is visible and can be re-driven: calling
    /// `provision` again with the same name resumes the stuck row, reusing
    /// its id and skipping partitions that already exist. A name whose row
    /// is past `provisioning` is a real duplicate and is rejected.
    #[instrument(skip(self, model))]
    pub async fn provision(
        &self,
        model: &PhysicalDataModel,
        tenant_name: &str,
    ) -> Result<ProvisionedTenant> {
        let tenant_id = match self
            .executor
            .get_tenant_by_name(&self.admin_schema, tenant_name)
            .await?
        {
            Some(existing) if existing.status == TenantStatus::Provisioning => {
                info!(
                    tenant = tenant_name,
                    tenant_id = existing.tenant_id,
                    "resuming interrupted provisioning"
                );
                existing.tenant_id
            }
            Some(_) => return Err(MigrateError::DuplicateTenant(tenant_name.to_string())),
            None => {
                let tenant_id = self.executor.allocate_tenant_id(&self.admin_schema).await?;
                let record = TenantRecord {
                    tenant_id,
                    tenant_name: tenant_name.to_string(),
                    status: TenantStatus::Provisioning,
                };
                self.executor
                    .insert_tenant(&self.admin_schema, &record)
                    .await?;
                tenant_id
            }
        };

        for table in model.tenant_tables() {
            self.executor
                .create_tenant_partition(&table.schema, &table.name, tenant_id)
                .await?;
        }

        // A key issued by an interrupted run was never returned to anyone,
        // so a resumed provision issues a fresh one either way.
        let (key_id, secret) = self.issue_key_unchecked(tenant_id).await?;

        self.executor
            .update_tenant_status(&self.admin_schema, tenant_id, TenantStatus::Active)
            .await?;
        info!(tenant = tenant_name, tenant_id, "tenant provisioned");

        Ok(ProvisionedTenant {
            record: TenantRecord {
                tenant_id,
                tenant_name: tenant_name.to_string(),
                status: TenantStatus::Active,
            },
            key_id,
            secret,
        })
    }

    async fn issue_key_unchecked(&self, tenant_id: i64) -> Result<(i64, String)> {
        let secret = keys::generate_secret();
        let salt = keys::generate_salt();
        let hash = keys::hash_secret(&salt, &secret);
        let key_id = self
            .executor
            .insert_tenant_key(&self.admin_schema, tenant_id, &salt, &hash)
            .await?;
        Ok((key_id, secret))
    }

    /// Issue an additional key for an active tenant. Part one of rotation.
    pub async fn issue_key(&self, tenant_id: i64) -> Result<(i64, String)> {
        let record = self.tenant(tenant_id).await?;
        Self::require_status(&record, TenantStatus::Active, "issue a key")?;
        let issued = self.issue_key_unchecked(tenant_id).await?;
        info!(tenant = %record.tenant_name, key_id = issued.0, "tenant key issued");
        Ok(issued)
    }

    /// Revoke one key. Part two of rotation. Returns false if the key did
    /// not exist.
    pub async fn revoke_key(&self, tenant_id: i64, key_id: i64) -> Result<bool> {
        let record = self.tenant(tenant_id).await?;
        let revoked = self
            .executor
            .delete_tenant_key(&self.admin_schema, tenant_id, key_id)
            .await?;
        if revoked {
            info!(tenant = %record.tenant_name, key_id, "tenant key revoked");
        } else {
            warn!(tenant = %record.tenant_name, key_id, "tenant key not found at revoke");
        }
        Ok(revoked)
    }

    /// Resolve a tenant name and secret to the tenant id, without touching
    /// session state. Any non-active tenant fails, as does a secret that
    /// matches none of the tenant's keys.
    pub async fn authenticate(&self, tenant_name: &str, secret: &str) -> Result<i64> {
        let record = self
            .executor
            .get_tenant_by_name(&self.admin_schema, tenant_name)
            .await?
            .ok_or_else(|| MigrateError::TenantNotFound(tenant_name.to_string()))?;
        Self::require_status(&record, TenantStatus::Active, "authenticate")?;

        let key_rows = self
            .executor
            .list_tenant_keys(&self.admin_schema, record.tenant_id)
            .await?;
        for key in &key_rows {
            if keys::hash_secret(&key.salt, secret) == key.hash {
                return Ok(record.tenant_id);
            }
        }
        Err(MigrateError::TenantState {
            tenant: tenant_name.to_string(),
            status: record.status.to_string(),
            message: "tenant key not recognized".into(),
        })
    }

    /// Authenticate and bind the tenant to the current session, so
    /// row-level predicates on the session variable see this tenant's
    /// partitions only.
    pub async fn set_tenant_context(&self, tenant_name: &str, secret: &str) -> Result<i64> {
        let tenant_id = self.authenticate(tenant_name, secret).await?;
        self.executor
            .set_session_tenant(&self.admin_schema, tenant_id)
            .await?;
        Ok(tenant_id)
    }

    /// Block writes for maintenance. Only active tenants can be frozen.
    pub async fn freeze(&self, tenant_id: i64) -> Result<()> {
        let record = self.tenant(tenant_id).await?;
        Self::require_status(&record, TenantStatus::Active, "freeze")?;
        self.executor
            .update_tenant_status(&self.admin_schema, tenant_id, TenantStatus::Frozen)
            .await?;
        info!(tenant = %record.tenant_name, "tenant frozen");
        Ok(())
    }

    /// Resume a frozen tenant.
    pub async fn unfreeze(&self, tenant_id: i64) -> Result<()> {
        let record = self.tenant(tenant_id).await?;
        Self::require_status(&record, TenantStatus::Frozen, "unfreeze")?;
        self.executor
            .update_tenant_status(&self.admin_schema, tenant_id, TenantStatus::Active)
            .await?;
        info!(tenant = %record.tenant_name, "tenant unfrozen");
        Ok(())
    }

    /// Remove a tenant's partitions and mark the row dropped. The tenant
    /// must be frozen first; the row itself is retained so the id is never
    /// reused for a different tenant.
    ///
    /// Partitions go child-first with the enforced foreign keys disabled
    /// for the duration, so dropping a referenced partition cannot trip a
    /// constraint mid-way.
    #[instrument(skip(self, model))]
    pub async fn drop_tenant(&self, model: &PhysicalDataModel, tenant_id: i64) -> Result<()> {
        let record = self.tenant(tenant_id).await?;
        Self::require_status(&record, TenantStatus::Frozen, "drop")?;

        self.with_foreign_keys_disabled(model, || async {
            for table in model.tenant_tables().into_iter().rev() {
                self.executor
                    .drop_tenant_partition(&table.schema, &table.name, tenant_id)
                    .await?;
            }
            Ok(())
        })
        .await?;
        self.executor
            .update_tenant_status(&self.admin_schema, tenant_id, TenantStatus::Dropped)
            .await?;
        info!(tenant = %record.tenant_name, "tenant dropped");
        Ok(())
    }

    /// Run a bulk operation with every enforced foreign key on the model's
    /// tenant tables disabled, re-enabling them afterwards on both the
    /// success and the failure path.
    pub async fn with_foreign_keys_disabled<F, Fut, T>(
        &self,
        model: &PhysicalDataModel,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let constraints: Vec<(String, String, String)> = model
            .tenant_tables()
            .into_iter()
            .flat_map(|t| {
                t.enforced_foreign_keys()
                    .map(|fk| (t.schema.clone(), t.name.clone(), fk.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        // Only constraints actually disabled get re-enabled below; a
        // failure part-way through the disable loop must not leave the
        // earlier ones off.
        let mut disabled: Vec<&(String, String, String)> = Vec::new();
        let mut disable_failure = None;
        for entry in &constraints {
            let (schema, table, constraint) = entry;
            match self
                .executor
                .set_fk_enforced(schema, table, constraint, false)
                .await
            {
                Ok(()) => disabled.push(entry),
                Err(e) => {
                    disable_failure = Some(e);
                    break;
                }
            }
        }

        let result = match disable_failure {
            None => op().await,
            Some(e) => Err(e),
        };

        let mut reenable_failure = None;
        for (schema, table, constraint) in disabled {
            if let Err(e) = self
                .executor
                .set_fk_enforced(schema, table, constraint, true)
                .await
            {
                error!(
                    constraint = %format!("{schema}.{table}.{constraint}"),
                    error = %e,
                    "failed to re-enable foreign key"
                );
                reenable_failure.get_or_insert(e);
            }
        }

        match (result, reenable_failure) {
            (Ok(value), None) => Ok(value),
            (Ok(_), Some(e)) => Err(e),
            // The operation's own error takes precedence.
            (Err(e), _) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::model::object::{ObjectDef, ObjectId, ObjectKind, SchemaObject};
    use crate::model::table::TableDef;

    const SCHEMA: &str = "FHIRDATA";

    fn tenant_model() -> PhysicalDataModel {
        let mut model = PhysicalDataModel::new();
        let parent = model
            .add_object(SchemaObject::new(
                ObjectId::new(SCHEMA, "logical_resources", ObjectKind::Table),
                1,
                ObjectDef::Table(
                    TableDef::builder(SCHEMA, "logical_resources")
                        .add_int_column("mt_id", false)
                        .add_bigint_column("logical_resource_id", false)
                        .add_primary_key("lr_pk", &["mt_id", "logical_resource_id"])
                        .tenant_column("mt_id")
                        .build(),
                ),
            ))
            .unwrap();
        let child = model
            .add_object(SchemaObject::new(
                ObjectId::new(SCHEMA, "str_values", ObjectKind::Table),
                1,
                ObjectDef::Table(
                    TableDef::builder(SCHEMA, "str_values")
                        .add_int_column("mt_id", false)
                        .add_bigint_column("logical_resource_id", false)
                        .add_foreign_key(
                            "str_values_lr_fk",
                            &["mt_id", "logical_resource_id"],
                            SCHEMA,
                            "logical_resources",
                            &["mt_id", "logical_resource_id"],
                            true,
                        )
                        .tenant_column("mt_id")
                        .build(),
                ),
            ))
            .unwrap();
        model.add_dependency(child, parent);
        model
    }

    fn two_child_model() -> PhysicalDataModel {
        let mut model = tenant_model();
        model
            .add_object(SchemaObject::new(
                ObjectId::new(SCHEMA, "token_values", ObjectKind::Table),
                1,
                ObjectDef::Table(
                    TableDef::builder(SCHEMA, "token_values")
                        .add_int_column("mt_id", false)
                        .add_bigint_column("logical_resource_id", false)
                        .add_foreign_key(
                            "token_values_lr_fk",
                            &["mt_id", "logical_resource_id"],
                            SCHEMA,
                            "logical_resources",
                            &["mt_id", "logical_resource_id"],
                            true,
                        )
                        .tenant_column("mt_id")
                        .build(),
                ),
            ))
            .unwrap();
        model
    }

    fn manager(adapter: &Arc<MemoryAdapter>) -> TenantManager {
        TenantManager::new(Arc::clone(adapter) as Arc<dyn SchemaExecutor>, "fhir_admin")
    }

    #[tokio::test]
    async fn test_provision_creates_partitions_and_activates() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = tenant_model();

        let provisioned = mgr.provision(&model, "acme").await.unwrap();
        assert_eq!(provisioned.record.status, TenantStatus::Active);
        assert!(!provisioned.secret.is_empty());
        let id = provisioned.record.tenant_id;
        assert_eq!(adapter.partitions_for(SCHEMA, "logical_resources"), vec![id]);
        assert_eq!(adapter.partitions_for(SCHEMA, "str_values"), vec![id]);
    }

    #[tokio::test]
    async fn test_provision_resumes_interrupted_run() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = tenant_model();

        // A crashed run left the row in provisioning with one of two
        // partitions in place.
        let id = adapter.allocate_tenant_id("fhir_admin").await.unwrap();
        adapter
            .insert_tenant(
                "fhir_admin",
                &TenantRecord {
                    tenant_id: id,
                    tenant_name: "acme".into(),
                    status: TenantStatus::Provisioning,
                },
            )
            .await
            .unwrap();
        adapter
            .create_tenant_partition(SCHEMA, "logical_resources", id)
            .await
            .unwrap();

        let provisioned = mgr.provision(&model, "acme").await.unwrap();
        assert_eq!(provisioned.record.tenant_id, id);
        assert_eq!(provisioned.record.status, TenantStatus::Active);
        assert_eq!(adapter.partitions_for(SCHEMA, "logical_resources"), vec![id]);
        assert_eq!(adapter.partitions_for(SCHEMA, "str_values"), vec![id]);
        assert!(mgr.authenticate("acme", &provisioned.secret).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_tenant_name_rejected() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = tenant_model();
        mgr.provision(&model, "acme").await.unwrap();
        assert!(matches!(
            mgr.provision(&model, "acme").await,
            Err(MigrateError::DuplicateTenant(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_and_session_context() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let provisioned = mgr.provision(&tenant_model(), "acme").await.unwrap();

        let id = mgr
            .set_tenant_context("acme", &provisioned.secret)
            .await
            .unwrap();
        assert_eq!(id, provisioned.record.tenant_id);
        assert_eq!(adapter.session_tenant(), Some(id));

        assert!(mgr.authenticate("acme", "not-the-secret").await.is_err());
        assert!(matches!(
            mgr.authenticate("nobody", &provisioned.secret).await,
            Err(MigrateError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_key_rotation() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let provisioned = mgr.provision(&tenant_model(), "acme").await.unwrap();
        let tenant_id = provisioned.record.tenant_id;

        let (new_key_id, new_secret) = mgr.issue_key(tenant_id).await.unwrap();
        // Both keys work during the switchover window.
        assert!(mgr.authenticate("acme", &provisioned.secret).await.is_ok());
        assert!(mgr.authenticate("acme", &new_secret).await.is_ok());

        assert!(mgr.revoke_key(tenant_id, provisioned.key_id).await.unwrap());
        assert!(mgr.authenticate("acme", &provisioned.secret).await.is_err());
        assert!(mgr.authenticate("acme", &new_secret).await.is_ok());

        assert_ne!(new_key_id, provisioned.key_id);
    }

    #[tokio::test]
    async fn test_status_ladder() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = tenant_model();
        let provisioned = mgr.provision(&model, "acme").await.unwrap();
        let id = provisioned.record.tenant_id;

        // Cannot drop an active tenant.
        assert!(matches!(
            mgr.drop_tenant(&model, id).await,
            Err(MigrateError::TenantState { .. })
        ));

        mgr.freeze(id).await.unwrap();
        // Frozen tenants do not authenticate.
        assert!(mgr.authenticate("acme", &provisioned.secret).await.is_err());
        // Freezing twice is a status error.
        assert!(mgr.freeze(id).await.is_err());

        mgr.unfreeze(id).await.unwrap();
        mgr.freeze(id).await.unwrap();
        mgr.drop_tenant(&model, id).await.unwrap();

        assert!(adapter.partitions_for(SCHEMA, "logical_resources").is_empty());
        let record = adapter.get_tenant("fhir_admin", id).await.unwrap().unwrap();
        assert_eq!(record.status, TenantStatus::Dropped);
    }

    #[tokio::test]
    async fn test_fk_bracket_restores_on_success_and_failure() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = tenant_model();

        let out = mgr
            .with_foreign_keys_disabled(&model, || async {
                let enforced = adapter
                    .fk_is_enforced(SCHEMA, "str_values", "str_values_lr_fk")
                    .await?;
                assert!(!enforced);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert!(adapter
            .fk_is_enforced(SCHEMA, "str_values", "str_values_lr_fk")
            .await
            .unwrap());

        let err = mgr
            .with_foreign_keys_disabled(&model, || async {
                Err::<(), _>(MigrateError::Config("load failed".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
        // Re-enabled even though the operation failed.
        assert!(adapter
            .fk_is_enforced(SCHEMA, "str_values", "str_values_lr_fk")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fk_bracket_reverts_partial_disable() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = two_child_model();
        adapter.fail_fk_toggle(SCHEMA, "token_values", "token_values_lr_fk");

        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = mgr
            .with_foreign_keys_disabled(&model, || async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Sql { .. }));
        // The operation never ran and the constraint disabled before the
        // failure is back on.
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(adapter
            .fk_is_enforced(SCHEMA, "str_values", "str_values_lr_fk")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_drop_tenant_drops_children_first_with_fks_bracketed() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = tenant_model();
        let provisioned = mgr.provision(&model, "acme").await.unwrap();
        let id = provisioned.record.tenant_id;
        mgr.freeze(id).await.unwrap();
        mgr.drop_tenant(&model, id).await.unwrap();

        let sql = adapter.executed_sql();
        let child = sql
            .iter()
            .position(|s| s == &format!("DROP TABLE {SCHEMA}.str_values_t{id}"))
            .unwrap();
        let parent = sql
            .iter()
            .position(|s| s == &format!("DROP TABLE {SCHEMA}.logical_resources_t{id}"))
            .unwrap();
        assert!(child < parent);
        assert!(adapter
            .fk_is_enforced(SCHEMA, "str_values", "str_values_lr_fk")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_drop_tenant_keeps_partitions_when_fk_disable_fails() {
        let adapter = Arc::new(MemoryAdapter::new());
        let mgr = manager(&adapter);
        let model = tenant_model();
        let provisioned = mgr.provision(&model, "acme").await.unwrap();
        let id = provisioned.record.tenant_id;
        mgr.freeze(id).await.unwrap();
        adapter.fail_fk_toggle(SCHEMA, "str_values", "str_values_lr_fk");

        assert!(mgr.drop_tenant(&model, id).await.is_err());
        assert_eq!(adapter.partitions_for(SCHEMA, "str_values"), vec![id]);
        assert_eq!(adapter.partitions_for(SCHEMA, "logical_resources"), vec![id]);
        let record = adapter.get_tenant("fhir_admin", id).await.unwrap().unwrap();
        assert_eq!(record.status, TenantStatus::Frozen);
    }
}
