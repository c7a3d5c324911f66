//! Migration engine.
//!
//! Drives one model against one managed schema: ensure the bookkeeping
//! tables, take the lease, then walk the model in dependency order with a
//! single unified pass that creates missing objects and migrates existing
//! ones. The recorded version moves only after every object has been
//! processed, so an interrupted run resumes from the old version and the
//! probe guards make the replayed statements no-ops.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{probe_holds, SchemaExecutor};
use crate::error::{MigrateError, Result};
use crate::lease::{LeaseGuard, LeaseManager, RetryPolicy};
use crate::model::object::{ObjectKind, SchemaObject, Statement};
use crate::model::PhysicalDataModel;

/// Engine tuning knobs, carried from configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Allow destructive steps to run against tables that hold rows.
    pub force: bool,
    /// Lease time-to-live.
    pub lease_ttl: std::time::Duration,
    /// Lease acquisition retry policy.
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            force: false,
            lease_ttl: std::time::Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// How one object was handled during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum ObjectOutcome {
    Created,
    Migrated,
    Unchanged,
}

/// Summary of one apply run, suitable for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub schema: String,
    /// Version found in the schema before the run, if any.
    pub prior_version: Option<i32>,
    /// Version recorded after the run.
    pub new_version: i32,
    pub objects_created: usize,
    pub objects_migrated: usize,
    pub objects_unchanged: usize,
    /// False when the lease row was no longer ours at release, meaning the
    /// lease expired mid-run and another instance took it over.
    pub lease_released: bool,
    pub elapsed_ms: u64,
}

impl ApplyResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Summary of one teardown run.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownResult {
    pub schema: String,
    pub objects_dropped: usize,
    pub lease_released: bool,
    pub elapsed_ms: u64,
}

impl TeardownResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Applies a [`PhysicalDataModel`] to a database through a
/// [`SchemaExecutor`].
pub struct MigrationEngine {
    executor: Arc<dyn SchemaExecutor>,
    lease: LeaseManager,
    admin_schema: String,
    force: bool,
}

impl MigrationEngine {
    pub fn new(
        executor: Arc<dyn SchemaExecutor>,
        admin_schema: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        let admin_schema = admin_schema.into();
        let lease = LeaseManager::new(
            Arc::clone(&executor),
            admin_schema.clone(),
            options.lease_ttl,
            options.retry,
        );
        Self {
            executor,
            lease,
            admin_schema,
            force: options.force,
        }
    }

    /// Create or migrate `schema` to match the model.
    ///
    /// Safe to re-run: objects already at the model's shape are left alone,
    /// and partially applied objects are completed by their probe-guarded
    /// statements.
    #[instrument(skip(self, model))]
    pub async fn apply(&self, model: &PhysicalDataModel, schema: &str) -> Result<ApplyResult> {
        let started = Instant::now();
        self.executor.ensure_control_table(&self.admin_schema).await?;
        self.executor.ensure_version_table(schema).await?;

        let order = model.compute_order()?;
        let mut guard = self.lease.acquire(schema).await?;

        let outcome = self.apply_under_lease(model, schema, &order, &mut guard).await;
        let release = guard.release().await;
        let (prior, counts) = outcome?;
        let lease_released = release?;

        let new_version = prior.unwrap_or(0).max(model.max_version());
        let result = ApplyResult {
            schema: schema.to_string(),
            prior_version: prior,
            new_version,
            objects_created: counts.0,
            objects_migrated: counts.1,
            objects_unchanged: counts.2,
            lease_released,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            schema,
            prior = ?result.prior_version,
            version = result.new_version,
            created = result.objects_created,
            migrated = result.objects_migrated,
            lease_released = result.lease_released,
            "apply complete"
        );
        Ok(result)
    }

    async fn apply_under_lease(
        &self,
        model: &PhysicalDataModel,
        schema: &str,
        order: &[&SchemaObject],
        guard: &mut LeaseGuard,
    ) -> Result<(Option<i32>, (usize, usize, usize))> {
        let prior = self.executor.read_version(schema).await?;
        let prior_vid = prior.unwrap_or(0);

        let mut created = 0usize;
        let mut migrated = 0usize;
        let mut unchanged = 0usize;

        for obj in order {
            guard.maybe_renew().await?;
            match self.apply_object(obj, prior_vid).await? {
                ObjectOutcome::Created => created += 1,
                ObjectOutcome::Migrated => migrated += 1,
                ObjectOutcome::Unchanged => unchanged += 1,
            }
        }

        let new_version = prior_vid.max(model.max_version());
        self.executor.update_version(schema, new_version).await?;
        Ok((prior, (created, migrated, unchanged)))
    }

    async fn apply_object(&self, obj: &SchemaObject, prior_vid: i32) -> Result<ObjectOutcome> {
        let id = obj.id();
        if matches!(id.kind, ObjectKind::Marker) {
            return Ok(ObjectOutcome::Unchanged);
        }

        if !self.executor.object_exists(id).await? {
            let statements = self
                .filter_statements(obj, self.executor.dialect().create_statements(obj))
                .await?;
            if statements.is_empty() {
                return Ok(ObjectOutcome::Unchanged);
            }
            debug!(object = %id.qualified_name(), "creating");
            self.executor.create_object(id, &statements).await?;
            return Ok(ObjectOutcome::Created);
        }

        if obj.version() > prior_vid {
            if let Some(steps) = obj.migration_steps(prior_vid) {
                let statements = self.filter_statements(obj, steps).await?;
                if statements.is_empty() {
                    return Ok(ObjectOutcome::Unchanged);
                }
                debug!(
                    object = %id.qualified_name(),
                    from = prior_vid,
                    to = obj.version(),
                    "migrating"
                );
                self.executor.apply_steps(id, &statements).await?;
                return Ok(ObjectOutcome::Migrated);
            }
            // An existing object newer than the recorded version with no
            // migration hook was created by this same run's resume.
            warn!(
                object = %id.qualified_name(),
                version = obj.version(),
                "object is ahead of recorded version and defines no migration"
            );
        }
        Ok(ObjectOutcome::Unchanged)
    }

    /// Drop probe-guarded statements whose guard no longer holds, and stop
    /// the run if a destructive statement would hit live data.
    async fn filter_statements(
        &self,
        obj: &SchemaObject,
        statements: Vec<Statement>,
    ) -> Result<Vec<Statement>> {
        let mut kept = Vec::with_capacity(statements.len());
        for stmt in statements {
            if let Some(probe) = &stmt.only_if {
                if !probe_holds(self.executor.as_ref(), probe).await? {
                    continue;
                }
            }
            if let Some((schema, table)) = &stmt.destructive_on {
                if !self.force && self.executor.table_has_data(schema, table).await? {
                    return Err(MigrateError::precheck(
                        obj.id().qualified_name(),
                        format!("destructive statement would run against {schema}.{table} which holds rows; re-run with force to proceed"),
                    ));
                }
            }
            kept.push(stmt);
        }
        Ok(kept)
    }

    /// Drop every model object from `schema`, children before parents, and
    /// clear the version record. Destructive by nature; still refuses to
    /// drop tables holding rows unless forced.
    #[instrument(skip(self, model))]
    pub async fn drop_all(
        &self,
        model: &PhysicalDataModel,
        schema: &str,
    ) -> Result<TeardownResult> {
        let started = Instant::now();
        self.executor.ensure_control_table(&self.admin_schema).await?;

        let order = model.compute_reverse_order()?;
        let mut guard = self.lease.acquire(schema).await?;
        let outcome = self.drop_under_lease(schema, &order, &mut guard).await;
        let release = guard.release().await;
        let dropped = outcome?;
        let lease_released = release?;

        Ok(TeardownResult {
            schema: schema.to_string(),
            objects_dropped: dropped,
            lease_released,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn drop_under_lease(
        &self,
        schema: &str,
        order: &[&SchemaObject],
        guard: &mut LeaseGuard,
    ) -> Result<usize> {
        let mut dropped = 0usize;
        for obj in order {
            guard.maybe_renew().await?;
            if matches!(obj.id().kind, ObjectKind::Marker) {
                continue;
            }
            if !self.executor.object_exists(obj.id()).await? {
                continue;
            }
            let statements = self
                .filter_statements(obj, self.executor.dialect().drop_statements(obj))
                .await?;
            if statements.is_empty() {
                continue;
            }
            debug!(object = %obj.id().qualified_name(), "dropping");
            self.executor.apply_steps(obj.id(), &statements).await?;
            dropped += 1;
        }
        self.executor.clear_version(schema).await?;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::model::object::{ObjectDef, ObjectId, Probe, SequenceDef};
    use crate::model::table::TableDef;

    const SCHEMA: &str = "FHIRDATA";

    fn options() -> EngineOptions {
        EngineOptions {
            force: false,
            lease_ttl: std::time::Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: std::time::Duration::from_millis(5),
                multiplier: 2.0,
            },
        }
    }

    fn engine(adapter: &Arc<MemoryAdapter>, force: bool) -> MigrationEngine {
        let executor: Arc<dyn SchemaExecutor> = Arc::clone(adapter) as _;
        MigrationEngine::new(
            executor,
            "fhir_admin",
            EngineOptions {
                force,
                ..options()
            },
        )
    }

    fn base_model() -> PhysicalDataModel {
        let mut model = PhysicalDataModel::new();
        let seq = model
            .add_object(SchemaObject::new(
                ObjectId::new(SCHEMA, "logical_resource_seq", ObjectKind::Sequence),
                1,
                ObjectDef::Sequence(SequenceDef {
                    start_with: 1,
                    increment_by: 1,
                    cache: 100,
                }),
            ))
            .unwrap();
        let table = model
            .add_object(SchemaObject::new(
                ObjectId::new(SCHEMA, "logical_resources", ObjectKind::Table),
                1,
                ObjectDef::Table(
                    TableDef::builder(SCHEMA, "logical_resources")
                        .add_int_column("mt_id", false)
                        .add_bigint_column("logical_resource_id", false)
                        .add_primary_key("logical_resources_pk", &["logical_resource_id"])
                        .build(),
                ),
            ))
            .unwrap();
        model.add_dependency(table, seq);
        model
    }

    /// Same shape plus a version-2 column added via a guarded migration.
    fn v2_model() -> PhysicalDataModel {
        let mut model = PhysicalDataModel::new();
        let seq = model
            .add_object(SchemaObject::new(
                ObjectId::new(SCHEMA, "logical_resource_seq", ObjectKind::Sequence),
                1,
                ObjectDef::Sequence(SequenceDef {
                    start_with: 1,
                    increment_by: 1,
                    cache: 100,
                }),
            ))
            .unwrap();
        let table = model
            .add_object(
                SchemaObject::new(
                    ObjectId::new(SCHEMA, "logical_resources", ObjectKind::Table),
                    2,
                    ObjectDef::Table(
                        TableDef::builder(SCHEMA, "logical_resources")
                            .add_int_column("mt_id", false)
                            .add_bigint_column("logical_resource_id", false)
                            .add_varchar_column("reindex_txid", 32, true)
                            .add_primary_key("logical_resources_pk", &["logical_resource_id"])
                            .build(),
                    ),
                )
                .with_migration(|prior| {
                    let mut steps = Vec::new();
                    if prior < 2 {
                        steps.push(
                            Statement::new(
                                "ALTER TABLE \"FHIRDATA\".\"logical_resources\" \
                                 ADD COLUMN \"reindex_txid\" VARCHAR(32)",
                            )
                            .only_if(Probe::ColumnMissing {
                                schema: SCHEMA.into(),
                                table: "logical_resources".into(),
                                column: "reindex_txid".into(),
                            }),
                        );
                    }
                    steps
                }),
            )
            .unwrap();
        model.add_dependency(table, seq);
        model
    }

    #[tokio::test]
    async fn test_fresh_apply_creates_everything() {
        let adapter = Arc::new(MemoryAdapter::new());
        let result = engine(&adapter, false)
            .apply(&base_model(), SCHEMA)
            .await
            .unwrap();

        assert_eq!(result.prior_version, None);
        assert_eq!(result.new_version, 1);
        assert_eq!(result.objects_created, 2);
        assert_eq!(result.objects_migrated, 0);
        assert!(result.lease_released);
        assert_eq!(adapter.read_version(SCHEMA).await.unwrap(), Some(1));
        assert!(adapter
            .object_exists(&ObjectId::new(SCHEMA, "logical_resources", ObjectKind::Table))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_second_apply_is_a_no_op() {
        let adapter = Arc::new(MemoryAdapter::new());
        let model = base_model();
        engine(&adapter, false).apply(&model, SCHEMA).await.unwrap();
        let sql_after_first = adapter.executed_sql();

        let result = engine(&adapter, false).apply(&model, SCHEMA).await.unwrap();
        assert_eq!(result.objects_created, 0);
        assert_eq!(result.objects_migrated, 0);
        assert_eq!(adapter.executed_sql(), sql_after_first);
    }

    #[tokio::test]
    async fn test_upgrade_applies_only_the_delta() {
        let adapter = Arc::new(MemoryAdapter::new());
        engine(&adapter, false)
            .apply(&base_model(), SCHEMA)
            .await
            .unwrap();

        let result = engine(&adapter, false)
            .apply(&v2_model(), SCHEMA)
            .await
            .unwrap();
        assert_eq!(result.prior_version, Some(1));
        assert_eq!(result.new_version, 2);
        assert_eq!(result.objects_migrated, 1);
        assert!(adapter
            .column_exists(SCHEMA, "logical_resources", "reindex_txid")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_upgrade_is_idempotent() {
        let adapter = Arc::new(MemoryAdapter::new());
        engine(&adapter, false)
            .apply(&base_model(), SCHEMA)
            .await
            .unwrap();
        let model = v2_model();
        engine(&adapter, false).apply(&model, SCHEMA).await.unwrap();
        let sql_after_upgrade = adapter.executed_sql();

        let result = engine(&adapter, false).apply(&model, SCHEMA).await.unwrap();
        assert_eq!(result.objects_migrated, 0);
        assert_eq!(adapter.executed_sql(), sql_after_upgrade);
    }

    /// A step applied out-of-band (or by a crashed run) is observed by its
    /// probe and skipped, so the re-run converges instead of failing.
    #[tokio::test]
    async fn test_partially_applied_migration_resumes_cleanly() {
        let adapter = Arc::new(MemoryAdapter::new());
        engine(&adapter, false)
            .apply(&base_model(), SCHEMA)
            .await
            .unwrap();
        adapter.mark_column(SCHEMA, "logical_resources", "reindex_txid");

        let result = engine(&adapter, false)
            .apply(&v2_model(), SCHEMA)
            .await
            .unwrap();
        assert_eq!(result.objects_migrated, 0);
        assert_eq!(result.new_version, 2);
        assert!(!adapter
            .executed_sql()
            .iter()
            .any(|s| s.contains("reindex_txid")));
    }

    #[tokio::test]
    async fn test_version_never_moves_backwards() {
        let adapter = Arc::new(MemoryAdapter::new());
        engine(&adapter, false)
            .apply(&v2_model(), SCHEMA)
            .await
            .unwrap();

        // Running an older model leaves the recorded version alone.
        let result = engine(&adapter, false)
            .apply(&base_model(), SCHEMA)
            .await
            .unwrap();
        assert_eq!(result.new_version, 2);
        assert_eq!(adapter.read_version(SCHEMA).await.unwrap(), Some(2));
    }

    fn destructive_model() -> PhysicalDataModel {
        let mut model = PhysicalDataModel::new();
        model
            .add_object(
                SchemaObject::new(
                    ObjectId::new(SCHEMA, "parameters", ObjectKind::Table),
                    2,
                    ObjectDef::Table(
                        TableDef::builder(SCHEMA, "parameters")
                            .add_bigint_column("parameter_id", false)
                            .build(),
                    ),
                )
                .with_migration(|prior| {
                    if prior < 2 {
                        vec![Statement::new(
                            "ALTER TABLE \"FHIRDATA\".\"parameters\" DROP COLUMN \"str_value\"",
                        )
                        .destructive_on(SCHEMA, "parameters")]
                    } else {
                        vec![]
                    }
                }),
            )
            .unwrap();
        model
    }

    #[tokio::test]
    async fn test_destructive_step_blocked_when_table_has_rows() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.mark_object(ObjectId::new(SCHEMA, "parameters", ObjectKind::Table));
        adapter.update_version(SCHEMA, 1).await.unwrap();
        adapter.seed_table_data(SCHEMA, "parameters");

        let err = engine(&adapter, false)
            .apply(&destructive_model(), SCHEMA)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::PrecheckFailed { .. }));
        // The failed run must not have bumped the version.
        assert_eq!(adapter.read_version(SCHEMA).await.unwrap(), Some(1));
        // And must not have left the lease behind.
        assert!(adapter
            .read_lease("fhir_admin", SCHEMA)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_destructive_step_runs_with_force() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.mark_object(ObjectId::new(SCHEMA, "parameters", ObjectKind::Table));
        adapter.update_version(SCHEMA, 1).await.unwrap();
        adapter.seed_table_data(SCHEMA, "parameters");

        let result = engine(&adapter, true)
            .apply(&destructive_model(), SCHEMA)
            .await
            .unwrap();
        assert_eq!(result.objects_migrated, 1);
        assert_eq!(adapter.read_version(SCHEMA).await.unwrap(), Some(2));
    }

    /// A crashed run can create an object and die before recording the
    /// version. The re-run finds the object ahead of the recorded version
    /// with no migration hook; it is left alone rather than failing, so
    /// the run converges and records the model version.
    #[tokio::test]
    async fn test_existing_object_ahead_of_version_without_hook_is_left_alone() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.mark_object(ObjectId::new(SCHEMA, "parameters", ObjectKind::Table));
        adapter.update_version(SCHEMA, 1).await.unwrap();

        let mut model = PhysicalDataModel::new();
        model
            .add_object(SchemaObject::new(
                ObjectId::new(SCHEMA, "parameters", ObjectKind::Table),
                2,
                ObjectDef::Table(
                    TableDef::builder(SCHEMA, "parameters")
                        .add_bigint_column("parameter_id", false)
                        .build(),
                ),
            ))
            .unwrap();

        let result = engine(&adapter, false).apply(&model, SCHEMA).await.unwrap();
        assert_eq!(result.objects_unchanged, 1);
        assert_eq!(result.objects_migrated, 0);
        assert!(adapter.executed_sql().is_empty());
        assert_eq!(result.new_version, 2);
    }

    #[tokio::test]
    async fn test_apply_reports_unreleased_lease_after_takeover() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.mark_object(ObjectId::new(SCHEMA, "parameters", ObjectKind::Table));
        adapter.update_version(SCHEMA, 1).await.unwrap();

        // The migration hook hands the lease row to a rival mid-run, the
        // way an expiry and takeover would.
        let rival = Arc::clone(&adapter);
        let mut model = PhysicalDataModel::new();
        model
            .add_object(
                SchemaObject::new(
                    ObjectId::new(SCHEMA, "parameters", ObjectKind::Table),
                    2,
                    ObjectDef::Table(
                        TableDef::builder(SCHEMA, "parameters")
                            .add_bigint_column("parameter_id", false)
                            .build(),
                    ),
                )
                .with_migration(move |prior| {
                    rival.usurp_lease(SCHEMA);
                    if prior < 2 {
                        vec![Statement::new(
                            "ALTER TABLE \"FHIRDATA\".\"parameters\" \
                             ADD COLUMN \"resource_id\" BIGINT",
                        )]
                    } else {
                        vec![]
                    }
                }),
            )
            .unwrap();

        let result = engine(&adapter, false).apply(&model, SCHEMA).await.unwrap();
        assert_eq!(result.objects_migrated, 1);
        assert!(!result.lease_released);
    }

    #[tokio::test]
    async fn test_drop_all_reverses_and_clears_version() {
        let adapter = Arc::new(MemoryAdapter::new());
        let model = base_model();
        engine(&adapter, false).apply(&model, SCHEMA).await.unwrap();

        let result = engine(&adapter, true).drop_all(&model, SCHEMA).await.unwrap();
        assert_eq!(result.objects_dropped, 2);
        assert!(result.lease_released);
        assert_eq!(adapter.read_version(SCHEMA).await.unwrap(), None);

        let sql = adapter.executed_sql();
        let drop_table = sql
            .iter()
            .position(|s| s.starts_with("DROP TABLE"))
            .unwrap();
        let drop_seq = sql
            .iter()
            .position(|s| s.starts_with("DROP SEQUENCE"))
            .unwrap();
        assert!(drop_table < drop_seq);
    }
}
