//! In-memory executor for tests and dry runs.
//!
//! Keeps the whole "database" in a mutex-guarded struct: catalog objects,
//! control/lease rows, version records, tenants, keys and partitions.
//! Applied SQL is recorded verbatim so tests and `--dry-run` can inspect
//! what a real run would have executed.
//!
//! A statement's probe guard doubles as its recorded effect: applying a
//! step guarded by `ColumnMissing` marks the column present, so re-running
//! the same step observes the column and skips it, mirroring how the live
//! catalog behaves.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::model::object::{ObjectId, Probe, Statement};

use super::{
    Lease, PgDialect, SchemaExecutor, SqlDialect, TenantKeyRecord, TenantRecord, TenantStatus,
};

#[derive(Default)]
struct MemoryState {
    objects: BTreeSet<ObjectId>,
    columns: BTreeSet<(String, String, String)>,
    tables_with_data: BTreeSet<(String, String)>,
    executed: Vec<String>,
    versions: HashMap<String, i32>,
    control: HashMap<String, Lease>,
    tenants: BTreeMap<i64, TenantRecord>,
    keys: Vec<TenantKeyRecord>,
    partitions: BTreeSet<(String, String, i64)>,
    fk_enforced: BTreeMap<(String, String, String), bool>,
    fk_toggle_failures: BTreeSet<(String, String, String)>,
    session_tenant: Option<i64>,
    next_tenant_id: i64,
    next_key_id: i64,
}

/// In-memory [`SchemaExecutor`].
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    dialect: PgDialect,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            dialect: PgDialect::new(),
        }
    }

    /// All SQL applied so far, in order.
    pub fn executed_sql(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Mark a table as holding rows, for precheck tests.
    pub fn seed_table_data(&self, schema: &str, table: &str) {
        self.state
            .lock()
            .unwrap()
            .tables_with_data
            .insert((schema.to_string(), table.to_string()));
    }

    /// Mark a column present, simulating an out-of-band or partial apply.
    pub fn mark_column(&self, schema: &str, table: &str, column: &str) {
        self.state.lock().unwrap().columns.insert((
            schema.to_string(),
            table.to_string(),
            column.to_string(),
        ));
    }

    /// Mark an object present without going through `create_object`.
    pub fn mark_object(&self, id: ObjectId) {
        self.state.lock().unwrap().objects.insert(id);
    }

    /// Make every toggle of the given constraint fail, for tests exercising
    /// the foreign-key bracket's failure paths.
    pub fn fail_fk_toggle(&self, schema: &str, table: &str, constraint: &str) {
        self.state.lock().unwrap().fk_toggle_failures.insert((
            schema.to_string(),
            table.to_string(),
            constraint.to_string(),
        ));
    }

    /// Hand a held lease to a different owner, simulating an expiry and
    /// takeover while the original holder is still working.
    pub fn usurp_lease(&self, schema: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(lease) = state.control.get_mut(schema) {
            lease.owner_id = Uuid::new_v4();
            lease.owner_host = "rival-host".into();
            lease.lease_until = Utc::now() + chrono::Duration::seconds(60);
        }
    }

    /// The tenant id currently set on the session, if any.
    pub fn session_tenant(&self) -> Option<i64> {
        self.state.lock().unwrap().session_tenant
    }

    /// Partitions existing for the given table.
    pub fn partitions_for(&self, schema: &str, table: &str) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .partitions
            .iter()
            .filter(|(s, t, _)| s == schema && t == table)
            .map(|(_, _, id)| *id)
            .collect()
    }

    fn record_effect(state: &mut MemoryState, stmt: &Statement) {
        state.executed.push(stmt.sql.clone());
        match &stmt.only_if {
            Some(Probe::ObjectMissing(id)) => {
                state.objects.insert(id.clone());
            }
            Some(Probe::ColumnMissing {
                schema,
                table,
                column,
            }) => {
                state
                    .columns
                    .insert((schema.clone(), table.clone(), column.clone()));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SchemaExecutor for MemoryAdapter {
    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn create_object(&self, id: &ObjectId, statements: &[Statement]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for stmt in statements {
            Self::record_effect(&mut state, stmt);
        }
        state.objects.insert(id.clone());
        Ok(())
    }

    async fn apply_steps(&self, _id: &ObjectId, statements: &[Statement]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for stmt in statements {
            Self::record_effect(&mut state, stmt);
        }
        Ok(())
    }

    async fn object_exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.state.lock().unwrap().objects.contains(id))
    }

    async fn column_exists(&self, schema: &str, table: &str, column: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().columns.contains(&(
            schema.to_string(),
            table.to_string(),
            column.to_string(),
        )))
    }

    async fn table_has_data(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables_with_data
            .contains(&(schema.to_string(), table.to_string())))
    }

    async fn ensure_control_table(&self, _admin_schema: &str) -> Result<()> {
        Ok(())
    }

    async fn ensure_version_table(&self, _schema: &str) -> Result<()> {
        Ok(())
    }

    async fn read_version(&self, schema: &str) -> Result<Option<i32>> {
        Ok(self.state.lock().unwrap().versions.get(schema).copied())
    }

    async fn update_version(&self, schema: &str, version: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.versions.entry(schema.to_string()).or_insert(version);
        // Monotonically non-decreasing.
        if *entry < version {
            *entry = version;
        }
        Ok(())
    }

    async fn clear_version(&self, schema: &str) -> Result<()> {
        self.state.lock().unwrap().versions.remove(schema);
        Ok(())
    }

    async fn try_insert_lease(&self, _admin_schema: &str, lease: &Lease) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.control.contains_key(&lease.schema_name) {
            return Ok(false);
        }
        state.control.insert(lease.schema_name.clone(), lease.clone());
        Ok(true)
    }

    async fn try_takeover_lease(&self, _admin_schema: &str, lease: &Lease) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.control.get(&lease.schema_name) {
            None => {
                state.control.insert(lease.schema_name.clone(), lease.clone());
                Ok(true)
            }
            Some(existing) => {
                if existing.is_expired_at(Utc::now()) || existing.owner_id == lease.owner_id {
                    state.control.insert(lease.schema_name.clone(), lease.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn read_lease(&self, _admin_schema: &str, schema: &str) -> Result<Option<Lease>> {
        Ok(self.state.lock().unwrap().control.get(schema).cloned())
    }

    async fn release_lease(
        &self,
        _admin_schema: &str,
        schema: &str,
        owner_id: Uuid,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.control.get(schema) {
            Some(lease) if lease.owner_id == owner_id => {
                state.control.remove(schema);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn allocate_tenant_id(&self, _admin_schema: &str) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_tenant_id += 1;
        Ok(state.next_tenant_id)
    }

    async fn insert_tenant(&self, _admin_schema: &str, tenant: &TenantRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state
            .tenants
            .values()
            .any(|t| t.tenant_name == tenant.tenant_name)
        {
            return Err(MigrateError::DuplicateTenant(tenant.tenant_name.clone()));
        }
        state.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(
        &self,
        _admin_schema: &str,
        tenant_id: i64,
    ) -> Result<Option<TenantRecord>> {
        Ok(self.state.lock().unwrap().tenants.get(&tenant_id).cloned())
    }

    async fn get_tenant_by_name(
        &self,
        _admin_schema: &str,
        name: &str,
    ) -> Result<Option<TenantRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tenants
            .values()
            .find(|t| t.tenant_name == name)
            .cloned())
    }

    async fn update_tenant_status(
        &self,
        _admin_schema: &str,
        tenant_id: i64,
        status: TenantStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.tenants.get_mut(&tenant_id) {
            Some(tenant) => {
                tenant.status = status;
                Ok(())
            }
            None => Err(MigrateError::TenantNotFound(tenant_id.to_string())),
        }
    }

    async fn insert_tenant_key(
        &self,
        _admin_schema: &str,
        tenant_id: i64,
        salt: &str,
        hash: &[u8],
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_key_id += 1;
        let key_id = state.next_key_id;
        state.keys.push(TenantKeyRecord {
            key_id,
            tenant_id,
            salt: salt.to_string(),
            hash: hash.to_vec(),
        });
        Ok(key_id)
    }

    async fn delete_tenant_key(
        &self,
        _admin_schema: &str,
        tenant_id: i64,
        key_id: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.keys.len();
        state
            .keys
            .retain(|k| !(k.tenant_id == tenant_id && k.key_id == key_id));
        Ok(state.keys.len() < before)
    }

    async fn list_tenant_keys(
        &self,
        _admin_schema: &str,
        tenant_id: i64,
    ) -> Result<Vec<TenantKeyRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .keys
            .iter()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn set_session_tenant(&self, _admin_schema: &str, tenant_id: i64) -> Result<()> {
        self.state.lock().unwrap().session_tenant = Some(tenant_id);
        Ok(())
    }

    async fn create_tenant_partition(
        &self,
        schema: &str,
        table: &str,
        tenant_id: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let created = state
            .partitions
            .insert((schema.to_string(), table.to_string(), tenant_id));
        if created {
            state.executed.push(format!(
                "CREATE TABLE {schema}.{table}_t{tenant_id} PARTITION OF {schema}.{table} FOR VALUES IN ({tenant_id})"
            ));
        }
        Ok(created)
    }

    async fn drop_tenant_partition(
        &self,
        schema: &str,
        table: &str,
        tenant_id: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let dropped = state
            .partitions
            .remove(&(schema.to_string(), table.to_string(), tenant_id));
        if dropped {
            state
                .executed
                .push(format!("DROP TABLE {schema}.{table}_t{tenant_id}"));
        }
        Ok(dropped)
    }

    async fn set_fk_enforced(
        &self,
        schema: &str,
        table: &str,
        constraint: &str,
        enforced: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (schema.to_string(), table.to_string(), constraint.to_string());
        if state.fk_toggle_failures.contains(&key) {
            return Err(MigrateError::Sql {
                sqlstate: "55006".to_string(),
                message: format!("cannot alter constraint {constraint}"),
            });
        }
        state.fk_enforced.insert(key, enforced);
        Ok(())
    }

    async fn fk_is_enforced(&self, schema: &str, table: &str, constraint: &str) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .fk_enforced
            .get(&(schema.to_string(), table.to_string(), constraint.to_string()))
            .unwrap_or(&true))
    }
}
