//! Vendor adapter seam.
//!
//! The core never inspects vendor-native error codes or SQL syntax
//! directly; everything goes through two traits:
//!
//! - [`SqlDialect`]: synchronous SQL-syntax strategy (quoting, type
//!   rendering, capability flags, error translation by SQLSTATE).
//! - [`SchemaExecutor`]: async execution surface for DDL application,
//!   catalog probes, control/lease/version tables and tenant operations.
//!
//! Implementations:
//!
//! - `PgAdapter` in `postgres.rs` (deadpool-postgres)
//! - `MemoryAdapter` in `memory.rs` (tests, dry runs)

pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::model::object::{ObjectId, Probe, SchemaObject, Statement};
use crate::model::table::ColumnType;

pub use memory::MemoryAdapter;
pub use postgres::{PgAdapter, PgDialect};

/// SQL syntax strategy for a database engine.
///
/// The capability flags replace per-vendor subclassing of control-table
/// operations: e.g. a dialect that cannot express `INSERT ... ON CONFLICT
/// DO NOTHING` reports it here and the lease insert falls back to catching
/// the duplicate-key error.
pub trait SqlDialect: Send + Sync {
    /// Dialect identifier (e.g. "postgres").
    fn name(&self) -> &str;

    /// Quote an identifier.
    fn quote_ident(&self, name: &str) -> String;

    /// Quote and qualify `schema.name`.
    fn qualified(&self, schema: &str, name: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(name))
    }

    /// Render an abstract column type as vendor SQL.
    fn render_type(&self, column_type: &ColumnType) -> String;

    /// Dialect-specific row-limit clause.
    fn limit(&self, n: u32) -> String;

    /// Whether the engine supports native list partitioning.
    fn supports_partitioning(&self) -> bool;

    /// Whether `INSERT ... ON CONFLICT DO NOTHING` (or equivalent) exists.
    fn supports_insert_on_conflict(&self) -> bool;

    /// Whether the given SQLSTATE is a uniqueness violation.
    fn is_duplicate_key(&self, sqlstate: &str) -> bool;

    /// Translate a vendor error (SQLSTATE plus message) to a domain error.
    fn translate(&self, sqlstate: Option<&str>, message: &str) -> MigrateError;

    /// Full create-DDL for an object in this dialect.
    fn create_statements(&self, obj: &SchemaObject) -> Vec<Statement>;

    /// Teardown DDL for an object in this dialect.
    fn drop_statements(&self, obj: &SchemaObject) -> Vec<Statement>;
}

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantStatus {
    /// Created but partitions are not yet complete.
    Provisioning,
    /// Allocated id with no live data, available for reuse.
    Free,
    /// Fully provisioned and serving.
    Active,
    /// Writes blocked during maintenance.
    Frozen,
    /// Partitions removed; the row is retained.
    Dropped,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Provisioning => "provisioning",
            TenantStatus::Free => "free",
            TenantStatus::Active => "active",
            TenantStatus::Frozen => "frozen",
            TenantStatus::Dropped => "dropped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "provisioning" => Ok(TenantStatus::Provisioning),
            "free" => Ok(TenantStatus::Free),
            "active" => Ok(TenantStatus::Active),
            "frozen" => Ok(TenantStatus::Frozen),
            "dropped" => Ok(TenantStatus::Dropped),
            _ => Err(MigrateError::Config(format!(
                "Invalid tenant status: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the tenants table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: i64,
    pub tenant_name: String,
    pub status: TenantStatus,
}

/// One row of the tenant keys table. The plaintext secret is never stored.
#[derive(Debug, Clone)]
pub struct TenantKeyRecord {
    pub key_id: i64,
    pub tenant_id: i64,
    pub salt: String,
    pub hash: Vec<u8>,
}

/// One row of the control table: the lease over a managed schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub schema_name: String,
    pub owner_host: String,
    pub owner_id: Uuid,
    pub lease_until: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_until < now
    }
}

/// Async execution surface the engine, lease manager and tenant manager run
/// against. Implementations must be `Send + Sync` so one adapter can be
/// shared across concurrent tenant operations.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    /// The SQL dialect this executor speaks.
    fn dialect(&self) -> &dyn SqlDialect;

    // ===== DDL application =====

    /// Apply an object's full create-DDL. Statements run in one
    /// transaction where the vendor allows transactional DDL.
    async fn create_object(&self, id: &ObjectId, statements: &[Statement]) -> Result<()>;

    /// Apply migration steps for one object in a single transaction.
    async fn apply_steps(&self, id: &ObjectId, statements: &[Statement]) -> Result<()>;

    // ===== Catalog probes =====

    async fn object_exists(&self, id: &ObjectId) -> Result<bool>;

    async fn column_exists(&self, schema: &str, table: &str, column: &str) -> Result<bool>;

    async fn table_has_data(&self, schema: &str, table: &str) -> Result<bool>;

    // ===== Version record =====

    /// Create the control (lease) table if missing. Idempotent.
    async fn ensure_control_table(&self, admin_schema: &str) -> Result<()>;

    /// Create the single-row version table for a managed schema if missing.
    /// Idempotent.
    async fn ensure_version_table(&self, schema: &str) -> Result<()>;

    /// Latest fully-applied version, or `None` for a fresh schema.
    async fn read_version(&self, schema: &str) -> Result<Option<i32>>;

    /// Upsert the version record.
    async fn update_version(&self, schema: &str, version: i32) -> Result<()>;

    /// Remove the version record. Only teardown calls this.
    async fn clear_version(&self, schema: &str) -> Result<()>;

    // ===== Lease =====

    /// Step 1 of acquisition: insert a fresh lease row. Returns false on a
    /// uniqueness conflict (a row already exists).
    async fn try_insert_lease(&self, admin_schema: &str, lease: &Lease) -> Result<bool>;

    /// Step 2: take a row lock on the existing lease row, then update it
    /// only if it is expired or already owned by this owner. Returns true
    /// when the caller now owns the lease. The lock must be taken before
    /// the conditional update's WHERE clause is evaluated.
    async fn try_takeover_lease(&self, admin_schema: &str, lease: &Lease) -> Result<bool>;

    async fn read_lease(&self, admin_schema: &str, schema: &str) -> Result<Option<Lease>>;

    /// Delete the lease row, but only if owned by `owner_id`.
    async fn release_lease(&self, admin_schema: &str, schema: &str, owner_id: Uuid)
        -> Result<bool>;

    // ===== Tenants =====

    /// Next value from the tenant id sequence.
    async fn allocate_tenant_id(&self, admin_schema: &str) -> Result<i64>;

    async fn insert_tenant(&self, admin_schema: &str, tenant: &TenantRecord) -> Result<()>;

    async fn get_tenant(&self, admin_schema: &str, tenant_id: i64)
        -> Result<Option<TenantRecord>>;

    async fn get_tenant_by_name(
        &self,
        admin_schema: &str,
        name: &str,
    ) -> Result<Option<TenantRecord>>;

    async fn update_tenant_status(
        &self,
        admin_schema: &str,
        tenant_id: i64,
        status: TenantStatus,
    ) -> Result<()>;

    /// Persist a tenant key row, returning the allocated key id.
    async fn insert_tenant_key(
        &self,
        admin_schema: &str,
        tenant_id: i64,
        salt: &str,
        hash: &[u8],
    ) -> Result<i64>;

    async fn delete_tenant_key(
        &self,
        admin_schema: &str,
        tenant_id: i64,
        key_id: i64,
    ) -> Result<bool>;

    async fn list_tenant_keys(
        &self,
        admin_schema: &str,
        tenant_id: i64,
    ) -> Result<Vec<TenantKeyRecord>>;

    /// Set the session-scoped tenant variable on the current connection.
    /// Connection-local: pooled connections must re-set it per checkout.
    async fn set_session_tenant(&self, admin_schema: &str, tenant_id: i64) -> Result<()>;

    // ===== Partitions and FK enforcement =====

    /// Create a tenant partition. Returns false if it already existed.
    async fn create_tenant_partition(
        &self,
        schema: &str,
        table: &str,
        tenant_id: i64,
    ) -> Result<bool>;

    /// Drop a tenant partition. Returns false if it did not exist.
    async fn drop_tenant_partition(
        &self,
        schema: &str,
        table: &str,
        tenant_id: i64,
    ) -> Result<bool>;

    /// Toggle enforcement of one foreign key constraint.
    async fn set_fk_enforced(
        &self,
        schema: &str,
        table: &str,
        constraint: &str,
        enforced: bool,
    ) -> Result<()>;

    async fn fk_is_enforced(&self, schema: &str, table: &str, constraint: &str) -> Result<bool>;
}

/// Evaluate a statement guard against the live catalog.
pub async fn probe_holds(executor: &dyn SchemaExecutor, probe: &Probe) -> Result<bool> {
    match probe {
        Probe::ObjectMissing(id) => Ok(!executor.object_exists(id).await?),
        Probe::ColumnMissing {
            schema,
            table,
            column,
        } => Ok(!executor.column_exists(schema, table, column).await?),
        Probe::TableHasNoData { schema, table } => {
            Ok(!executor.table_has_data(schema, table).await?)
        }
    }
}
