//! # tenantdb-migrate
//!
//! Versioned schema migration engine for a multi-tenant clinical data
//! store on PostgreSQL.
//!
//! This library provides the core functionality for creating and evolving
//! a tenant-partitioned physical data model with support for:
//!
//! - **Dependency-ordered DDL** from a declarative object model
//! - **Idempotent create and migrate** guarded by catalog probes
//! - **Distributed leases** so concurrent instances never collide
//! - **Tenant lifecycle** with partition provisioning and key rotation
//! - **Vendor dialects** behind a strategy seam (PostgreSQL built in)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenantdb_migrate::{
//!     admin_model, Config, EngineOptions, MigrationEngine, PgAdapter, SchemaExecutor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tenantdb_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let executor: Arc<dyn SchemaExecutor> = Arc::new(PgAdapter::connect(&config.database)?);
//!     let engine = MigrationEngine::new(
//!         executor,
//!         config.schema.admin_schema.clone(),
//!         EngineOptions::default(),
//!     );
//!     let model = admin_model(&config.schema.admin_schema)?;
//!     let result = engine.apply(&model, &config.schema.admin_schema).await?;
//!     println!("schema at version {}", result.new_version);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod model;
pub mod schema;
pub mod tenant;

// Re-exports for convenient access
pub use adapter::{
    Lease, MemoryAdapter, PgAdapter, PgDialect, SchemaExecutor, SqlDialect, TenantRecord,
    TenantStatus,
};
pub use config::{Config, DatabaseConfig, LeaseConfig, SchemaConfig};
pub use engine::{ApplyResult, EngineOptions, MigrationEngine, TeardownResult};
pub use error::{MigrateError, Result};
pub use lease::{LeaseManager, RetryPolicy};
pub use model::{PhysicalDataModel, SchemaObject};
pub use schema::{
    admin_model, admin_version_catalog, data_model, data_version_catalog, ADMIN_SCHEMA_VERSION,
    DATA_SCHEMA_VERSION,
};
pub use tenant::{ProvisionedTenant, TenantManager};
