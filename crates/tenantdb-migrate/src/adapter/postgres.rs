//! PostgreSQL adapter: dialect and executor over a deadpool-postgres pool.

use async_trait::async_trait;
use deadpool_postgres::{Pool, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};
use crate::model::object::{ObjectDef, ObjectId, ObjectKind, SchemaObject, Statement};
use crate::model::table::{ColumnType, SortDirection, TableDef};

use super::{Lease, SchemaExecutor, SqlDialect, TenantKeyRecord, TenantRecord, TenantStatus};

/// PostgreSQL SQL dialect.
#[derive(Debug, Clone, Default)]
pub struct PgDialect;

impl PgDialect {
    pub fn new() -> Self {
        Self
    }

    fn render_column(&self, col: &crate::model::table::ColumnDef) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote_ident(&col.name),
            self.render_type(&col.column_type)
        );
        if !col.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(ref default) = col.default_value {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
        sql
    }

    fn create_table_statements(&self, table: &TableDef) -> Vec<Statement> {
        let qualified = self.qualified(&table.schema, &table.name);
        let mut parts: Vec<String> = table.columns.iter().map(|c| self.render_column(c)).collect();

        if let Some(ref pk) = table.primary_key {
            let cols = pk
                .columns
                .iter()
                .map(|c| self.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_ident(&pk.name),
                cols
            ));
        }

        let mut create = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            qualified,
            parts.join(", ")
        );

        if let Some(ref tenant_col) = table.tenant_column {
            if self.supports_partitioning() {
                create.push_str(&format!(
                    " PARTITION BY LIST ({})",
                    self.quote_ident(tenant_col)
                ));
            }
        }

        if let Some(ref ts) = table.tablespace {
            create.push_str(&format!(" TABLESPACE {}", self.quote_ident(ts)));
        }

        let mut statements = vec![Statement::new(create)];

        for idx in &table.indexes {
            let cols = idx
                .columns
                .iter()
                .map(|c| {
                    let dir = match c.direction {
                        SortDirection::Ascending => "ASC",
                        SortDirection::Descending => "DESC",
                    };
                    format!("{} {}", self.quote_ident(&c.name), dir)
                })
                .collect::<Vec<_>>()
                .join(", ");
            let unique = if idx.unique { "UNIQUE " } else { "" };
            statements.push(Statement::new(format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                unique,
                self.quote_ident(&idx.name),
                qualified,
                cols
            )));
        }

        for fk in &table.foreign_keys {
            let cols = fk
                .columns
                .iter()
                .map(|c| self.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let ref_cols = fk
                .target_columns
                .iter()
                .map(|c| self.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            // Unenforced constraints are declared NOT VALID: documented but
            // not checked against existing rows.
            let validity = if fk.enforced { "" } else { " NOT VALID" };
            statements.push(Statement::new(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}",
                qualified,
                self.quote_ident(&fk.name),
                cols,
                self.qualified(&fk.target_schema, &fk.target_table),
                ref_cols,
                validity
            )));
        }

        for grant in &table.privileges {
            statements.push(Statement::new(format!(
                "GRANT {} ON {} TO {}",
                grant.privilege,
                qualified,
                self.quote_ident(&grant.grantee)
            )));
        }

        statements
    }
}

impl SqlDialect for PgDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn render_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Int => "INT".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Double => "DOUBLE PRECISION".to_string(),
            ColumnType::Varchar(n) => format!("VARCHAR({})", n),
            ColumnType::Char(n) => format!("CHAR({})", n),
            ColumnType::Varbinary(_) => "BYTEA".to_string(),
            ColumnType::Timestamp => "TIMESTAMPTZ".to_string(),
            ColumnType::Clob => "TEXT".to_string(),
            ColumnType::Blob => "BYTEA".to_string(),
        }
    }

    fn limit(&self, n: u32) -> String {
        format!("LIMIT {}", n)
    }

    fn supports_partitioning(&self) -> bool {
        true
    }

    fn supports_insert_on_conflict(&self) -> bool {
        true
    }

    fn is_duplicate_key(&self, sqlstate: &str) -> bool {
        sqlstate == "23505"
    }

    fn translate(&self, sqlstate: Option<&str>, message: &str) -> MigrateError {
        MigrateError::Sql {
            sqlstate: sqlstate.unwrap_or("unknown").to_string(),
            message: message.to_string(),
        }
    }

    fn create_statements(&self, obj: &SchemaObject) -> Vec<Statement> {
        match obj.def() {
            ObjectDef::Table(table) => self.create_table_statements(table),
            ObjectDef::Sequence(seq) => vec![Statement::new(format!(
                "CREATE SEQUENCE IF NOT EXISTS {} START WITH {} INCREMENT BY {} CACHE {}",
                self.qualified(&obj.id().schema, &obj.id().name),
                seq.start_with,
                seq.increment_by,
                seq.cache
            ))],
            ObjectDef::View(view) => vec![Statement::new(format!(
                "CREATE OR REPLACE VIEW {} AS {}",
                self.qualified(&obj.id().schema, &obj.id().name),
                view.select
            ))],
            ObjectDef::Tablespace(ts) => {
                let mut sql = format!("CREATE TABLESPACE {}", self.quote_ident(&obj.id().name));
                if let Some(ref location) = ts.location {
                    sql.push_str(&format!(" LOCATION '{}'", location.replace('\'', "''")));
                }
                vec![Statement::new(sql)
                    .only_if(crate::model::object::Probe::ObjectMissing(obj.id().clone()))]
            }
            // No CREATE VARIABLE in PostgreSQL: the variable is a custom
            // setting established per connection via set_config. The object
            // still participates in dependency ordering.
            ObjectDef::SessionVariable(_) => Vec::new(),
            ObjectDef::Routine(routine) => vec![Statement::new(routine.body.clone())],
            ObjectDef::Marker => Vec::new(),
        }
    }

    fn drop_statements(&self, obj: &SchemaObject) -> Vec<Statement> {
        let qualified = self.qualified(&obj.id().schema, &obj.id().name);
        match obj.def() {
            ObjectDef::Table(table) => vec![Statement::new(format!(
                "DROP TABLE IF EXISTS {} CASCADE",
                qualified
            ))
            .destructive_on(table.schema.clone(), table.name.clone())],
            ObjectDef::Sequence(_) => {
                vec![Statement::new(format!("DROP SEQUENCE IF EXISTS {}", qualified))]
            }
            ObjectDef::View(_) => {
                vec![Statement::new(format!("DROP VIEW IF EXISTS {}", qualified))]
            }
            ObjectDef::Tablespace(_) => vec![Statement::new(format!(
                "DROP TABLESPACE {}",
                self.quote_ident(&obj.id().name)
            ))],
            ObjectDef::Routine(_) => {
                vec![Statement::new(format!("DROP ROUTINE IF EXISTS {}", qualified))]
            }
            ObjectDef::SessionVariable(_) | ObjectDef::Marker => Vec::new(),
        }
    }
}

/// PostgreSQL executor over a deadpool connection pool.
pub struct PgAdapter {
    pool: Pool,
    dialect: PgDialect,
}

impl PgAdapter {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            dialect: PgDialect::new(),
        }
    }

    /// Build a pool from configuration and wrap it.
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| MigrateError::pool(e.to_string(), "creating postgres pool"))?;
        Ok(Self::new(pool))
    }

    fn sqlstate(err: &tokio_postgres::Error) -> Option<String> {
        err.code().map(|c| c.code().to_string())
    }

    fn version_table(&self, schema: &str) -> String {
        self.dialect.qualified(schema, "whole_schema_version")
    }

    fn control_table(&self, admin_schema: &str) -> String {
        self.dialect.qualified(admin_schema, "control")
    }

    fn partition_name(table: &str, tenant_id: i64) -> String {
        format!("{}_t{}", table, tenant_id)
    }
}

#[async_trait]
impl SchemaExecutor for PgAdapter {
    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn create_object(&self, id: &ObjectId, statements: &[Statement]) -> Result<()> {
        self.apply_steps(id, statements).await
    }

    async fn apply_steps(&self, id: &ObjectId, statements: &[Statement]) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        for stmt in statements {
            debug!(object = %id, sql = %stmt.sql, "executing");
            tx.batch_execute(&stmt.sql).await.map_err(|e| {
                let translated = self
                    .dialect
                    .translate(Self::sqlstate(&e).as_deref(), &e.to_string());
                MigrateError::step(id.to_string(), translated.to_string())
            })?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn object_exists(&self, id: &ObjectId) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = match id.kind {
            ObjectKind::Table => {
                conn.query_opt(
                    "SELECT 1 FROM information_schema.tables
                     WHERE table_schema = $1 AND table_name = $2",
                    &[&id.schema, &id.name],
                )
                .await?
            }
            ObjectKind::View => {
                conn.query_opt(
                    "SELECT 1 FROM information_schema.views
                     WHERE table_schema = $1 AND table_name = $2",
                    &[&id.schema, &id.name],
                )
                .await?
            }
            ObjectKind::Sequence => {
                conn.query_opt(
                    "SELECT 1 FROM information_schema.sequences
                     WHERE sequence_schema = $1 AND sequence_name = $2",
                    &[&id.schema, &id.name],
                )
                .await?
            }
            ObjectKind::Procedure | ObjectKind::Function => {
                conn.query_opt(
                    "SELECT 1 FROM pg_proc p
                     JOIN pg_namespace n ON n.oid = p.pronamespace
                     WHERE n.nspname = $1 AND p.proname = $2",
                    &[&id.schema, &id.name],
                )
                .await?
            }
            ObjectKind::Tablespace => {
                conn.query_opt(
                    "SELECT 1 FROM pg_tablespace WHERE spcname = $1",
                    &[&id.name],
                )
                .await?
            }
            // Session variables and markers have no catalog presence.
            ObjectKind::SessionVariable | ObjectKind::Marker => None,
        };
        Ok(row.is_some())
    }

    async fn column_exists(&self, schema: &str, table: &str, column: &str) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT 1 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
                &[&schema, &table, &column],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn table_has_data(&self, schema: &str, table: &str) -> Result<bool> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT 1 FROM {} {}",
            self.dialect.qualified(schema, table),
            self.dialect.limit(1)
        );
        Ok(conn.query_opt(&sql, &[]).await?.is_some())
    }

    async fn ensure_control_table(&self, admin_schema: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                self.dialect.quote_ident(admin_schema)
            ),
            &[],
        )
        .await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    schema_name TEXT PRIMARY KEY,
                    lease_owner_host TEXT NOT NULL,
                    lease_owner_uuid UUID NOT NULL,
                    lease_until TIMESTAMPTZ NOT NULL
                )",
                self.control_table(admin_schema)
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn ensure_version_table(&self, schema: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                self.dialect.quote_ident(schema)
            ),
            &[],
        )
        .await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    record_id INT PRIMARY KEY,
                    version_id INT NOT NULL
                )",
                self.version_table(schema)
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn read_version(&self, schema: &str) -> Result<Option<i32>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT version_id FROM {} WHERE record_id = 1",
                    self.version_table(schema)
                ),
                &[],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, i32>(0)))
    }

    async fn update_version(&self, schema: &str, version: i32) -> Result<()> {
        let conn = self.pool.get().await?;
        let table = self.version_table(schema);
        // The WHERE guard keeps the record monotonically non-decreasing
        // even if a stale run attempts to write an older version.
        conn.execute(
            &format!(
                "INSERT INTO {table} (record_id, version_id) VALUES (1, $1)
                 ON CONFLICT (record_id) DO UPDATE SET version_id = EXCLUDED.version_id
                 WHERE {table}.version_id <= EXCLUDED.version_id"
            ),
            &[&version],
        )
        .await?;
        Ok(())
    }

    async fn clear_version(&self, schema: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!("DELETE FROM {} WHERE record_id = 1", self.version_table(schema)),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn try_insert_lease(&self, admin_schema: &str, lease: &Lease) -> Result<bool> {
        let conn = self.pool.get().await?;
        let table = self.control_table(admin_schema);
        if self.dialect.supports_insert_on_conflict() {
            let rows = conn
                .execute(
                    &format!(
                        "INSERT INTO {} (schema_name, lease_owner_host, lease_owner_uuid, lease_until)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (schema_name) DO NOTHING",
                        table
                    ),
                    &[
                        &lease.schema_name,
                        &lease.owner_host,
                        &lease.owner_id,
                        &lease.lease_until,
                    ],
                )
                .await?;
            return Ok(rows == 1);
        }

        // Fallback for engines without conflict-absorbing inserts: run the
        // plain insert and translate the uniqueness violation.
        match conn
            .execute(
                &format!(
                    "INSERT INTO {} (schema_name, lease_owner_host, lease_owner_uuid, lease_until)
                     VALUES ($1, $2, $3, $4)",
                    table
                ),
                &[
                    &lease.schema_name,
                    &lease.owner_host,
                    &lease.owner_id,
                    &lease.lease_until,
                ],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match Self::sqlstate(&e) {
                Some(code) if self.dialect.is_duplicate_key(&code) => Ok(false),
                _ => Err(e.into()),
            },
        }
    }

    async fn try_takeover_lease(&self, admin_schema: &str, lease: &Lease) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let table = self.control_table(admin_schema);
        let tx = conn.transaction().await?;

        // Row lock first: the holder cannot delete or renew the row between
        // our read and the conditional update below.
        let existing = tx
            .query_opt(
                &format!(
                    "SELECT lease_owner_uuid, lease_until FROM {} WHERE schema_name = $1 FOR UPDATE",
                    table
                ),
                &[&lease.schema_name],
            )
            .await?;

        let owned = match existing {
            None => {
                // The row vanished after our failed insert; claim it.
                tx.execute(
                    &format!(
                        "INSERT INTO {} (schema_name, lease_owner_host, lease_owner_uuid, lease_until)
                         VALUES ($1, $2, $3, $4)",
                        table
                    ),
                    &[
                        &lease.schema_name,
                        &lease.owner_host,
                        &lease.owner_id,
                        &lease.lease_until,
                    ],
                )
                .await?;
                true
            }
            Some(_) => {
                let rows = tx
                    .execute(
                        &format!(
                            "UPDATE {} SET lease_owner_host = $2, lease_owner_uuid = $3, lease_until = $4
                             WHERE schema_name = $1
                               AND (lease_until < NOW() OR lease_owner_uuid = $3)",
                            table
                        ),
                        &[
                            &lease.schema_name,
                            &lease.owner_host,
                            &lease.owner_id,
                            &lease.lease_until,
                        ],
                    )
                    .await?;
                rows == 1
            }
        };

        tx.commit().await?;
        Ok(owned)
    }

    async fn read_lease(&self, admin_schema: &str, schema: &str) -> Result<Option<Lease>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT schema_name, lease_owner_host, lease_owner_uuid, lease_until
                     FROM {} WHERE schema_name = $1",
                    self.control_table(admin_schema)
                ),
                &[&schema],
            )
            .await?;
        Ok(row.map(|r| Lease {
            schema_name: r.get(0),
            owner_host: r.get(1),
            owner_id: r.get(2),
            lease_until: r.get(3),
        }))
    }

    async fn release_lease(
        &self,
        admin_schema: &str,
        schema: &str,
        owner_id: Uuid,
    ) -> Result<bool> {
        let conn = self.pool.get().await?;
        let rows = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE schema_name = $1 AND lease_owner_uuid = $2",
                    self.control_table(admin_schema)
                ),
                &[&schema, &owner_id],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn allocate_tenant_id(&self, admin_schema: &str) -> Result<i64> {
        let conn = self.pool.get().await?;
        let seq = format!(
            "{}.{}",
            self.dialect.quote_ident(admin_schema),
            self.dialect.quote_ident("tenant_sequence")
        );
        let row = conn
            .query_one(&format!("SELECT nextval('{}')", seq.replace('\'', "''")), &[])
            .await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn insert_tenant(&self, admin_schema: &str, tenant: &TenantRecord) -> Result<()> {
        let conn = self.pool.get().await?;
        let status = tenant.status.as_str();
        let result = conn
            .execute(
                &format!(
                    "INSERT INTO {} (tenant_id, tenant_name, tenant_status) VALUES ($1, $2, $3)",
                    self.dialect.qualified(admin_schema, "tenants")
                ),
                &[&tenant.tenant_id, &tenant.tenant_name, &status],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => match Self::sqlstate(&e) {
                Some(code) if self.dialect.is_duplicate_key(&code) => {
                    Err(MigrateError::DuplicateTenant(tenant.tenant_name.clone()))
                }
                _ => Err(e.into()),
            },
        }
    }

    async fn get_tenant(
        &self,
        admin_schema: &str,
        tenant_id: i64,
    ) -> Result<Option<TenantRecord>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT tenant_id, tenant_name, tenant_status FROM {} WHERE tenant_id = $1",
                    self.dialect.qualified(admin_schema, "tenants")
                ),
                &[&tenant_id],
            )
            .await?;
        row.map(|r| {
            Ok(TenantRecord {
                tenant_id: r.get(0),
                tenant_name: r.get(1),
                status: TenantStatus::parse(r.get::<_, &str>(2))?,
            })
        })
        .transpose()
    }

    async fn get_tenant_by_name(
        &self,
        admin_schema: &str,
        name: &str,
    ) -> Result<Option<TenantRecord>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT tenant_id, tenant_name, tenant_status FROM {} WHERE tenant_name = $1",
                    self.dialect.qualified(admin_schema, "tenants")
                ),
                &[&name],
            )
            .await?;
        row.map(|r| {
            Ok(TenantRecord {
                tenant_id: r.get(0),
                tenant_name: r.get(1),
                status: TenantStatus::parse(r.get::<_, &str>(2))?,
            })
        })
        .transpose()
    }

    async fn update_tenant_status(
        &self,
        admin_schema: &str,
        tenant_id: i64,
        status: TenantStatus,
    ) -> Result<()> {
        let conn = self.pool.get().await?;
        let rows = conn
            .execute(
                &format!(
                    "UPDATE {} SET tenant_status = $2 WHERE tenant_id = $1",
                    self.dialect.qualified(admin_schema, "tenants")
                ),
                &[&tenant_id, &status.as_str()],
            )
            .await?;
        if rows == 0 {
            return Err(MigrateError::TenantNotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    async fn insert_tenant_key(
        &self,
        admin_schema: &str,
        tenant_id: i64,
        salt: &str,
        hash: &[u8],
    ) -> Result<i64> {
        let conn = self.pool.get().await?;
        let seq = format!(
            "{}.{}",
            self.dialect.quote_ident(admin_schema),
            self.dialect.quote_ident("tenant_key_sequence")
        );
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO {} (key_id, tenant_id, salt, hash)
                     VALUES (nextval('{}'), $1, $2, $3)
                     RETURNING key_id",
                    self.dialect.qualified(admin_schema, "tenant_keys"),
                    seq.replace('\'', "''")
                ),
                &[&tenant_id, &salt, &hash],
            )
            .await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn delete_tenant_key(
        &self,
        admin_schema: &str,
        tenant_id: i64,
        key_id: i64,
    ) -> Result<bool> {
        let conn = self.pool.get().await?;
        let rows = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE tenant_id = $1 AND key_id = $2",
                    self.dialect.qualified(admin_schema, "tenant_keys")
                ),
                &[&tenant_id, &key_id],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn list_tenant_keys(
        &self,
        admin_schema: &str,
        tenant_id: i64,
    ) -> Result<Vec<TenantKeyRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT key_id, tenant_id, salt, hash FROM {}
                     WHERE tenant_id = $1 ORDER BY key_id",
                    self.dialect.qualified(admin_schema, "tenant_keys")
                ),
                &[&tenant_id],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| TenantKeyRecord {
                key_id: r.get(0),
                tenant_id: r.get(1),
                salt: r.get(2),
                hash: r.get(3),
            })
            .collect())
    }

    async fn set_session_tenant(&self, admin_schema: &str, tenant_id: i64) -> Result<()> {
        let conn = self.pool.get().await?;
        let variable = format!("{}.sv_tenant_id", admin_schema);
        conn.execute(
            "SELECT set_config($1, $2, false)",
            &[&variable, &tenant_id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn create_tenant_partition(
        &self,
        schema: &str,
        table: &str,
        tenant_id: i64,
    ) -> Result<bool> {
        let conn = self.pool.get().await?;
        let partition = Self::partition_name(table, tenant_id);
        let regclass = format!(
            "{}.{}",
            self.dialect.quote_ident(schema),
            self.dialect.quote_ident(&partition)
        );
        let exists = conn
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&regclass])
            .await?
            .get::<_, bool>(0);
        if exists {
            return Ok(false);
        }
        conn.execute(
            &format!(
                "CREATE TABLE {} PARTITION OF {} FOR VALUES IN ({})",
                self.dialect.qualified(schema, &partition),
                self.dialect.qualified(schema, table),
                tenant_id
            ),
            &[],
        )
        .await?;
        Ok(true)
    }

    async fn drop_tenant_partition(
        &self,
        schema: &str,
        table: &str,
        tenant_id: i64,
    ) -> Result<bool> {
        let conn = self.pool.get().await?;
        let partition = Self::partition_name(table, tenant_id);
        let regclass = format!(
            "{}.{}",
            self.dialect.quote_ident(schema),
            self.dialect.quote_ident(&partition)
        );
        let exists = conn
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&regclass])
            .await?
            .get::<_, bool>(0);
        if !exists {
            return Ok(false);
        }
        conn.execute(
            &format!(
                "DROP TABLE {}",
                self.dialect.qualified(schema, &partition)
            ),
            &[],
        )
        .await?;
        Ok(true)
    }

    async fn set_fk_enforced(
        &self,
        schema: &str,
        table: &str,
        constraint: &str,
        enforced: bool,
    ) -> Result<()> {
        // PostgreSQL cannot disable a single FK constraint in place; the
        // closest operation is disabling the owning table's triggers, which
        // covers its constraint triggers. Constraint name kept for the log.
        let conn = self.pool.get().await?;
        let action = if enforced { "ENABLE" } else { "DISABLE" };
        warn!(
            schema,
            table, constraint, action, "toggling constraint triggers table-wide"
        );
        conn.execute(
            &format!(
                "ALTER TABLE {} {} TRIGGER ALL",
                self.dialect.qualified(schema, table),
                action
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn fk_is_enforced(&self, schema: &str, table: &str, constraint: &str) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT t.tgenabled FROM pg_trigger t
                 JOIN pg_constraint c ON c.oid = t.tgconstraint
                 JOIN pg_class r ON r.oid = c.conrelid
                 JOIN pg_namespace n ON n.oid = r.relnamespace
                 WHERE n.nspname = $1 AND r.relname = $2 AND c.conname = $3
                 LIMIT 1",
                &[&schema, &table, &constraint],
            )
            .await?;
        Ok(row
            .map(|r| r.get::<_, i8>(0) as u8 as char != 'D')
            .unwrap_or(true))
    }
}
