//! Table definitions: columns, keys, indexes, foreign keys, tenant
//! partitioning and privileges.
//!
//! [`TableDef`] is built with a fluent builder in registration code, e.g.:
//!
//! ```rust
//! use tenantdb_migrate::model::table::{ColumnType, TableDef};
//!
//! let tenants = TableDef::builder("FHIR_ADMIN", "TENANTS")
//!     .add_int_column("MT_ID", false)
//!     .add_varchar_column("TENANT_NAME", 36, false)
//!     .add_varchar_column("TENANT_STATUS", 16, false)
//!     .add_unique_index("IDX_TENANT_TN", &["TENANT_NAME"])
//!     .add_primary_key("TENANT_PK", &["MT_ID"])
//!     .build();
//! assert_eq!(tenants.columns.len(), 3);
//! ```

/// Abstract column type, rendered to vendor SQL by the dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    BigInt,
    Double,
    Varchar(u32),
    Char(u32),
    Varbinary(u32),
    Timestamp,
    Clob,
    Blob,
}

/// Column definition.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default_value: Option<String>,
}

/// Sort direction of an indexed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// An indexed column with its direction.
#[derive(Debug, Clone)]
pub struct OrderedColumn {
    pub name: String,
    pub direction: SortDirection,
}

impl OrderedColumn {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Secondary or unique index definition.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<OrderedColumn>,
    pub unique: bool,
}

/// Foreign key constraint definition.
#[derive(Debug, Clone)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<String>,
    pub target_schema: String,
    pub target_table: String,
    pub target_columns: Vec<String>,
    /// Unenforced constraints document the relationship without checking it.
    pub enforced: bool,
}

/// Primary key constraint definition.
#[derive(Debug, Clone)]
pub struct PrimaryKeyDef {
    pub name: String,
    pub columns: Vec<String>,
}

/// Distribution strategy for distributed back ends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Distribution {
    #[default]
    None,
    /// Full copy on every node.
    Replicated,
    /// Sharded by the named column.
    Sharded(String),
}

/// A granted privilege on the table.
#[derive(Debug, Clone)]
pub struct Privilege {
    pub grantee: String,
    pub privilege: String,
}

/// Complete table definition.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<PrimaryKeyDef>,
    pub indexes: Vec<IndexDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// When set, the table is horizontally partitioned by tenant on this
    /// column.
    pub tenant_column: Option<String>,
    pub distribution: Distribution,
    pub privileges: Vec<Privilege>,
    pub tablespace: Option<String>,
}

impl TableDef {
    /// Start building a table definition.
    pub fn builder(schema: impl Into<String>, name: impl Into<String>) -> TableBuilder {
        TableBuilder {
            def: TableDef {
                schema: schema.into(),
                name: name.into(),
                columns: Vec::new(),
                primary_key: None,
                indexes: Vec::new(),
                foreign_keys: Vec::new(),
                tenant_column: None,
                distribution: Distribution::None,
                privileges: Vec::new(),
                tablespace: None,
            },
        }
    }

    /// Whether the table is tenant-partitioned.
    pub fn is_tenant_partitioned(&self) -> bool {
        self.tenant_column.is_some()
    }

    /// Enforced foreign keys, the set touched by FK bracketing.
    pub fn enforced_foreign_keys(&self) -> impl Iterator<Item = &ForeignKeyDef> {
        self.foreign_keys.iter().filter(|fk| fk.enforced)
    }
}

/// Fluent builder for [`TableDef`].
pub struct TableBuilder {
    def: TableDef,
}

impl TableBuilder {
    pub fn add_column(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        nullable: bool,
    ) -> Self {
        self.def.columns.push(ColumnDef {
            name: name.into(),
            column_type,
            nullable,
            default_value: None,
        });
        self
    }

    pub fn add_int_column(self, name: impl Into<String>, nullable: bool) -> Self {
        self.add_column(name, ColumnType::Int, nullable)
    }

    pub fn add_bigint_column(self, name: impl Into<String>, nullable: bool) -> Self {
        self.add_column(name, ColumnType::BigInt, nullable)
    }

    pub fn add_varchar_column(self, name: impl Into<String>, len: u32, nullable: bool) -> Self {
        self.add_column(name, ColumnType::Varchar(len), nullable)
    }

    pub fn add_varbinary_column(self, name: impl Into<String>, len: u32, nullable: bool) -> Self {
        self.add_column(name, ColumnType::Varbinary(len), nullable)
    }

    pub fn add_timestamp_column(self, name: impl Into<String>, nullable: bool) -> Self {
        self.add_column(name, ColumnType::Timestamp, nullable)
    }

    /// Set a SQL default for the most recently added column.
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        if let Some(col) = self.def.columns.last_mut() {
            col.default_value = Some(value.into());
        }
        self
    }

    pub fn add_primary_key(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.def.primary_key = Some(PrimaryKeyDef {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn add_index(mut self, name: impl Into<String>, columns: Vec<OrderedColumn>) -> Self {
        self.def.indexes.push(IndexDef {
            name: name.into(),
            columns,
            unique: false,
        });
        self
    }

    pub fn add_unique_index(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.def.indexes.push(IndexDef {
            name: name.into(),
            columns: columns.iter().map(|c| OrderedColumn::asc(*c)).collect(),
            unique: true,
        });
        self
    }

    pub fn add_foreign_key(
        mut self,
        name: impl Into<String>,
        columns: &[&str],
        target_schema: impl Into<String>,
        target_table: impl Into<String>,
        target_columns: &[&str],
        enforced: bool,
    ) -> Self {
        self.def.foreign_keys.push(ForeignKeyDef {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            target_schema: target_schema.into(),
            target_table: target_table.into(),
            target_columns: target_columns.iter().map(|c| c.to_string()).collect(),
            enforced,
        });
        self
    }

    /// Mark the table as horizontally partitioned by tenant on the given
    /// column. The column must already be declared.
    pub fn tenant_column(mut self, column: impl Into<String>) -> Self {
        self.def.tenant_column = Some(column.into());
        self
    }

    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.def.distribution = distribution;
        self
    }

    pub fn add_privilege(
        mut self,
        grantee: impl Into<String>,
        privilege: impl Into<String>,
    ) -> Self {
        self.def.privileges.push(Privilege {
            grantee: grantee.into(),
            privilege: privilege.into(),
        });
        self
    }

    pub fn tablespace(mut self, name: impl Into<String>) -> Self {
        self.def.tablespace = Some(name.into());
        self
    }

    pub fn build(self) -> TableDef {
        self.def
    }
}
