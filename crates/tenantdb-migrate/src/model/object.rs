//! Schema object descriptors.
//!
//! A [`SchemaObject`] is any named, versioned, DDL-creatable entity: table,
//! sequence, view, tablespace, session variable, routine, or a synthetic
//! no-op marker used as a dependency barrier. Objects are registered in a
//! [`PhysicalDataModel`](crate::model::PhysicalDataModel) which computes the
//! dependency-respecting application order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::table::TableDef;

/// The kind of a schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Tablespace,
    Sequence,
    Table,
    View,
    SessionVariable,
    Procedure,
    Function,
    /// Synthetic no-op node used as a synchronization barrier.
    Marker,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Tablespace => "tablespace",
            ObjectKind::Sequence => "sequence",
            ObjectKind::Table => "table",
            ObjectKind::View => "view",
            ObjectKind::SessionVariable => "session variable",
            ObjectKind::Procedure => "procedure",
            ObjectKind::Function => "function",
            ObjectKind::Marker => "marker",
        };
        f.write_str(s)
    }
}

/// Identity of a schema object, unique within a model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
}

impl ObjectId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            kind,
        }
    }

    /// Qualified name without the kind, e.g. `FHIRDATA.PATIENT_RESOURCES`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.schema, self.name, self.kind)
    }
}

/// A single unit of DDL/DML produced by an object's create definition or a
/// versioned migration hook.
///
/// Statements may carry a [`Probe`] guard: the statement is skipped when the
/// probe reports the step has already taken effect. Guards are evaluated
/// against the live catalog, not the recorded version number, so a partially
/// applied or hand-patched schema can be safely re-migrated.
#[derive(Debug, Clone)]
pub struct Statement {
    /// Vendor SQL text.
    pub sql: String,

    /// Run this statement only when the probe holds.
    pub only_if: Option<Probe>,

    /// Destructive steps refuse to run against live data in the named table
    /// unless the caller supplies an explicit force override.
    pub destructive_on: Option<(String, String)>,
}

impl Statement {
    /// A plain, unconditional statement.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            only_if: None,
            destructive_on: None,
        }
    }

    /// Guard the statement with a probe.
    pub fn only_if(mut self, probe: Probe) -> Self {
        self.only_if = Some(probe);
        self
    }

    /// Mark the statement destructive for the given table.
    pub fn destructive_on(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.destructive_on = Some((schema.into(), table.into()));
        self
    }
}

/// Live-catalog condition re-derived from the database before a guarded
/// statement runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The object does not exist yet.
    ObjectMissing(ObjectId),
    /// The column does not exist on the table yet.
    ColumnMissing {
        schema: String,
        table: String,
        column: String,
    },
    /// The table holds no rows.
    TableHasNoData { schema: String, table: String },
}

/// Callback that produces the statements needed to move an object from the
/// previously recorded schema version to its current definition.
pub type MigrationHook = Arc<dyn Fn(i32) -> Vec<Statement> + Send + Sync>;

/// Variant payload of a schema object.
#[derive(Debug, Clone)]
pub enum ObjectDef {
    Table(TableDef),
    Sequence(SequenceDef),
    View(ViewDef),
    Tablespace(TablespaceDef),
    SessionVariable(SessionVariableDef),
    Routine(RoutineDef),
    Marker,
}

/// Sequence definition.
#[derive(Debug, Clone)]
pub struct SequenceDef {
    pub start_with: i64,
    pub increment_by: i64,
    pub cache: i64,
}

/// View definition: the body is the SELECT the view wraps.
#[derive(Debug, Clone)]
pub struct ViewDef {
    pub select: String,
}

/// Tablespace definition.
#[derive(Debug, Clone)]
pub struct TablespaceDef {
    pub location: Option<String>,
}

/// Session variable definition. Read by the row-level access predicate of
/// every tenant-scoped table.
#[derive(Debug, Clone)]
pub struct SessionVariableDef {
    pub default_value: Option<i64>,
}

/// Stored procedure/function definition. The body is read from a resource
/// file by the caller; the model only carries the text.
#[derive(Debug, Clone)]
pub struct RoutineDef {
    pub body: String,
}

/// A named, versioned schema object with its dependencies and an optional
/// versioned-migration hook.
#[derive(Clone)]
pub struct SchemaObject {
    id: ObjectId,
    version: i32,
    tags: BTreeMap<String, String>,
    def: ObjectDef,
    migration: Option<MigrationHook>,
}

impl SchemaObject {
    /// Create a new schema object at the given version.
    pub fn new(id: ObjectId, version: i32, def: ObjectDef) -> Self {
        Self {
            id,
            version,
            tags: BTreeMap::new(),
            def,
            migration: None,
        }
    }

    /// Create a no-op marker object.
    pub fn marker(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            ObjectId::new(schema, name, ObjectKind::Marker),
            1,
            ObjectDef::Marker,
        )
    }

    /// Attach an opaque tag. Tags partition objects into logical groups for
    /// selective processing; they carry no weight for ordering.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Attach a versioned-migration hook. Given the previously recorded
    /// version, the hook returns the statements needed to reach this
    /// object's current version.
    pub fn with_migration<F>(mut self, hook: F) -> Self
    where
        F: Fn(i32) -> Vec<Statement> + Send + Sync + 'static,
    {
        self.migration = Some(Arc::new(hook));
        self
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn def(&self) -> &ObjectDef {
        &self.def
    }

    /// The table definition, when this object is a table.
    pub fn as_table(&self) -> Option<&TableDef> {
        match &self.def {
            ObjectDef::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Whether an incremental migration is defined for this object.
    pub fn has_migration(&self) -> bool {
        self.migration.is_some()
    }

    /// Statements needed to move from `prior_version` to the current
    /// definition. `None` means no incremental migration is defined, which
    /// is valid only for newly introduced objects.
    pub fn migration_steps(&self, prior_version: i32) -> Option<Vec<Statement>> {
        self.migration.as_ref().map(|hook| hook(prior_version))
    }
}

impl fmt::Debug for SchemaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaObject")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("tags", &self.tags)
            .field("has_migration", &self.migration.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        let id = ObjectId::new("FHIRDATA", "PATIENTS", ObjectKind::Table);
        assert_eq!(id.to_string(), "FHIRDATA.PATIENTS (table)");
        assert_eq!(id.qualified_name(), "FHIRDATA.PATIENTS");
    }

    #[test]
    fn test_migration_steps_receive_prior_version() {
        let obj = SchemaObject::new(
            ObjectId::new("S", "T", ObjectKind::Table),
            3,
            ObjectDef::Marker,
        )
        .with_migration(|prior| {
            let mut steps = Vec::new();
            if prior < 2 {
                steps.push(Statement::new("ALTER TABLE s.t ADD COLUMN a int"));
            }
            if prior < 3 {
                steps.push(Statement::new("ALTER TABLE s.t ADD COLUMN b int"));
            }
            steps
        });

        assert_eq!(obj.migration_steps(1).unwrap().len(), 2);
        assert_eq!(obj.migration_steps(2).unwrap().len(), 1);
        assert_eq!(obj.migration_steps(3).unwrap().len(), 0);
    }

    #[test]
    fn test_no_migration_hook() {
        let obj = SchemaObject::marker("S", "M");
        assert!(!obj.has_migration());
        assert!(obj.migration_steps(1).is_none());
    }

    #[test]
    fn test_tags_are_opaque() {
        let obj = SchemaObject::marker("S", "M").with_tag("group", "administrative");
        assert_eq!(obj.tag("group"), Some("administrative"));
        assert_eq!(obj.tag("missing"), None);
    }
}
