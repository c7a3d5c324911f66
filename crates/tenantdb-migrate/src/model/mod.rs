//! Physical data model: the dependency graph of schema objects.
//!
//! A [`PhysicalDataModel`] accumulates [`SchemaObject`]s and dependency
//! edges, then computes a deterministic application order (and its reverse,
//! for teardown). The model is an explicit value owned by the caller; there
//! is no process-wide registry, so independent models can be built side by
//! side in tests without cross-contamination.

pub mod object;
pub mod table;
pub mod version;

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{MigrateError, Result};

pub use object::{ObjectDef, ObjectId, ObjectKind, SchemaObject, Statement};
pub use table::TableDef;

/// Handle to an object registered in a model. Valid only for the model that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef(usize);

/// The complete set of registered schema objects plus their dependency
/// edges.
///
/// Invariants:
/// - every dependency endpoint is registered in the same model;
/// - the forward order is a valid topological sort: no object precedes any
///   of its dependencies;
/// - order computation is deterministic, with ties broken by registration
///   order, so output is reproducible across runs.
#[derive(Default)]
pub struct PhysicalDataModel {
    objects: Vec<SchemaObject>,
    index: HashMap<ObjectId, usize>,
    /// Dependencies of each object, by registration index.
    deps: Vec<BTreeSet<usize>>,
    /// Most recent barrier marker; everything registered afterwards
    /// automatically depends on it.
    barrier: Option<usize>,
}

impl PhysicalDataModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object. Everything registered after a barrier marker
    /// automatically depends on that barrier.
    ///
    /// # Errors
    ///
    /// `DuplicateObject` if the (schema, name, kind) triple is already
    /// registered.
    pub fn add_object(&mut self, obj: SchemaObject) -> Result<ObjectRef> {
        if self.index.contains_key(obj.id()) {
            return Err(MigrateError::DuplicateObject {
                object: obj.id().to_string(),
            });
        }

        let idx = self.objects.len();
        self.index.insert(obj.id().clone(), idx);
        self.objects.push(obj);

        let mut deps = BTreeSet::new();
        if let Some(b) = self.barrier {
            deps.insert(b);
        }
        self.deps.push(deps);

        Ok(ObjectRef(idx))
    }

    /// Record that `obj` must be applied after `depends_on`.
    pub fn add_dependency(&mut self, obj: ObjectRef, depends_on: ObjectRef) {
        self.deps[obj.0].insert(depends_on.0);
    }

    /// Record a dependency edge between two already-registered objects,
    /// named by identity.
    ///
    /// # Errors
    ///
    /// `MissingDependency` if either endpoint is not registered.
    pub fn add_dependency_by_id(&mut self, obj: &ObjectId, depends_on: &ObjectId) -> Result<()> {
        let from = self.resolve(obj, depends_on)?;
        let to = self.resolve(depends_on, obj)?;
        self.deps[from].insert(to);
        Ok(())
    }

    fn resolve(&self, id: &ObjectId, other_end: &ObjectId) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| MigrateError::MissingDependency {
                object: other_end.to_string(),
                dependency: id.to_string(),
            })
    }

    /// Insert a synchronization barrier: a no-op marker that depends on
    /// every object registered so far and that every later registration
    /// depends on. Used e.g. to force all base tables into existence before
    /// any stored routine referencing them is created.
    pub fn add_barrier(&mut self, schema: &str, name: &str) -> Result<ObjectRef> {
        let marker = SchemaObject::marker(schema, name);
        let before: Vec<usize> = (0..self.objects.len()).collect();
        let marker_ref = self.add_object(marker)?;
        for idx in before {
            self.deps[marker_ref.0].insert(idx);
        }
        self.barrier = Some(marker_ref.0);
        Ok(marker_ref)
    }

    /// Look up a registered object.
    pub fn get(&self, id: &ObjectId) -> Option<&SchemaObject> {
        self.index.get(id).map(|&i| &self.objects[i])
    }

    pub fn object(&self, r: ObjectRef) -> &SchemaObject {
        &self.objects[r.0]
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All objects in registration order.
    pub fn objects(&self) -> impl Iterator<Item = &SchemaObject> {
        self.objects.iter()
    }

    /// Objects carrying the given tag value.
    pub fn objects_tagged<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> impl Iterator<Item = &'a SchemaObject> {
        self.objects.iter().filter(move |o| o.tag(key) == Some(value))
    }

    /// Tenant-partitioned table definitions, in registration order. This is
    /// the traversal used by partition maintenance and FK bracketing.
    pub fn tenant_tables(&self) -> Vec<&TableDef> {
        self.objects
            .iter()
            .filter_map(|o| o.as_table())
            .filter(|t| t.is_tenant_partitioned())
            .collect()
    }

    /// Highest version carried by any registered object.
    pub fn max_version(&self) -> i32 {
        self.objects.iter().map(|o| o.version()).max().unwrap_or(0)
    }

    /// Compute the forward application order: a deterministic topological
    /// sort of the dependency graph. Ties are broken by registration order.
    ///
    /// # Errors
    ///
    /// `CyclicDependency`, naming the members of one cycle, if the graph is
    /// not acyclic.
    pub fn compute_order(&self) -> Result<Vec<&SchemaObject>> {
        let n = self.objects.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (node, deps) in self.deps.iter().enumerate() {
            in_degree[node] = deps.len();
            for &dep in deps {
                dependents[dep].push(node);
            }
        }

        // Kahn's algorithm with a BTreeSet ready queue: the smallest
        // registration index is always applied next, which keeps the output
        // stable across runs for diffing.
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < n {
            let remaining: BTreeSet<usize> =
                (0..n).filter(|&i| in_degree[i] > 0).collect();
            return Err(MigrateError::CyclicDependency {
                cycle: self.find_cycle(&remaining),
            });
        }

        debug!(objects = n, "computed application order");
        Ok(order.into_iter().map(|i| &self.objects[i]).collect())
    }

    /// The forward order reversed, used for teardown so that dependents are
    /// removed before their dependencies.
    pub fn compute_reverse_order(&self) -> Result<Vec<&SchemaObject>> {
        let mut order = self.compute_order()?;
        order.reverse();
        Ok(order)
    }

    /// Walk the unresolved subgraph to name one actual cycle. Nodes merely
    /// downstream of a cycle are excluded from the report.
    fn find_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<String> {
        let start = match remaining.iter().next() {
            Some(&s) => s,
            None => return Vec::new(),
        };

        let mut stack: Vec<usize> = Vec::new();
        let mut on_stack = vec![false; self.objects.len()];
        let mut node = start;

        loop {
            if on_stack[node] {
                let pos = stack.iter().position(|&n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = stack[pos..]
                    .iter()
                    .map(|&n| self.objects[n].id().qualified_name())
                    .collect();
                cycle.push(self.objects[node].id().qualified_name());
                return cycle;
            }
            on_stack[node] = true;
            stack.push(node);

            // Every unresolved node still has at least one unresolved
            // dependency, so the walk cannot dead-end and must eventually
            // revisit a node on the stack.
            match self.deps[node].iter().find(|d| remaining.contains(d)) {
                Some(&next) => node = next,
                None => return vec![self.objects[node].id().qualified_name()],
            }
        }
    }
}

impl std::fmt::Debug for PhysicalDataModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDataModel")
            .field("objects", &self.objects.len())
            .field(
                "edges",
                &self.deps.iter().map(|d| d.len()).sum::<usize>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::object::{ObjectDef, SequenceDef, RoutineDef, TablespaceDef};
    use super::table::TableDef;
    use super::*;

    fn table(schema: &str, name: &str) -> SchemaObject {
        SchemaObject::new(
            ObjectId::new(schema, name, ObjectKind::Table),
            1,
            ObjectDef::Table(TableDef::builder(schema, name).add_int_column("ID", false).build()),
        )
    }

    #[test]
    fn test_duplicate_object_rejected() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("S", "A")).unwrap();
        let err = model.add_object(table("S", "A")).unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateObject { .. }));
    }

    #[test]
    fn test_same_name_different_kind_allowed() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("S", "A")).unwrap();
        model
            .add_object(SchemaObject::new(
                ObjectId::new("S", "A", ObjectKind::Sequence),
                1,
                ObjectDef::Sequence(SequenceDef {
                    start_with: 1,
                    increment_by: 1,
                    cache: 20,
                }),
            ))
            .unwrap();
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("S", "A")).unwrap();
        let err = model
            .add_dependency_by_id(
                &ObjectId::new("S", "A", ObjectKind::Table),
                &ObjectId::new("S", "GHOST", ObjectKind::Table),
            )
            .unwrap_err();
        assert!(matches!(err, MigrateError::MissingDependency { .. }));
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let mut model = PhysicalDataModel::new();
        let a = model.add_object(table("S", "A")).unwrap();
        let b = model.add_object(table("S", "B")).unwrap();
        let c = model.add_object(table("S", "C")).unwrap();
        model.add_dependency(a, c);
        model.add_dependency(b, a);

        let order: Vec<String> = model
            .compute_order()
            .unwrap()
            .iter()
            .map(|o| o.id().name.clone())
            .collect();

        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("C") < pos("A"));
        assert!(pos("A") < pos("B"));
    }

    #[test]
    fn test_ties_broken_by_registration_order() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("S", "Z")).unwrap();
        model.add_object(table("S", "A")).unwrap();
        model.add_object(table("S", "M")).unwrap();

        let order: Vec<String> = model
            .compute_order()
            .unwrap()
            .iter()
            .map(|o| o.id().name.clone())
            .collect();
        // Independent siblings keep registration order, not name order.
        assert_eq!(order, vec!["Z", "A", "M"]);
    }

    #[test]
    fn test_cycle_detection_names_members() {
        let mut model = PhysicalDataModel::new();
        let a = model.add_object(table("S", "A")).unwrap();
        let b = model.add_object(table("S", "B")).unwrap();
        let c = model.add_object(table("S", "C")).unwrap();
        // A -> B -> A cycle, with C hanging off A.
        model.add_dependency(a, b);
        model.add_dependency(b, a);
        model.add_dependency(c, a);

        let err = model.compute_order().unwrap_err();
        match err {
            MigrateError::CyclicDependency { cycle } => {
                assert!(cycle.contains(&"S.A".to_string()));
                assert!(cycle.contains(&"S.B".to_string()));
                assert!(!cycle.contains(&"S.C".to_string()));
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    /// Scenario from the design review: tablespace T, table A placed in T,
    /// table B referencing A, barrier M, procedure P after the barrier.
    #[test]
    fn test_tablespace_tables_barrier_procedure_scenario() {
        let mut model = PhysicalDataModel::new();

        let t = model
            .add_object(SchemaObject::new(
                ObjectId::new("S", "T", ObjectKind::Tablespace),
                1,
                ObjectDef::Tablespace(TablespaceDef { location: None }),
            ))
            .unwrap();
        let a = model.add_object(table("S", "A")).unwrap();
        model.add_dependency(a, t);
        let b = model.add_object(table("S", "B")).unwrap();
        model.add_dependency(b, a);
        model.add_barrier("S", "M").unwrap();
        model
            .add_object(SchemaObject::new(
                ObjectId::new("S", "P", ObjectKind::Procedure),
                1,
                ObjectDef::Routine(RoutineDef {
                    body: "BEGIN END".into(),
                }),
            ))
            .unwrap();

        let order: Vec<String> = model
            .compute_order()
            .unwrap()
            .iter()
            .map(|o| o.id().name.clone())
            .collect();
        assert_eq!(order, vec!["T", "A", "B", "M", "P"]);
    }

    #[test]
    fn test_reverse_order_is_forward_reversed() {
        let mut model = PhysicalDataModel::new();
        let a = model.add_object(table("S", "A")).unwrap();
        let b = model.add_object(table("S", "B")).unwrap();
        model.add_dependency(b, a);

        let forward: Vec<String> = model
            .compute_order()
            .unwrap()
            .iter()
            .map(|o| o.id().name.clone())
            .collect();
        let mut reversed: Vec<String> = model
            .compute_reverse_order()
            .unwrap()
            .iter()
            .map(|o| o.id().name.clone())
            .collect();
        reversed.reverse();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_tenant_table_traversal() {
        let mut model = PhysicalDataModel::new();
        model.add_object(table("S", "GLOBAL")).unwrap();
        model
            .add_object(SchemaObject::new(
                ObjectId::new("S", "SCOPED", ObjectKind::Table),
                1,
                ObjectDef::Table(
                    TableDef::builder("S", "SCOPED")
                        .add_int_column("MT_ID", false)
                        .tenant_column("MT_ID")
                        .build(),
                ),
            ))
            .unwrap();

        let tenant_tables = model.tenant_tables();
        assert_eq!(tenant_tables.len(), 1);
        assert_eq!(tenant_tables[0].name, "SCOPED");
    }

    #[test]
    fn test_tag_filtering() {
        let mut model = PhysicalDataModel::new();
        model
            .add_object(table("S", "A").with_tag("group", "admin"))
            .unwrap();
        model
            .add_object(table("S", "B").with_tag("group", "data"))
            .unwrap();

        let admin: Vec<_> = model.objects_tagged("group", "admin").collect();
        assert_eq!(admin.len(), 1);
        assert_eq!(admin[0].id().name, "A");
    }
}
