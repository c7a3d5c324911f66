//! Built-in physical models.
//!
//! The admin schema holds the bookkeeping the library itself needs:
//! tenant registry, tenant keys, id sequences and the session tenant
//! variable. It is managed by the same engine as any other model, so the
//! control table gets created through the executor's
//! `ensure_control_table` rather than appearing here.

use crate::error::Result;
use crate::model::object::{
    ObjectDef, ObjectId, ObjectKind, Probe, SchemaObject, SequenceDef, SessionVariableDef,
    Statement,
};
use crate::model::table::{OrderedColumn, TableDef};
use crate::model::version::{VersionCatalog, VersionEntry};
use crate::model::PhysicalDataModel;

/// Current version of the admin model.
pub const ADMIN_SCHEMA_VERSION: i32 = 1;

/// Version history of the admin model.
pub fn admin_version_catalog() -> Result<VersionCatalog> {
    VersionCatalog::new(vec![VersionEntry::new(
        1,
        "tenant registry, tenant keys and session variable",
        false,
    )])
}

/// Build the administrative model rooted at `admin_schema`.
///
/// Objects and names line up with the SQL the adapters emit for tenant
/// operations: `tenants`, `tenant_keys`, `tenant_sequence`,
/// `tenant_key_sequence` and `sv_tenant_id`.
pub fn admin_model(admin_schema: &str) -> Result<PhysicalDataModel> {
    let mut model = PhysicalDataModel::new();

    let tenant_seq = model.add_object(SchemaObject::new(
        ObjectId::new(admin_schema, "tenant_sequence", ObjectKind::Sequence),
        ADMIN_SCHEMA_VERSION,
        ObjectDef::Sequence(SequenceDef {
            start_with: 1,
            increment_by: 1,
            cache: 1,
        }),
    ))?;

    let key_seq = model.add_object(SchemaObject::new(
        ObjectId::new(admin_schema, "tenant_key_sequence", ObjectKind::Sequence),
        ADMIN_SCHEMA_VERSION,
        ObjectDef::Sequence(SequenceDef {
            start_with: 1,
            increment_by: 1,
            cache: 1,
        }),
    ))?;

    let tenants = model.add_object(SchemaObject::new(
        ObjectId::new(admin_schema, "tenants", ObjectKind::Table),
        ADMIN_SCHEMA_VERSION,
        ObjectDef::Table(
            TableDef::builder(admin_schema, "tenants")
                .add_bigint_column("tenant_id", false)
                .add_varchar_column("tenant_name", 36, false)
                .add_varchar_column("tenant_status", 16, false)
                .add_primary_key("tenants_pk", &["tenant_id"])
                .add_unique_index("tenants_name_uq", &["tenant_name"])
                .build(),
        ),
    ))?;
    model.add_dependency(tenants, tenant_seq);

    // Salt is unique across all keys so a hash lookup resolves to at most
    // one tenant.
    let tenant_keys = model.add_object(SchemaObject::new(
        ObjectId::new(admin_schema, "tenant_keys", ObjectKind::Table),
        ADMIN_SCHEMA_VERSION,
        ObjectDef::Table(
            TableDef::builder(admin_schema, "tenant_keys")
                .add_bigint_column("key_id", false)
                .add_bigint_column("tenant_id", false)
                .add_varchar_column("salt", 64, false)
                .add_varbinary_column("hash", 32, false)
                .add_primary_key("tenant_keys_pk", &["key_id"])
                .add_unique_index("tenant_keys_salt_uq", &["salt"])
                .add_foreign_key(
                    "tenant_keys_tenant_fk",
                    &["tenant_id"],
                    admin_schema,
                    "tenants",
                    &["tenant_id"],
                    true,
                )
                .build(),
        ),
    ))?;
    model.add_dependency(tenant_keys, tenants);
    model.add_dependency(tenant_keys, key_seq);

    model.add_object(SchemaObject::new(
        ObjectId::new(admin_schema, "sv_tenant_id", ObjectKind::SessionVariable),
        ADMIN_SCHEMA_VERSION,
        ObjectDef::SessionVariable(SessionVariableDef {
            default_value: Some(0),
        }),
    ))?;

    Ok(model)
}

/// Current version of the clinical data model.
pub const DATA_SCHEMA_VERSION: i32 = 2;

/// Version history of the clinical data model.
pub fn data_version_catalog() -> Result<VersionCatalog> {
    VersionCatalog::new(vec![
        VersionEntry::new(1, "resource tables and search parameter values", false),
        VersionEntry::new(2, "reindex tracking on logical resources", false),
    ])
}

/// Build the clinical data model rooted at `data_schema`.
///
/// Resource payloads hang off `logical_resources`; search parameter values
/// live in `str_values`. Reference tables (`resource_types`,
/// `parameter_names`) are shared across tenants, everything else is
/// partitioned on `mt_id`.
pub fn data_model(data_schema: &str) -> Result<PhysicalDataModel> {
    let mut model = PhysicalDataModel::new();

    let resource_seq = model.add_object(SchemaObject::new(
        ObjectId::new(data_schema, "resource_sequence", ObjectKind::Sequence),
        1,
        ObjectDef::Sequence(SequenceDef {
            start_with: 1000,
            increment_by: 1,
            cache: 100,
        }),
    ))?;

    let resource_types = model.add_object(SchemaObject::new(
        ObjectId::new(data_schema, "resource_types", ObjectKind::Table),
        1,
        ObjectDef::Table(
            TableDef::builder(data_schema, "resource_types")
                .add_int_column("resource_type_id", false)
                .add_varchar_column("resource_type", 64, false)
                .add_primary_key("resource_types_pk", &["resource_type_id"])
                .add_unique_index("resource_types_rt_uq", &["resource_type"])
                .build(),
        ),
    ))?;

    let parameter_names = model.add_object(SchemaObject::new(
        ObjectId::new(data_schema, "parameter_names", ObjectKind::Table),
        1,
        ObjectDef::Table(
            TableDef::builder(data_schema, "parameter_names")
                .add_int_column("parameter_name_id", false)
                .add_varchar_column("parameter_name", 255, false)
                .add_primary_key("parameter_names_pk", &["parameter_name_id"])
                .add_unique_index("parameter_names_pn_uq", &["parameter_name"])
                .build(),
        ),
    ))?;

    let schema_for_hook = data_schema.to_string();
    let logical_resources = model.add_object(
        SchemaObject::new(
            ObjectId::new(data_schema, "logical_resources", ObjectKind::Table),
            DATA_SCHEMA_VERSION,
            ObjectDef::Table(
                TableDef::builder(data_schema, "logical_resources")
                    .add_int_column("mt_id", false)
                    .add_bigint_column("logical_resource_id", false)
                    .add_int_column("resource_type_id", false)
                    .add_varchar_column("logical_id", 255, false)
                    .add_timestamp_column("last_updated", false)
                    .add_timestamp_column("reindex_tstamp", true)
                    .add_primary_key("logical_resources_pk", &["mt_id", "logical_resource_id"])
                    .add_index(
                        "logical_resources_type_lid_ix",
                        vec![
                            OrderedColumn::asc("mt_id"),
                            OrderedColumn::asc("resource_type_id"),
                            OrderedColumn::asc("logical_id"),
                        ],
                    )
                    .add_foreign_key(
                        "logical_resources_rt_fk",
                        &["resource_type_id"],
                        data_schema,
                        "resource_types",
                        &["resource_type_id"],
                        true,
                    )
                    .tenant_column("mt_id")
                    .build(),
            ),
        )
        .with_migration(move |prior| {
            let mut steps = Vec::new();
            if prior < 2 {
                steps.push(
                    Statement::new(format!(
                        "ALTER TABLE \"{schema_for_hook}\".\"logical_resources\" \
                         ADD COLUMN \"reindex_tstamp\" TIMESTAMPTZ"
                    ))
                    .only_if(Probe::ColumnMissing {
                        schema: schema_for_hook.clone(),
                        table: "logical_resources".into(),
                        column: "reindex_tstamp".into(),
                    }),
                );
            }
            steps
        }),
    )?;
    model.add_dependency(logical_resources, resource_types);
    model.add_dependency(logical_resources, resource_seq);

    let resources = model.add_object(SchemaObject::new(
        ObjectId::new(data_schema, "resources", ObjectKind::Table),
        1,
        ObjectDef::Table(
            TableDef::builder(data_schema, "resources")
                .add_int_column("mt_id", false)
                .add_bigint_column("resource_id", false)
                .add_bigint_column("logical_resource_id", false)
                .add_int_column("version_id", false)
                .add_timestamp_column("last_updated", false)
                .add_column("data", crate::model::table::ColumnType::Blob, true)
                .add_primary_key("resources_pk", &["mt_id", "resource_id"])
                .add_foreign_key(
                    "resources_lr_fk",
                    &["mt_id", "logical_resource_id"],
                    data_schema,
                    "logical_resources",
                    &["mt_id", "logical_resource_id"],
                    true,
                )
                .tenant_column("mt_id")
                .build(),
        ),
    ))?;
    model.add_dependency(resources, logical_resources);

    let str_values = model.add_object(SchemaObject::new(
        ObjectId::new(data_schema, "str_values", ObjectKind::Table),
        1,
        ObjectDef::Table(
            TableDef::builder(data_schema, "str_values")
                .add_int_column("mt_id", false)
                .add_int_column("parameter_name_id", false)
                .add_varchar_column("str_value", 511, true)
                .add_bigint_column("logical_resource_id", false)
                .add_index(
                    "str_values_pn_sv_ix",
                    vec![
                        OrderedColumn::asc("mt_id"),
                        OrderedColumn::asc("parameter_name_id"),
                        OrderedColumn::asc("str_value"),
                    ],
                )
                .add_foreign_key(
                    "str_values_lr_fk",
                    &["mt_id", "logical_resource_id"],
                    data_schema,
                    "logical_resources",
                    &["mt_id", "logical_resource_id"],
                    true,
                )
                .add_foreign_key(
                    "str_values_pn_fk",
                    &["parameter_name_id"],
                    data_schema,
                    "parameter_names",
                    &["parameter_name_id"],
                    true,
                )
                .tenant_column("mt_id")
                .build(),
        ),
    ))?;
    model.add_dependency(str_values, logical_resources);
    model.add_dependency(str_values, parameter_names);

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_model_orders_sequences_first() {
        let model = admin_model("fhir_admin").unwrap();
        let order: Vec<String> = model
            .compute_order()
            .unwrap()
            .iter()
            .map(|o| o.id().name.clone())
            .collect();

        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("tenant_sequence") < pos("tenants"));
        assert!(pos("tenants") < pos("tenant_keys"));
        assert!(pos("tenant_key_sequence") < pos("tenant_keys"));
    }

    #[test]
    fn test_admin_model_version() {
        let model = admin_model("fhir_admin").unwrap();
        assert_eq!(model.max_version(), ADMIN_SCHEMA_VERSION);
        assert_eq!(
            admin_version_catalog().unwrap().latest_vid(),
            ADMIN_SCHEMA_VERSION
        );
    }

    #[test]
    fn test_data_model_orders_references_before_resources() {
        let model = data_model("FHIRDATA").unwrap();
        let order: Vec<String> = model
            .compute_order()
            .unwrap()
            .iter()
            .map(|o| o.id().name.clone())
            .collect();

        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("resource_types") < pos("logical_resources"));
        assert!(pos("logical_resources") < pos("resources"));
        assert!(pos("logical_resources") < pos("str_values"));
        assert!(pos("parameter_names") < pos("str_values"));
    }

    #[test]
    fn test_data_model_tenant_tables() {
        let model = data_model("FHIRDATA").unwrap();
        let mut names: Vec<&str> = model
            .tenant_tables()
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["logical_resources", "resources", "str_values"]);
    }

    #[test]
    fn test_data_model_migration_delta() {
        let model = data_model("FHIRDATA").unwrap();
        let lr = model
            .get(&ObjectId::new(
                "FHIRDATA",
                "logical_resources",
                ObjectKind::Table,
            ))
            .unwrap();
        let steps = lr.migration_steps(1).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].sql.contains("reindex_tstamp"));
        assert!(lr.migration_steps(2).unwrap().is_empty());
    }

    #[test]
    fn test_data_catalog_matches_model_version() {
        let model = data_model("FHIRDATA").unwrap();
        assert_eq!(model.max_version(), DATA_SCHEMA_VERSION);
        assert_eq!(
            data_version_catalog().unwrap().latest_vid(),
            DATA_SCHEMA_VERSION
        );
    }

    #[test]
    fn test_tenant_keys_fk_is_enforced() {
        let model = admin_model("fhir_admin").unwrap();
        let keys = model
            .get(&ObjectId::new(
                "fhir_admin",
                "tenant_keys",
                ObjectKind::Table,
            ))
            .unwrap();
        let table = keys.as_table().unwrap();
        assert_eq!(table.enforced_foreign_keys().count(), 1);
    }
}
