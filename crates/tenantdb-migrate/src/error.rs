//! Error types for the schema migration library.

use thiserror::Error;

/// Main error type for schema migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// An object with the same (schema, name, kind) is already registered.
    #[error("Duplicate schema object: {object}")]
    DuplicateObject { object: String },

    /// A dependency edge references an object that is not registered.
    #[error("Object {object} depends on unregistered object {dependency}")]
    MissingDependency { object: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency involving: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Another instance holds a live lease on the schema.
    #[error("Lease denied for schema {schema}: held by {holder} until {until}")]
    LeaseDenied {
        schema: String,
        holder: String,
        until: chrono::DateTime<chrono::Utc>,
    },

    /// A specific object's DDL/DML failed during create or migrate.
    #[error("Migration step failed for {object}: {message}")]
    MigrationStep { object: String, message: String },

    /// A destructive step found live data and no force override was given.
    #[error("Integrity precheck failed for {object}: {message}")]
    PrecheckFailed { object: String, message: String },

    /// A tenant operation was attempted in an incompatible status.
    #[error("Tenant {tenant} is in status {status}: {message}")]
    TenantState {
        tenant: String,
        status: String,
        message: String,
    },

    /// No tenant with the given name or id exists.
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    /// A tenant with the given name already exists.
    #[error("Tenant name already in use: {0}")]
    DuplicateTenant(String),

    /// Database error, translated from the vendor driver.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Vendor SQL error translated at the dialect seam.
    #[error("SQL error [{sqlstate}]: {message}")]
    Sql { sqlstate: String, message: String },

    /// Connection pool error with context.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a MigrationStep error.
    pub fn step(object: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::MigrationStep {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Create a PrecheckFailed error.
    pub fn precheck(object: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::PrecheckFailed {
            object: object.into(),
            message: message.into(),
        }
    }

    /// True for errors raised at model-construction time, before any
    /// database I/O. These are never retried.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            MigrateError::DuplicateObject { .. }
                | MigrateError::MissingDependency { .. }
                | MigrateError::CyclicDependency { .. }
        )
    }

    /// Process exit code for the CLI, stable per error family.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Json(_) => 1,
            MigrateError::DuplicateObject { .. }
            | MigrateError::MissingDependency { .. }
            | MigrateError::CyclicDependency { .. } => 2,
            MigrateError::LeaseDenied { .. } => 3,
            MigrateError::MigrationStep { .. } | MigrateError::PrecheckFailed { .. } => 4,
            MigrateError::TenantState { .. }
            | MigrateError::TenantNotFound(_)
            | MigrateError::DuplicateTenant(_) => 5,
            MigrateError::Database(_) | MigrateError::Sql { .. } | MigrateError::Pool { .. } => 6,
            MigrateError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        MigrateError::pool(err.to_string(), "acquiring pooled connection")
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_error_classification() {
        let err = MigrateError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert!(err.is_construction_error());

        let err = MigrateError::Config("bad".into());
        assert!(!err.is_construction_error());
    }

    #[test]
    fn test_cycle_message_names_members() {
        let err = MigrateError::CyclicDependency {
            cycle: vec!["S.A".into(), "S.B".into(), "S.A".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("S.A -> S.B -> S.A"));
    }

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 1);
        assert_eq!(
            MigrateError::LeaseDenied {
                schema: "s".into(),
                holder: "h".into(),
                until: chrono::Utc::now(),
            }
            .exit_code(),
            3
        );
        assert_eq!(MigrateError::precheck("o", "m").exit_code(), 4);
        assert_eq!(MigrateError::TenantNotFound("t".into()).exit_code(), 5);
    }

    #[test]
    fn test_lease_denied_display() {
        let err = MigrateError::LeaseDenied {
            schema: "FHIRDATA".into(),
            holder: "inst-1".into(),
            until: chrono::Utc::now(),
        };
        assert!(err.to_string().contains("FHIRDATA"));
        assert!(err.to_string().contains("inst-1"));
    }
}
